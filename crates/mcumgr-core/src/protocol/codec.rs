//! Payload codec.
//!
//! The client never touches CBOR directly; it goes through [`MapCodec`] so a
//! different encoder (or a fake one in tests) can be injected.

use std::collections::BTreeMap;

use minicbor::data::Type;
use minicbor::decode::{self, Decoder};
use minicbor::encode::{self, Encoder, Write};
use minicbor::{Decode, Encode};
use thiserror::Error;

use super::value::{Payload, Value};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(#[from] decode::Error),
}

/// Encoder/decoder for SMP bodies.
pub trait MapCodec: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError>;
}

/// CBOR codec backed by `minicbor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl MapCodec for CborCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        minicbor::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        if bytes.is_empty() {
            return Ok(Payload::new());
        }
        Ok(minicbor::decode(bytes)?)
    }
}

impl<C> Encode<C> for Value {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Value::Null => {
                e.null()?;
            }
            Value::Bool(v) => {
                e.bool(*v)?;
            }
            Value::Int(v) => {
                e.i64(*v)?;
            }
            Value::Bytes(v) => {
                e.bytes(v)?;
            }
            Value::Text(v) => {
                e.str(v)?;
            }
            Value::Array(items) => {
                e.array(items.len() as u64)?;
                for item in items {
                    item.encode(e, ctx)?;
                }
            }
            Value::Map(map) => map.encode(e, ctx)?,
        }
        Ok(())
    }
}

impl<C> Encode<C> for Payload {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        e.map(self.len() as u64)?;
        for (key, value) in self.iter() {
            e.str(key)?;
            value.encode(e, ctx)?;
        }
        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Value {
    fn decode(d: &mut Decoder<'b>, ctx: &mut ()) -> Result<Self, decode::Error> {
        match d.datatype()? {
            Type::Null | Type::Undefined => {
                d.skip()?;
                Ok(Value::Null)
            }
            Type::Bool => Ok(Value::Bool(d.bool()?)),
            Type::U8
            | Type::U16
            | Type::U32
            | Type::U64
            | Type::I8
            | Type::I16
            | Type::I32
            | Type::I64 => Ok(Value::Int(d.i64()?)),
            Type::Bytes => Ok(Value::Bytes(d.bytes()?.to_vec())),
            Type::BytesIndef => {
                let mut out = Vec::new();
                for chunk in d.bytes_iter()? {
                    out.extend_from_slice(chunk?);
                }
                Ok(Value::Bytes(out))
            }
            Type::String => Ok(Value::Text(d.str()?.to_string())),
            Type::StringIndef => {
                let mut out = String::new();
                for chunk in d.str_iter()? {
                    out.push_str(chunk?);
                }
                Ok(Value::Text(out))
            }
            Type::Array | Type::ArrayIndef => {
                let items = d.array_iter::<Value>()?.collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(items))
            }
            Type::Map | Type::MapIndef => Ok(Value::Map(Payload::decode(d, ctx)?)),
            Type::Tag => {
                // Tags carry no meaning for SMP bodies; keep the tagged item.
                d.tag()?;
                Value::decode(d, ctx)
            }
            other => Err(decode::Error::message(format!(
                "unsupported CBOR type {other:?}"
            ))),
        }
    }
}

impl<'b> Decode<'b, ()> for Payload {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        let mut entries = BTreeMap::new();
        for entry in d.map_iter::<String, Value>()? {
            let (key, value) = entry?;
            entries.insert(key, value);
        }
        Ok(entries.into_iter().collect())
    }
}
