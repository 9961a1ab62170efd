//! Default (OS) management group.

use std::sync::Arc;

use crate::client::McuMgrClient;
use crate::error::{FormatError, Result};
use crate::protocol::constants::{DEFAULT_ECHO, DEFAULT_PARAMS, DEFAULT_RESET, GROUP_DEFAULT};
use crate::protocol::header::Operation;
use crate::protocol::value::Payload;

/// SMP buffer parameters reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuMgrParams {
    pub buf_size: u32,
    pub buf_count: u32,
}

#[derive(Clone)]
pub struct DefaultManager {
    client: Arc<McuMgrClient>,
}

impl DefaultManager {
    pub fn new(client: Arc<McuMgrClient>) -> Self {
        Self { client }
    }

    /// Reboot the device. `force` skips the application's veto.
    pub fn reset(&self, force: bool) -> Result<()> {
        self.client
            .send(Operation::Write, GROUP_DEFAULT, DEFAULT_RESET, &reset_request(force))?;
        Ok(())
    }

    pub fn reset_async<F>(&self, force: bool, on_response: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.client.send_async(
            Operation::Write,
            GROUP_DEFAULT,
            DEFAULT_RESET,
            &reset_request(force),
            move |result| on_response(result.map(|_| ())),
        );
    }

    pub fn echo(&self, text: &str) -> Result<String> {
        let body = self.client.send(
            Operation::Write,
            GROUP_DEFAULT,
            DEFAULT_ECHO,
            &Payload::new().with("d", text),
        )?;
        Ok(body
            .text("r")
            .ok_or(FormatError::InvalidField("r"))?
            .to_string())
    }

    pub fn params(&self) -> Result<McuMgrParams> {
        let body = self
            .client
            .send(Operation::Read, GROUP_DEFAULT, DEFAULT_PARAMS, &Payload::new())?;
        let field = |key: &'static str| {
            body.int(key)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(FormatError::InvalidField(key))
        };
        Ok(McuMgrParams {
            buf_size: field("buf_size")?,
            buf_count: field("buf_count")?,
        })
    }
}

fn reset_request(force: bool) -> Payload {
    let mut request = Payload::new();
    if force {
        request.insert("force", 1i64);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn manager() -> (Arc<MockTransport>, DefaultManager) {
        let mock = Arc::new(MockTransport::new());
        let client = Arc::new(McuMgrClient::new(mock.clone()));
        (mock, DefaultManager::new(client))
    }

    #[test]
    fn test_echo() {
        let (mock, os) = manager();
        mock.set_responder(|req| {
            crate::transport::MockReply::Payload(
                Payload::new().with("r", req.payload.text("d").unwrap_or_default()),
            )
        });
        assert_eq!(os.echo("ping").unwrap(), "ping");
    }

    #[test]
    fn test_reset_force_flag() {
        let (mock, os) = manager();
        mock.queue_payload(Payload::new());
        mock.queue_payload(Payload::new());
        os.reset(false).unwrap();
        os.reset(true).unwrap();

        let requests = mock.requests();
        assert!(requests[0].is(GROUP_DEFAULT, DEFAULT_RESET));
        assert!(requests[0].payload.is_empty());
        assert_eq!(requests[1].payload.int("force"), Some(1));
    }

    #[test]
    fn test_params() {
        let (mock, os) = manager();
        mock.queue_payload(
            Payload::new()
                .with("buf_size", 2475i64)
                .with("buf_count", 4i64),
        );
        assert_eq!(
            os.params().unwrap(),
            McuMgrParams {
                buf_size: 2475,
                buf_count: 4
            }
        );

        mock.queue_payload(Payload::new().with("buf_size", 2475i64));
        assert!(os.params().is_err());
    }
}
