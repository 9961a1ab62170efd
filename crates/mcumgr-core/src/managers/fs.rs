//! File system management group: file transfer targets.

use crate::protocol::constants::{FS_FILE, GROUP_FS};
use crate::protocol::value::Payload;
use crate::transfer::{DownloadTarget, UploadTarget};

/// Upload to a file on the device.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
}

impl UploadTarget for FileUpload {
    fn group(&self) -> u16 {
        GROUP_FS
    }

    fn command(&self) -> u8 {
        FS_FILE
    }

    fn chunk_request(&self, chunk: &[u8], offset: usize, total: usize) -> Payload {
        let mut request = Payload::new()
            .with("name", self.name.as_str())
            .with("off", offset)
            .with("data", chunk);
        if offset == 0 {
            request.insert("len", total);
        }
        request
    }
}

/// Download of a file from the device.
#[derive(Debug, Clone)]
pub struct FileDownload {
    pub name: String,
}

impl DownloadTarget for FileDownload {
    fn group(&self) -> u16 {
        GROUP_FS
    }

    fn command(&self) -> u8 {
        FS_FILE
    }

    fn chunk_request(&self, offset: usize) -> Payload {
        Payload::new()
            .with("name", self.name.as_str())
            .with("off", offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::McuMgrClient;
    use crate::settings::UpgradeSettings;
    use crate::transfer::testing::{Seen, recorder, until_terminal};
    use crate::transfer::{download, upload};
    use crate::transport::{MockReply, MockTransport};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_file_round_trip_through_fake_device() {
        let stored = Arc::new(Mutex::new(Vec::<u8>::new()));
        let mock = Arc::new(MockTransport::with_mtu(96));
        let device = Arc::clone(&stored);
        mock.set_responder(move |req| {
            assert_eq!(req.payload.text("name"), Some("/lfs/cfg.bin"));
            let off = req.payload.int("off").unwrap() as usize;
            let mut file = device.lock().unwrap();
            match req.payload.bytes("data") {
                Some(data) => {
                    file.truncate(off);
                    file.extend_from_slice(data);
                    MockReply::Payload(Payload::new().with("off", off + data.len()))
                }
                None => {
                    let end = (off + 40).min(file.len());
                    let mut body = Payload::new().with("off", off).with("data", &file[off..end]);
                    if off == 0 {
                        body.insert("len", file.len());
                    }
                    MockReply::Payload(body)
                }
            }
        });
        let client = Arc::new(McuMgrClient::new(mock));
        let contents: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();

        let (callback, rx) = recorder();
        upload(
            client.clone(),
            FileUpload {
                name: "/lfs/cfg.bin".into(),
            },
            contents.clone().into(),
            UpgradeSettings::default(),
            callback,
        )
        .unwrap();
        assert!(matches!(until_terminal(&rx).last(), Some(Seen::Uploaded)));
        assert_eq!(*stored.lock().unwrap(), contents);

        let (callback, rx) = recorder();
        download(
            client,
            FileDownload {
                name: "/lfs/cfg.bin".into(),
            },
            callback,
        )
        .unwrap();
        match until_terminal(&rx).pop() {
            Some(Seen::Downloaded(data)) => assert_eq!(data, contents),
            other => panic!("unexpected {other:?}"),
        }
    }
}
