//! mcumgr-core: SMP device management and firmware upgrade in Rust.
//!
//! This crate implements the client side of the SMP (mcumgr) protocol and
//! the two upgrade schemes Zephyr devices use: MCUboot image swaps and SUIT
//! manifests.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire header, CBOR payload model, group/command constants
//! - **Image**: MCUboot header and TLV parsing, SUIT envelope detection
//! - **Transport**: Link abstraction (UDP, mock)
//! - **Client**: Request framing and response validation
//! - **Managers**: Typed requests per SMP group
//! - **Transfer**: Windowed chunked upload and download
//! - **Scheduler**: Priority task runner with pause/resume/cancel
//! - **Upgrade**: Firmware and manifest upgrade flows
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcumgr_core::{FirmwareUpgrade, McuMgrClient, ParsedImage, TracingObserver, UdpTransport, UpgradeConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let transport = Arc::new(UdpTransport::connect("192.0.2.1")?);
//! let client = Arc::new(McuMgrClient::new(transport));
//! let image = ParsedImage::from_bytes(std::fs::read("zephyr.signed.bin")?)?;
//!
//! let upgrade = FirmwareUpgrade::new(client, image, UpgradeConfig::default())?;
//! upgrade.run(&TracingObserver)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod image;
pub mod managers;
pub mod protocol;
pub mod scheduler;
pub mod settings;
pub mod transfer;
pub mod transport;
pub mod upgrade;

// Re-exports for convenience
pub use client::McuMgrClient;
pub use error::{Error, FormatError, ImageError, Result};
pub use events::{NullObserver, TracingObserver, UpgradeEvent, UpgradeObserver};
pub use image::{FirmwareImage, ImageHeader, ImageVersion, ParsedImage, parse_image};
pub use managers::{DefaultManager, ImageManager, SuitManager};
pub use protocol::{Operation, Payload, Value, WireHeader};
pub use scheduler::{Task, TaskContext, TaskScheduler};
pub use settings::{ResetPollConfig, UpgradeConfig, UpgradeMode, UpgradeSettings};
pub use transfer::{TransferCallback, TransferController};
pub use transport::{MockTransport, SmpTransport, TransportError, UdpTransport};
pub use upgrade::{
    CacheImage, FirmwareUpgrade, ManifestUpgrade, ManifestUpgradeState, ResourceProvider,
    UpgradeFailure, UpgradeOutcome, UpgradeResult, UpgradeState,
};
