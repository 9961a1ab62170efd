//! Group managers: typed requests for the SMP groups the upgrade flows use.

pub mod default;
pub mod fs;
pub mod image;
pub mod suit;

pub use default::{DefaultManager, McuMgrParams};
pub use fs::{FileDownload, FileUpload};
pub use image::{ImageManager, ImageSlot, ImageStateResponse, ImageUpload};
pub use suit::{CacheUpload, EnvelopeUpload, ManifestInfo, MissingResource, ResourceUpload, SuitManager};
