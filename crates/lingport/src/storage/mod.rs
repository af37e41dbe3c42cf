pub mod checksum;
pub mod layout;
pub mod staging;

pub use checksum::{fingerprint_file, Fingerprint};
pub use layout::ProjectLayout;
pub use staging::{Promotion, StageOutcome, StageRequest, StagedFile, StagingArea, StagingManager};
