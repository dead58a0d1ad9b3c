// restore/mod.rs
//
// Restore mount/browse: expose a chain tip read-only and walk its
// filesystem for file-level extraction.

mod browse;
mod error;
mod mount;

pub use browse::FileEntry;
pub use error::RestoreError;
pub use mount::{MountInfo, MountManager};
