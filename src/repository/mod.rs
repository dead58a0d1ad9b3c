// repository/mod.rs
//
// The repository layer: copy-on-write image persistence, chain integrity,
// capacity accounting and immutability.

mod chain;
mod error;
mod image;
mod retention;
mod storage;

pub use chain::{chain_id, ChainManager};
pub use error::RepositoryError;
pub use image::{CowImage, OpenMode, DEFAULT_CLUSTER_SIZE};
pub use retention::{check_deletable, retention_until, sweep_once, RetentionSweeper};
pub use storage::{
    BackendConfig, CifsConfig, LocalConfig, NfsConfig, ObjectConfig, RepositoryManager,
    StorageInfo,
};
