// transport/mod.rs
//
// The transport data path: change-set coalescing, parallel slice copy
// with zero elision, and progress aggregation.

mod copier;
mod endpoint;
mod error;
mod extent;
mod nbd;
mod progress;
mod zero;

pub use copier::{run_copy, CopyOptions};
pub use endpoint::{
    BlockEndpoint, EndpointConnector, EndpointUrl, FileEndpoint, UrlConnector,
};
pub use error::TransportError;
pub use extent::{coalesce, total_length, ChangedRange};
pub use nbd::NbdClient;
pub use progress::{ProgressAggregator, ProgressPolicy, ProgressUpdate};
pub use zero::{is_all_zero, probe_offsets, SAMPLED_PROBE_MIN, SAMPLE_LEN};
