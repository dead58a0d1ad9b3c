// platforms/mod.rs
//
// The source-platform collaborator contract. Each supported hypervisor or
// cloud implements the same five capabilities behind one trait; the engine
// never sees vendor specifics.

mod aws;
mod azure;
mod cloudstack;
mod hyperv;
mod nutanix;
mod vmware;

pub use aws::AwsPlatform;
pub use azure::AzurePlatform;
pub use cloudstack::CloudStackPlatform;
pub use hyperv::HyperVPlatform;
pub use nutanix::NutanixPlatform;
pub use vmware::VmwarePlatform;

use crate::transport::ChangedRange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Supported source platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Vmware,
    Cloudstack,
    Hyperv,
    Aws,
    Azure,
    Nutanix,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Vmware => "vmware",
            PlatformKind::Cloudstack => "cloudstack",
            PlatformKind::Hyperv => "hyperv",
            PlatformKind::Aws => "aws",
            PlatformKind::Azure => "azure",
            PlatformKind::Nutanix => "nutanix",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmware" => Ok(PlatformKind::Vmware),
            "cloudstack" => Ok(PlatformKind::Cloudstack),
            "hyperv" => Ok(PlatformKind::Hyperv),
            "aws" => Ok(PlatformKind::Aws),
            "azure" => Ok(PlatformKind::Azure),
            "nutanix" => Ok(PlatformKind::Nutanix),
            other => Err(format!("unrecognised platform '{}'", other)),
        }
    }
}

/// Errors surfaced by platform collaborators.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Platform configuration error: {0}")]
    Config(String),

    #[error("Platform endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Operation not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),
}

impl PlatformError {
    pub fn from_reqwest(e: reqwest::Error) -> PlatformError {
        if let Some(status) = e.status() {
            PlatformError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            PlatformError::Unavailable(e.to_string())
        }
    }
}

/// Opaque handle anchoring one snapshot of one disk. `attributes` carries
/// whatever the platform needs to find its way back (snapshot uuid, CBT
/// id, dirty-bitmap name, RCT id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub platform: PlatformKind,
    pub snapshot_id: String,
    pub context_id: String,
    pub disk_ordinal: i32,
    pub attributes: Value,
}

/// Where to read the snapshotted disk from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEndpoint {
    /// Block endpoint URL (nbd://, nbd+unix:// or file://).
    pub url: String,
    /// Bearer credential for the endpoint, when the platform issues one.
    pub auth: Option<String>,
}

/// Capabilities every source platform provides. This is the only surface
/// the engine touches.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Creates a crash-consistent (or quiesced) snapshot of one disk and
    /// arranges change tracking for the next incremental.
    async fn snapshot(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        quiesce: bool,
    ) -> Result<SnapshotHandle, PlatformError>;

    /// Ranges changed since `since_marker`, sorted and non-overlapping.
    /// With no marker the platform reports the allocated extent set.
    async fn enumerate_changes(
        &self,
        handle: &SnapshotHandle,
        since_marker: Option<&str>,
    ) -> Result<Vec<ChangedRange>, PlatformError>;

    /// Exposes the snapshot as a readable block endpoint.
    async fn open_read(&self, handle: &SnapshotHandle) -> Result<SourceEndpoint, PlatformError>;

    /// Releases the snapshot and its change-tracking anchor.
    async fn release(&self, handle: &SnapshotHandle) -> Result<(), PlatformError>;

    /// The change marker to store after a successful backup.
    async fn extract_change_marker(
        &self,
        handle: &SnapshotHandle,
    ) -> Result<String, PlatformError>;

    /// Actual allocated bytes of the disk, when the platform can tell.
    async fn allocated_bytes(
        &self,
        _handle: &SnapshotHandle,
    ) -> Result<Option<u64>, PlatformError> {
        Ok(None)
    }
}

/// Per-process registry mapping platform tags to their collaborator.
pub struct PlatformRegistry {
    platforms: HashMap<PlatformKind, Arc<dyn SourcePlatform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self {
            platforms: HashMap::new(),
        }
    }

    pub fn register(&mut self, platform: Arc<dyn SourcePlatform>) {
        self.platforms.insert(platform.kind(), platform);
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn SourcePlatform>> {
        self.platforms.get(&kind).cloned()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_kind_round_trips() {
        for kind in [
            PlatformKind::Vmware,
            PlatformKind::Cloudstack,
            PlatformKind::Hyperv,
            PlatformKind::Aws,
            PlatformKind::Azure,
            PlatformKind::Nutanix,
        ] {
            assert_eq!(PlatformKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(PlatformKind::from_str("xen").is_err());
    }
}
