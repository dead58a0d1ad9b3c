use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a protected VM, independent of any job.
///
/// Rows are created by the discovery collaborator; the engine references
/// them but never mutates them.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmContext {
    pub id: String,
    pub display_name: String,
    pub platform: String, // enum: 'vmware', 'cloudstack', 'hyperv', 'aws', 'azure', 'nutanix'
    pub disk_inventory: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// One virtual disk belonging to a VM context.
///
/// The change marker is the opaque token the source hypervisor returned for
/// the last successful snapshot of this disk; it is advanced only when a
/// backup completes end-to-end.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Disk {
    pub id: i64,
    pub context_id: String,
    pub disk_ordinal: i32,
    pub capacity_bytes: i64,
    pub allocated_bytes: Option<i64>,
    pub change_marker: Option<String>,
}
