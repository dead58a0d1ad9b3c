// platforms/cloudstack.rs
//
// CloudStack/KVM collaborator: drives the KVM host agent, which snapshots
// the volume, maintains qemu dirty bitmaps for change tracking and serves
// the snapshot over qemu's NBD export.

use crate::platforms::{
    PlatformError, PlatformKind, SnapshotHandle, SourceEndpoint, SourcePlatform,
};
use crate::transport::ChangedRange;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub struct CloudStackPlatform {
    client: reqwest::Client,
    agent_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct VolumeSnapshotRequest<'a> {
    volume_uuid: &'a str,
    disk_index: i32,
    quiesce: bool,
    /// Name for the dirty bitmap anchoring the next incremental.
    bitmap: String,
}

#[derive(Debug, Deserialize)]
struct VolumeSnapshotResponse {
    snapshot_uuid: String,
    bitmap: String,
    capacity_bytes: u64,
    #[serde(default)]
    allocated_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DirtyRegionsResponse {
    #[serde(default)]
    regions: Vec<DirtyRegion>,
}

#[derive(Debug, Deserialize)]
struct DirtyRegion {
    offset: u64,
    length: u64,
}

#[derive(Debug, Deserialize)]
struct NbdExportResponse {
    url: String,
}

impl CloudStackPlatform {
    pub fn new(agent_url: &str, api_key: &str) -> Result<CloudStackPlatform, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        Ok(CloudStackPlatform {
            client,
            agent_url: agent_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, PlatformError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PlatformError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(PlatformError::from_reqwest)
    }
}

#[async_trait]
impl SourcePlatform for CloudStackPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Cloudstack
    }

    async fn snapshot(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        quiesce: bool,
    ) -> Result<SnapshotHandle, PlatformError> {
        // A fresh bitmap starts tracking for the backup after this one.
        let bitmap = format!("vmvault-{}-{}", context_id, chrono::Utc::now().timestamp());
        let request = VolumeSnapshotRequest {
            volume_uuid: context_id,
            disk_index: disk_ordinal,
            quiesce,
            bitmap: bitmap.clone(),
        };
        let response = self
            .client
            .post(format!("{}/v1/volume-snapshots", self.agent_url))
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let snapshot: VolumeSnapshotResponse = self.check(response).await?;

        info!(
            "cloudstack snapshot {} created for {} disk {} (bitmap {})",
            snapshot.snapshot_uuid, context_id, disk_ordinal, snapshot.bitmap
        );

        Ok(SnapshotHandle {
            platform: PlatformKind::Cloudstack,
            snapshot_id: snapshot.snapshot_uuid,
            context_id: context_id.to_string(),
            disk_ordinal,
            attributes: json!({
                "bitmap": snapshot.bitmap,
                "capacity_bytes": snapshot.capacity_bytes,
                "allocated_bytes": snapshot.allocated_bytes,
            }),
        })
    }

    async fn enumerate_changes(
        &self,
        handle: &SnapshotHandle,
        since_marker: Option<&str>,
    ) -> Result<Vec<ChangedRange>, PlatformError> {
        // since_marker is the bitmap of the previous backup; the agent
        // reports the regions it accumulated.
        let mut request = self
            .client
            .get(format!(
                "{}/v1/volume-snapshots/{}/dirty-regions",
                self.agent_url, handle.snapshot_id
            ))
            .header("x-api-key", &self.api_key);
        if let Some(marker) = since_marker {
            request = request.query(&[("bitmap", marker)]);
        }
        let response = request.send().await.map_err(PlatformError::from_reqwest)?;
        let dirty: DirtyRegionsResponse = self.check(response).await?;

        let ranges: Vec<ChangedRange> = dirty
            .regions
            .into_iter()
            .map(|r| ChangedRange::new(r.offset, r.length))
            .collect();
        debug!(
            "cloudstack reported {} dirty region(s) for snapshot {}",
            ranges.len(),
            handle.snapshot_id
        );
        Ok(ranges)
    }

    async fn open_read(&self, handle: &SnapshotHandle) -> Result<SourceEndpoint, PlatformError> {
        let response = self
            .client
            .post(format!(
                "{}/v1/volume-snapshots/{}/nbd-export",
                self.agent_url, handle.snapshot_id
            ))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let export: NbdExportResponse = self.check(response).await?;

        Ok(SourceEndpoint {
            url: export.url,
            auth: None,
        })
    }

    async fn release(&self, handle: &SnapshotHandle) -> Result<(), PlatformError> {
        let response = self
            .client
            .delete(format!(
                "{}/v1/volume-snapshots/{}",
                self.agent_url, handle.snapshot_id
            ))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        if response.status().as_u16() == 404 {
            return Err(PlatformError::SnapshotNotFound(handle.snapshot_id.clone()));
        }
        let _: serde_json::Value = self.check(response).await?;
        Ok(())
    }

    async fn extract_change_marker(
        &self,
        handle: &SnapshotHandle,
    ) -> Result<String, PlatformError> {
        // The new bitmap becomes the next incremental's anchor.
        handle
            .attributes
            .get("bitmap")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Config("snapshot handle carries no bitmap".into()))
    }

    async fn allocated_bytes(
        &self,
        handle: &SnapshotHandle,
    ) -> Result<Option<u64>, PlatformError> {
        Ok(handle
            .attributes
            .get("allocated_bytes")
            .and_then(|v| v.as_u64()))
    }
}
