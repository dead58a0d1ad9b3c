// platforms/vmware.rs
//
// VMware collaborator: talks to the vSphere connector agent, which fronts
// vCenter snapshots and CBT and exposes snapshotted disks through its NBD
// gateway.

use crate::platforms::{
    PlatformError, PlatformKind, SnapshotHandle, SourceEndpoint, SourcePlatform,
};
use crate::transport::ChangedRange;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub struct VmwarePlatform {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    vm_moref: &'a str,
    disk_key: i32,
    quiesce: bool,
    memory: bool,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    snapshot_moref: String,
    change_id: String,
    disk_capacity_bytes: u64,
    #[serde(default)]
    disk_allocated_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangedAreasResponse {
    #[serde(default)]
    areas: Vec<ChangedArea>,
    #[serde(default)]
    next_offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangedArea {
    start: u64,
    length: u64,
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    nbd_url: String,
    #[serde(default)]
    session_token: Option<String>,
}

impl VmwarePlatform {
    pub fn new(base_url: &str, token: &str) -> Result<VmwarePlatform, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        Ok(VmwarePlatform {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
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
impl SourcePlatform for VmwarePlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Vmware
    }

    async fn snapshot(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        quiesce: bool,
    ) -> Result<SnapshotHandle, PlatformError> {
        let request = SnapshotRequest {
            vm_moref: context_id,
            disk_key: disk_ordinal,
            quiesce,
            memory: false,
        };
        let response = self
            .client
            .post(format!("{}/api/v1/snapshots", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let snapshot: SnapshotResponse = self.check(response).await?;

        info!(
            "vmware snapshot {} created for {} disk {} (change id {})",
            snapshot.snapshot_moref, context_id, disk_ordinal, snapshot.change_id
        );

        Ok(SnapshotHandle {
            platform: PlatformKind::Vmware,
            snapshot_id: snapshot.snapshot_moref,
            context_id: context_id.to_string(),
            disk_ordinal,
            attributes: json!({
                "change_id": snapshot.change_id,
                "capacity_bytes": snapshot.disk_capacity_bytes,
                "allocated_bytes": snapshot.disk_allocated_bytes,
            }),
        })
    }

    async fn enumerate_changes(
        &self,
        handle: &SnapshotHandle,
        since_marker: Option<&str>,
    ) -> Result<Vec<ChangedRange>, PlatformError> {
        let mut ranges = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut request = self
                .client
                .get(format!(
                    "{}/api/v1/snapshots/{}/changed-areas",
                    self.base_url, handle.snapshot_id
                ))
                .bearer_auth(&self.token)
                .query(&[("offset", offset.to_string())]);
            if let Some(marker) = since_marker {
                request = request.query(&[("since_change_id", marker)]);
            }
            let response = request.send().await.map_err(PlatformError::from_reqwest)?;
            let page: ChangedAreasResponse = self.check(response).await?;

            for area in page.areas {
                ranges.push(ChangedRange::new(area.start, area.length));
            }
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }

        debug!(
            "vmware reported {} changed area(s) for snapshot {}",
            ranges.len(),
            handle.snapshot_id
        );
        Ok(ranges)
    }

    async fn open_read(&self, handle: &SnapshotHandle) -> Result<SourceEndpoint, PlatformError> {
        let response = self
            .client
            .post(format!(
                "{}/api/v1/snapshots/{}/export",
                self.base_url, handle.snapshot_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let export: ExportResponse = self.check(response).await?;

        Ok(SourceEndpoint {
            url: export.nbd_url,
            auth: export.session_token,
        })
    }

    async fn release(&self, handle: &SnapshotHandle) -> Result<(), PlatformError> {
        let response = self
            .client
            .delete(format!(
                "{}/api/v1/snapshots/{}",
                self.base_url, handle.snapshot_id
            ))
            .bearer_auth(&self.token)
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
        handle
            .attributes
            .get("change_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::Config("snapshot handle carries no CBT change id".into())
            })
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
