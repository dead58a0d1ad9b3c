// platforms/hyperv.rs
//
// Hyper-V collaborator: the Windows-side agent wraps checkpoint creation
// and Resilient Change Tracking (RCT) and streams VHDX content through its
// block gateway.

use crate::platforms::{
    PlatformError, PlatformKind, SnapshotHandle, SourceEndpoint, SourcePlatform,
};
use crate::transport::ChangedRange;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub struct HyperVPlatform {
    client: reqwest::Client,
    agent_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CheckpointRequest<'a> {
    vm_id: &'a str,
    disk_index: i32,
    /// Production checkpoint (VSS-quiesced) versus standard.
    production: bool,
}

#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    checkpoint_id: String,
    rct_id: String,
    disk_size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ChangedExtentsResponse {
    #[serde(default)]
    extents: Vec<ChangedExtent>,
}

#[derive(Debug, Deserialize)]
struct ChangedExtent {
    offset: u64,
    length: u64,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    endpoint: String,
    #[serde(default)]
    access_token: Option<String>,
}

impl HyperVPlatform {
    pub fn new(agent_url: &str, token: &str) -> Result<HyperVPlatform, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        Ok(HyperVPlatform {
            client,
            agent_url: agent_url.trim_end_matches('/').to_string(),
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
impl SourcePlatform for HyperVPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Hyperv
    }

    async fn snapshot(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        quiesce: bool,
    ) -> Result<SnapshotHandle, PlatformError> {
        let request = CheckpointRequest {
            vm_id: context_id,
            disk_index: disk_ordinal,
            production: quiesce,
        };
        let response = self
            .client
            .post(format!("{}/api/checkpoints", self.agent_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let checkpoint: CheckpointResponse = self.check(response).await?;

        info!(
            "hyper-v checkpoint {} created for {} disk {} (rct {})",
            checkpoint.checkpoint_id, context_id, disk_ordinal, checkpoint.rct_id
        );

        Ok(SnapshotHandle {
            platform: PlatformKind::Hyperv,
            snapshot_id: checkpoint.checkpoint_id,
            context_id: context_id.to_string(),
            disk_ordinal,
            attributes: json!({
                "rct_id": checkpoint.rct_id,
                "capacity_bytes": checkpoint.disk_size_bytes,
            }),
        })
    }

    async fn enumerate_changes(
        &self,
        handle: &SnapshotHandle,
        since_marker: Option<&str>,
    ) -> Result<Vec<ChangedRange>, PlatformError> {
        let mut request = self
            .client
            .get(format!(
                "{}/api/checkpoints/{}/changed-extents",
                self.agent_url, handle.snapshot_id
            ))
            .bearer_auth(&self.token);
        if let Some(marker) = since_marker {
            request = request.query(&[("since_rct_id", marker)]);
        }
        let response = request.send().await.map_err(PlatformError::from_reqwest)?;
        let changed: ChangedExtentsResponse = self.check(response).await?;

        let ranges: Vec<ChangedRange> = changed
            .extents
            .into_iter()
            .map(|e| ChangedRange::new(e.offset, e.length))
            .collect();
        debug!(
            "hyper-v reported {} changed extent(s) for checkpoint {}",
            ranges.len(),
            handle.snapshot_id
        );
        Ok(ranges)
    }

    async fn open_read(&self, handle: &SnapshotHandle) -> Result<SourceEndpoint, PlatformError> {
        let response = self
            .client
            .post(format!(
                "{}/api/checkpoints/{}/gateway",
                self.agent_url, handle.snapshot_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let gateway: GatewayResponse = self.check(response).await?;

        Ok(SourceEndpoint {
            url: gateway.endpoint,
            auth: gateway.access_token,
        })
    }

    async fn release(&self, handle: &SnapshotHandle) -> Result<(), PlatformError> {
        let response = self
            .client
            .delete(format!(
                "{}/api/checkpoints/{}",
                self.agent_url, handle.snapshot_id
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
            .get("rct_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Config("checkpoint handle carries no RCT id".into()))
    }
}
