// platforms/nutanix.rs
//
// Nutanix AHV collaborator: recovery points with the changed-regions API,
// reached through the Prism gateway.

use crate::platforms::{
    PlatformError, PlatformKind, SnapshotHandle, SourceEndpoint, SourcePlatform,
};
use crate::transport::ChangedRange;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub struct NutanixPlatform {
    client: reqwest::Client,
    prism_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct RecoveryPointRequest<'a> {
    vm_uuid: &'a str,
    disk_index: i32,
    app_consistent: bool,
}

#[derive(Debug, Deserialize)]
struct RecoveryPointResponse {
    recovery_point_uuid: String,
    disk_capacity_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ChangedRegionsResponse {
    #[serde(default)]
    regions: Vec<ChangedRegion>,
    #[serde(default)]
    next_offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangedRegion {
    offset: u64,
    length: u64,
}

#[derive(Debug, Deserialize)]
struct DiskStreamResponse {
    url: String,
    #[serde(default)]
    token: Option<String>,
}

impl NutanixPlatform {
    pub fn new(prism_url: &str, token: &str) -> Result<NutanixPlatform, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;
        Ok(NutanixPlatform {
            client,
            prism_url: prism_url.trim_end_matches('/').to_string(),
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
impl SourcePlatform for NutanixPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Nutanix
    }

    async fn snapshot(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        quiesce: bool,
    ) -> Result<SnapshotHandle, PlatformError> {
        let request = RecoveryPointRequest {
            vm_uuid: context_id,
            disk_index: disk_ordinal,
            app_consistent: quiesce,
        };
        let response = self
            .client
            .post(format!("{}/api/v3/recovery-points", self.prism_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let point: RecoveryPointResponse = self.check(response).await?;

        info!(
            "nutanix recovery point {} created for {} disk {}",
            point.recovery_point_uuid, context_id, disk_ordinal
        );

        Ok(SnapshotHandle {
            platform: PlatformKind::Nutanix,
            snapshot_id: point.recovery_point_uuid,
            context_id: context_id.to_string(),
            disk_ordinal,
            attributes: json!({
                "capacity_bytes": point.disk_capacity_bytes,
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
                    "{}/api/v3/recovery-points/{}/changed-regions",
                    self.prism_url, handle.snapshot_id
                ))
                .bearer_auth(&self.token)
                .query(&[("offset", offset.to_string())]);
            if let Some(marker) = since_marker {
                request = request.query(&[("reference_recovery_point", marker)]);
            }
            let response = request.send().await.map_err(PlatformError::from_reqwest)?;
            let page: ChangedRegionsResponse = self.check(response).await?;

            for region in page.regions {
                ranges.push(ChangedRange::new(region.offset, region.length));
            }
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }

        debug!(
            "nutanix reported {} changed region(s) for recovery point {}",
            ranges.len(),
            handle.snapshot_id
        );
        Ok(ranges)
    }

    async fn open_read(&self, handle: &SnapshotHandle) -> Result<SourceEndpoint, PlatformError> {
        let response = self
            .client
            .post(format!(
                "{}/api/v3/recovery-points/{}/disk-stream",
                self.prism_url, handle.snapshot_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(PlatformError::from_reqwest)?;
        let stream: DiskStreamResponse = self.check(response).await?;

        Ok(SourceEndpoint {
            url: stream.url,
            auth: stream.token,
        })
    }

    async fn release(&self, handle: &SnapshotHandle) -> Result<(), PlatformError> {
        let response = self
            .client
            .delete(format!(
                "{}/api/v3/recovery-points/{}/disk-stream",
                self.prism_url, handle.snapshot_id
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
        // Recovery points reference each other by uuid.
        Ok(handle.snapshot_id.clone())
    }
}
