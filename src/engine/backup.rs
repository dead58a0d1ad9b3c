// engine/backup.rs
//
// The backup engine: drives one backup per (context, disk) request through
// snapshot, enumerate, target, export, transfer and finalise, and keeps
// job and chain state honest on every exit path.

use crate::cancel::CancelSignal;
use crate::config::{EngineConfig, TransportConfig};
use crate::db::queries;
use crate::engine::error::EngineError;
use crate::engine::limits::ConcurrencyLimits;
use crate::engine::types::{BackupOutcome, BackupRequest};
use crate::export::{backup_export_name, ExportServer};
use crate::joblog::JobTracker;
use crate::models::{BackupJob, BackupType, Disk, LogLevel, Outcome, Repository, VmContext};
use crate::platforms::{PlatformKind, PlatformRegistry, SnapshotHandle, SourcePlatform};
use crate::repository::{retention_until, ChainManager, CowImage, RepositoryManager};
use crate::transport::{
    coalesce, run_copy, total_length, ChangedRange, CopyOptions, EndpointUrl, ProgressAggregator,
    ProgressPolicy, UrlConnector,
};
use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything a job may have acquired, for teardown on any exit path.
#[derive(Default)]
struct JobState {
    snapshot: Option<SnapshotHandle>,
    image_path: Option<PathBuf>,
    image_pinned: bool,
    export_name: Option<String>,
    reserved_bytes: Option<u64>,
}

pub struct BackupEngine {
    pool: Pool<MySql>,
    tracker: Arc<JobTracker>,
    repositories: Arc<RepositoryManager>,
    chains: Arc<ChainManager>,
    exports: Arc<ExportServer>,
    platforms: Arc<PlatformRegistry>,
    limits: ConcurrencyLimits,
    transport_config: TransportConfig,
    engine_config: EngineConfig,
    /// Unix socket of the embedded export server, for target URLs.
    export_socket: PathBuf,
    /// Cancellation signals of in-flight jobs, by backup id.
    active: Mutex<HashMap<String, CancelSignal>>,
}

impl BackupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool<MySql>,
        tracker: Arc<JobTracker>,
        repositories: Arc<RepositoryManager>,
        chains: Arc<ChainManager>,
        exports: Arc<ExportServer>,
        platforms: Arc<PlatformRegistry>,
        transport_config: TransportConfig,
        engine_config: EngineConfig,
        export_socket: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let limits = ConcurrencyLimits::new(engine_config.global_concurrency);
        Arc::new(Self {
            pool,
            tracker,
            repositories,
            chains,
            exports,
            platforms,
            limits,
            transport_config,
            engine_config,
            export_socket: export_socket.into(),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Executes one backup request to completion.
    ///
    /// Idempotency: a request carrying the id of a completed job returns
    /// that job's outcome without side effects; a terminal failed or
    /// cancelled id gets a fresh attempt as a new job. An id still in
    /// flight returns the current state.
    pub async fn execute_backup(
        &self,
        request: &BackupRequest,
    ) -> Result<BackupOutcome, EngineError> {
        if let Some(job_id) = &request.job_id {
            if let Some(existing) = queries::backup::get_backup_job(&self.pool, job_id).await? {
                match existing.status.as_str() {
                    "completed" | "pending" | "running" => return Ok(outcome_of(&existing)),
                    // Failed attempts stay failed; retry below as a new job.
                    _ => {}
                }
            }
        }

        let context = queries::vm::get_context(&self.pool, &request.context_id)
            .await?
            .ok_or_else(|| {
                EngineError::Config(format!("unknown VM context '{}'", request.context_id))
            })?;
        let disk = queries::vm::get_disk(&self.pool, &request.context_id, request.disk_ordinal)
            .await?
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "context '{}' has no disk {}",
                    request.context_id, request.disk_ordinal
                ))
            })?;
        let repository = self.repositories.get_repository(&request.repository_id).await?;
        if !repository.enabled {
            return Err(EngineError::Unavailable(format!(
                "repository '{}' is disabled",
                repository.id
            )));
        }
        let platform_kind = PlatformKind::from_str(&context.platform)
            .map_err(EngineError::Config)?;
        let platform = self
            .platforms
            .get(platform_kind)
            .ok_or_else(|| {
                EngineError::Config(format!("no collaborator registered for {}", platform_kind))
            })?;

        // Incrementals need an open chain to hang off; without one there
        // is nothing to record as parent and the request is refused before
        // a job record exists (the API layer offers promotion to full).
        let parent = match request.backup_type {
            BackupType::Full => None,
            BackupType::Incremental => {
                let chain = self
                    .chains
                    .get_chain(&request.context_id, request.disk_ordinal, &request.repository_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::ParentMissing(format!(
                            "no chain for {}/disk{} in {}",
                            request.context_id, request.disk_ordinal, request.repository_id
                        ))
                    })?;
                let parent = queries::backup::get_backup_job(&self.pool, &chain.latest_backup_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::ParentMissing(chain.latest_backup_id.clone())
                    })?;
                if parent.status != "completed" {
                    return Err(EngineError::ParentMissing(format!(
                        "chain tip {} is {}",
                        parent.id, parent.status
                    )));
                }
                Some(parent)
            }
        };

        let backup_id = request
            .job_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Serialise per disk; queued requests wait here in pending.
        let disk_lock = self
            .limits
            .disk_lock(&request.context_id, request.disk_ordinal);
        let _disk_guard = disk_lock.lock().await;

        // Re-check idempotency under the lock: the id may have just run.
        if let Some(existing) = queries::backup::get_backup_job(&self.pool, &backup_id).await? {
            if existing.status != "failed" && existing.status != "cancelled" {
                return Ok(outcome_of(&existing));
            }
        }
        let backup_id = match queries::backup::get_backup_job(&self.pool, &backup_id).await? {
            // Terminal record under this id: a fresh attempt is a new job.
            Some(_) => Uuid::new_v4().to_string(),
            None => backup_id,
        };

        queries::backup::create_backup_job(
            &self.pool,
            &backup_id,
            &request.context_id,
            request.disk_ordinal,
            request.backup_type.as_str(),
            &request.repository_id,
            parent.as_ref().map(|p| p.id.as_str()),
        )
        .await?;

        let tracker_job = self
            .tracker
            .start_job(None, "backup", "backup-engine", Some(&backup_id))
            .await;

        let cancel = CancelSignal::new();
        self.active.lock().insert(backup_id.clone(), cancel.clone());

        // Wall-clock ceiling: exceeding the TTL cancels the job.
        let ttl_guard = {
            let cancel = cancel.clone();
            let ttl = Duration::from_secs(self.engine_config.job_ttl_secs);
            let id = backup_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                warn!("backup {} exceeded its TTL; cancelling", id);
                cancel.cancel();
            })
        };

        let mut state = JobState::default();
        let result = self
            .run_phases(
                request, &context, &disk, &repository, platform.as_ref(), parent.as_ref(),
                &backup_id, &tracker_job, &cancel, &mut state,
            )
            .await;

        ttl_guard.abort();
        self.active.lock().remove(&backup_id);

        match result {
            Ok((bytes, marker)) => {
                self.tracker.end_job(&tracker_job, Outcome::Ok, None).await;
                info!(
                    "backup {} completed: {} bytes, marker {}",
                    backup_id, bytes, marker
                );
            }
            Err(e) => {
                let status = e.terminal_status();
                let message = e.to_string();
                self.teardown(&mut state, &repository, platform.as_ref()).await;
                if let Err(db_error) = queries::backup::finish_backup_job(
                    &self.pool,
                    &backup_id,
                    status,
                    Some(&message),
                )
                .await
                {
                    warn!("could not record terminal state of {}: {}", backup_id, db_error);
                }
                self.tracker
                    .end_job(&tracker_job, Outcome::Failed, Some(&message))
                    .await;
                warn!("backup {} {}: {}", backup_id, status, message);
            }
        }

        let row = queries::backup::get_backup_job(&self.pool, &backup_id)
            .await?
            .ok_or_else(|| EngineError::Internal("backup row vanished".into()))?;
        Ok(outcome_of(&row))
    }

    /// Requests cancellation of an in-flight backup. Returns false when
    /// the job is not running.
    pub fn cancel_backup(&self, backup_id: &str) -> bool {
        match self.active.lock().get(backup_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupJob, EngineError> {
        queries::backup::get_backup_job(&self.pool, backup_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(backup_id.to_string()))
    }

    pub async fn list_backups(
        &self,
        filter: &queries::backup::BackupFilter,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<BackupJob>, EngineError> {
        Ok(queries::backup::list_backups(&self.pool, filter, page, page_size).await?)
    }

    pub async fn get_chain(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        repository_id: &str,
    ) -> Result<Vec<BackupJob>, EngineError> {
        Ok(self
            .chains
            .list_chain(context_id, disk_ordinal, repository_id)
            .await?)
    }

    /// Deletes a completed backup, subject to immutability and chain
    /// integrity.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<(), EngineError> {
        let backup = self.get_backup(backup_id).await?;
        if backup.status == "running" || backup.status == "pending" {
            return Err(EngineError::Unavailable(format!(
                "backup {} is still {}",
                backup_id, backup.status
            )));
        }

        crate::repository::check_deletable(&backup)?;

        let children = queries::backup::count_children(&self.pool, backup_id).await?;
        if children > 0 {
            return Err(EngineError::Repository(
                crate::repository::RepositoryError::HasChildren(backup_id.to_string()),
            ));
        }

        let chain = self
            .chains
            .get_chain(&backup.context_id, backup.disk_ordinal, &backup.repository_id)
            .await?;

        let physical_size = match &backup.image_path {
            Some(path) => {
                let path = PathBuf::from(path);
                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                self.repositories.delete_image(&path).await?;
                size as i64
            }
            None => 0,
        };

        // Chain bookkeeping: removing the tip re-tips to its parent;
        // removing the last member closes the chain.
        if let Some(chain) = chain {
            if chain.latest_backup_id == backup.id {
                let _head = self.chains.head_lock(&chain.id).lock_owned().await;
                if chain.full_backup_id == backup.id {
                    self.chains.delete_chain(&chain.id).await?;
                } else if let Some(parent_id) = &backup.parent_backup_id {
                    queries::chain::retip_chain(&self.pool, &chain.id, parent_id, physical_size)
                        .await?;
                }
            }
        }

        queries::backup::delete_backup_job(&self.pool, backup_id).await?;

        if let Err(e) = self.repositories.refresh_storage(&backup.repository_id).await {
            warn!(
                "storage refresh after delete failed for {}: {}",
                backup.repository_id, e
            );
        }

        info!("backup {} deleted", backup_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        request: &BackupRequest,
        context: &VmContext,
        disk: &Disk,
        repository: &Repository,
        platform: &dyn SourcePlatform,
        parent: Option<&BackupJob>,
        backup_id: &str,
        tracker_job: &str,
        cancel: &CancelSignal,
        state: &mut JobState,
    ) -> Result<(i64, String), EngineError> {
        // snapshotting
        let snapshot = self
            .phase(tracker_job, "snapshotting", cancel, async {
                queries::backup::mark_running(&self.pool, backup_id).await?;
                Ok(platform
                    .snapshot(&context.id, disk.disk_ordinal, request.policy.quiesce)
                    .await?)
            })
            .await?;
        state.snapshot = Some(snapshot.clone());

        // enumerating
        let capacity = disk.capacity_bytes as u64;
        let (extents, total_bytes) = self
            .phase(tracker_job, "enumerating", cancel, async {
                match request.backup_type {
                    BackupType::Full => {
                        // Total bytes is the actual allocation when the
                        // source reports it, else the logical capacity;
                        // the change set is always the whole disk.
                        let allocated = platform.allocated_bytes(&snapshot).await?;
                        let total = allocated
                            .or(disk.allocated_bytes.map(|b| b as u64))
                            .unwrap_or(capacity);
                        let extents = if capacity == 0 {
                            Vec::new()
                        } else {
                            vec![ChangedRange::new(0, capacity)]
                        };
                        Ok((extents, total))
                    }
                    BackupType::Incremental => {
                        let parent = parent.ok_or_else(|| {
                            EngineError::Internal("incremental without parent".into())
                        })?;
                        // The parent's image must still be live in the
                        // repository.
                        let parent_path = parent.image_path.as_deref().ok_or_else(|| {
                            EngineError::ParentMissing(parent.id.clone())
                        })?;
                        match tokio::fs::try_exists(parent_path).await {
                            Ok(true) => {}
                            _ => {
                                return Err(EngineError::ParentMissing(format!(
                                    "parent image {} is gone",
                                    parent_path
                                )))
                            }
                        }

                        let ranges = platform
                            .enumerate_changes(&snapshot, disk.change_marker.as_deref())
                            .await?;
                        let extents = coalesce(
                            &ranges,
                            self.transport_config.max_gap_bytes,
                            self.transport_config.max_chunk_bytes,
                        );
                        let total = total_length(&extents);
                        Ok((extents, total))
                    }
                }
            })
            .await?;

        queries::backup::set_total_bytes(&self.pool, backup_id, total_bytes as i64).await?;

        // The transfer of a full walks the whole capacity, so percent is
        // computed against what the workers will actually process.
        let progress_total = match request.backup_type {
            BackupType::Full => capacity,
            BackupType::Incremental => total_bytes,
        };

        // targeting
        let image_path = self
            .phase(tracker_job, "targeting", cancel, async {
                let expected = request.total_bytes_hint.unwrap_or(total_bytes);
                if request.backup_type == BackupType::Full {
                    self.repositories
                        .check_space_for_full(repository, expected)
                        .await?;
                }
                self.repositories
                    .reserve_space(&repository.id, expected)
                    .await?;
                state.reserved_bytes = Some(expected);

                let parent_file = parent.map(|p| format!("{}.vvc", p.id));
                let path = self
                    .repositories
                    .create_image(
                        repository,
                        &context.id,
                        disk.disk_ordinal,
                        backup_id,
                        capacity,
                        parent_file.as_deref(),
                    )
                    .await?;
                queries::backup::set_image_path(
                    &self.pool,
                    backup_id,
                    &path.display().to_string(),
                )
                .await?;
                Ok(path)
            })
            .await?;
        state.image_path = Some(image_path.clone());

        // exporting
        let (export_name, source_url) = self
            .phase(tracker_job, "exporting", cancel, async {
                let name = backup_export_name(
                    &context.id,
                    disk.disk_ordinal,
                    request.backup_type,
                    Utc::now(),
                );
                self.exports
                    .create_file_export(&name, &image_path, true, None)
                    .await?;
                self.repositories.pin_image(&image_path);
                let source = platform.open_read(&snapshot).await?;
                Ok((name, source.url))
            })
            .await?;
        state.export_name = Some(export_name.clone());
        state.image_pinned = true;

        // transferring
        let bytes = self
            .phase(tracker_job, "transferring", cancel, async {
                let _permit = self
                    .limits
                    .transfer_gate()
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Internal("transfer gate closed".into()))?;

                let source = Arc::new(
                    UrlConnector::parse(&source_url, false).map_err(EngineError::Transport)?,
                );
                let target = Arc::new(UrlConnector::new(
                    EndpointUrl::NbdUnix {
                        socket: self.export_socket.clone(),
                        export: export_name.clone(),
                    },
                    true,
                ));

                let policy = ProgressPolicy {
                    interval: Duration::from_secs(self.transport_config.progress_interval_secs),
                    percent_step: self.transport_config.progress_percent,
                };
                let (update_tx, mut update_rx) = mpsc::channel(64);
                let aggregator = ProgressAggregator::start(progress_total, policy, update_tx);

                // Progress updates land in the job log, tagged with the
                // backup id.
                let progress_logger = {
                    let tracker = Arc::clone(&self.tracker);
                    let tracker_job = tracker_job.to_string();
                    let pool = self.pool.clone();
                    let backup_id = backup_id.to_string();
                    tokio::spawn(async move {
                        while let Some(update) = update_rx.recv().await {
                            let _ = queries::backup::set_bytes_transferred(
                                &pool,
                                &backup_id,
                                update.cumulative_bytes as i64,
                            )
                            .await;
                            tracker
                                .log(
                                    &tracker_job,
                                    None,
                                    LogLevel::Info,
                                    "transfer progress",
                                    Some(json!({
                                        "bytes": update.cumulative_bytes,
                                        "total": update.total_bytes,
                                        "percent": update.percent,
                                        "throughput_bps": update.throughput_bps,
                                    })),
                                )
                                .await;
                        }
                    })
                };

                let options = CopyOptions {
                    workers: self.transport_config.workers,
                    max_chunk: self.transport_config.max_chunk_bytes,
                };
                let copied = run_copy(
                    source,
                    target,
                    extents.clone(),
                    options,
                    cancel.clone(),
                    aggregator.delta_sender(),
                )
                .await;

                aggregator.finish().await;
                let _ = progress_logger.await;

                match copied {
                    Ok(bytes) => Ok(bytes as i64),
                    Err(crate::transport::TransportError::Cancelled) => {
                        Err(EngineError::Cancelled)
                    }
                    Err(e) => Err(EngineError::Transport(e)),
                }
            })
            .await?;

        // finalising: cancellation no longer interrupts.
        let step = self.tracker.start_step(tracker_job, "finalising").await;
        let finalise = async {
            self.exports.remove_export(&export_name).await?;
            self.repositories.unpin_image(&image_path);
            state.export_name = None;
            state.image_pinned = false;

            let marker = platform.extract_change_marker(&snapshot).await?;
            let physical_size = tokio::fs::metadata(&image_path)
                .await
                .map(|m| m.len() as i64)
                .unwrap_or(0);

            queries::backup::complete_backup_job(
                &self.pool,
                backup_id,
                bytes,
                &marker,
                retention_until(repository),
            )
            .await?;
            queries::vm::update_change_marker(
                &self.pool,
                &context.id,
                disk.disk_ordinal,
                &marker,
            )
            .await?;

            let completed = queries::backup::get_backup_job(&self.pool, backup_id)
                .await?
                .ok_or_else(|| EngineError::Internal("completed row vanished".into()))?;

            match request.backup_type {
                BackupType::Full => {
                    let chain_id = crate::repository::chain_id(
                        &context.id,
                        disk.disk_ordinal,
                        &repository.id,
                        backup_id,
                    );
                    let _head = self.chains.head_lock(&chain_id).lock_owned().await;
                    self.chains.register_chain(&completed, physical_size).await?;
                    info!("chain {} rooted at backup {}", chain_id, backup_id);
                }
                BackupType::Incremental => {
                    let chain = self
                        .chains
                        .get_chain(&context.id, disk.disk_ordinal, &repository.id)
                        .await?
                        .ok_or_else(|| {
                            EngineError::Internal("chain vanished during finalise".into())
                        })?;
                    let _head = self.chains.head_lock(&chain.id).lock_owned().await;
                    self.chains
                        .append_to_chain(&chain.id, backup_id, physical_size)
                        .await?;
                }
            }

            if let Err(e) = platform.release(&snapshot).await {
                warn!("snapshot release failed (continuing): {}", e);
            }
            state.snapshot = None;

            if let Some(reserved) = state.reserved_bytes.take() {
                self.repositories.release_reservation(&repository.id, reserved);
            }
            if let Err(e) = self.repositories.refresh_storage(&repository.id).await {
                warn!("storage refresh failed for {}: {}", repository.id, e);
            }

            Ok::<String, EngineError>(marker)
        };
        match finalise.await {
            Ok(marker) => {
                self.tracker.end_step(&step, Outcome::Ok, None).await;
                Ok((bytes, marker))
            }
            Err(e) => {
                self.tracker
                    .end_step(&step, Outcome::Failed, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Runs one phase under a tracker step, honouring cancellation at the
    /// phase boundary.
    async fn phase<T>(
        &self,
        tracker_job: &str,
        name: &str,
        cancel: &CancelSignal,
        work: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let step = self.tracker.start_step(tracker_job, name).await;
        match work.await {
            Ok(value) => {
                self.tracker.end_step(&step, Outcome::Ok, None).await;
                Ok(value)
            }
            Err(e) => {
                self.tracker
                    .end_step(&step, Outcome::Failed, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Releases everything a failed or cancelled job still holds. The
    /// disk's previous change marker is left untouched.
    async fn teardown(
        &self,
        state: &mut JobState,
        repository: &Repository,
        platform: &dyn SourcePlatform,
    ) {
        if let Some(export_name) = state.export_name.take() {
            if let Err(e) = self.exports.remove_export(&export_name).await {
                warn!("teardown: export {} removal failed: {}", export_name, e);
            }
        }
        if let Some(image_path) = &state.image_path {
            if state.image_pinned {
                self.repositories.unpin_image(image_path);
                state.image_pinned = false;
            }
            if let Err(e) = CowImage::mark_invalid(image_path).await {
                warn!(
                    "teardown: could not mark {} invalid: {}",
                    image_path.display(),
                    e
                );
            }
        }
        if let Some(snapshot) = state.snapshot.take() {
            if let Err(e) = platform.release(&snapshot).await {
                warn!("teardown: snapshot release failed: {}", e);
            }
        }
        if let Some(reserved) = state.reserved_bytes.take() {
            self.repositories.release_reservation(&repository.id, reserved);
        }
    }
}

fn outcome_of(job: &BackupJob) -> BackupOutcome {
    BackupOutcome {
        job_id: job.id.clone(),
        status: job.status.clone(),
        image_path: job.image_path.clone(),
        bytes_transferred: job.bytes_transferred,
        change_marker: job.change_marker.clone(),
        error: job.error_message.clone(),
    }
}
