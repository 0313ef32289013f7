//! Per-stream transfer controller
//!
//! One controller owns one stream directory. Each scan cycle it re-reads
//! configuration and status, lists the eligible transfer units oldest
//! first, gates each behind a two-sample stability check, and hands stable
//! units to the transfer engine strictly one at a time -- there are never
//! concurrent transfers within a stream, trading throughput for a simple
//! failure model.
//!
//! Units the engine fails on stay in place for the next cycle. A missing
//! transport setting is different: retrying cannot fix configuration, so
//! the controller stops the stream permanently and tells the supervisor.

use std::sync::Arc;

use common::config::{DatasetConfig, DatasetConfigHandle, GlobalSection};
use common::fsutil;
use common::status::StreamStatus;
use tokio_util::sync::CancellationToken;
use transport::CommandRunner;

use crate::engine::{EngineError, TransferEngine, TransferOutcome};
use crate::sleep_cancellable;
use crate::supervisor::StreamEvent;

/// Gap between the two stability samples.
pub const STABILITY_GAP: std::time::Duration = std::time::Duration::from_secs(5);

/// Two-sample stability check: a unit is eligible only when size and mtime
/// are unchanged across `gap`. Directories are checked file-by-file; any
/// contained file changing (or appearing, or vanishing) marks the whole
/// unit unstable for this cycle.
pub async fn two_sample_stable(
    path: &std::path::Path,
    gap: std::time::Duration,
    cancel: &CancellationToken,
) -> bool {
    let Some(first) = sample(path).await else {
        return false;
    };
    if sleep_cancellable(cancel, gap).await {
        return false;
    }
    match sample(path).await {
        Some(second) => first == second,
        None => false,
    }
}

async fn sample(path: &std::path::Path) -> Option<Vec<(std::path::PathBuf, fsutil::Snapshot)>> {
    let md = tokio::fs::symlink_metadata(path).await.ok()?;
    if !md.is_dir() {
        return Some(vec![(path.to_path_buf(), fsutil::snapshot(path).await?)]);
    }
    let mut snapshots = vec![];
    for file in fsutil::walk_files(path).await.ok()? {
        let snapshot = fsutil::snapshot(&file).await?;
        snapshots.push((file, snapshot));
    }
    snapshots.sort();
    Some(snapshots)
}

pub struct DatasetTransferController {
    handle: DatasetConfigHandle,
    global: GlobalSection,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    events: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    status: StreamStatus,
    stability_gap: std::time::Duration,
}

impl DatasetTransferController {
    pub fn new(
        handle: DatasetConfigHandle,
        global: GlobalSection,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
        events: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let status = handle.get().data_stream.status;
        Self {
            handle,
            global,
            runner,
            cancel,
            events,
            status,
            stability_gap: STABILITY_GAP,
        }
    }

    /// Override the stability gap; tests use a short one.
    pub fn with_stability_gap(mut self, gap: std::time::Duration) -> Self {
        self.stability_gap = gap;
        self
    }

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.global.general_poll_interval)
    }

    fn stream_name(&self) -> String {
        self.handle.get().name.clone()
    }

    fn update_status_and_config(&mut self) {
        if self.handle.reread_if_updated() {
            self.status = self.handle.get().data_stream.status;
        }
        if self.status == StreamStatus::Stopped {
            tracing::info!("stop requested in config for stream {}", self.stream_name());
        } else if self.cancel.is_cancelled() {
            tracing::info!("stop requested for stream {}", self.stream_name());
            self.status = StreamStatus::Stopped;
        }
    }

    fn notify(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("supervisor is gone, dropping stream event");
        }
    }

    /// Scan loop; runs until the stream completes, is stopped, or hits a
    /// configuration error.
    pub async fn run(mut self) -> anyhow::Result<StreamStatus> {
        let name = self.stream_name();
        tracing::info!("dataset transfer controller starting for stream {}", name);
        self.do_setup().await?;
        if self.status == StreamStatus::Complete {
            return Ok(self.status);
        }
        self.status = StreamStatus::Running;
        let mut had_completion_unit = false;
        loop {
            self.update_status_and_config();
            if self.status == StreamStatus::Stopped {
                return Ok(self.status);
            }
            let config = self.handle.get().clone();
            let wants_transfer = config.outgoing.transfer_protocol != "none";
            if wants_transfer
                && (config.outgoing.target_host.is_none() || config.outgoing.target_dir.is_none())
            {
                tracing::error!(
                    "stream {} has no transfer target configured, stopping permanently",
                    name
                );
                self.status = StreamStatus::Stopped;
                self.notify(StreamEvent::Stopped {
                    stream: name.clone(),
                });
                return Ok(self.status);
            }
            let items = match fsutil::list_dir(config.stream_dir(), false).await {
                Ok(items) => items,
                Err(error) => {
                    tracing::warn!("could not list stream directory: {:#}", error);
                    vec![]
                }
            };
            // completion: the completion unit has been seen at least once
            // and a subsequent scan finds the directory empty
            if items.is_empty() && had_completion_unit {
                tracing::info!("stream {} complete", name);
                self.status = StreamStatus::Complete;
                self.notify(StreamEvent::Completed {
                    stream: name.clone(),
                });
                return Ok(self.status);
            }
            if !items.is_empty() {
                tracing::info!(
                    "found {} transfer unit(s) for stream {}, starting with {:?}",
                    items.len(),
                    name,
                    &items[..items.len().min(3)]
                );
            }
            let mut processed = 0usize;
            for item in &items {
                if self.cancel.is_cancelled() {
                    return Ok(StreamStatus::Stopped);
                }
                if self.ignored(&config, item) {
                    continue;
                }
                let path = config.path_in_stream(item);
                if !two_sample_stable(&path, self.stability_gap, &self.cancel).await {
                    tracing::info!("unit {} is still changing, skipping this cycle", item);
                    continue;
                }
                processed += 1;
                if processed % 5 == 0 {
                    self.update_status_and_config();
                    if self.status == StreamStatus::Stopped {
                        return Ok(self.status);
                    }
                }
                if wants_transfer && !self.transfer_one(item).await? {
                    return Ok(self.status);
                }
                if config.data_stream.completion_file.as_deref() == Some(item.as_str()) {
                    had_completion_unit = true;
                }
            }
            if self.global.oneoff {
                tracing::info!("one-shot pass over stream {} finished", self.stream_name());
                self.status = StreamStatus::Complete;
                self.notify(StreamEvent::Completed {
                    stream: self.stream_name(),
                });
                return Ok(self.status);
            }
            tracing::debug!(
                "sleeping for {}s before rescanning stream {}",
                self.global.general_poll_interval,
                self.stream_name()
            );
            if sleep_cancellable(&self.cancel, self.poll_interval()).await {
                return Ok(StreamStatus::Stopped);
            }
        }
    }

    /// Run the engine for one unit. Returns false when the stream must
    /// stop (abort or fatal configuration error).
    async fn transfer_one(&mut self, item: &str) -> anyhow::Result<bool> {
        let config = self.handle.get().clone();
        let engine = match TransferEngine::new(
            config,
            self.poll_interval(),
            self.runner.clone(),
            self.cancel.clone(),
        ) {
            Ok(engine) => engine,
            Err(EngineError::Configuration(error)) => {
                return self.stop_for_configuration(&error.to_string());
            }
            Err(EngineError::Failed { log, .. }) => {
                tracing::error!("engine setup failed: {}", log);
                return Ok(true);
            }
        };
        match engine.run(item).await {
            Ok(TransferOutcome::Delivered { .. }) => {}
            Ok(TransferOutcome::Quarantined { item }) => {
                tracing::warn!("did not attempt transfer of {}", item);
            }
            Ok(TransferOutcome::Aborted) => {
                self.status = StreamStatus::Stopped;
                return Ok(false);
            }
            Err(EngineError::Configuration(error)) => {
                return self.stop_for_configuration(&error.to_string());
            }
            Err(error @ EngineError::Failed { .. }) => {
                // unit stays in place for the next scan cycle
                tracing::error!("{}", error);
            }
        }
        Ok(true)
    }

    fn stop_for_configuration(&mut self, error: &str) -> anyhow::Result<bool> {
        tracing::error!(
            "stream {} cannot run with its current configuration ({}), stopping permanently",
            self.stream_name(),
            error
        );
        self.status = StreamStatus::Stopped;
        self.notify(StreamEvent::Stopped {
            stream: self.stream_name(),
        });
        Ok(false)
    }

    async fn do_setup(&mut self) -> anyhow::Result<()> {
        let config = self.handle.get().clone();
        fsutil::ensure_dir_exists(config.stream_dir()).await?;
        tidy_stream_dir(&config).await;
        Ok(())
    }

    fn ignored(&self, config: &DatasetConfig, item: &str) -> bool {
        // the quarantine directory may live under the stream directory
        if config.path_in_stream(item) == config.quarantine_dir() {
            return true;
        }
        // handshake chatter is all dot-files; the listing already excludes
        // them but be safe
        fsutil::is_dotfile(item)
    }
}

/// Remove control-record files left over from a previous run.
pub async fn tidy_stream_dir(config: &DatasetConfig) {
    let suffix = format!(".{}", config.outgoing.control_file_extension);
    let items = match fsutil::list_dir(config.stream_dir(), true).await {
        Ok(items) => items,
        Err(_) => return,
    };
    for item in items {
        if item.ends_with(&suffix) {
            fsutil::delete_or_warn(&config.path_in_stream(&item)).await;
        }
    }
}
