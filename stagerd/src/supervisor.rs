//! Worker lifecycle supervisor
//!
//! The only top-level coordinator: loads the global and per-stream
//! configurations from a directory, spawns one transfer controller and/or
//! arrival monitor task per stream and one disk-space governor per
//! filesystem hosting stream directories, then keeps rescanning the
//! configuration directory for streams appearing or disappearing. Workers
//! share nothing in memory; the supervisor only hands each a child of the
//! root cancellation token and listens for their completion events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use common::config::{self, DatasetConfig, DatasetConfigHandle, GlobalConfig};
use common::fsutil;
use tokio_util::sync::CancellationToken;
use transport::{CommandRunner, ShellRunner};

use crate::arrival::ArrivalMonitor;
use crate::controller::DatasetTransferController;
use crate::governor::DiskSpaceGovernor;

/// Notification from a stream worker back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream drained after its completion unit, or a one-shot pass
    /// over it finished.
    Completed { stream: String },
    /// The stream stopped permanently (fatal configuration error or an
    /// operator stop).
    Stopped { stream: String },
}

struct StreamWorkers {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

pub struct Supervisor {
    config_dir: std::path::PathBuf,
    global: GlobalConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Load the global configuration from `<config_dir>/global.json` (all
    /// defaults when the file is absent). `oneoff` overrides the config.
    pub fn new(config_dir: &std::path::Path, oneoff: bool) -> anyhow::Result<Self> {
        let global_path = config_dir.join("global.json");
        let mut global = if global_path.exists() {
            config::load_global(&global_path)?
        } else {
            GlobalConfig::default()
        };
        if oneoff {
            global.global.oneoff = true;
        }
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            global,
            runner: Arc::new(ShellRunner),
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops every worker at its next checkpoint.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Supervise until cancelled (or, in one-shot mode, until every stream
    /// has reported in).
    pub async fn run(self) -> anyhow::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("cannot listen for SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("cannot listen for SIGTERM")?;

        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();
        let mut workers: HashMap<String, StreamWorkers> = HashMap::new();
        let mut governors: Vec<tokio::task::JoinHandle<()>> = vec![];
        let mut governor_cancel = self.cancel.child_token();
        let mut known_streams: Vec<String> = vec![];
        // streams whose controller has not yet reported; drives one-shot exit
        let mut pending: std::collections::HashSet<String> = Default::default();
        let poll =
            std::time::Duration::from_secs(self.global.global.general_poll_interval.max(1));

        tracing::info!("supervisor starting, config directory {:?}", self.config_dir);
        loop {
            let stream_paths = match self.stream_config_paths().await {
                Ok(paths) => paths,
                Err(error) => {
                    tracing::warn!("could not scan config directory: {:#}", error);
                    HashMap::new()
                }
            };
            let mut configs: Vec<DatasetConfig> = vec![];
            for (name, path) in &stream_paths {
                match config::load_dataset(path) {
                    Ok(config) => configs.push(config),
                    Err(error) => {
                        tracing::warn!("skipping unreadable stream config {:?}: {:#}", path, error);
                        continue;
                    }
                }
                if workers.contains_key(name) {
                    continue;
                }
                match self.start_stream(path, &events_tx) {
                    Ok((started, has_controller)) => {
                        if has_controller {
                            pending.insert(name.clone());
                        }
                        workers.insert(name.clone(), started);
                    }
                    Err(error) => {
                        tracing::error!("could not start stream {}: {:#}", name, error);
                    }
                }
            }
            workers.retain(|name, stream| {
                if stream_paths.contains_key(name) {
                    return true;
                }
                tracing::info!("stream {} removed from configuration, stopping it", name);
                stream.cancel.cancel();
                pending.remove(name);
                false
            });

            let mut streams: Vec<String> = stream_paths.keys().cloned().collect();
            streams.sort();
            if streams != known_streams {
                known_streams = streams;
                governor_cancel.cancel();
                for task in governors.drain(..) {
                    let _ = task.await;
                }
                governor_cancel = self.cancel.child_token();
                governors = self.spawn_governors(&configs, &governor_cancel);
            }

            if self.global.global.oneoff && pending.is_empty() {
                tracing::info!("all one-shot streams finished");
                break;
            }

            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    self.cancel.cancel();
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    self.cancel.cancel();
                }
                () = self.cancel.cancelled() => {}
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        match &event {
                            StreamEvent::Completed { stream } => {
                                tracing::info!("stream {} reported completion", stream);
                                pending.remove(stream);
                            }
                            StreamEvent::Stopped { stream } => {
                                tracing::warn!("stream {} stopped permanently", stream);
                                pending.remove(stream);
                            }
                        }
                    }
                }
                () = tokio::time::sleep(poll) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.cancel.cancel();
        for (name, stream) in workers {
            for task in stream.tasks {
                if let Err(error) = task.await {
                    tracing::warn!("worker task for stream {} panicked: {}", name, error);
                }
            }
        }
        for task in governors {
            let _ = task.await;
        }
        tracing::info!("supervisor finished");
        Ok(())
    }

    /// Stream config files in the config directory: every `*.json` except
    /// `global.json`, keyed by file stem (the stream name).
    async fn stream_config_paths(
        &self,
    ) -> anyhow::Result<HashMap<String, std::path::PathBuf>> {
        let mut paths = HashMap::new();
        for item in fsutil::list_dir(&self.config_dir, false).await? {
            let path = self.config_dir.join(&item);
            if path.extension().is_none_or(|ext| ext != "json") || item == "global.json" {
                continue;
            }
            let Some(stem) = path.file_stem() else {
                continue;
            };
            paths.insert(stem.to_string_lossy().to_string(), path);
        }
        Ok(paths)
    }

    /// Spawn the workers one stream needs: a transfer controller when it
    /// has an outgoing protocol, an arrival monitor when it expects
    /// inbound files. Returns whether a controller was started.
    fn start_stream(
        &self,
        path: &std::path::Path,
        events_tx: &tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    ) -> anyhow::Result<(StreamWorkers, bool)> {
        let cancel = self.cancel.child_token();
        let mut tasks = vec![];
        let handle = DatasetConfigHandle::load(path)?;
        let config = handle.get().clone();
        let has_controller = config.outgoing.transfer_protocol != "none";
        if has_controller {
            tracing::info!("starting transfer controller for stream {}", config.name);
            let controller = DatasetTransferController::new(
                handle,
                self.global.global.clone(),
                self.runner.clone(),
                cancel.clone(),
                events_tx.clone(),
            );
            tasks.push(tokio::spawn(async move {
                match controller.run().await {
                    Ok(status) => tracing::info!("transfer controller exited: {:?}", status),
                    Err(error) => tracing::error!("transfer controller failed: {:#}", error),
                }
            }));
        }
        if config.incoming.require_arrival_monitor {
            tracing::info!("starting arrival monitor for stream {}", config.name);
            let monitor = ArrivalMonitor::new(
                DatasetConfigHandle::load(path)?,
                self.global.global.clone(),
                cancel.clone(),
            );
            tasks.push(tokio::spawn(async move {
                match monitor.run().await {
                    Ok(status) => tracing::info!("arrival monitor exited: {:?}", status),
                    Err(error) => tracing::error!("arrival monitor failed: {:#}", error),
                }
            }));
        }
        Ok((StreamWorkers { cancel, tasks }, has_controller))
    }

    /// One governor per filesystem hosting stream (or incoming)
    /// directories; streams whose directories span two filesystems are
    /// watched by both governors.
    fn spawn_governors(
        &self,
        configs: &[DatasetConfig],
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = vec![];
        for (filesys, datasets) in governor_groups(configs) {
            tracing::info!(
                "starting disk space governor for {:?} ({} stream(s))",
                filesys,
                datasets.len()
            );
            let governor = DiskSpaceGovernor::new(
                filesys,
                self.global.disk_space_monitor.clone(),
                self.global.global.general_poll_interval,
                datasets,
                cancel.clone(),
            );
            tasks.push(tokio::spawn(async move {
                if let Err(error) = governor.run().await {
                    tracing::error!("disk space governor failed: {:#}", error);
                }
            }));
        }
        tasks
    }
}

/// Group streams by the mount point their directories resolve to.
fn governor_groups(
    configs: &[DatasetConfig],
) -> HashMap<std::path::PathBuf, Vec<DatasetConfig>> {
    let mut groups: HashMap<std::path::PathBuf, Vec<DatasetConfig>> = HashMap::new();
    for config in configs {
        let mut mounts = vec![];
        let mut dirs = vec![config.stream_dir()];
        if let Some(incoming) = config.incoming_dir() {
            dirs.push(incoming);
        }
        for dir in dirs {
            match fsutil::mount_point_for_path(dir) {
                Ok(mount) => {
                    if !mounts.contains(&mount) {
                        mounts.push(mount);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        "cannot resolve the filesystem of {:?} for stream {}: {:#}",
                        dir,
                        config.name,
                        error
                    );
                }
            }
        }
        for mount in mounts {
            groups.entry(mount).or_default().push(config.clone());
        }
    }
    groups
}
