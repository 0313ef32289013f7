//! Disk-space governor
//!
//! One governor watches one filesystem hosting stream directories. Each
//! poll it classifies free space into four ordered states and acts on
//! *directional crossings* of the thresholds rather than on levels, so an
//! action fires once per crossing instead of once per poll:
//!
//! - rising through GOOD: remove stop markers for every stream
//! - rising through OKAY: remove stop markers for high-priority streams
//! - falling through LOW: create stop markers for streams at or below the
//!   base priority
//! - while VLOW (every poll): destructive eviction
//!
//! Disk exhaustion is a state here, not an error; only the final
//! "stop everything" escalation logs at error level.

use common::config::{DatasetConfig, DiskSpaceMonitorSection};
use common::fsutil;
use tokio_util::sync::CancellationToken;

use crate::sleep_cancellable;

/// Ordered disk-pressure states; the variant order is the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskState {
    Vlow,
    Low,
    Okay,
    Good,
}

/// Classify free space (MB) against the configured thresholds.
pub fn classify(free_mb: u64, settings: &DiskSpaceMonitorSection) -> DiskState {
    if free_mb > settings.level_good {
        DiskState::Good
    } else if free_mb < settings.level_vlow {
        DiskState::Vlow
    } else if free_mb < settings.level_low {
        DiskState::Low
    } else {
        DiskState::Okay
    }
}

/// Test for a transition to `threshold` in the given direction (rising =
/// improving). Also true when the current state already satisfies the
/// threshold on the very first poll (`prev` is `None`).
pub fn crossed(
    threshold: DiskState,
    state: DiskState,
    prev: Option<DiskState>,
    rising: bool,
) -> bool {
    let direction = if rising {
        std::cmp::Ordering::Greater
    } else {
        std::cmp::Ordering::Less
    };
    let side = state.cmp(&threshold);
    if side != std::cmp::Ordering::Equal && side != direction {
        return false;
    }
    match prev {
        None => true,
        Some(prev) => threshold.cmp(&prev) == direction,
    }
}

pub struct DiskSpaceGovernor {
    filesys: std::path::PathBuf,
    settings: DiskSpaceMonitorSection,
    poll_interval: std::time::Duration,
    /// Streams on this filesystem, lowest priority first.
    datasets: Vec<DatasetConfig>,
    cancel: CancellationToken,
}

impl DiskSpaceGovernor {
    /// `filesys` is the mount point to watch; `datasets` are the streams
    /// whose directories live on it. Unset priorities are filled with the
    /// base priority (in memory only), then streams are ordered by
    /// (priority, name) so eviction has a definite order.
    pub fn new(
        filesys: std::path::PathBuf,
        settings: DiskSpaceMonitorSection,
        general_poll_interval: u64,
        mut datasets: Vec<DatasetConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let base = settings.base_priority;
        for dataset in &mut datasets {
            if dataset.data_stream.priority.is_none() {
                dataset.data_stream.priority = Some(base);
            }
        }
        datasets.sort_by(|a, b| {
            a.priority_or(base)
                .cmp(&b.priority_or(base))
                .then_with(|| a.name.cmp(&b.name))
        });
        let poll_interval =
            std::time::Duration::from_secs(settings.poll_interval.unwrap_or(general_poll_interval));
        Self {
            filesys,
            settings,
            poll_interval,
            datasets,
            cancel,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            "disk space governor starting for {:?} ({} stream(s))",
            self.filesys,
            self.datasets.len()
        );
        for dataset in &self.datasets {
            tracing::debug!(
                "stream {} priority {}",
                dataset.name,
                dataset.priority_or(self.settings.base_priority)
            );
        }
        let mut prev: Option<DiskState> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.disk_state() {
                Err(error) => tracing::warn!("could not read disk state: {:#}", error),
                Ok(state) => {
                    tracing::debug!("disk space state on {:?}: {:?}", self.filesys, state);
                    if crossed(DiskState::Good, state, prev, true) {
                        self.restart_all_datasets().await;
                    }
                    if crossed(DiskState::Okay, state, prev, true) {
                        self.restart_high_priority_datasets().await;
                    }
                    if crossed(DiskState::Low, state, prev, false) {
                        self.stop_datasets_except_high_priority().await;
                    }
                    // eviction runs on every VLOW poll, not just the
                    // transition, so it keeps deleting if more arrives
                    if state == DiskState::Vlow {
                        self.drastic_action().await;
                    }
                    prev = Some(state);
                }
            }
            if sleep_cancellable(&self.cancel, self.poll_interval).await {
                return Ok(());
            }
        }
    }

    fn disk_state(&self) -> anyhow::Result<DiskState> {
        let space = fsutil::disk_space(&self.filesys)?;
        Ok(classify(space.avail_bytes / (1024 * 1024), &self.settings))
    }

    fn is_high_priority(&self, dataset: &DatasetConfig) -> bool {
        dataset.priority_or(self.settings.base_priority) > self.settings.base_priority
    }

    async fn restart_all_datasets(&self) {
        tracing::info!("disk space recovered on {:?}, restarting all streams", self.filesys);
        for dataset in &self.datasets {
            remove_stop_marker(dataset).await;
        }
    }

    async fn restart_high_priority_datasets(&self) {
        tracing::info!(
            "disk space improving on {:?}, restarting high-priority streams",
            self.filesys
        );
        for dataset in self.datasets.iter().filter(|d| self.is_high_priority(d)) {
            remove_stop_marker(dataset).await;
        }
    }

    async fn stop_datasets_except_high_priority(&self) {
        tracing::info!(
            "disk space low on {:?}, stopping streams at or below base priority",
            self.filesys
        );
        for dataset in self.datasets.iter().filter(|d| !self.is_high_priority(d)) {
            create_stop_marker(dataset).await;
        }
    }

    /// Destructive eviction. Works through the eligible (at-or-below base
    /// priority) streams in priority order deleting candidate units, and
    /// only if the filesystem is *still* VLOW after every eligible stream
    /// has been attempted does it escalate to stopping all streams.
    async fn drastic_action(&self) {
        tracing::info!("drastic action on {:?}", self.filesys);
        let mut deletions: Vec<std::path::PathBuf> = vec![];
        let mut recovered = false;
        for dataset in self.datasets.iter().filter(|d| !self.is_high_priority(d)) {
            // marker should already exist from the LOW crossing, but this
            // is cheap and the crossing may have been missed across a
            // restart
            create_stop_marker(dataset).await;
            if !dataset.data_stream.deletion_enabled {
                tracing::info!(
                    "not deleting units of {} (deletion disabled), but need more disk space",
                    dataset.name
                );
                continue;
            }
            if self.delete_units_while_vlow(dataset, &mut deletions).await {
                recovered = true;
                break;
            }
        }
        if !recovered && matches!(self.disk_state(), Ok(DiskState::Vlow)) {
            // eviction across every eligible stream did not fix it
            for dataset in &self.datasets {
                create_stop_marker(dataset).await;
            }
            tracing::error!("had to stop all arrivals on {:?}", self.filesys);
        }
        if !deletions.is_empty() {
            tracing::error!("had to delete transfer units: {:?}", deletions);
        }
    }

    /// Delete one stream's candidate units while the disk stays VLOW.
    /// Returns whether a better state was reached.
    async fn delete_units_while_vlow(
        &self,
        dataset: &DatasetConfig,
        deletions: &mut Vec<std::path::PathBuf>,
    ) -> bool {
        for unit in candidates_for_deletion(dataset).await {
            // re-check before every deletion; stop as soon as we recover
            if !matches!(self.disk_state(), Ok(DiskState::Vlow)) {
                return true;
            }
            let is_dir = unit.is_dir();
            let result = if is_dir {
                fsutil::delete_dir_displaced(&unit).await
            } else {
                tokio::fs::remove_file(&unit)
                    .await
                    .map_err(anyhow::Error::from)
            };
            match result {
                Ok(()) => deletions.push(unit),
                Err(error) => tracing::warn!("could not delete {:?}: {:#}", unit, error),
            }
        }
        !matches!(self.disk_state(), Ok(DiskState::Vlow))
    }
}

/// Candidate transfer units for deletion, in order: arrivals directory
/// first (cheapest -- those files have not been checksummed yet), then the
/// stream directory (minus the quarantine entry) together with the
/// quarantine directory. Each group is ordered newest-created-first, by
/// ctime: the most recent arrivals are the likeliest to still have another
/// copy elsewhere, and mtime may be inherited from a remote system.
pub async fn candidates_for_deletion(dataset: &DatasetConfig) -> Vec<std::path::PathBuf> {
    let quarantine = dataset.quarantine_dir();
    let mut units: Vec<std::path::PathBuf> = fsutil::list_dir_paths(dataset.stream_dir())
        .await
        .into_iter()
        .filter(|path| *path != quarantine)
        .collect();
    units.extend(fsutil::list_dir_paths(&quarantine).await);
    sort_newest_created_first(&mut units);
    let mut ordered = match dataset.incoming_dir() {
        Some(arrivals) => {
            let mut arrivals = fsutil::list_dir_paths(arrivals).await;
            sort_newest_created_first(&mut arrivals);
            arrivals
        }
        None => vec![],
    };
    ordered.extend(units);
    ordered.retain(|path| path.exists());
    ordered
}

fn sort_newest_created_first(units: &mut [std::path::PathBuf]) {
    units.sort_by_key(|path| std::cmp::Reverse(fsutil::ctime_or_none(path)));
}

/// Create a stream's stop marker (a zero-byte file); its mere presence
/// blocks new pushes or arrivals.
pub async fn create_stop_marker(dataset: &DatasetConfig) {
    let path = dataset.stop_marker_path();
    if path.exists() {
        return;
    }
    if let Some(dir) = path.parent() {
        // a brand new stream's directories may not exist yet
        if let Err(error) = fsutil::ensure_dir_exists(dir).await {
            tracing::warn!("could not create stop marker directory: {:#}", error);
            return;
        }
    }
    tracing::info!("creating stop marker {:?}", path);
    if let Err(error) = tokio::fs::write(&path, b"").await {
        tracing::warn!("could not create stop marker {:?}: {}", path, error);
    }
}

pub async fn remove_stop_marker(dataset: &DatasetConfig) {
    let path = dataset.stop_marker_path();
    if path.exists() {
        tracing::info!("removing stop marker {:?}", path);
        fsutil::delete_or_warn(&path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DiskSpaceMonitorSection {
        DiskSpaceMonitorSection {
            poll_interval: None,
            base_priority: 1,
            level_good: 1000,
            level_low: 500,
            level_vlow: 100,
        }
    }

    #[test]
    fn classify_maps_thresholds() {
        let s = settings();
        assert_eq!(classify(2000, &s), DiskState::Good);
        assert_eq!(classify(1000, &s), DiskState::Okay);
        assert_eq!(classify(600, &s), DiskState::Okay);
        assert_eq!(classify(400, &s), DiskState::Low);
        assert_eq!(classify(50, &s), DiskState::Vlow);
    }

    /// Which actions fire for a sequence of states, using the same
    /// crossing predicate the monitor loop applies.
    fn fired_actions(states: &[DiskState]) -> Vec<(usize, &'static str)> {
        let mut fired = vec![];
        let mut prev = None;
        for (idx, &state) in states.iter().enumerate() {
            if crossed(DiskState::Good, state, prev, true) {
                fired.push((idx, "restart_all"));
            }
            if crossed(DiskState::Okay, state, prev, true) {
                fired.push((idx, "restart_high_prio"));
            }
            if crossed(DiskState::Low, state, prev, false) {
                fired.push((idx, "stop_low_prio"));
            }
            if state == DiskState::Vlow {
                fired.push((idx, "drastic"));
            }
            prev = Some(state);
        }
        fired
    }

    #[test]
    fn hysteresis_fires_on_crossings_not_levels() {
        use DiskState::{Good, Low, Okay, Vlow};
        let fired = fired_actions(&[Good, Good, Low, Low, Vlow, Low, Okay, Good]);
        assert_eq!(
            fired,
            vec![
                // first poll: already on the rising side of both thresholds
                (0, "restart_all"),
                (0, "restart_high_prio"),
                // GOOD -> LOW crossing fires the stop exactly once
                (2, "stop_low_prio"),
                // every VLOW poll runs eviction
                (4, "drastic"),
                // LOW -> OKAY rising crossing
                (6, "restart_high_prio"),
                // OKAY -> GOOD rising crossing: restart-all only here
                (7, "restart_all"),
            ]
        );
    }

    #[test]
    fn first_poll_only_fires_on_the_matching_side() {
        // starting in LOW: the falling threshold applies immediately, the
        // rising ones do not
        let fired = fired_actions(&[DiskState::Low]);
        assert_eq!(fired, vec![(0, "stop_low_prio")]);
    }

    fn dataset_for(dir: &std::path::Path, incoming: Option<&std::path::Path>) -> DatasetConfig {
        let incoming_json = match incoming {
            Some(path) => format!(
                r#", "incoming": {{ "require_arrival_monitor": true, "directory": {:?} }}"#,
                path.to_string_lossy()
            ),
            None => String::new(),
        };
        serde_json::from_str(&format!(
            r#"{{ "data_stream": {{ "directory": {:?} }}{} }}"#,
            dir.to_string_lossy(),
            incoming_json
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn eviction_order_is_arrivals_first_then_newest_created() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let stream = tmp.path().join("stream");
        let arrivals = tmp.path().join("arrivals");
        let quarantine = stream.join("quarantine");
        fsutil::ensure_dir_exists(&stream).await?;
        fsutil::ensure_dir_exists(&arrivals).await?;
        fsutil::ensure_dir_exists(&quarantine).await?;
        let pause = std::time::Duration::from_millis(400);
        // created oldest to newest: stream/old, quarantine/rejected,
        // stream/new, arrivals/incoming
        tokio::fs::write(stream.join("old.nc"), "1").await?;
        tokio::time::sleep(pause).await;
        tokio::fs::write(quarantine.join("rejected.nc"), "2").await?;
        tokio::time::sleep(pause).await;
        tokio::fs::write(stream.join("new.nc"), "3").await?;
        tokio::time::sleep(pause).await;
        tokio::fs::write(arrivals.join("incoming.nc"), "4").await?;

        let dataset = dataset_for(&stream, Some(&arrivals));
        let order = candidates_for_deletion(&dataset).await;
        let names: Vec<String> = order
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        // arrivals precede everything regardless of creation time; the
        // rest run newest first; the quarantine dir itself is not a
        // candidate but its contents are
        assert_eq!(names, vec!["incoming.nc", "new.nc", "rejected.nc", "old.nc"]);
        Ok(())
    }

    #[tokio::test]
    async fn stop_markers_are_created_and_removed_in_the_right_place() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let stream = tmp.path().join("stream");
        let incoming = tmp.path().join("incoming");
        let plain = dataset_for(&stream, None);
        create_stop_marker(&plain).await;
        assert!(stream.join(".stop").exists());
        remove_stop_marker(&plain).await;
        assert!(!stream.join(".stop").exists());

        let monitored = dataset_for(&stream, Some(&incoming));
        create_stop_marker(&monitored).await;
        assert!(incoming.join(".stop").exists());
        assert!(!stream.join(".stop").exists());
        Ok(())
    }

    #[test]
    fn datasets_are_ordered_by_priority_then_name_with_default_fill() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = dataset_for(&tmp.path().join("a"), None);
        a.name = "beta".to_string();
        let mut b = dataset_for(&tmp.path().join("b"), None);
        b.name = "alpha".to_string();
        let mut c = dataset_for(&tmp.path().join("c"), None);
        c.name = "gamma".to_string();
        c.data_stream.priority = Some(5);
        let governor = DiskSpaceGovernor::new(
            tmp.path().to_path_buf(),
            settings(),
            3,
            vec![c.clone(), a, b],
            CancellationToken::new(),
        );
        let names: Vec<&str> = governor.datasets.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        // default priorities were filled in memory
        assert_eq!(governor.datasets[0].data_stream.priority, Some(1));
        assert!(governor.is_high_priority(&governor.datasets[2]));
    }
}
