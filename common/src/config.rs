//! Typed configuration for the stager tools
//!
//! One `global.json` plus one `<stream>.json` per stream live in a
//! configuration directory. Files are plain JSON deserialized into the
//! typed sections below; every setting has a default so a minimal stream
//! file only names its directory and target.
//!
//! String values may embed `{{var:NAME}}` tokens, substituted from process
//! environment variables at load time. This is variable lookup and
//! concatenation only -- there is deliberately no expression evaluation.

use anyhow::Context;

use crate::status::StreamStatus;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub global: GlobalSection,
    #[serde(default)]
    pub disk_space_monitor: DiskSpaceMonitorSection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GlobalSection {
    /// Seconds between scan cycles and between push retries.
    pub general_poll_interval: u64,
    /// Process every stream once and exit instead of scanning forever.
    pub oneoff: bool,
    pub debug_on: bool,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            general_poll_interval: 3,
            oneoff: false,
            debug_on: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DiskSpaceMonitorSection {
    /// Seconds between disk polls; falls back to `general_poll_interval`.
    pub poll_interval: Option<u64>,
    /// Streams at or below this priority are throttled first.
    pub base_priority: i32,
    /// Free-space thresholds in MB.
    pub level_good: u64,
    pub level_low: u64,
    pub level_vlow: u64,
}

impl Default for DiskSpaceMonitorSection {
    fn default() -> Self {
        Self {
            poll_interval: None,
            base_priority: 1,
            level_good: 1024,
            level_low: 512,
            level_vlow: 128,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatasetConfig {
    /// Stream name; filled from the config file's stem when absent.
    #[serde(default)]
    pub name: String,
    pub data_stream: DataStreamSection,
    #[serde(default)]
    pub incoming: IncomingSection,
    #[serde(default)]
    pub outgoing: OutgoingSection,
    #[serde(default)]
    pub rsync_ssh: RsyncSshSection,
    #[serde(default)]
    pub rsync_native: RsyncNativeSection,
    #[serde(default)]
    pub ftp: FtpSection,
    #[serde(default)]
    pub gridftp: GridftpSection,
}

impl DatasetConfig {
    pub fn stream_dir(&self) -> &std::path::Path {
        &self.data_stream.directory
    }

    /// Quarantine directory; defaults to `quarantine` under the stream dir.
    pub fn quarantine_dir(&self) -> std::path::PathBuf {
        self.outgoing
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| self.data_stream.directory.join("quarantine"))
    }

    pub fn incoming_dir(&self) -> Option<&std::path::Path> {
        self.incoming.directory.as_deref()
    }

    /// Where this stream's stop marker lives: the incoming directory when an
    /// arrival monitor runs, the stream directory otherwise.
    pub fn stop_marker_path(&self) -> std::path::PathBuf {
        let dir = match (self.incoming.require_arrival_monitor, self.incoming_dir()) {
            (true, Some(incoming)) => incoming,
            _ => self.stream_dir(),
        };
        dir.join(&self.incoming.stop_file)
    }

    pub fn priority_or(&self, base: i32) -> i32 {
        self.data_stream.priority.unwrap_or(base)
    }

    /// Full path for a basename inside the stream directory; only the
    /// basename part of `name` is used.
    pub fn path_in_stream(&self, name: &str) -> std::path::PathBuf {
        path_in_dir(name, self.stream_dir())
    }
}

/// Join a basename onto a directory, discarding any path components the
/// name may carry.
pub fn path_in_dir(name: &str, dir: &std::path::Path) -> std::path::PathBuf {
    match std::path::Path::new(name).file_name() {
        Some(base) => dir.join(base),
        None => dir.to_path_buf(),
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataStreamSection {
    pub directory: std::path::PathBuf,
    #[serde(default)]
    pub status: StreamStatus,
    /// Governor priority; unset means "use the base priority".
    #[serde(default)]
    pub priority: Option<i32>,
    /// Unit whose arrival arms completion detection.
    #[serde(default)]
    pub completion_file: Option<String>,
    /// Allow the disk governor to evict this stream's units under VLOW.
    #[serde(default)]
    pub deletion_enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IncomingSection {
    pub require_arrival_monitor: bool,
    pub directory: Option<std::path::PathBuf>,
    pub control_file_extension: String,
    pub receipt_file_extension: String,
    pub thankyou_file_extension: String,
    pub stop_file: String,
}

impl Default for IncomingSection {
    fn default() -> Self {
        Self {
            require_arrival_monitor: false,
            directory: None,
            control_file_extension: "stager-ctrl-bss".to_string(),
            receipt_file_extension: "stager-rcpt-bss".to_string(),
            thankyou_file_extension: "stager-thanks-bss".to_string(),
            stop_file: ".stop".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Delete units locally once delivered.
    #[default]
    Move,
    /// Retain units locally; directories are pushed as-is, not zipped.
    Mirror,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutgoingSection {
    /// One of `rsync_ssh`, `rsync_native`, `ftp`, `gridftp`, or `none`.
    pub transfer_protocol: String,
    pub target_host: Option<String>,
    pub target_dir: Option<String>,
    pub target_uses_arrival_monitor: bool,
    pub control_file_extension: String,
    pub receipt_file_extension: String,
    pub thankyou_file_extension: String,
    pub retry_count: u32,
    pub receipt_file_poll_count: u32,
    pub receipt_file_poll_interval: u64,
    pub stop_file: String,
    pub stop_file_poll_interval: u64,
    pub quarantine_dir: Option<std::path::PathBuf>,
    /// Largest directory unit we will zip and send, in MB.
    pub dir_size_limit: Option<u64>,
    pub transfer_mode: TransferMode,
}

impl Default for OutgoingSection {
    fn default() -> Self {
        Self {
            transfer_protocol: "none".to_string(),
            target_host: None,
            target_dir: None,
            target_uses_arrival_monitor: false,
            control_file_extension: "stager-ctrl-bss".to_string(),
            receipt_file_extension: "stager-rcpt-bss".to_string(),
            thankyou_file_extension: "stager-thanks-bss".to_string(),
            retry_count: 3,
            receipt_file_poll_count: 100,
            receipt_file_poll_interval: 5,
            stop_file: ".stop".to_string(),
            stop_file_poll_interval: 600,
            quarantine_dir: None,
            dir_size_limit: None,
            transfer_mode: TransferMode::Move,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RsyncSshSection {
    pub cmd: Option<String>,
    pub use_checksum: bool,
    pub check_size: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RsyncNativeSection {
    pub cmd: Option<String>,
    pub module: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FtpSection {
    pub cmd: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GridftpSection {
    pub cmd: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<String>,
}

/// Substitute `{{var:NAME}}` tokens from the process environment.
pub fn substitute_vars(input: &str) -> anyhow::Result<String> {
    const OPEN: &str = "{{var:";
    const CLOSE: &str = "}}";
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .with_context(|| format!("unterminated {{{{var:...}}}} token in {input:?}"))?;
        let name = &after[..end];
        let value = std::env::var(name)
            .with_context(|| format!("environment variable {name:?} referenced in config is not set"))?;
        out.push_str(&value);
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute_value(value: &mut serde_json::Value) -> anyhow::Result<()> {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("{{var:") {
                *s = substitute_vars(s)?;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn load_value(path: &std::path::Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {:?}", path))?;
    let mut value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("failed parsing config file {:?}", path))?;
    substitute_value(&mut value)?;
    Ok(value)
}

pub fn load_global(path: &std::path::Path) -> anyhow::Result<GlobalConfig> {
    let value = load_value(path)?;
    serde_json::from_value(value).with_context(|| format!("invalid global config {:?}", path))
}

pub fn load_dataset(path: &std::path::Path) -> anyhow::Result<DatasetConfig> {
    let value = load_value(path)?;
    let mut config: DatasetConfig = serde_json::from_value(value)
        .with_context(|| format!("invalid stream config {:?}", path))?;
    if config.name.is_empty() {
        config.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
    }
    Ok(config)
}

/// A stream config bound to its file, re-readable on mtime change.
#[derive(Debug)]
pub struct DatasetConfigHandle {
    path: std::path::PathBuf,
    mtime: Option<std::time::SystemTime>,
    value: DatasetConfig,
}

impl DatasetConfigHandle {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let value = load_dataset(path)?;
        let mtime = std::fs::metadata(path).and_then(|md| md.modified()).ok();
        Ok(Self {
            path: path.to_path_buf(),
            mtime,
            value,
        })
    }

    pub fn get(&self) -> &DatasetConfig {
        &self.value
    }

    /// Re-read the file if it changed on disk; returns whether it did.
    ///
    /// A file that vanished or no longer parses keeps the last good config;
    /// an unattended daemon must not die over a half-edited file.
    pub fn reread_if_updated(&mut self) -> bool {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|md| md.modified())
            .ok();
        if mtime.is_none() || mtime == self.mtime {
            return false;
        }
        match load_dataset(&self.path) {
            Ok(value) => {
                self.value = value;
                self.mtime = mtime;
                tracing::info!("config file {:?} reread", self.path);
                true
            }
            Err(error) => {
                tracing::warn!("ignoring unreadable config update {:?}: {:#}", self.path, error);
                self.mtime = mtime;
                false
            }
        }
    }
}
