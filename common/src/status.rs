//! Stream status flag

/// Lifecycle flag for one stream, carried in its configuration file and
/// re-read at every checkpoint. Operators stop a stream by setting it to
/// `STOPPED`; controllers set `COMPLETE` when a completion unit has been
/// seen and the stream directory drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    #[default]
    Running,
    Stopped,
    Complete,
}
