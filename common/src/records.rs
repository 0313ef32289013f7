//! Durable handshake record files
//!
//! Three record types travel alongside the data file: a control record
//! announcing what was sent, a receipt record carrying the receiver's
//! verdict, and a thank-you record acknowledging the receipt. Each is a
//! short line-oriented file bracketed by type-specific magic marker lines;
//! a file missing either marker (or otherwise malformed) is `Invalid`, and
//! callers decide from the file's age whether it is still arriving or
//! corrupt. Writes always go through a temp-file-then-rename step so no
//! partial record is ever observable at the final path.

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid record file {path:?}")]
    Invalid { path: std::path::PathBuf },
    #[error("record file {path:?} already exists")]
    AlreadyExists { path: std::path::PathBuf },
    #[error("failed writing record file {path:?}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A line-encodable record type with its magic marker lines.
pub trait Record: Sized {
    const MAGIC_START: &'static str;
    const MAGIC_END: &'static str;

    /// Interior lines of the record file, in fixed order.
    fn encode(&self) -> Vec<String>;

    /// Rebuild the record from interior lines; `None` marks the file invalid.
    fn decode(lines: &[String]) -> Option<Self>;
}

/// Read and validate a record file.
///
/// Any failure to read or parse (missing file, wrong magic lines, wrong
/// field count, non-numeric fields) maps to [`RecordError::Invalid`] -- the
/// caller cannot do anything more fine-grained with a half-arrived file.
pub fn read<R: Record>(path: &std::path::Path) -> Result<R, RecordError> {
    let invalid = || RecordError::Invalid {
        path: path.to_path_buf(),
    };
    let text = std::fs::read_to_string(path).map_err(|_| invalid())?;
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    if lines.len() < 2
        || lines.first().map(String::as_str) != Some(R::MAGIC_START)
        || lines.last().map(String::as_str) != Some(R::MAGIC_END)
    {
        return Err(invalid());
    }
    R::decode(&lines[1..lines.len() - 1]).ok_or_else(invalid)
}

/// Write a record file atomically (temp path, then rename).
pub fn write<R: Record>(path: &std::path::Path, record: &R) -> Result<(), RecordError> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut contents = String::new();
    contents.push_str(R::MAGIC_START);
    contents.push('\n');
    for line in record.encode() {
        contents.push_str(&line);
        contents.push('\n');
    }
    contents.push_str(R::MAGIC_END);
    contents.push('\n');
    let tmp_path = temp_path_for(path);
    std::fs::write(&tmp_path, contents).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)
}

/// Create a record file, refusing to clobber an existing one unless
/// `overwrite` is set. The pre-existing record is left untouched on refusal.
pub fn create<R: Record>(
    path: &std::path::Path,
    record: &R,
    overwrite: bool,
) -> Result<(), RecordError> {
    if !overwrite && path.exists() {
        return Err(RecordError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    write(path, record)
}

fn temp_path_for(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("_tmp");
    std::path::PathBuf::from(name)
}

/// Metadata sent with a data file: the name it was sent under, its expected
/// size and checksum, and the basename the receiver must use for the receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub data_file_name: String,
    pub size: u64,
    pub checksum: String,
    pub receipt_file_name: String,
}

impl Record for ControlRecord {
    const MAGIC_START: &'static str = "_start_stager_ctrl_data_";
    const MAGIC_END: &'static str = "_end_stager_ctrl_data_";

    fn encode(&self) -> Vec<String> {
        vec![
            self.data_file_name.clone(),
            self.size.to_string(),
            self.checksum.clone(),
            self.receipt_file_name.clone(),
        ]
    }

    fn decode(lines: &[String]) -> Option<Self> {
        let [data_file_name, size, checksum, receipt_file_name] = lines else {
            return None;
        };
        Some(Self {
            data_file_name: data_file_name.clone(),
            size: size.parse().ok()?,
            checksum: checksum.clone(),
            receipt_file_name: receipt_file_name.clone(),
        })
    }
}

/// Receiver's verdict on a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    BadSize,
    BadChecksum,
    IoError,
    NoSuchFile,
}

impl ReceiptStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::BadSize => 1,
            Self::BadChecksum => 2,
            Self::IoError => 3,
            Self::NoSuchFile => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::BadSize),
            2 => Some(Self::BadChecksum),
            3 => Some(Self::IoError),
            4 => Some(Self::NoSuchFile),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BadSize => "data file has bad size",
            Self::BadChecksum => "data file has bad checksum",
            Self::IoError => "I/O error reading data file",
            Self::NoSuchFile => "data file does not exist",
        }
    }
}

/// The receiving side's verdict: status plus what was actually observed.
///
/// `size` is `-1` and `checksum` empty when the corresponding check never
/// ran (missing file, I/O error). `thankyou_file_name` is the basename the
/// sender must use for its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRecord {
    pub data_file_name: String,
    pub status: ReceiptStatus,
    pub size: i64,
    pub checksum: String,
    pub thankyou_file_name: String,
}

impl Record for ReceiptRecord {
    const MAGIC_START: &'static str = "_start_stager_receipt_data_";
    const MAGIC_END: &'static str = "_end_stager_receipt_data_";

    fn encode(&self) -> Vec<String> {
        vec![
            self.data_file_name.clone(),
            i64::from(self.status.code()).to_string(),
            self.size.to_string(),
            self.checksum.clone(),
            self.thankyou_file_name.clone(),
        ]
    }

    fn decode(lines: &[String]) -> Option<Self> {
        let [data_file_name, status, size, checksum, thankyou_file_name] = lines else {
            return None;
        };
        Some(Self {
            data_file_name: data_file_name.clone(),
            status: ReceiptStatus::from_code(status.parse().ok()?)?,
            size: size.parse().ok()?,
            checksum: checksum.clone(),
            thankyou_file_name: thankyou_file_name.clone(),
        })
    }
}

/// Sender's acknowledgment naming the receipt it retires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThankyouRecord {
    pub receipt_file_name: String,
}

impl Record for ThankyouRecord {
    const MAGIC_START: &'static str = "_start_stager_thankyou_";
    const MAGIC_END: &'static str = "_end_stager_thankyou_";

    fn encode(&self) -> Vec<String> {
        vec![self.receipt_file_name.clone()]
    }

    fn decode(lines: &[String]) -> Option<Self> {
        let [receipt_file_name] = lines else {
            return None;
        };
        Some(Self {
            receipt_file_name: receipt_file_name.clone(),
        })
    }
}
