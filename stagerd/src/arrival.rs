//! Receiving-side arrival monitor
//!
//! Scans one incoming directory for control records, verifies the data
//! files they announce (existence, then size, then checksum -- the first
//! failing check decides the receipt status), delivers accepted files into
//! the stream directory, and retires receipts when their thank-you
//! acknowledgments arrive.
//!
//! Data files are never touched until a control record refers to them, so
//! partially arrived data is harmless -- but the sender must push the
//! control record after the data file. An unparseable record younger than
//! the grace age is assumed to still be arriving and left alone; an old
//! one is discarded with a warning, and the remote sender will time out
//! and retry from scratch.

use common::config::{path_in_dir, DatasetConfig, DatasetConfigHandle, GlobalSection};
use common::records::{ControlRecord, ReceiptRecord, ReceiptStatus, ThankyouRecord};
use common::status::StreamStatus;
use common::{checksum, fsutil, records};
use tokio_util::sync::CancellationToken;

use crate::sleep_cancellable;

/// Age below which an unparseable record file is assumed still in flight.
pub const MAX_AGE_FOR_BAD_RECORD: std::time::Duration = std::time::Duration::from_secs(10);

pub struct ArrivalMonitor {
    handle: DatasetConfigHandle,
    global: GlobalSection,
    cancel: CancellationToken,
    status: StreamStatus,
}

impl ArrivalMonitor {
    pub fn new(
        handle: DatasetConfigHandle,
        global: GlobalSection,
        cancel: CancellationToken,
    ) -> Self {
        let status = handle.get().data_stream.status;
        Self {
            handle,
            global,
            cancel,
            status,
        }
    }

    /// Monitor loop; runs until stopped.
    pub async fn run(mut self) -> anyhow::Result<StreamStatus> {
        let config = self.handle.get().clone();
        let Some(incoming_dir) = config.incoming_dir().map(std::path::Path::to_path_buf) else {
            anyhow::bail!(
                "stream {} requires an arrival monitor but has no incoming.directory",
                config.name
            );
        };
        tracing::info!(
            "arrival monitor starting for stream {} on {:?}",
            config.name,
            incoming_dir
        );
        fsutil::ensure_dir_exists(config.stream_dir()).await?;
        fsutil::ensure_dir_exists(&incoming_dir).await?;
        loop {
            self.update_status_and_config();
            if self.status == StreamStatus::Stopped {
                return Ok(self.status);
            }
            let config = self.handle.get().clone();
            let ctl_suffix = format!(".{}", config.incoming.control_file_extension);
            let thanks_suffix = format!(".{}", config.incoming.thankyou_file_extension);
            let items = match fsutil::list_dir(&incoming_dir, true).await {
                Ok(items) => items,
                Err(error) => {
                    tracing::warn!("could not list incoming directory: {:#}", error);
                    vec![]
                }
            };
            for item in items {
                if item.ends_with(&ctl_suffix) {
                    self.respond_to_control_file(&config, &incoming_dir, &item)
                        .await;
                } else if item.ends_with(&thanks_suffix) {
                    self.respond_to_thankyou_file(&incoming_dir, &item).await;
                }
            }
            if sleep_cancellable(
                &self.cancel,
                std::time::Duration::from_secs(self.global.general_poll_interval),
            )
            .await
            {
                return Ok(StreamStatus::Stopped);
            }
        }
    }

    fn update_status_and_config(&mut self) {
        if self.handle.reread_if_updated() {
            self.status = self.handle.get().data_stream.status;
        }
        if self.cancel.is_cancelled() {
            self.status = StreamStatus::Stopped;
        }
    }

    /// Handle one control record: verify the data file it names, deliver
    /// or delete it, and answer with a receipt.
    async fn respond_to_control_file(
        &self,
        config: &DatasetConfig,
        incoming_dir: &std::path::Path,
        item: &str,
    ) {
        let ctl_path = path_in_dir(item, incoming_dir);
        let control = match records::read::<ControlRecord>(&ctl_path) {
            Ok(control) => control,
            Err(_) => {
                discard_if_old(&ctl_path, "control").await;
                return;
            }
        };
        tracing::info!(
            "control file {} says {} size {} cksum {}",
            item,
            control.data_file_name,
            control.size,
            control.checksum
        );
        let data_path = path_in_dir(&control.data_file_name, incoming_dir);
        let verdict = check_file(&data_path, control.size, &control.checksum).await;
        if verdict.status == ReceiptStatus::Success {
            let delivered = config.path_in_stream(&control.data_file_name);
            match tokio::fs::rename(&data_path, &delivered).await {
                Ok(()) => tracing::info!(
                    "file {} accepted (size {}, cksum {})",
                    control.data_file_name,
                    control.size,
                    control.checksum
                ),
                Err(error) => {
                    tracing::error!(
                        "could not deliver {} to stream directory: {}",
                        control.data_file_name,
                        error
                    );
                }
            }
        } else {
            tracing::warn!(
                "file {} rejected: {}",
                control.data_file_name,
                verdict.status.describe()
            );
            fsutil::delete_or_warn(&data_path).await;
        }
        // delete the control file before writing the receipt: a fast
        // retrying sender's next control file must not be mistaken for a
        // leftover of this attempt
        fsutil::delete_or_warn(&ctl_path).await;
        self.create_receipt_file(config, incoming_dir, &control, verdict)
            .await;
    }

    /// Write the receipt the control record asked for. The thank-you name
    /// embeds a fresh timestamp so retries of the same data file never
    /// collide with an earlier attempt's acknowledgment.
    async fn create_receipt_file(
        &self,
        config: &DatasetConfig,
        incoming_dir: &std::path::Path,
        control: &ControlRecord,
        verdict: Verdict,
    ) {
        let thankyou_file_name = format!(
            ".{}.{}.{}",
            control.data_file_name,
            fsutil::filename_timestamp(),
            config.incoming.thankyou_file_extension
        );
        let receipt_path = path_in_dir(&control.receipt_file_name, incoming_dir);
        let receipt = ReceiptRecord {
            data_file_name: control.data_file_name.clone(),
            status: verdict.status,
            size: verdict.size,
            checksum: verdict.checksum,
            thankyou_file_name: thankyou_file_name.clone(),
        };
        match records::create(&receipt_path, &receipt, true) {
            Ok(()) => tracing::debug!(
                "made receipt file {}, want thank-you file {}",
                control.receipt_file_name,
                thankyou_file_name
            ),
            Err(error) => tracing::warn!("could not write receipt file: {}", error),
        }
    }

    /// Handle a thank-you: delete the receipt it acknowledges, then the
    /// thank-you itself.
    async fn respond_to_thankyou_file(&self, incoming_dir: &std::path::Path, item: &str) {
        let thankyou_path = path_in_dir(item, incoming_dir);
        match records::read::<ThankyouRecord>(&thankyou_path) {
            Ok(thankyou) => {
                let receipt_path = path_in_dir(&thankyou.receipt_file_name, incoming_dir);
                fsutil::delete_or_warn(&receipt_path).await;
                tracing::debug!("deleted receipt file {:?}", receipt_path);
            }
            Err(_) => {
                discard_if_old(&thankyou_path, "thank-you").await;
                return;
            }
        }
        fsutil::delete_or_warn(&thankyou_path).await;
        tracing::debug!("deleted thank-you file {:?}", thankyou_path);
    }
}

/// Young invalid records may still be arriving; old ones are discarded.
async fn discard_if_old(path: &std::path::Path, kind: &str) {
    match fsutil::file_age(path) {
        Some(age) if age < MAX_AGE_FOR_BAD_RECORD => {}
        None => {}
        Some(_) => {
            tracing::warn!("unparseable {} file {:?}", kind, path);
            fsutil::delete_or_warn(path).await;
        }
    }
}

struct Verdict {
    status: ReceiptStatus,
    size: i64,
    checksum: String,
}

/// Verify a data file against its control record: existence, then size,
/// then checksum. Later checks are skipped once one fails.
async fn check_file(path: &std::path::Path, correct_size: u64, correct_cksum: &str) -> Verdict {
    let md = match tokio::fs::metadata(path).await {
        Ok(md) => md,
        Err(_) => {
            tracing::warn!("{:?}: no such file", path);
            return Verdict {
                status: ReceiptStatus::NoSuchFile,
                size: -1,
                checksum: String::new(),
            };
        }
    };
    let actual_size = md.len();
    if actual_size != correct_size {
        tracing::warn!(
            "{:?} actual size {} correct size {}",
            path,
            actual_size,
            correct_size
        );
        return Verdict {
            status: ReceiptStatus::BadSize,
            size: actual_size as i64,
            checksum: String::new(),
        };
    }
    match checksum::md5_file(path).await {
        Err(error) => {
            tracing::warn!("I/O error checksumming {:?}: {:#}", path, error);
            Verdict {
                status: ReceiptStatus::IoError,
                size: actual_size as i64,
                checksum: String::new(),
            }
        }
        Ok(actual_cksum) if actual_cksum != correct_cksum => {
            tracing::warn!(
                "{:?} actual cksum {} correct cksum {}",
                path,
                actual_cksum,
                correct_cksum
            );
            Verdict {
                status: ReceiptStatus::BadChecksum,
                size: actual_size as i64,
                checksum: actual_cksum,
            }
        }
        Ok(actual_cksum) => Verdict {
            status: ReceiptStatus::Success,
            size: actual_size as i64,
            checksum: actual_cksum,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verification_stops_at_first_failing_check() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("dataset.nc");

        let missing = check_file(&path, 4, "whatever").await;
        assert_eq!(missing.status, ReceiptStatus::NoSuchFile);
        assert_eq!(missing.size, -1);

        tokio::fs::write(&path, "data").await?;
        let bad_size = check_file(&path, 5, "whatever").await;
        assert_eq!(bad_size.status, ReceiptStatus::BadSize);
        assert_eq!(bad_size.size, 4);
        assert!(bad_size.checksum.is_empty());

        let bad_cksum = check_file(&path, 4, "not-the-digest").await;
        assert_eq!(bad_cksum.status, ReceiptStatus::BadChecksum);
        assert!(!bad_cksum.checksum.is_empty());

        let digest = checksum::md5_file(&path).await?;
        let good = check_file(&path, 4, &digest).await;
        assert_eq!(good.status, ReceiptStatus::Success);
        assert_eq!(good.checksum, digest);
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn young_garbage_is_left_alone_old_garbage_is_discarded() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let young = tmp.path().join(".part.stager-ctrl-bss");
        tokio::fs::write(&young, "still arriving").await?;
        discard_if_old(&young, "control").await;
        assert!(young.exists());
        // age the file past the grace threshold by rewinding its mtime
        let old_mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let file = std::fs::File::options().append(true).open(&young)?;
        file.set_modified(old_mtime)?;
        drop(file);
        discard_if_old(&young, "control").await;
        assert!(!young.exists());
        assert!(logs_contain("unparseable control file"));
        Ok(())
    }
}
