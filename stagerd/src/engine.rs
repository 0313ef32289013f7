//! Per-unit transfer engine
//!
//! Drives one transfer unit through the handshake state machine:
//!
//! ```text
//! AwaitingClearance -> Pushing -> Done                    (no acknowledgment)
//! AwaitingClearance -> Pushing -> PullingReceipt
//!                   -> PushingThankyou -> Done            (arrival-monitor target)
//! ```
//!
//! Clearance polls the remote stop marker and only proceeds when the probe
//! positively reports absence; any ambiguous outcome counts as "still
//! blocked". Push failures are retried a bounded number of times and every
//! attempt's failure is kept, so the final error reflects the whole
//! history. A pulled receipt only counts once it decodes as a valid record.

use std::sync::Arc;

use common::config::{DatasetConfig, TransferMode};
use common::records::{ControlRecord, ReceiptRecord, ReceiptStatus, ThankyouRecord};
use common::{checksum, fsutil, records};
use tokio_util::sync::CancellationToken;
use transport::{CommandRunner, CredentialBootstrap, TransferCommand, TransportBackend, TransportError};

use crate::sleep_cancellable;
use crate::unit::{self, PreparedUnit};

/// Result of one engine run over a single transfer unit.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Unit delivered (and locally removed unless mirroring).
    Delivered { file: String },
    /// Unit could not be prepared for transfer and was moved to quarantine.
    Quarantined { item: String },
    /// A stop request arrived; the unit is untouched and will be retried.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing backend settings; fatal to the whole stream, retrying
    /// cannot fix configuration.
    #[error(transparent)]
    Configuration(#[from] TransportError),
    /// Transfer failed after exhausting its retry budget; the unit stays
    /// in place for the next scan cycle.
    #[error("transfer of {item} failed: {log}")]
    Failed { item: String, log: AttemptLog },
}

/// Accumulated failure history across attempts of one engine run.
#[derive(Debug, Default)]
pub struct AttemptLog {
    entries: Vec<String>,
    suppressed: usize,
}

const MAX_LOGGED_ATTEMPTS: usize = 20;

impl AttemptLog {
    pub fn record(&mut self, entry: impl Into<String>) {
        if self.entries.len() < MAX_LOGGED_ATTEMPTS {
            self.entries.push(entry.into());
        } else {
            self.suppressed += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.suppressed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for AttemptLog {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.entries.join("; "))?;
        if self.suppressed > 0 {
            write!(f, "; ... and {} more attempts", self.suppressed)?;
        }
        Ok(())
    }
}

enum ReceiptPull {
    Pulled(ReceiptRecord),
    Exhausted,
    Aborted,
}

struct StagedHandshake {
    control_name: String,
    control_path: std::path::PathBuf,
    receipt_name: String,
    receipt_path: std::path::PathBuf,
}

pub struct TransferEngine {
    config: DatasetConfig,
    poll: std::time::Duration,
    backend: Box<dyn TransportBackend>,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl TransferEngine {
    /// Build an engine for the stream's configured protocol, validating the
    /// backend's required settings eagerly.
    pub fn new(
        config: DatasetConfig,
        general_poll_interval: std::time::Duration,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let backend = transport::backend_for(&config)?;
        Ok(Self::with_backend(
            config,
            general_poll_interval,
            backend,
            runner,
            cancel,
        ))
    }

    pub fn with_backend(
        config: DatasetConfig,
        general_poll_interval: std::time::Duration,
        backend: Box<dyn TransportBackend>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            poll: general_poll_interval,
            backend,
            runner,
            cancel,
        }
    }

    /// Run the full handshake for one unit from the stream directory.
    pub async fn run(&self, item: &str) -> Result<TransferOutcome, EngineError> {
        let file = match unit::prepare(&self.config, self.runner.as_ref(), item).await {
            Ok(PreparedUnit::File(file)) => file,
            Ok(PreparedUnit::Quarantined) => {
                return Ok(TransferOutcome::Quarantined {
                    item: item.to_string(),
                });
            }
            Err(error) => {
                let mut log = AttemptLog::default();
                log.record(format!("preparing unit: {error:#}"));
                return Err(EngineError::Failed {
                    item: item.to_string(),
                    log,
                });
            }
        };
        if let Some(bootstrap) = self.backend.credential_bootstrap() {
            if let Err(failure) = self.ensure_credential(&bootstrap).await {
                let mut log = AttemptLog::default();
                log.record(failure);
                return Err(EngineError::Failed { item: file, log });
            }
        }
        if !self.wait_for_clearance().await {
            return Ok(TransferOutcome::Aborted);
        }
        // the scripted ftp client leaves a local copy of any stop marker it
        // managed to fetch during clearance polling
        if self.backend.protocol() == "ftp" {
            let fetched = self.config.path_in_stream(&self.config.outgoing.stop_file);
            fsutil::delete_or_warn(&fetched).await;
        }
        let outcome = self.push_data(&file).await?;
        if let TransferOutcome::Delivered { file } = &outcome {
            if self.config.outgoing.transfer_mode == TransferMode::Move {
                fsutil::delete_or_warn(&self.config.path_in_stream(file)).await;
            }
            tracing::info!(
                "successfully sent {} for stream {}",
                file,
                self.config.name
            );
        }
        Ok(outcome)
    }

    async fn ensure_credential(&self, bootstrap: &CredentialBootstrap) -> Result<(), String> {
        if self.run_ok(&bootstrap.check).await.is_ok() {
            return Ok(());
        }
        tracing::info!("transfer credential check failed, attempting renewal");
        self.run_ok(&bootstrap.renew)
            .await
            .map(|_| ())
            .map_err(|failure| format!("credential renewal: {failure}"))
    }

    /// Poll the remote stop marker until it is positively absent.
    ///
    /// Returns false when cancelled. There is no retry bound here: a
    /// present stop marker blocks the stream for as long as it stays.
    async fn wait_for_clearance(&self) -> bool {
        let probe = self.backend.build_probe_stop();
        let interval = std::time::Duration::from_secs(self.config.outgoing.stop_file_poll_interval);
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.runner.run(&probe).await {
                Ok(output) if output.combined().contains(self.backend.stop_absent_marker()) => {
                    tracing::info!("stop marker not present, clear to push");
                    return true;
                }
                Ok(_) => tracing::debug!("stop marker still present or probe inconclusive"),
                Err(error) => tracing::debug!("stop marker probe failed: {:#}", error),
            }
            if sleep_cancellable(&self.cancel, interval).await {
                return false;
            }
        }
    }

    async fn push_data(&self, file: &str) -> Result<TransferOutcome, EngineError> {
        let outgoing = self.config.outgoing.clone();
        let needs_ack = outgoing.target_uses_arrival_monitor;
        let mut log = AttemptLog::default();
        let mut tries = 0u32;
        while tries < outgoing.retry_count {
            if self.cancel.is_cancelled() {
                return Ok(TransferOutcome::Aborted);
            }
            let attempt = tries + 1;
            let staged = if needs_ack {
                match self.stage_control_record(file).await {
                    Ok(staged) => Some(staged),
                    Err(error) => {
                        tries += 1;
                        log.record(format!("attempt {attempt}: staging control record: {error:#}"));
                        if sleep_cancellable(&self.cancel, self.poll).await {
                            return Ok(TransferOutcome::Aborted);
                        }
                        continue;
                    }
                }
            } else {
                None
            };
            let mut files = vec![file.to_string()];
            if let Some(staged) = &staged {
                files.push(staged.control_name.clone());
            }
            match self.run_ok(&self.backend.build_push(&files)).await {
                Err(failure) => {
                    tries += 1;
                    log.record(format!("push attempt {attempt}: {failure}"));
                    tracing::info!("push of {} failed, trying again", file);
                    if sleep_cancellable(&self.cancel, self.poll).await {
                        return Ok(TransferOutcome::Aborted);
                    }
                }
                Ok(_) => {
                    let Some(staged) = staged else {
                        return Ok(TransferOutcome::Delivered {
                            file: file.to_string(),
                        });
                    };
                    // give the arrival monitor a moment to verify before we
                    // start polling for the receipt
                    if sleep_cancellable(&self.cancel, self.poll).await {
                        return Ok(TransferOutcome::Aborted);
                    }
                    match self.pull_receipt(&staged, &mut log).await {
                        ReceiptPull::Aborted => return Ok(TransferOutcome::Aborted),
                        ReceiptPull::Exhausted => {
                            return Err(EngineError::Failed {
                                item: file.to_string(),
                                log,
                            });
                        }
                        ReceiptPull::Pulled(receipt) => {
                            let delivered = receipt.status == ReceiptStatus::Success;
                            let thankyou_path = self.push_thankyou(&staged, &receipt).await;
                            self.cleanup_artifacts(&staged, thankyou_path.as_deref()).await;
                            if delivered {
                                return Ok(TransferOutcome::Delivered {
                                    file: file.to_string(),
                                });
                            }
                            log.record(format!(
                                "receipt reported: {}",
                                receipt.status.describe()
                            ));
                            return Err(EngineError::Failed {
                                item: file.to_string(),
                                log,
                            });
                        }
                    }
                }
            }
        }
        Err(EngineError::Failed {
            item: file.to_string(),
            log,
        })
    }

    /// Stat, checksum and stage a fresh control record next to the data
    /// file, returning the names the rest of the handshake will use.
    async fn stage_control_record(&self, file: &str) -> anyhow::Result<StagedHandshake> {
        use anyhow::Context;
        let outgoing = &self.config.outgoing;
        let data_path = self.config.path_in_stream(file);
        let control_name = format!(".{}.{}", file, outgoing.control_file_extension);
        let control_path = self.config.path_in_stream(&control_name);
        let receipt_name = format!(
            ".{}.{}.{}",
            file,
            fsutil::filename_timestamp(),
            outgoing.receipt_file_extension
        );
        let receipt_path = self.config.path_in_stream(&receipt_name);
        let md = tokio::fs::metadata(&data_path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", data_path))?;
        let digest = checksum::md5_file(&data_path).await?;
        records::create(
            &control_path,
            &ControlRecord {
                data_file_name: file.to_string(),
                size: md.len(),
                checksum: digest,
                receipt_file_name: receipt_name.clone(),
            },
            true,
        )?;
        tracing::debug!(
            "staged control record {} expecting receipt {}",
            control_name,
            receipt_name
        );
        Ok(StagedHandshake {
            control_name,
            control_path,
            receipt_name,
            receipt_path,
        })
    }

    /// Poll for the receipt. An attempt only succeeds when the transport
    /// call succeeds, its output does not carry the "not found" marker, and
    /// the fetched file decodes as a valid receipt.
    async fn pull_receipt(&self, staged: &StagedHandshake, log: &mut AttemptLog) -> ReceiptPull {
        let outgoing = &self.config.outgoing;
        let command = self.backend.build_pull_receipt(&staged.receipt_name);
        let interval = std::time::Duration::from_secs(outgoing.receipt_file_poll_interval);
        for poll in 1..=outgoing.receipt_file_poll_count {
            if self.cancel.is_cancelled() {
                return ReceiptPull::Aborted;
            }
            match self.runner.run(&command).await {
                Ok(output)
                    if output.success()
                        && !output.combined().contains(self.backend.stop_absent_marker()) =>
                {
                    match records::read::<ReceiptRecord>(&staged.receipt_path) {
                        Ok(receipt) => {
                            tracing::info!(
                                "receipt {} pulled: {}",
                                staged.receipt_name,
                                receipt.status.describe()
                            );
                            return ReceiptPull::Pulled(receipt);
                        }
                        Err(error) => {
                            log.record(format!("receipt poll {poll}: fetched but invalid: {error}"));
                            fsutil::delete_or_warn(&staged.receipt_path).await;
                        }
                    }
                }
                Ok(output) => log.record(format!(
                    "receipt poll {poll}: exit code {}: {}",
                    output.exit_code,
                    output.combined().trim()
                )),
                Err(error) => log.record(format!("receipt poll {poll}: {error:#}")),
            }
            if sleep_cancellable(&self.cancel, interval).await {
                return ReceiptPull::Aborted;
            }
        }
        ReceiptPull::Exhausted
    }

    /// Stage and push the thank-you acknowledging a pulled receipt. A
    /// failure here is logged, not propagated: the receiver will retire the
    /// receipt whenever the acknowledgment eventually lands.
    async fn push_thankyou(
        &self,
        staged: &StagedHandshake,
        receipt: &ReceiptRecord,
    ) -> Option<std::path::PathBuf> {
        if receipt.thankyou_file_name.is_empty() {
            tracing::warn!(
                "receipt {} names no thank-you file, skipping acknowledgment",
                staged.receipt_name
            );
            return None;
        }
        let path = self.config.path_in_stream(&receipt.thankyou_file_name);
        if let Err(error) = records::create(
            &path,
            &ThankyouRecord {
                receipt_file_name: staged.receipt_name.clone(),
            },
            true,
        ) {
            tracing::warn!("could not stage thank-you file: {}", error);
            return Some(path);
        }
        match self
            .run_ok(&self.backend.build_push_thankyou(&receipt.thankyou_file_name))
            .await
        {
            Ok(_) => tracing::info!("thank-you file {} sent", receipt.thankyou_file_name),
            Err(failure) => tracing::warn!("thank-you push failed: {}", failure),
        }
        Some(path)
    }

    async fn cleanup_artifacts(
        &self,
        staged: &StagedHandshake,
        thankyou_path: Option<&std::path::Path>,
    ) {
        fsutil::delete_or_warn(&staged.control_path).await;
        fsutil::delete_or_warn(&staged.receipt_path).await;
        if let Some(path) = thankyou_path {
            fsutil::delete_or_warn(path).await;
        }
    }

    async fn run_ok(&self, command: &TransferCommand) -> Result<transport::ExecOutput, String> {
        match self.runner.run(command).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(format!(
                "exit code {}: {}",
                output.exit_code,
                output.combined().trim()
            )),
            Err(error) => Err(format!("{error:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use transport::ExecOutput;

    /// Backend whose commands are single verbs the scripted runner
    /// interprets.
    struct VerbBackend;

    impl TransportBackend for VerbBackend {
        fn protocol(&self) -> &'static str {
            "verb"
        }
        fn stop_absent_marker(&self) -> &str {
            "No such file or directory"
        }
        fn build_probe_stop(&self) -> TransferCommand {
            TransferCommand::shell("probe")
        }
        fn build_push(&self, files: &[String]) -> TransferCommand {
            TransferCommand::shell(format!("push {}", files.join(" ")))
        }
        fn build_pull_receipt(&self, receipt_name: &str) -> TransferCommand {
            TransferCommand::shell(format!("pull {receipt_name}"))
        }
        fn build_push_thankyou(&self, thankyou_name: &str) -> TransferCommand {
            TransferCommand::shell(format!("thanks {thankyou_name}"))
        }
    }

    /// Clear probe, failing push.
    struct FailingPushRunner {
        pushes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for FailingPushRunner {
        async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput> {
            if command.line == "probe" {
                return Ok(ExecOutput {
                    exit_code: 23,
                    stdout: String::new(),
                    stderr: "rsync: .stop failed: No such file or directory".to_string(),
                });
            }
            assert!(command.line.starts_with("push"));
            let attempt = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("connection reset (attempt {attempt})"),
            })
        }
    }

    fn test_config(stream_dir: &std::path::Path, ack: bool) -> DatasetConfig {
        let mut config: DatasetConfig = serde_json::from_str(&format!(
            r#"{{ "data_stream": {{ "directory": {:?} }} }}"#,
            stream_dir.to_string_lossy()
        ))
        .unwrap();
        config.name = "teststream".to_string();
        config.outgoing.target_uses_arrival_monitor = ack;
        config.outgoing.receipt_file_poll_interval = 0;
        config.outgoing.stop_file_poll_interval = 0;
        config
    }

    fn engine_with(
        config: DatasetConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> TransferEngine {
        TransferEngine::with_backend(
            config,
            std::time::Duration::from_millis(0),
            Box::new(VerbBackend),
            runner,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn push_retries_exactly_retry_count_times_and_aggregates_failures() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("dataset.nc"), vec![0u8; 16])
            .await
            .unwrap();
        let runner = Arc::new(FailingPushRunner {
            pushes: AtomicUsize::new(0),
        });
        let engine = engine_with(test_config(tmp.path(), false), runner.clone());
        let error = engine.run("dataset.nc").await.unwrap_err();
        assert_eq!(runner.pushes.load(Ordering::SeqCst), 3);
        let EngineError::Failed { item, log } = error else {
            panic!("expected Failed");
        };
        assert_eq!(item, "dataset.nc");
        assert_eq!(log.len(), 3);
        let message = log.to_string();
        for attempt in 1..=3 {
            assert!(
                message.contains(&format!("(attempt {attempt})")),
                "missing attempt {attempt} in {message}"
            );
        }
        // the unit is left in place for the next scan cycle
        assert!(tmp.path().join("dataset.nc").exists());
    }

    /// Pull "succeeds" but delivers garbage; must count against the poll
    /// budget rather than as a success.
    struct GarbageReceiptRunner {
        stream_dir: std::path::PathBuf,
        pulls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for GarbageReceiptRunner {
        async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput> {
            let line = &command.line;
            if line == "probe" {
                return Ok(ExecOutput {
                    exit_code: 23,
                    stdout: String::new(),
                    stderr: "failed: No such file or directory".to_string(),
                });
            }
            if let Some(name) = line.strip_prefix("pull ") {
                self.pulls.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(self.stream_dir.join(name), "not a receipt at all\n").await?;
                return Ok(ExecOutput::default());
            }
            Ok(ExecOutput::default())
        }
    }

    #[tokio::test]
    async fn undecodable_receipt_counts_as_failed_poll() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("dataset.nc"), vec![0u8; 16])
            .await
            .unwrap();
        let mut config = test_config(tmp.path(), true);
        config.outgoing.receipt_file_poll_count = 2;
        let runner = Arc::new(GarbageReceiptRunner {
            stream_dir: tmp.path().to_path_buf(),
            pulls: AtomicUsize::new(0),
        });
        let engine = engine_with(config, runner.clone());
        let error = engine.run("dataset.nc").await.unwrap_err();
        assert_eq!(runner.pulls.load(Ordering::SeqCst), 2);
        let EngineError::Failed { log, .. } = error else {
            panic!("expected Failed");
        };
        assert!(log.to_string().contains("fetched but invalid"));
    }

    /// Receipt arrives but reports a checksum mismatch: the engine must
    /// retire the receipt with a thank-you yet treat the send as failed.
    struct MismatchReceiptRunner {
        stream_dir: std::path::PathBuf,
        thanked: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for MismatchReceiptRunner {
        async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput> {
            let line = &command.line;
            if line == "probe" {
                return Ok(ExecOutput {
                    exit_code: 23,
                    stdout: String::new(),
                    stderr: "failed: No such file or directory".to_string(),
                });
            }
            if let Some(name) = line.strip_prefix("pull ") {
                records::write(
                    &self.stream_dir.join(name),
                    &ReceiptRecord {
                        data_file_name: "dataset.nc".to_string(),
                        status: ReceiptStatus::BadChecksum,
                        size: 16,
                        checksum: "deadbeef".to_string(),
                        thankyou_file_name: ".dataset.nc.1.00.stager-thanks-bss".to_string(),
                    },
                )?;
            }
            if line.starts_with("thanks ") {
                self.thanked.fetch_add(1, Ordering::SeqCst);
            }
            Ok(ExecOutput::default())
        }
    }

    #[tokio::test]
    async fn mismatch_receipt_fails_the_send_after_acknowledging() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("dataset.nc"), vec![0u8; 16])
            .await
            .unwrap();
        let runner = Arc::new(MismatchReceiptRunner {
            stream_dir: tmp.path().to_path_buf(),
            thanked: AtomicUsize::new(0),
        });
        let engine = engine_with(test_config(tmp.path(), true), runner.clone());
        let error = engine.run("dataset.nc").await.unwrap_err();
        assert_eq!(runner.thanked.load(Ordering::SeqCst), 1);
        let EngineError::Failed { log, .. } = error else {
            panic!("expected Failed");
        };
        assert!(log.to_string().contains("bad checksum"));
        // the data file stays put; no handshake artifacts linger locally
        assert!(tmp.path().join("dataset.nc").exists());
        let leftovers = fsutil::list_dir(tmp.path(), true).await.unwrap();
        assert_eq!(leftovers, vec!["dataset.nc".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_aborts_during_clearance() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("dataset.nc"), vec![0u8; 16])
            .await
            .unwrap();

        /// Probe that always reports "still blocked".
        struct BlockedRunner;
        #[async_trait::async_trait]
        impl CommandRunner for BlockedRunner {
            async fn run(&self, _command: &TransferCommand) -> anyhow::Result<ExecOutput> {
                Ok(ExecOutput::default())
            }
        }

        let mut config = test_config(tmp.path(), false);
        config.outgoing.stop_file_poll_interval = 600;
        let cancel = CancellationToken::new();
        let engine = TransferEngine::with_backend(
            config,
            std::time::Duration::from_millis(0),
            Box::new(VerbBackend),
            Arc::new(BlockedRunner),
            cancel.clone(),
        );
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let outcome = engine.run("dataset.nc").await.unwrap();
        assert!(matches!(outcome, TransferOutcome::Aborted));
        assert!(tmp.path().join("dataset.nc").exists());
    }
}
