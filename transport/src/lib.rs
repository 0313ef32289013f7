//! Pluggable transfer command backends
//!
//! All remote data movement is delegated to external commands (rsync, ftp,
//! globus-url-copy). A backend knows how to phrase the four operations of
//! the handshake protocol as shell commands for one transport: probing the
//! remote stop marker, pushing the data (and control record), pulling the
//! receipt back, and pushing the thank-you. Backends build commands; a
//! [`CommandRunner`] executes them, so tests can substitute a scripted
//! runner for the real shell.
//!
//! Backend selection is a registry lookup on the configured protocol name;
//! required settings are validated eagerly at construction, before any
//! network call.

use common::config::DatasetConfig;

pub mod ftp;
pub mod gridftp;
pub mod rsync_native;
pub mod rsync_ssh;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("missing required setting `{0}`")]
    MissingConfiguration(&'static str),
    #[error("unknown transfer protocol `{0}`")]
    UnknownProtocol(String),
}

/// An opaque command descriptor: a shell line plus optional piped stdin
/// (the ftp backend feeds its command script through stdin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub line: String,
    pub stdin: Option<String>,
}

impl TransferCommand {
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(line: impl Into<String>, stdin: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            stdin: Some(stdin.into()),
        }
    }
}

/// Raw result of one executed transfer command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output for marker matching; the transports disagree about
    /// which stream carries their diagnostics.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Executes transfer commands. The engine only ever talks to transports
/// through this seam, which is what the tests mock.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput>;
}

/// Runs commands through `sh -c`, piping stdin when present.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput> {
        use anyhow::Context;
        use tokio::io::AsyncWriteExt;

        tracing::debug!("running transfer command: {}", command.line);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command.line)
            .stdin(if command.stdin.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed spawning `{}`", command.line))?;
        if let Some(input) = &command.stdin {
            let mut stdin = child
                .stdin
                .take()
                .context("failed to get stdin for transfer command")?;
            stdin
                .write_all(input.as_bytes())
                .await
                .context("failed writing to transfer command stdin")?;
            stdin
                .shutdown()
                .await
                .context("failed to shutdown transfer command stdin")?;
            drop(stdin);
        }
        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("failed waiting for `{}`", command.line))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Credential bootstrap for transports that need one (gridftp): a check
/// command and, should the check fail, a renewal command.
#[derive(Debug, Clone)]
pub struct CredentialBootstrap {
    pub check: TransferCommand,
    pub renew: TransferCommand,
}

/// Capability interface over the transfer protocol variants.
pub trait TransportBackend: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Substring of a probe's output that positively identifies "the stop
    /// marker is not present". Any other probe outcome means still blocked.
    fn stop_absent_marker(&self) -> &str;

    fn build_probe_stop(&self) -> TransferCommand;

    /// Push the named units (basenames within the stream directory).
    fn build_push(&self, files: &[String]) -> TransferCommand;

    fn build_pull_receipt(&self, receipt_name: &str) -> TransferCommand;

    fn build_push_thankyou(&self, thankyou_name: &str) -> TransferCommand;

    fn credential_bootstrap(&self) -> Option<CredentialBootstrap> {
        None
    }
}

/// Look up the backend for a stream's configured protocol, validating its
/// required settings eagerly.
pub fn backend_for(config: &DatasetConfig) -> Result<Box<dyn TransportBackend>, TransportError> {
    match config.outgoing.transfer_protocol.as_str() {
        "rsync_ssh" => Ok(Box::new(rsync_ssh::RsyncSshBackend::new(config)?)),
        "rsync_native" => Ok(Box::new(rsync_native::RsyncNativeBackend::new(config)?)),
        "ftp" => Ok(Box::new(ftp::FtpBackend::new(config)?)),
        "gridftp" => Ok(Box::new(gridftp::GridftpBackend::new(config)?)),
        other => Err(TransportError::UnknownProtocol(other.to_string())),
    }
}

pub(crate) fn require<T: Clone>(
    value: &Option<T>,
    key: &'static str,
) -> Result<T, TransportError> {
    value
        .clone()
        .ok_or(TransportError::MissingConfiguration(key))
}

/// Quote a string for safe interpolation into a `sh -c` line.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
