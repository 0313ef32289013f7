//! rsync-over-ssh backend
//!
//! The workhorse transport. The stop-marker probe is a read-only
//! `--list-only` fetch; rsync reports a missing remote file with
//! `failed: No such file or directory`, which is the only outcome treated
//! as "not blocked".

use common::config::DatasetConfig;

use crate::{require, shell_quote, TransferCommand, TransportBackend, TransportError};

pub struct RsyncSshBackend {
    cmd: String,
    use_checksum: bool,
    check_size: bool,
    stream_dir: std::path::PathBuf,
    target_host: String,
    target_dir: String,
    stop_file: String,
}

impl RsyncSshBackend {
    pub fn new(config: &DatasetConfig) -> Result<Self, TransportError> {
        Ok(Self {
            cmd: require(&config.rsync_ssh.cmd, "rsync_ssh.cmd")?,
            use_checksum: config.rsync_ssh.use_checksum,
            check_size: config.rsync_ssh.check_size,
            stream_dir: config.data_stream.directory.clone(),
            target_host: require(&config.outgoing.target_host, "outgoing.target_host")?,
            target_dir: require(&config.outgoing.target_dir, "outgoing.target_dir")?,
            stop_file: config.outgoing.stop_file.clone(),
        })
    }

    fn remote(&self, name: &str) -> String {
        format!("{}:{}/{}", self.target_host, self.target_dir, name)
    }

    fn local(&self, name: &str) -> String {
        shell_quote(&self.stream_dir.join(name).to_string_lossy())
    }

    fn push_flags(&self) -> String {
        let mut flags = "-avz".to_string();
        if self.use_checksum {
            flags.push_str(" --checksum");
        }
        if self.check_size {
            flags.push_str(" --size-only");
        }
        flags
    }
}

impl TransportBackend for RsyncSshBackend {
    fn protocol(&self) -> &'static str {
        "rsync_ssh"
    }

    fn stop_absent_marker(&self) -> &str {
        "failed: No such file or directory"
    }

    fn build_probe_stop(&self) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} --list-only {}",
            self.cmd,
            self.remote(&self.stop_file)
        ))
    }

    fn build_push(&self, files: &[String]) -> TransferCommand {
        let sources = files
            .iter()
            .map(|f| self.local(f))
            .collect::<Vec<_>>()
            .join(" ");
        TransferCommand::shell(format!(
            "{} {} {} {}",
            self.cmd,
            self.push_flags(),
            sources,
            self.remote("")
        ))
    }

    fn build_pull_receipt(&self, receipt_name: &str) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} {} {}/",
            self.cmd,
            self.remote(receipt_name),
            shell_quote(&self.stream_dir.to_string_lossy())
        ))
    }

    fn build_push_thankyou(&self, thankyou_name: &str) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} {} {}",
            self.cmd,
            self.local(thankyou_name),
            self.remote("")
        ))
    }
}
