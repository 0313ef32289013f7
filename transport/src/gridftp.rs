//! GridFTP backend (globus-url-copy)
//!
//! Adds a proxy-credential bootstrap ahead of the handshake: the engine
//! first runs `grid-proxy-info -exists`, and only if that fails attempts a
//! `myproxy-logon` renewal with the configured passphrase fed over stdin.

use common::config::DatasetConfig;

use crate::{
    require, shell_quote, CredentialBootstrap, TransferCommand, TransportBackend, TransportError,
};

pub struct GridftpBackend {
    cmd: String,
    port: u16,
    username: String,
    password: String,
    proxy: String,
    stream_dir: std::path::PathBuf,
    target_host: String,
    target_dir: String,
    stop_file: String,
    target_uses_arrival_monitor: bool,
}

impl GridftpBackend {
    pub fn new(config: &DatasetConfig) -> Result<Self, TransportError> {
        Ok(Self {
            cmd: require(&config.gridftp.cmd, "gridftp.cmd")?,
            port: require(&config.gridftp.port, "gridftp.port")?,
            username: require(&config.gridftp.username, "gridftp.username")?,
            password: require(&config.gridftp.password, "gridftp.password")?,
            proxy: require(&config.gridftp.proxy, "gridftp.proxy")?,
            stream_dir: config.data_stream.directory.clone(),
            target_host: require(&config.outgoing.target_host, "outgoing.target_host")?,
            target_dir: require(&config.outgoing.target_dir, "outgoing.target_dir")?,
            stop_file: config.outgoing.stop_file.clone(),
            target_uses_arrival_monitor: config.outgoing.target_uses_arrival_monitor,
        })
    }

    fn gsiftp_url(&self, name: &str) -> String {
        format!(
            "gsiftp://{}:{}/{}/{}",
            self.target_host,
            self.port,
            self.target_dir.trim_matches('/'),
            name
        )
    }

    fn local(&self, name: &str) -> String {
        shell_quote(&self.stream_dir.join(name).to_string_lossy())
    }

    fn copy_flags(&self) -> &'static str {
        // without an arrival monitor the -sync level is the only
        // verification the transfer gets
        if self.target_uses_arrival_monitor {
            ""
        } else {
            " -sync -sync-level 3"
        }
    }
}

impl TransportBackend for GridftpBackend {
    fn protocol(&self) -> &'static str {
        "gridftp"
    }

    fn stop_absent_marker(&self) -> &str {
        "No such file or directory"
    }

    fn build_probe_stop(&self) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} {} file:///dev/null",
            self.cmd,
            self.gsiftp_url(&self.stop_file)
        ))
    }

    fn build_push(&self, files: &[String]) -> TransferCommand {
        let copies: Vec<String> = files
            .iter()
            .map(|f| {
                format!(
                    "{}{} {} {}",
                    self.cmd,
                    self.copy_flags(),
                    self.local(f),
                    self.gsiftp_url(f)
                )
            })
            .collect();
        TransferCommand::shell(copies.join("; "))
    }

    fn build_pull_receipt(&self, receipt_name: &str) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} {} {}",
            self.cmd,
            self.gsiftp_url(receipt_name),
            self.local(receipt_name)
        ))
    }

    fn build_push_thankyou(&self, thankyou_name: &str) -> TransferCommand {
        TransferCommand::shell(format!(
            "{} {} {}",
            self.cmd,
            self.local(thankyou_name),
            self.gsiftp_url(thankyou_name)
        ))
    }

    fn credential_bootstrap(&self) -> Option<CredentialBootstrap> {
        Some(CredentialBootstrap {
            check: TransferCommand::shell("grid-proxy-info -exists"),
            renew: TransferCommand::with_stdin(
                format!(
                    "myproxy-logon -S -s {} -l {}",
                    shell_quote(&self.proxy),
                    shell_quote(&self.username)
                ),
                format!("{}\n", self.password),
            ),
        })
    }
}
