//! Native rsync daemon backend
//!
//! Same command vocabulary as the ssh variant but addressed at an rsync
//! daemon module (`host::module` syntax), for sites that run rsyncd rather
//! than allowing shell access.

use common::config::DatasetConfig;

use crate::{require, shell_quote, TransferCommand, TransportBackend, TransportError};

pub struct RsyncNativeBackend {
    cmd: String,
    module: String,
    stream_dir: std::path::PathBuf,
    target_host: String,
    stop_file: String,
}

impl RsyncNativeBackend {
    pub fn new(config: &DatasetConfig) -> Result<Self, TransportError> {
        Ok(Self {
            cmd: require(&config.rsync_native.cmd, "rsync_native.cmd")?,
            module: require(&config.rsync_native.module, "rsync_native.module")?,
            stream_dir: config.data_stream.directory.clone(),
            target_host: require(&config.outgoing.target_host, "outgoing.target_host")?,
            stop_file: config.outgoing.stop_file.clone(),
        })
    }

    fn remote(&self, name: &str) -> String {
        format!("{}::{}/{}", self.target_host, self.module, name)
    }
}

impl TransportBackend for RsyncNativeBackend {
    fn protocol(&self) -> &'static str {
        "rsync_native"
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
            .map(|f| shell_quote(&self.stream_dir.join(f).to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ");
        TransferCommand::shell(format!("{} -avz {} {}", self.cmd, sources, self.remote("")))
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
            shell_quote(&self.stream_dir.join(thankyou_name).to_string_lossy()),
            self.remote("")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_daemon_module_syntax() {
        let config: DatasetConfig = serde_json::from_str(
            r#"{
                "data_stream": { "directory": "/data/mystream" },
                "outgoing": {
                    "transfer_protocol": "rsync_native",
                    "target_host": "archive.example.org"
                },
                "rsync_native": { "cmd": "rsync", "module": "staging" }
            }"#,
        )
        .unwrap();
        let backend = RsyncNativeBackend::new(&config).unwrap();
        assert_eq!(
            backend.build_probe_stop().line,
            "rsync --list-only archive.example.org::staging/.stop"
        );
        assert_eq!(
            backend.build_push(&["dataset.nc".to_string()]).line,
            "rsync -avz /data/mystream/dataset.nc archive.example.org::staging/"
        );
    }

    #[test]
    fn module_is_required() {
        let config: DatasetConfig = serde_json::from_str(
            r#"{
                "data_stream": { "directory": "/data/mystream" },
                "outgoing": {
                    "transfer_protocol": "rsync_native",
                    "target_host": "archive.example.org"
                },
                "rsync_native": { "cmd": "rsync" }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            RsyncNativeBackend::new(&config),
            Err(TransportError::MissingConfiguration("rsync_native.module"))
        ));
    }
}
