//! Scripted ftp backend
//!
//! Drives a plain `ftp -n` client by feeding it a command script on stdin
//! (user/cd/lcd, then the puts or gets, then exit). The ftp client exits 0
//! even when a transfer fails, so outcomes are judged by the handshake
//! protocol itself: a missing remote file surfaces as
//! `No such file or directory` in the session transcript, and a push that
//! silently failed is caught when no receipt ever appears.

use common::config::DatasetConfig;

use crate::{require, TransferCommand, TransportBackend, TransportError};

pub struct FtpBackend {
    cmd: String,
    username: String,
    password: String,
    stream_dir: std::path::PathBuf,
    target_host: String,
    target_dir: String,
    stop_file: String,
}

impl FtpBackend {
    pub fn new(config: &DatasetConfig) -> Result<Self, TransportError> {
        Ok(Self {
            cmd: require(&config.ftp.cmd, "ftp.cmd")?,
            username: require(&config.ftp.username, "ftp.username")?,
            password: require(&config.ftp.password, "ftp.password")?,
            stream_dir: config.data_stream.directory.clone(),
            target_host: require(&config.outgoing.target_host, "outgoing.target_host")?,
            target_dir: require(&config.outgoing.target_dir, "outgoing.target_dir")?,
            stop_file: config.outgoing.stop_file.clone(),
        })
    }

    fn scripted(&self, actions: &[String]) -> TransferCommand {
        let mut lines = vec![
            format!("user {} {}", self.username, self.password),
            format!("cd {}", self.target_dir),
            format!("lcd {}", self.stream_dir.display()),
        ];
        lines.extend_from_slice(actions);
        lines.push("exit".to_string());
        TransferCommand::with_stdin(
            format!("{} -n -v {}", self.cmd, self.target_host),
            lines.join("\n") + "\n",
        )
    }
}

impl TransportBackend for FtpBackend {
    fn protocol(&self) -> &'static str {
        "ftp"
    }

    fn stop_absent_marker(&self) -> &str {
        "No such file or directory"
    }

    fn build_probe_stop(&self) -> TransferCommand {
        self.scripted(&[format!("get {}", self.stop_file)])
    }

    fn build_push(&self, files: &[String]) -> TransferCommand {
        let actions: Vec<String> = files.iter().map(|f| format!("put {f}")).collect();
        self.scripted(&actions)
    }

    fn build_pull_receipt(&self, receipt_name: &str) -> TransferCommand {
        self.scripted(&[format!("get {receipt_name}")])
    }

    fn build_push_thankyou(&self, thankyou_name: &str) -> TransferCommand {
        self.scripted(&[format!("put {thankyou_name}")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatasetConfig {
        serde_json::from_str(
            r#"{
                "data_stream": { "directory": "/data/mystream" },
                "outgoing": {
                    "transfer_protocol": "ftp",
                    "target_host": "ftp.example.org",
                    "target_dir": "/incoming"
                },
                "ftp": { "cmd": "/usr/bin/ftp", "username": "stager", "password": "hunter2" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn push_script_goes_over_stdin() {
        let backend = FtpBackend::new(&config()).unwrap();
        let push = backend.build_push(&[
            "dataset.nc".to_string(),
            ".dataset.nc.stager-ctrl-bss".to_string(),
        ]);
        assert_eq!(push.line, "/usr/bin/ftp -n -v ftp.example.org");
        assert_eq!(
            push.stdin.as_deref(),
            Some(
                "user stager hunter2\n\
                 cd /incoming\n\
                 lcd /data/mystream\n\
                 put dataset.nc\n\
                 put .dataset.nc.stager-ctrl-bss\n\
                 exit\n"
            )
        );
    }

    #[test]
    fn probe_fetches_the_stop_marker() {
        let backend = FtpBackend::new(&config()).unwrap();
        let probe = backend.build_probe_stop();
        assert!(probe.stdin.as_deref().unwrap().contains("get .stop\n"));
        assert_eq!(backend.stop_absent_marker(), "No such file or directory");
    }

    #[test]
    fn credentials_are_required() {
        let mut incomplete = config();
        incomplete.ftp.password = None;
        assert!(matches!(
            FtpBackend::new(&incomplete),
            Err(TransportError::MissingConfiguration("ftp.password"))
        ));
    }
}
