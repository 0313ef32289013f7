//! Transfer-unit preparation
//!
//! A directory entry becomes a pushable plain file here: files pass
//! through, directories are zipped into `<name>.zip` (and the directory
//! removed) unless the stream mirrors, and anything untransferable --
//! symlinks, directories over the configured size limit, units that fail
//! to zip -- is moved to quarantine.

use anyhow::Context;
use common::config::{DatasetConfig, TransferMode};
use common::fsutil;
use transport::{CommandRunner, TransferCommand};

#[derive(Debug)]
pub enum PreparedUnit {
    /// Basename of the file to push (the original name, or `<dir>.zip`).
    File(String),
    Quarantined,
}

pub async fn prepare(
    config: &DatasetConfig,
    runner: &dyn CommandRunner,
    item: &str,
) -> anyhow::Result<PreparedUnit> {
    let path = config.path_in_stream(item);
    let md = tokio::fs::symlink_metadata(&path)
        .await
        .with_context(|| format!("unit {:?} vanished before transfer", path))?;
    if md.is_symlink() {
        tracing::warn!("not transferring symlink {:?}", path);
        return quarantined(config, item).await;
    }
    if md.is_file() {
        return Ok(PreparedUnit::File(item.to_string()));
    }
    if !md.is_dir() {
        tracing::warn!("not transferring special file {:?}", path);
        return quarantined(config, item).await;
    }
    if config.outgoing.transfer_mode == TransferMode::Mirror {
        // mirrored streams push the directory tree as-is
        return Ok(PreparedUnit::File(item.to_string()));
    }
    if let Some(limit_mb) = config.outgoing.dir_size_limit {
        let size = match fsutil::dir_size(&path).await {
            Ok(size) => size,
            Err(error) => {
                tracing::warn!("could not size directory {:?}: {:#}", path, error);
                return quarantined(config, item).await;
            }
        };
        if size > limit_mb * 1_048_576 {
            tracing::warn!(
                "directory {:?} exceeds dir_size_limit ({} > {} MB)",
                path,
                size,
                limit_mb
            );
            return quarantined(config, item).await;
        }
    }
    zip_directory(config, runner, item).await
}

async fn zip_directory(
    config: &DatasetConfig,
    runner: &dyn CommandRunner,
    item: &str,
) -> anyhow::Result<PreparedUnit> {
    let zip_name = format!("{item}.zip");
    let command = TransferCommand::shell(format!(
        "cd {} && zip -qr {} {}",
        transport::shell_quote(&config.stream_dir().to_string_lossy()),
        transport::shell_quote(&zip_name),
        transport::shell_quote(item)
    ));
    let zip_path = config.path_in_stream(&zip_name);
    match runner.run(&command).await {
        Ok(output) if output.success() => {
            fsutil::delete_or_warn(&config.path_in_stream(item)).await;
            tracing::info!("zipped directory {} as {}", item, zip_name);
            Ok(PreparedUnit::File(zip_name))
        }
        Ok(output) => {
            tracing::warn!(
                "zipping {} failed with exit code {}: {}",
                item,
                output.exit_code,
                output.combined().trim()
            );
            fsutil::delete_or_warn(&zip_path).await;
            quarantined(config, item).await
        }
        Err(error) => {
            tracing::warn!("zipping {} failed: {:#}", item, error);
            fsutil::delete_or_warn(&zip_path).await;
            quarantined(config, item).await
        }
    }
}

async fn quarantined(config: &DatasetConfig, item: &str) -> anyhow::Result<PreparedUnit> {
    fsutil::quarantine(item, config.stream_dir(), &config.quarantine_dir()).await?;
    Ok(PreparedUnit::Quarantined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::ExecOutput;

    /// Pretends `zip` ran by writing the archive the command names.
    struct FakeZipRunner {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeZipRunner {
        async fn run(&self, command: &TransferCommand) -> anyhow::Result<ExecOutput> {
            assert!(command.line.contains("zip -qr"));
            if self.fail {
                return Ok(ExecOutput {
                    exit_code: 15,
                    stdout: String::new(),
                    stderr: "zip I/O error".to_string(),
                });
            }
            let dir = command
                .line
                .strip_prefix("cd ")
                .and_then(|rest| rest.split(" && ").next())
                .unwrap()
                .to_string();
            let name = command.line.rsplit(' ').nth(1).unwrap();
            tokio::fs::write(std::path::Path::new(&dir).join(name), "PK").await?;
            Ok(ExecOutput::default())
        }
    }

    fn config_for(dir: &std::path::Path) -> DatasetConfig {
        serde_json::from_str(&format!(
            r#"{{ "data_stream": {{ "directory": {:?} }} }}"#,
            dir.to_string_lossy()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn plain_files_pass_through() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::write(tmp.path().join("dataset.nc"), "x").await?;
        let prepared = prepare(
            &config_for(tmp.path()),
            &FakeZipRunner { fail: false },
            "dataset.nc",
        )
        .await?;
        assert!(matches!(prepared, PreparedUnit::File(name) if name == "dataset.nc"));
        Ok(())
    }

    #[tokio::test]
    async fn directories_are_zipped_and_removed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("bundle");
        tokio::fs::create_dir(&dir).await?;
        tokio::fs::write(dir.join("part.nc"), "data").await?;
        let prepared = prepare(
            &config_for(tmp.path()),
            &FakeZipRunner { fail: false },
            "bundle",
        )
        .await?;
        assert!(matches!(prepared, PreparedUnit::File(name) if name == "bundle.zip"));
        assert!(!dir.exists());
        assert!(tmp.path().join("bundle.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn mirror_mode_keeps_directories_unzipped() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::create_dir(tmp.path().join("bundle")).await?;
        let mut config = config_for(tmp.path());
        config.outgoing.transfer_mode = TransferMode::Mirror;
        let prepared = prepare(&config, &FakeZipRunner { fail: true }, "bundle").await?;
        assert!(matches!(prepared, PreparedUnit::File(name) if name == "bundle"));
        assert!(tmp.path().join("bundle").exists());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_directories_are_quarantined() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("bundle");
        tokio::fs::create_dir(&dir).await?;
        tokio::fs::write(dir.join("part.nc"), vec![0u8; 4096]).await?;
        let mut config = config_for(tmp.path());
        config.outgoing.dir_size_limit = Some(0);
        let prepared = prepare(&config, &FakeZipRunner { fail: false }, "bundle").await?;
        assert!(matches!(prepared, PreparedUnit::Quarantined));
        assert!(!dir.exists());
        assert!(config.quarantine_dir().join("bundle").exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_zip_quarantines_the_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("bundle");
        tokio::fs::create_dir(&dir).await?;
        let config = config_for(tmp.path());
        let prepared = prepare(&config, &FakeZipRunner { fail: true }, "bundle").await?;
        assert!(matches!(prepared, PreparedUnit::Quarantined));
        assert!(config.quarantine_dir().join("bundle").exists());
        Ok(())
    }

    #[tokio::test]
    async fn symlinks_are_quarantined() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::write(tmp.path().join("real.nc"), "x").await?;
        tokio::fs::symlink(tmp.path().join("real.nc"), tmp.path().join("link.nc")).await?;
        let config = config_for(tmp.path());
        let prepared = prepare(&config, &FakeZipRunner { fail: false }, "link.nc").await?;
        assert!(matches!(prepared, PreparedUnit::Quarantined));
        Ok(())
    }
}
