//! Whole-file MD5, streamed in fixed-size blocks

use anyhow::Context;
use tokio::io::AsyncReadExt;

const BLOCK_SIZE: usize = 0x10000;

/// Compute the hex MD5 digest of a file's contents.
///
/// The digest matches what `md5sum` reports; the block size only bounds
/// memory use and has no effect on the digest.
pub async fn md5_file(path: &std::path::Path) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed opening {:?} for checksumming", path))?;
    let mut context = md5::Context::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let read = file
            .read(&mut block)
            .await
            .with_context(|| format!("failed reading {:?} while checksumming", path))?;
        if read == 0 {
            break;
        }
        context.consume(&block[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
