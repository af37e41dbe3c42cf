//! Streaming SHA-256 over files.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// Size in bytes and lowercase hex SHA-256 of a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size_bytes: u64,
    pub sha256: String,
}

pub async fn fingerprint_file(path: &Path) -> std::io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size_bytes += read as u64;
    }

    Ok(Fingerprint {
        size_bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Copies `src` into an already-open destination, hashing as it goes.
pub async fn copy_with_fingerprint(
    src: &Path,
    dst: &mut tokio::fs::File,
) -> std::io::Result<Fingerprint> {
    let mut input = tokio::fs::File::open(src).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let read = input.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        dst.write_all(&buffer[..read]).await?;
        size_bytes += read as u64;
    }
    dst.flush().await?;
    dst.sync_all().await?;

    Ok(Fingerprint {
        size_bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}
