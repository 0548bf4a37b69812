//! SHA-256 helpers shared by the slicer and the server-side finalizer.

use sha2::{Digest, Sha256};
use std::{io, path::Path};
use tokio::{fs::File, io::AsyncReadExt};

const READ_BUFFER: usize = 64 * 1024;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stream a file through SHA-256 without loading it into memory.
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_and_bytes_digests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(sha256_file(&path).await.unwrap(), sha256_bytes(&data));
    }

    #[test]
    fn empty_input_digest() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
