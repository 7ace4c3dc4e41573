//! SHA-256 digest helpers.
//!
//! Blobs are addressed as `sha256:<64 lowercase hex>`. `HashingReader` hashes
//! a byte stream while it is being consumed so encode, upload and verify never
//! need a second pass over the data.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use modpack_core::error::{PackError, Result};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Algorithm prefix of every digest produced by this crate.
pub const SHA256_PREFIX: &str = "sha256:";

/// Digest of an in-memory byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(data)))
}

/// Check that `digest` is `sha256:` followed by 64 lowercase hex characters.
pub fn validate_digest(digest: &str) -> Result<()> {
    let hex_part = digest.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
        PackError::InvalidInput(format!("unsupported digest algorithm: {}", digest))
    })?;
    let valid = hex_part.len() == 64
        && hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !valid {
        return Err(PackError::InvalidInput(format!(
            "invalid sha256 digest: {}",
            digest
        )));
    }
    Ok(())
}

/// Hex portion of a digest, validating it first.
pub fn digest_hex(digest: &str) -> Result<&str> {
    validate_digest(digest)?;
    Ok(&digest[SHA256_PREFIX.len()..])
}

/// Whether a reference string is a digest rather than a tag.
pub fn is_digest(reference: &str) -> bool {
    reference.starts_with(SHA256_PREFIX)
}

/// Running hash state shared between a `HashingReader` and its owner.
#[derive(Clone, Default)]
pub struct HashState {
    inner: Arc<Mutex<(Sha256, u64)>>,
}

impl HashState {
    /// Digest and byte count of everything observed so far.
    pub fn finish(&self) -> (String, u64) {
        let guard = self.inner.lock();
        let (hasher, size) = &*guard;
        let digest = format!(
            "{}{}",
            SHA256_PREFIX,
            hex::encode(hasher.clone().finalize())
        );
        (digest, *size)
    }

    fn update(&self, data: &[u8]) {
        let mut guard = self.inner.lock();
        guard.0.update(data);
        guard.1 += data.len() as u64;
    }
}

/// `AsyncRead` adapter that hashes and counts every byte passing through.
pub struct HashingReader<R> {
    inner: R,
    state: HashState,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: HashState::default(),
        }
    }

    /// Handle for reading the digest after the reader has been moved away.
    pub fn state(&self) -> HashState {
        self.state.clone()
    }

    pub fn finish(&self) -> (String, u64) {
        self.state.finish()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.state.update(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Drain a reader, returning its digest and size.
pub async fn digest_reader<R: AsyncRead + Unpin>(reader: R) -> Result<(String, u64)> {
    let mut hashing = HashingReader::new(reader);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = hashing.read(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(hashing.finish())
}
