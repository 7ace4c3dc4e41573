use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};
use tar::{EntryType, Header};
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;

use super::{safe_join, Codec, CodecType, EncodedStream};
use crate::spec::Descriptor;
use crate::BoxReader;

const BLOCK_SIZE: u64 = 512;
const NAME_FIELD_LEN: usize = 100;

/// Wraps a file in a single-entry tar archive.
pub struct TarCodec;

#[async_trait]
impl Codec for TarCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Tar
    }

    async fn encode(&self, file_path: &Path, base_dir: &Path) -> Result<EncodedStream> {
        let file = tokio::fs::File::open(file_path).await.map_err(|e| {
            PackError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to open {}: {}", file_path.display(), e),
            ))
        })?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(PackError::InvalidInput(format!(
                "{} is not a regular file",
                file_path.display()
            )));
        }

        let name = archive_name(file_path, base_dir)?;
        let header = entry_header(&name, &meta)?;
        let size = meta.len();

        let padding = (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE;
        // Entry padding followed by the two zero blocks that end the archive.
        let trailer = vec![0u8; (padding + 2 * BLOCK_SIZE) as usize];

        let stream = Cursor::new(header)
            .chain(file.take(size))
            .chain(Cursor::new(trailer));
        Ok(EncodedStream::Archive(Box::new(stream)))
    }

    async fn decode(
        &self,
        reader: BoxReader,
        output_dir: &Path,
        _relative_path: &str,
        _desc: &Descriptor,
    ) -> Result<()> {
        let output_dir = output_dir.to_path_buf();
        let bridge = SyncIoBridge::new(reader);

        tokio::task::spawn_blocking(move || unpack(bridge, &output_dir))
            .await
            .map_err(|e| PackError::Other(format!("tar decode task failed: {}", e)))?
    }
}

/// Archive member name: `file_path` relative to `base_dir`, `/`-separated.
fn archive_name(file_path: &Path, base_dir: &Path) -> Result<String> {
    let rel = file_path.strip_prefix(base_dir).map_err(|_| {
        PackError::InvalidInput(format!(
            "{} is outside of {}",
            file_path.display(),
            base_dir.display()
        ))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return Err(PackError::InvalidInput(format!(
            "{} has no name relative to {}",
            file_path.display(),
            base_dir.display()
        )));
    }
    Ok(parts.join("/"))
}

/// Header block(s) for one regular file, with a GNU long-name record ahead of
/// the entry header when the name does not fit.
fn entry_header(name: &str, meta: &std::fs::Metadata) -> Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header.set_metadata(meta);
    header.set_entry_type(EntryType::Regular);

    let mut out = Vec::with_capacity(3 * BLOCK_SIZE as usize);
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_FIELD_LEN {
        out.extend_from_slice(&long_name_record(bytes));
        header.as_old_mut().name.copy_from_slice(&bytes[..NAME_FIELD_LEN]);
    } else {
        header.set_path(name).map_err(|e| {
            PackError::InvalidInput(format!("Failed to set tar path {}: {}", name, e))
        })?;
    }
    header.set_cksum();
    out.extend_from_slice(header.as_bytes());
    Ok(out)
}

/// `././@LongLink` header plus the NUL-terminated name, padded to a block.
fn long_name_record(name: &[u8]) -> Vec<u8> {
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..13].copy_from_slice(b"././@LongLink");
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(name.len() as u64 + 1);
    header.set_entry_type(EntryType::GNULongName);
    header.set_cksum();

    let data_len = name.len() as u64 + 1;
    let padded = data_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut out = Vec::with_capacity((BLOCK_SIZE + padded) as usize);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name);
    out.resize((BLOCK_SIZE + padded) as usize, 0);
    out
}

fn unpack<R: std::io::Read>(reader: R, output_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| PackError::BuildError(format!("Failed to read tar archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PackError::BuildError(format!("Failed to read tar entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| PackError::BuildError(format!("Invalid tar entry path: {}", e)))?
            .into_owned();
        let target = safe_join(output_dir, &path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|e| {
                    PackError::IoError(std::io::Error::new(
                        e.kind(),
                        format!("Failed to create directory {}: {}", target.display(), e),
                    ))
                })?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&target).map_err(|e| {
                    PackError::IoError(std::io::Error::new(
                        e.kind(),
                        format!("Failed to unpack {}: {}", target.display(), e),
                    ))
                })?;
                tracing::debug!(path = %target.display(), "Decoded tar entry");
            }
            other => {
                tracing::debug!(path = %path.display(), entry_type = ?other, "Skipping tar entry");
            }
        }
    }

    // Drain the remainder so a verifying reader sees every byte.
    let mut rest = archive.into_inner();
    std::io::copy(&mut rest, &mut std::io::sink())?;
    Ok(())
}
