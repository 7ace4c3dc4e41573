use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};

use super::{safe_join, Codec, CodecType, EncodedStream};
use crate::spec::Descriptor;
use crate::BoxReader;

/// Stores the file bytes verbatim.
pub struct RawCodec;

#[async_trait]
impl Codec for RawCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Raw
    }

    async fn encode(&self, file_path: &Path, _base_dir: &Path) -> Result<EncodedStream> {
        let file = tokio::fs::File::open(file_path).await.map_err(|e| {
            PackError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to open {}: {}", file_path.display(), e),
            ))
        })?;
        Ok(EncodedStream::File(file))
    }

    async fn decode(
        &self,
        mut reader: BoxReader,
        output_dir: &Path,
        relative_path: &str,
        desc: &Descriptor,
    ) -> Result<()> {
        let target = safe_join(output_dir, Path::new(relative_path))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PackError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {}: {}", parent.display(), e),
                ))
            })?;
        }

        let mut file = tokio::fs::File::create(&target).await.map_err(|e| {
            PackError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", target.display(), e),
            ))
        })?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(meta) = desc.file_metadata() {
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(meta.mode))?;
            let mtime = filetime::FileTime::from_unix_time(
                meta.mtime.timestamp(),
                meta.mtime.timestamp_subsec_nanos(),
            );
            filetime::set_file_mtime(&target, mtime)?;
        }

        tracing::debug!(path = %target.display(), "Decoded raw layer");
        Ok(())
    }
}
