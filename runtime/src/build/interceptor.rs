//! Side-channel interceptors fed a copy of each layer stream.
//!
//! An interceptor reads the same bytes the output strategy receives and
//! returns extra annotations for the layer descriptor.

use std::collections::BTreeMap;
use std::io::Read;

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};
use serde::Serialize;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::codec::CodecType;
use crate::spec::ANNOTATION_NYDUS_CRCS;
use crate::BoxReader;

/// Chunk size for every media type without an override.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Chunk size for weight and dataset layers.
pub const LARGE_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Observes a layer stream and produces descriptor annotations.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        cancel: CancellationToken,
        media_type: &str,
        file_path: &str,
        codec_type: CodecType,
        reader: BoxReader,
    ) -> Result<Option<BTreeMap<String, String>>>;
}

#[derive(Debug, Serialize)]
struct FileCrcList {
    files: Vec<FileCrcInfo>,
}

#[derive(Debug, Serialize)]
struct FileCrcInfo {
    file_path: String,
    chunk_crcs: String,
}

/// Computes CRC32C checksums of fixed-size file chunks, the format nydus
/// uses to verify lazily fetched model chunks.
#[derive(Debug, Default, Clone)]
pub struct ChunkCrcInterceptor;

impl ChunkCrcInterceptor {
    pub fn new() -> Self {
        Self
    }

    /// Chunk size used for a layer media type.
    pub fn chunk_size(media_type: &str) -> u64 {
        const LARGE: [&str; 2] = [
            "application/vnd.cnai.model.weight.v1.",
            "application/vnd.cnai.model.dataset.v1.",
        ];
        if LARGE.iter().any(|prefix| media_type.starts_with(prefix)) {
            LARGE_CHUNK_SIZE
        } else {
            DEFAULT_CHUNK_SIZE
        }
    }
}

#[async_trait]
impl Interceptor for ChunkCrcInterceptor {
    async fn intercept(
        &self,
        cancel: CancellationToken,
        media_type: &str,
        file_path: &str,
        codec_type: CodecType,
        reader: BoxReader,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let chunk_size = Self::chunk_size(media_type);

        let files = match codec_type {
            CodecType::Raw => {
                let mut bridge = SyncIoBridge::new(reader);
                let token = cancel.clone();
                let crcs = tokio::task::spawn_blocking(move || {
                    chunk_crcs(&mut bridge, chunk_size, &token)
                })
                .await
                .map_err(|e| PackError::Other(format!("crc task failed: {}", e)))??;
                vec![FileCrcInfo {
                    file_path: file_path.to_string(),
                    chunk_crcs: format_crcs(&crcs),
                }]
            }
            CodecType::Tar => {
                let bridge = SyncIoBridge::new(reader);
                let token = cancel.clone();
                tokio::task::spawn_blocking(move || crcs_in_tar(bridge, chunk_size, &token))
                    .await
                    .map_err(|e| PackError::Other(format!("crc task failed: {}", e)))??
            }
        };

        let json = serde_json::to_string(&FileCrcList { files })?;
        tracing::debug!(file = file_path, chunk_size, "Computed chunk checksums");
        Ok(Some(BTreeMap::from([(ANNOTATION_NYDUS_CRCS.to_string(), json)])))
    }
}

/// CRC32C of each `chunk_size` slice of the stream; `[0]` for empty input.
fn chunk_crcs<R: Read>(
    reader: &mut R,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<Vec<u32>> {
    let mut crcs = Vec::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut crc = 0u32;
    let mut filled = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        let want = READ_BUF_SIZE.min((chunk_size - filled) as usize);
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        filled += n as u64;
        if filled == chunk_size {
            crcs.push(crc);
            crc = 0;
            filled = 0;
        }
    }

    if filled > 0 {
        crcs.push(crc);
    }
    if crcs.is_empty() {
        crcs.push(0);
    }
    Ok(crcs)
}

fn crcs_in_tar<R: Read>(
    reader: R,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<Vec<FileCrcInfo>> {
    let mut archive = tar::Archive::new(reader);
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| PackError::BuildError(format!("error reading tar: {}", e)))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        let mut entry =
            entry.map_err(|e| PackError::BuildError(format!("error reading tar: {}", e)))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| PackError::BuildError(format!("invalid tar entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let crcs = chunk_crcs(&mut entry, chunk_size, cancel)?;
        files.push(FileCrcInfo {
            file_path: name,
            chunk_crcs: format_crcs(&crcs),
        });
    }
    Ok(files)
}

fn format_crcs(crcs: &[u32]) -> String {
    crcs.iter()
        .map(|c| format!("{:#x}", c))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, TarCodec};
    use crate::spec::{MEDIA_TYPE_CODE_TAR, MEDIA_TYPE_DATASET_RAW, MEDIA_TYPE_WEIGHT_CONFIG_RAW, MEDIA_TYPE_WEIGHT_RAW};

    fn boxed(data: Vec<u8>) -> BoxReader {
        Box::new(std::io::Cursor::new(data))
    }

    #[test]
    fn test_chunk_crcs_known_value() {
        let mut reader = &b"hello world"[..];
        let crcs = chunk_crcs(&mut reader, 11, &CancellationToken::new()).unwrap();
        assert_eq!(crcs, vec![0xc99465aa]);
    }

    #[test]
    fn test_chunk_crcs_empty_input() {
        let mut reader = &b""[..];
        let crcs = chunk_crcs(&mut reader, 10, &CancellationToken::new()).unwrap();
        assert_eq!(crcs, vec![0]);
    }

    #[test]
    fn test_chunk_boundaries() {
        let mut reader = &b"hello worldhello worldhello"[..];
        let crcs = chunk_crcs(&mut reader, 11, &CancellationToken::new()).unwrap();
        assert_eq!(crcs.len(), 3);
        assert_eq!(crcs[0], 0xc99465aa);
        assert_eq!(crcs[1], 0xc99465aa);
        assert_eq!(crcs[2], crc32c::crc32c(b"hello"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_interceptor() {
        let token = CancellationToken::new();
        token.cancel();
        let err = ChunkCrcInterceptor
            .intercept(token, MEDIA_TYPE_WEIGHT_RAW, "m.bin", CodecType::Raw, boxed(vec![1; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::Cancelled));
    }

    #[test]
    fn test_chunk_size_by_media_type() {
        assert_eq!(ChunkCrcInterceptor::chunk_size(MEDIA_TYPE_WEIGHT_RAW), LARGE_CHUNK_SIZE);
        assert_eq!(ChunkCrcInterceptor::chunk_size(MEDIA_TYPE_DATASET_RAW), LARGE_CHUNK_SIZE);
        assert_eq!(
            ChunkCrcInterceptor::chunk_size(MEDIA_TYPE_WEIGHT_CONFIG_RAW),
            DEFAULT_CHUNK_SIZE
        );
        assert_eq!(ChunkCrcInterceptor::chunk_size(MEDIA_TYPE_CODE_TAR), DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_raw_annotation_format() {
        let annotations = ChunkCrcInterceptor
            .intercept(
                CancellationToken::new(),
                MEDIA_TYPE_WEIGHT_RAW,
                "model.bin",
                CodecType::Raw,
                boxed(b"hello world".to_vec()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            annotations[ANNOTATION_NYDUS_CRCS],
            r#"{"files":[{"file_path":"model.bin","chunk_crcs":"0xc99465aa"}]}"#
        );
    }

    #[tokio::test]
    async fn test_tar_annotation_uses_entry_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        let path = tmp.path().join("src/train.py");
        std::fs::write(&path, b"hello world").unwrap();
        let stream = TarCodec.encode(&path, tmp.path()).await.unwrap();

        let annotations = ChunkCrcInterceptor
            .intercept(
                CancellationToken::new(),
                MEDIA_TYPE_CODE_TAR,
                "ignored",
                CodecType::Tar,
                stream.into_reader(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            annotations[ANNOTATION_NYDUS_CRCS],
            r#"{"files":[{"file_path":"src/train.py","chunk_crcs":"0xc99465aa"}]}"#
        );
    }
}
