//! Layer codecs.
//!
//! A codec turns one file into the byte representation stored in a layer
//! blob and back. The media-type suffix selects it: `.raw` stores the file
//! verbatim, `.tar` wraps it in a single-entry tar archive.

mod raw;
mod tar;

pub use self::raw::RawCodec;
pub use self::tar::TarCodec;

use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use modpack_core::error::{PackError, Result};
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};

use crate::spec::Descriptor;
use crate::BoxReader;

/// Encoding applied to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    Raw,
    Tar,
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecType::Raw => write!(f, "raw"),
            CodecType::Tar => write!(f, "tar"),
        }
    }
}

/// Encoded layer content.
pub enum EncodedStream {
    /// The file itself; seekable
    File(tokio::fs::File),
    /// Incrementally generated archive; not seekable
    Archive(BoxReader),
}

impl EncodedStream {
    pub fn is_seekable(&self) -> bool {
        matches!(self, EncodedStream::File(_))
    }

    /// Reset to the first byte. Seekable streams seek; anything else is
    /// produced again by `codec`.
    pub async fn rewind(
        self,
        codec: &dyn Codec,
        file_path: &Path,
        base_dir: &Path,
    ) -> Result<EncodedStream> {
        match self {
            EncodedStream::File(mut file) => {
                file.seek(std::io::SeekFrom::Start(0)).await.map_err(|e| {
                    PackError::IoError(std::io::Error::new(
                        e.kind(),
                        format!("Failed to rewind {}: {}", file_path.display(), e),
                    ))
                })?;
                Ok(EncodedStream::File(file))
            }
            EncodedStream::Archive(_) => codec.encode(file_path, base_dir).await,
        }
    }

    pub fn into_reader(self) -> BoxReader {
        match self {
            EncodedStream::File(file) => Box::new(file),
            EncodedStream::Archive(reader) => reader,
        }
    }
}

impl AsyncRead for EncodedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            EncodedStream::File(file) => Pin::new(file).poll_read(cx, buf),
            EncodedStream::Archive(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

/// Encode/decode strategy for one layer encoding.
#[async_trait]
pub trait Codec: Send + Sync {
    fn codec_type(&self) -> CodecType;

    /// Produce the layer bytes of `file_path`. Archive member names are
    /// relative to `base_dir`.
    async fn encode(&self, file_path: &Path, base_dir: &Path) -> Result<EncodedStream>;

    /// Write the layer bytes read from `reader` under `output_dir`.
    async fn decode(
        &self,
        reader: BoxReader,
        output_dir: &Path,
        relative_path: &str,
        desc: &Descriptor,
    ) -> Result<()>;
}

/// Codec type named by a media-type suffix.
pub fn codec_type_for(media_type: &str) -> Result<CodecType> {
    if media_type.ends_with(".raw") {
        Ok(CodecType::Raw)
    } else if media_type.ends_with(".tar") {
        Ok(CodecType::Tar)
    } else {
        Err(PackError::UnsupportedCodec(media_type.to_string()))
    }
}

/// Codec for a layer media type.
pub fn for_media_type(media_type: &str) -> Result<Box<dyn Codec>> {
    Ok(match codec_type_for(media_type)? {
        CodecType::Raw => Box::new(RawCodec),
        CodecType::Tar => Box::new(TarCodec),
    })
}

pub fn is_raw_media_type(media_type: &str) -> bool {
    media_type.ends_with(".raw")
}

/// Join a relative archive path onto `base`, refusing absolute paths and
/// parent components.
pub fn safe_join(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PackError::InvalidInput(format!(
                    "illegal path in layer: {}",
                    relative.display()
                )));
            }
        }
    }
    if out == base {
        return Err(PackError::InvalidInput(format!(
            "empty path in layer: '{}'",
            relative.display()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{MEDIA_TYPE_CODE_TAR, MEDIA_TYPE_MODEL_CONFIG, MEDIA_TYPE_WEIGHT_RAW};

    #[test]
    fn test_codec_selection_by_suffix() {
        assert_eq!(
            for_media_type(MEDIA_TYPE_WEIGHT_RAW).unwrap().codec_type(),
            CodecType::Raw
        );
        assert_eq!(
            for_media_type(MEDIA_TYPE_CODE_TAR).unwrap().codec_type(),
            CodecType::Tar
        );
    }

    #[test]
    fn test_unsupported_media_type() {
        let err = for_media_type(MEDIA_TYPE_MODEL_CONFIG).err().unwrap();
        assert!(matches!(err, PackError::UnsupportedCodec(_)));
        let err = for_media_type("application/vnd.cnai.model.weight.v1.tar+gzip")
            .err()
            .unwrap();
        assert!(matches!(err, PackError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_is_raw_media_type() {
        assert!(is_raw_media_type(MEDIA_TYPE_WEIGHT_RAW));
        assert!(!is_raw_media_type(MEDIA_TYPE_CODE_TAR));
    }

    #[test]
    fn test_safe_join() {
        let base = Path::new("/out");
        assert_eq!(
            safe_join(base, Path::new("a/./b.txt")).unwrap(),
            PathBuf::from("/out/a/b.txt")
        );
        assert!(safe_join(base, Path::new("../etc/passwd")).is_err());
        assert!(safe_join(base, Path::new("a/../../x")).is_err());
        assert!(safe_join(base, Path::new("/etc/passwd")).is_err());
        assert!(safe_join(base, Path::new(".")).is_err());
    }
}
