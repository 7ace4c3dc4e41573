//! Build lifecycle hooks and progress reporting.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use modpack_core::error::PackError;
use tokio::io::{AsyncRead, ReadBuf};

use crate::spec::Descriptor;
use crate::BoxReader;

pub type OnStartFn = dyn Fn(&str, u64, BoxReader) -> BoxReader + Send + Sync;
pub type OnErrorFn = dyn Fn(&str, &PackError) + Send + Sync;
pub type OnCompleteFn = dyn Fn(&str, &Descriptor) + Send + Sync;

/// Callbacks invoked around each blob transfer.
///
/// `on_start` may wrap the stream but must not change its bytes.
#[derive(Clone)]
pub struct Hooks {
    on_start: Arc<OnStartFn>,
    on_error: Arc<OnErrorFn>,
    on_complete: Arc<OnCompleteFn>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_start: Arc::new(|_: &str, _: u64, reader: BoxReader| reader),
            on_error: Arc::new(|_: &str, _: &PackError| {}),
            on_complete: Arc::new(|_: &str, _: &Descriptor| {}),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

impl Hooks {
    pub fn with_on_start(
        mut self,
        f: impl Fn(&str, u64, BoxReader) -> BoxReader + Send + Sync + 'static,
    ) -> Self {
        self.on_start = Arc::new(f);
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&str, &PackError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }

    pub fn with_on_complete(
        mut self,
        f: impl Fn(&str, &Descriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Arc::new(f);
        self
    }

    /// Hooks forwarding to a progress observer under `prompt`.
    pub fn from_observer(observer: Arc<dyn ProgressObserver>, prompt: &str) -> Self {
        let prompt = prompt.to_string();
        let start = observer.clone();
        let error = observer.clone();
        Self {
            on_start: Arc::new(move |name: &str, size: u64, reader: BoxReader| {
                start.add(&prompt, name, size, reader)
            }),
            on_error: Arc::new(move |name: &str, err: &PackError| error.abort(name, err)),
            on_complete: Arc::new(move |name: &str, desc: &Descriptor| {
                observer.complete(name, &format!("{} {}", desc.digest, desc.size))
            }),
        }
    }

    pub fn start(&self, name: &str, size: u64, reader: BoxReader) -> BoxReader {
        (self.on_start)(name, size, reader)
    }

    /// Run `reader` through `on_start` to the end, for transfers whose bytes
    /// are not otherwise streamed.
    pub async fn drain(&self, name: &str, size: u64, reader: BoxReader) -> Result<u64, PackError> {
        let mut reader = self.start(name, size, reader);
        Ok(tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?)
    }

    pub fn error(&self, name: &str, err: &PackError) {
        (self.on_error)(name, err)
    }

    pub fn complete(&self, name: &str, desc: &Descriptor) {
        (self.on_complete)(name, desc)
    }
}

/// Receives transfer progress. Purely observational.
pub trait ProgressObserver: Send + Sync {
    /// A transfer of `size` bytes begins; may wrap the reader to count bytes.
    fn add(&self, prompt: &str, name: &str, size: u64, reader: BoxReader) -> BoxReader;

    fn abort(&self, name: &str, err: &PackError);

    fn complete(&self, name: &str, message: &str);
}

/// Progress observer that logs through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn add(&self, prompt: &str, name: &str, size: u64, reader: BoxReader) -> BoxReader {
        tracing::info!(prompt, name, size, "Transfer started");
        Box::new(CountingReader::new(reader))
    }

    fn abort(&self, name: &str, err: &PackError) {
        tracing::warn!(name, error = %err, "Transfer failed");
    }

    fn complete(&self, name: &str, message: &str) {
        tracing::info!(name, message, "Transfer complete");
    }
}

/// Reader wrapper tracking bytes read.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of bytes read so far.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.count
                .fetch_add((buf.filled().len() - before) as u64, Ordering::Relaxed);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_default_hooks_are_transparent() {
        let hooks = Hooks::default();
        let mut reader = hooks.start("a", 3, Box::new(&b"abc"[..]));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        hooks.error("a", &PackError::Cancelled);
        hooks.complete("a", &Descriptor::new("m", "sha256:00", 3));
    }

    #[tokio::test]
    async fn test_custom_hooks_are_invoked() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
        let hooks = Hooks::default()
            .with_on_start(move |name, size, r| {
                e1.lock().push(format!("start {name} {size}"));
                r
            })
            .with_on_error(move |name, _| e2.lock().push(format!("error {name}")))
            .with_on_complete(move |name, d| e3.lock().push(format!("done {name} {}", d.size)));

        let cloned = hooks.clone();
        let _ = cloned.start("x", 9, Box::new(&b""[..]));
        cloned.error("x", &PackError::Cancelled);
        cloned.complete("x", &Descriptor::new("m", "sha256:00", 9));

        assert_eq!(
            *events.lock(),
            vec!["start x 9", "error x", "done x 9"]
        );
    }

    #[tokio::test]
    async fn test_counting_reader() {
        let reader = CountingReader::new(&b"hello world"[..]);
        let counter = reader.counter();
        let mut reader = reader;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_observer_hooks_pass_bytes_through() {
        let hooks = Hooks::from_observer(Arc::new(TracingProgress), "Building");
        let mut reader = hooks.start("model.bin", 4, Box::new(&b"data"[..]));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");
    }
}
