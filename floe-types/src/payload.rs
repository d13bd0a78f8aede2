//! Lazy byte-stream payloads with exactly-once completion.
//!
//! Request and response bodies are [`PayloadSource`]s: single-consumer,
//! possibly-empty, possibly-unbounded byte sequences. Whoever owns the source
//! must call [`PayloadSource::complete`] exactly once with the definitive
//! outcome; the outcome is observable through the clonable [`Completed`]
//! handle. [`PayloadSink`] is the write-side dual.
//!
//! The first `complete` call wins; later calls are no-ops. Reading after
//! completion fails deterministically. Dropping an incomplete source or sink
//! resolves it as cancelled, so no outcome is ever lost to an early return.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::Error;

/// Boxed future returned by [`PayloadReader::read`].
pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Bytes>, Error>> + Send + 'a>>;

/// Boxed future returned by [`PayloadWriter::write`].
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// The byte stream behind a [`PayloadSource`].
pub trait PayloadReader: Send + 'static {
    /// Yield the next chunk, or `None` at end of stream.
    fn read(&mut self) -> ReadFuture<'_>;
}

/// The byte stream behind a [`PayloadSink`].
pub trait PayloadWriter: Send + 'static {
    fn write(&mut self, chunk: Bytes) -> WriteFuture<'_>;
}

/// Decorator applied to an outgoing payload sink before the payload is
/// copied into it. Decorators wrap the sink they are given and are applied
/// in stack order, last pushed outermost.
pub type PayloadSinkDecorator = Box<dyn FnOnce(PayloadSink) -> PayloadSink + Send>;

// ============================================================================
// Completion
// ============================================================================

#[derive(Default)]
struct CompletionInner {
    outcome: Mutex<Option<Option<Error>>>,
    notify: Notify,
}

/// Write side of a payload outcome. Resolves at most once.
#[derive(Clone, Default)]
pub(crate) struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    /// Record the outcome. Returns false if one was already recorded.
    pub(crate) fn resolve(&self, cause: Option<Error>) -> bool {
        {
            let mut slot = self.inner.outcome.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.inner.outcome.lock().unwrap().is_some()
    }

    pub(crate) fn handle(&self) -> Completed {
        Completed {
            inner: self.inner.clone(),
        }
    }
}

/// Awaitable handle to a payload's final outcome.
///
/// Clonable; any number of observers may wait. Resolves with `None` for
/// success, or the failure cause.
#[derive(Clone)]
pub struct Completed {
    inner: Arc<CompletionInner>,
}

impl Completed {
    /// Wait for the outcome.
    pub async fn wait(&self) -> Option<Error> {
        loop {
            if let Some(outcome) = self.inner.outcome.lock().unwrap().clone() {
                return outcome;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a resolve between the check and
            // the await still wakes us.
            notified.as_mut().enable();
            if let Some(outcome) = self.inner.outcome.lock().unwrap().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Non-blocking peek: `None` while unresolved.
    pub fn outcome(&self) -> Option<Option<Error>> {
        self.inner.outcome.lock().unwrap().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.outcome.lock().unwrap().is_some()
    }
}

impl fmt::Debug for Completed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completed")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Handle that resolves a payload's outcome without owning the source.
///
/// A connection holds one while a dispatcher borrows the source, so the
/// definitive outcome can still be recorded after the dispatch returns.
/// The exactly-once rule is shared with the source: whichever resolves
/// first wins.
pub struct Completer {
    completion: Completion,
}

impl Completer {
    /// Record the outcome unless one is already recorded.
    pub fn complete(&self, cause: Option<Error>) -> bool {
        self.completion.resolve(cause)
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("resolved", &self.completion.is_resolved())
            .finish()
    }
}

// ============================================================================
// PayloadSource
// ============================================================================

/// A lazy, single-consumer byte stream that completes exactly once.
pub struct PayloadSource {
    reader: Option<Box<dyn PayloadReader>>,
    completion: Completion,
}

impl PayloadSource {
    pub fn new(reader: impl PayloadReader) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            completion: Completion::default(),
        }
    }

    /// An empty payload: the first read yields end-of-stream.
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// A payload backed by a single in-memory chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(BytesReader(Some(bytes.into())))
    }

    /// Yield the next chunk, or `None` at end of stream.
    ///
    /// Fails with [`Error::InvalidArgument`] once the source is completed.
    pub async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        match self.reader.as_mut() {
            Some(reader) => reader.read().await,
            None => Err(Error::InvalidArgument(
                "payload read after completion".into(),
            )),
        }
    }

    /// Drain the stream into a single buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Record the definitive outcome and release the underlying stream.
    ///
    /// The first call wins; later calls are no-ops. Readers that observed
    /// end-of-stream still call `complete(None)` to release resources.
    pub fn complete(&mut self, cause: Option<Error>) {
        self.reader = None;
        self.completion.resolve(cause);
    }

    /// Handle observing the outcome set by [`complete`](Self::complete).
    pub fn completed(&self) -> Completed {
        self.completion.handle()
    }

    /// Handle that can resolve the outcome while something else owns the
    /// source.
    pub fn completer(&self) -> Completer {
        Completer {
            completion: self.completion.clone(),
        }
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSource")
            .field("completed", &self.completion.is_resolved())
            .finish_non_exhaustive()
    }
}

impl Drop for PayloadSource {
    fn drop(&mut self) {
        // Scoped-owner guard: an owner that bails without completing still
        // resolves the outcome, so observers are never left hanging.
        if !self.completion.is_resolved() {
            self.completion.resolve(Some(Error::Cancelled));
        }
    }
}

struct BytesReader(Option<Bytes>);

impl PayloadReader for BytesReader {
    fn read(&mut self) -> ReadFuture<'_> {
        let chunk = self.0.take().filter(|b| !b.is_empty());
        Box::pin(async move { Ok(chunk) })
    }
}

// ============================================================================
// PayloadSink
// ============================================================================

/// Write-side dual of [`PayloadSource`].
pub struct PayloadSink {
    writer: Option<Box<dyn PayloadWriter>>,
    completion: Completion,
}

impl PayloadSink {
    pub fn new(writer: impl PayloadWriter) -> Self {
        Self {
            writer: Some(Box::new(writer)),
            completion: Completion::default(),
        }
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(chunk).await,
            None => Err(Error::InvalidArgument(
                "payload write after completion".into(),
            )),
        }
    }

    /// Record the definitive outcome and release the underlying stream.
    pub fn complete(&mut self, cause: Option<Error>) {
        self.writer = None;
        self.completion.resolve(cause);
    }

    pub fn completed(&self) -> Completed {
        self.completion.handle()
    }
}

impl fmt::Debug for PayloadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSink")
            .field("completed", &self.completion.is_resolved())
            .finish_non_exhaustive()
    }
}

impl Drop for PayloadSink {
    fn drop(&mut self) {
        if !self.completion.is_resolved() {
            self.completion.resolve(Some(Error::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_bytes_yields_one_chunk_then_eof() {
        let mut payload = PayloadSource::from_bytes(&b"hello"[..]);
        assert_eq!(payload.read().await.unwrap(), Some(Bytes::from("hello")));
        assert_eq!(payload.read().await.unwrap(), None);
        payload.complete(None);
        assert!(payload.completed().wait().await.is_none());
    }

    #[tokio::test]
    async fn empty_payload_is_immediate_eof() {
        let mut payload = PayloadSource::empty();
        assert_eq!(payload.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_after_complete_fails() {
        let mut payload = PayloadSource::from_bytes(&b"x"[..]);
        payload.complete(None);
        assert!(matches!(
            payload.read().await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn first_complete_wins() {
        let mut payload = PayloadSource::empty();
        let completed = payload.completed();
        payload.complete(Some(Error::ConnectionClosed));
        payload.complete(None);
        assert!(matches!(
            completed.wait().await,
            Some(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn completion_wakes_observers_registered_before_resolve() {
        let mut payload = PayloadSource::empty();
        let completed = payload.completed();
        let waiter = tokio::spawn(async move { completed.wait().await });
        tokio::task::yield_now().await;
        payload.complete(Some(Error::Cancelled));
        assert!(matches!(waiter.await.unwrap(), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn drop_without_complete_resolves_cancelled() {
        let payload = PayloadSource::from_bytes(&b"abandoned"[..]);
        let completed = payload.completed();
        drop(payload);
        assert!(matches!(completed.wait().await, Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn read_to_end_concatenates_chunks() {
        struct TwoChunks(u8);
        impl PayloadReader for TwoChunks {
            fn read(&mut self) -> ReadFuture<'_> {
                self.0 += 1;
                let chunk = match self.0 {
                    1 => Some(Bytes::from("ab")),
                    2 => Some(Bytes::from("cd")),
                    _ => None,
                };
                Box::pin(async move { Ok(chunk) })
            }
        }

        let mut payload = PayloadSource::new(TwoChunks(0));
        assert_eq!(payload.read_to_end().await.unwrap(), Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn sink_write_after_complete_fails() {
        struct NullWriter;
        impl PayloadWriter for NullWriter {
            fn write(&mut self, _chunk: Bytes) -> WriteFuture<'_> {
                Box::pin(async { Ok(()) })
            }
        }

        let mut sink = PayloadSink::new(NullWriter);
        sink.write(Bytes::from("ok")).await.unwrap();
        sink.complete(None);
        assert!(matches!(
            sink.write(Bytes::from("late")).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(sink.completed().wait().await.is_none());
    }
}
