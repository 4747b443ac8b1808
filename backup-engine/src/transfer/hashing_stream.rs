//! Stream wrapper that hashes upload bytes as they go out.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use crate::sync::{ChecksumAlgorithm, ChecksumHasher};

#[derive(Default)]
struct DigestState {
    hasher: Option<ChecksumHasher>,
    bytes: u64,
    finished: bool,
    source_error: Option<(io::ErrorKind, String)>,
}

/// Read side of a [`HashingStream`], kept by the caller while the stream
/// itself is handed to the store.
pub struct StreamDigest {
    state: Arc<Mutex<DigestState>>,
}

impl StreamDigest {
    fn lock(&self) -> MutexGuard<'_, DigestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The local read error that ended the stream, if any.
    pub fn source_error(&self) -> Option<io::Error> {
        self.lock()
            .source_error
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    pub fn bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Checksum and size of everything that was streamed. Fails if the
    /// source errored, or if the stream was neither read to the end nor
    /// read up to `expected_len` bytes.
    pub fn finish(self, expected_len: Option<u64>) -> io::Result<(String, u64)> {
        let mut state = self.lock();
        if let Some((kind, msg)) = state.source_error.take() {
            return Err(io::Error::new(kind, msg));
        }
        if !state.finished && expected_len != Some(state.bytes) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upload stream was not read to the end",
            ));
        }
        let hasher = state.hasher.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "upload digest already taken")
        })?;
        Ok((hasher.finalize(), state.bytes))
    }
}

pub struct HashingStream<S> {
    inner: S,
    state: Arc<Mutex<DigestState>>,
}

impl<S> HashingStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>>,
{
    pub fn new(inner: S, algorithm: ChecksumAlgorithm) -> (Self, StreamDigest) {
        let state = Arc::new(Mutex::new(DigestState {
            hasher: Some(algorithm.hasher()),
            ..Default::default()
        }));
        let digest = StreamDigest {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, digest)
    }

    fn lock(&self) -> MutexGuard<'_, DigestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let mut state = self.lock();
                if let Some(hasher) = state.hasher.as_mut() {
                    hasher.update(&bytes);
                }
                state.bytes += bytes.len() as u64;
                drop(state);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.lock().source_error = Some((e.kind(), e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.lock().finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
