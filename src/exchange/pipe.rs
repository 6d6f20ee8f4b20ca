//! Bounded streaming pipe between a byte producer and a single consumer.
//!
//! The transport is the producer: it pulls bytes off the socket into the pipe
//! with [`Pipe::sink`]. A handler is the consumer: it reads through the
//! [`PipeSource`], either asynchronously (`AsyncRead` / `Stream`) or from a
//! worker thread with blocking `std::io::Read`.
//!
//! # Backpressure
//! ```text
//! sink() fills buffer to capacity  ->  producer suspended (stops reading socket)
//! consumer drains below capacity   ->  registered on_available_capacity callback fires once
//! ```
//! The producer never polls for capacity; it registers a one-shot callback and
//! waits for it.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send>;

/// Default buffer capacity for request bodies.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// A fixed-capacity byte pipe.
///
/// Cloning a `Pipe` yields another handle to the producer side.
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<Shared>,
}

/// Consumer side of a [`Pipe`].
pub struct PipeSource {
    shared: Arc<Shared>,
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    readable: Condvar,
    source_taken: AtomicBool,
}

#[derive(Default)]
struct State {
    buf: BytesMut,
    closed: bool,
    consumer_gone: bool,
    error: Option<StoredError>,
    read_waker: Option<Waker>,
    on_capacity: Option<Callback>,
    on_demand: Option<Callback>,
    demanded: bool,
}

#[derive(Clone)]
struct StoredError {
    kind: io::ErrorKind,
    message: String,
}

impl StoredError {
    fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Pipe")
            .field("capacity", &self.shared.capacity)
            .field("buffered", &state.buf.len())
            .field("closed", &state.closed)
            .field("failed", &state.error.is_some())
            .finish()
    }
}

impl std::fmt::Debug for PipeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeSource").finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Pipe {
    /// Create a pipe holding at most `capacity` unread bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity: capacity.max(1),
                state: Mutex::new(State::default()),
                readable: Condvar::new(),
                source_taken: AtomicBool::new(false),
            }),
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Take the consumer side. Only the first call returns a source.
    pub fn source(&self) -> Option<PipeSource> {
        if self.shared.source_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(PipeSource {
            shared: self.shared.clone(),
        })
    }

    /// Pull bytes from the producer callback into free buffer space.
    ///
    /// `read_fn` receives a slice no larger than the free capacity and returns
    /// how many bytes it wrote. It runs under the pipe lock and must not call
    /// back into the pipe. Returns `Ok(0)` without calling `read_fn` when the
    /// buffer is full.
    pub fn sink<F>(&self, read_fn: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let (n, waker) = {
            let mut state = self.shared.lock();
            if let Some(err) = &state.error {
                return Err(err.to_io());
            }
            if state.consumer_gone {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe consumer closed",
                ));
            }
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
            }
            let free = self.shared.capacity - state.buf.len();
            if free == 0 {
                return Ok(0);
            }

            let start = state.buf.len();
            state.buf.resize(start + free, 0);
            let n = match read_fn(&mut state.buf[start..]) {
                Ok(n) => n.min(free),
                Err(e) => {
                    state.buf.truncate(start);
                    return Err(e);
                }
            };
            state.buf.truncate(start + n);
            if n == 0 {
                return Ok(0);
            }
            (n, state.read_waker.take())
        };

        self.shared.readable.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(n)
    }

    /// Copy as much of `data` as fits. Returns the number of bytes accepted.
    pub fn push(&self, data: &[u8]) -> io::Result<usize> {
        let mut accepted = 0;
        self.sink(|dst| {
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
            accepted = n;
            Ok(n)
        })?;
        Ok(accepted)
    }

    /// Free buffer space in bytes; zero once the pipe is terminated.
    pub fn available_capacity(&self) -> usize {
        let state = self.shared.lock();
        if state.closed || state.error.is_some() || state.consumer_gone {
            return 0;
        }
        self.shared.capacity - state.buf.len()
    }

    /// Whether more producer bytes can be accepted right now.
    pub fn has_available_capacity(&self) -> bool {
        self.available_capacity() > 0
    }

    /// Register a one-shot wake-up for when capacity frees up.
    ///
    /// Runs immediately if there is capacity (or the pipe is terminated).
    /// Replaces any previously registered callback.
    pub fn on_available_capacity<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            let terminated = state.closed || state.error.is_some() || state.consumer_gone;
            if !terminated && state.buf.len() >= self.shared.capacity {
                state.on_capacity = Some(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Wait until capacity frees up, via [`Pipe::on_available_capacity`].
    pub async fn capacity_available(&self) {
        let (tx, rx) = oneshot::channel::<()>();
        self.on_available_capacity(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Register a one-shot callback fired the first time the consumer asks
    /// for bytes. Runs immediately if that already happened.
    pub fn on_demand<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if !state.demanded {
                state.on_demand = Some(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Signal end of stream. Buffered bytes remain readable.
    pub fn close(&self) {
        let waker = {
            let mut state = self.shared.lock();
            if state.closed || state.error.is_some() {
                return;
            }
            state.closed = true;
            state.on_capacity = None;
            state.read_waker.take()
        };
        self.shared.readable.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Terminate the pipe with an error. Every later read or write returns it.
    pub fn fail(&self, err: io::Error) {
        let (waker, on_capacity) = {
            let mut state = self.shared.lock();
            if state.error.is_some() {
                return;
            }
            state.error = Some(StoredError {
                kind: err.kind(),
                message: err.to_string(),
            });
            state.buf.clear();
            (state.read_waker.take(), state.on_capacity.take())
        };
        self.shared.readable.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some(callback) = on_capacity {
            callback();
        }
    }

    /// True once `close` or `fail` was called, or the consumer went away.
    pub fn is_terminated(&self) -> bool {
        let state = self.shared.lock();
        state.closed || state.error.is_some() || state.consumer_gone
    }

    /// True if the consumer dropped its source.
    pub fn is_consumer_gone(&self) -> bool {
        self.shared.lock().consumer_gone
    }
}

enum Take {
    Data(Bytes),
    Eof,
    Failed(io::Error),
    Empty,
}

impl PipeSource {
    fn take(&self, max: usize) -> (Take, Vec<Callback>) {
        let mut callbacks = Vec::new();
        let mut state = self.shared.lock();
        if !state.demanded {
            state.demanded = true;
            if let Some(cb) = state.on_demand.take() {
                callbacks.push(cb);
            }
        }
        if let Some(err) = &state.error {
            return (Take::Failed(err.to_io()), callbacks);
        }
        if state.buf.is_empty() {
            let outcome = if state.closed { Take::Eof } else { Take::Empty };
            return (outcome, callbacks);
        }

        let n = state.buf.len().min(max);
        let data = state.buf.split_to(n).freeze();
        if state.buf.len() < self.shared.capacity {
            if let Some(cb) = state.on_capacity.take() {
                callbacks.push(cb);
            }
        }
        (Take::Data(data), callbacks)
    }

    fn park(&self, waker: &Waker) -> bool {
        let mut state = self.shared.lock();
        if !state.buf.is_empty() || state.closed || state.error.is_some() {
            return false;
        }
        state.read_waker = Some(waker.clone());
        true
    }

    fn run(callbacks: Vec<Callback>) {
        for cb in callbacks {
            cb();
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>, max: usize) -> Poll<io::Result<Option<Bytes>>> {
        loop {
            let (outcome, callbacks) = self.take(max);
            Self::run(callbacks);
            match outcome {
                Take::Data(data) => return Poll::Ready(Ok(Some(data))),
                Take::Eof => return Poll::Ready(Ok(None)),
                Take::Failed(err) => return Poll::Ready(Err(err)),
                Take::Empty => {
                    if self.park(cx.waker()) {
                        return Poll::Pending;
                    }
                }
            }
        }
    }

    /// Blocking read for worker threads.
    fn read_blocking(&self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let (outcome, callbacks) = self.take(dst.len());
            Self::run(callbacks);
            match outcome {
                Take::Data(data) => {
                    dst[..data.len()].copy_from_slice(&data);
                    return Ok(data.len());
                }
                Take::Eof => return Ok(0),
                Take::Failed(err) => return Err(err),
                Take::Empty => {
                    let state = self.shared.lock();
                    if state.buf.is_empty() && !state.closed && state.error.is_none() {
                        drop(
                            self.shared
                                .readable
                                .wait(state)
                                .unwrap_or_else(PoisonError::into_inner),
                        );
                    }
                }
            }
        }
    }
}

impl AsyncRead for PipeSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match self.poll_take(cx, buf.remaining()) {
            Poll::Ready(Ok(Some(data))) => {
                buf.put_slice(&data);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl io::Read for PipeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl Stream for PipeSource {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.poll_take(cx, usize::MAX) {
            Poll::Ready(Ok(Some(data))) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        let on_capacity = {
            let mut state = self.shared.lock();
            state.consumer_gone = true;
            state.buf.clear();
            state.on_capacity.take()
        };
        if let Some(cb) = on_capacity {
            cb();
        }
    }
}

/// Bytes buffered but not yet read; used by tests and diagnostics.
pub fn buffered_len(pipe: &Pipe) -> usize {
    pipe.shared.lock().buf.len()
}

/// Frames pulled from a transport but not yet accepted by a [`Pipe`].
///
/// A decoded frame can be larger than the pipe's free space; the remainder
/// waits here until the consumer drains.
#[derive(Debug, Default)]
pub struct Pending {
    chunks: VecDeque<Bytes>,
}

impl Pending {
    /// Queue a chunk for delivery.
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// True when nothing is left to deliver.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Move as many queued bytes as fit into `pipe`.
    pub fn flush_into(&mut self, pipe: &Pipe) -> io::Result<usize> {
        let mut total = 0;
        while let Some(front) = self.chunks.front_mut() {
            let n = pipe.push(front)?;
            if n == 0 {
                break;
            }
            total += n;
            if n == front.len() {
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(n);
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    #[test]
    fn capacity_is_never_exceeded() {
        let pipe = Pipe::with_capacity(8);
        assert_eq!(pipe.push(b"0123456789").unwrap(), 8);
        assert_eq!(buffered_len(&pipe), 8);
        assert!(!pipe.has_available_capacity());
        assert_eq!(pipe.push(b"x").unwrap(), 0);
    }

    #[test]
    fn resume_callback_fires_once_per_cycle() {
        let pipe = Pipe::with_capacity(4);
        let mut source = pipe.source().unwrap();
        let resumed = Arc::new(AtomicUsize::new(0));

        for cycle in 1..=3 {
            assert_eq!(pipe.push(b"abcd").unwrap(), 4);
            assert!(!pipe.has_available_capacity());

            let counter = resumed.clone();
            pipe.on_available_capacity(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(resumed.load(Ordering::SeqCst), cycle - 1);

            let mut buf = [0u8; 1];
            io::Read::read_exact(&mut source, &mut buf).unwrap();
            assert_eq!(resumed.load(Ordering::SeqCst), cycle);

            // Draining further within the same cycle does not fire again.
            let mut rest = [0u8; 3];
            io::Read::read_exact(&mut source, &mut rest).unwrap();
            assert_eq!(resumed.load(Ordering::SeqCst), cycle);
        }
    }

    #[test]
    fn callback_runs_immediately_when_space_exists() {
        let pipe = Pipe::with_capacity(4);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        pipe.on_available_capacity(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn fail_is_sticky() {
        let pipe = Pipe::with_capacity(16);
        let mut source = pipe.source().unwrap();
        pipe.push(b"hello").unwrap();
        pipe.fail(io::Error::new(io::ErrorKind::InvalidData, "digest"));

        let mut buf = [0u8; 8];
        let err = io::Read::read(&mut source, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = pipe.push(b"more").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = io::Read::read(&mut source, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn only_one_consumer() {
        let pipe = Pipe::with_capacity(4);
        assert!(pipe.source().is_some());
        assert!(pipe.source().is_none());
    }

    #[test]
    fn dropped_consumer_breaks_producer() {
        let pipe = Pipe::with_capacity(4);
        let source = pipe.source().unwrap();
        drop(source);
        let err = pipe.push(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn async_consumer_sees_eof_after_close() {
        let pipe = Pipe::with_capacity(4);
        let mut source = pipe.source().unwrap();
        let producer = pipe.clone();

        let task = tokio::spawn(async move {
            let mut data: &[u8] = b"streamed through a tiny pipe";
            while !data.is_empty() {
                if !producer.has_available_capacity() {
                    producer.capacity_available().await;
                    continue;
                }
                let n = producer.push(data).unwrap();
                data = &data[n..];
            }
            producer.close();
        });

        let mut out = String::new();
        AsyncReadExt::read_to_string(&mut source, &mut out).await.unwrap();
        task.await.unwrap();
        assert_eq!(out, "streamed through a tiny pipe");
    }

    #[test]
    fn blocking_consumer_waits_for_producer() {
        let pipe = Pipe::with_capacity(2);
        let mut source = pipe.source().unwrap();
        let producer = pipe.clone();

        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            io::Read::read_to_end(&mut source, &mut out).unwrap();
            out
        });

        let mut data: &[u8] = b"abcdef";
        while !data.is_empty() {
            let n = producer.push(data).unwrap();
            data = &data[n..];
            if n == 0 {
                std::thread::yield_now();
            }
        }
        producer.close();
        assert_eq!(reader.join().unwrap(), b"abcdef");
    }

    #[test]
    fn demand_fires_on_first_read() {
        let pipe = Pipe::with_capacity(4);
        let mut source = pipe.source().unwrap();
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        pipe.on_demand(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(asked.load(Ordering::SeqCst), 0);

        pipe.push(b"ab").unwrap();
        let mut buf = [0u8; 1];
        io::Read::read_exact(&mut source, &mut buf).unwrap();
        io::Read::read_exact(&mut source, &mut buf).unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }
}
