//! Peekable stream adapter: lets the dispatcher sniff a connection's first
//! bytes without consuming them.
//!
//! Wraps a byte-stream connection with a `Recording`/`Replaying` mode
//! switch: while `Recording`, every byte read from the underlying stream
//! is both handed to the caller and appended to a replay buffer; once
//! switched to `Replaying`, reads drain that buffer first and only then
//! fall through to fresh underlying reads.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Recording,
    Replaying,
}

/// Adapter over any duplex byte stream, allowing a bounded prefix to be
/// consumed once, inspected by the dispatcher, then replayed to whichever
/// protocol parser is chosen.
pub struct PeekableStream<S> {
    inner: S,
    mode: Mode,
    replay: VecDeque<u8>,
}

impl<S> PeekableStream<S> {
    /// Starts in `Recording` mode, matching the dispatcher's single
    /// record-then-replay cycle per connection.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            mode: Mode::Recording,
            replay: VecDeque::new(),
        }
    }

    pub fn start_recording(&mut self) {
        self.mode = Mode::Recording;
    }

    /// Does not clear the buffer — subsequent reads replay it before
    /// falling through to the underlying stream.
    pub fn stop_recording(&mut self) {
        self.mode = Mode::Replaying;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> PeekableStream<S> {
    /// Half-close the write side if the underlying stream supports it;
    /// `AsyncWriteExt::shutdown` is a safe no-op otherwise.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Recording => {
                let before = buf.filled().len();
                let res = Pin::new(&mut this.inner).poll_read(cx, buf);
                if let Poll::Ready(Ok(())) = &res {
                    this.replay.extend(buf.filled()[before..].iter().copied());
                }
                res
            }
            Mode::Replaying => {
                let served_from_replay = !this.replay.is_empty();
                if served_from_replay {
                    let n = this.replay.len().min(buf.remaining());
                    let chunk: Vec<u8> = this.replay.drain(..n).collect();
                    buf.put_slice(&chunk);
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                let res = Pin::new(&mut this.inner).poll_read(cx, buf);
                if served_from_replay && res.is_pending() {
                    // Bytes already copied into `buf` from the replay
                    // buffer can't be un-served once the caller's future
                    // is polled again with a fresh `ReadBuf`, so this call
                    // must report them as `Ready` now rather than losing
                    // them behind a `Pending` from the inner stream.
                    return Poll::Ready(Ok(()));
                }
                res
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
