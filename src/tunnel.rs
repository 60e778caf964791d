//! Bidirectional tunnel: splices two byte streams together once a protocol
//! handler has decided where the connection's other end lives.
//!
//! Splices two byte streams with two concurrent copy tasks. Each task
//! half-closes its destination on a clean source EOF so the peer observes
//! FIN. The join rule is "first-error-wins, EOF-tolerated": if the first
//! direction to finish reports a genuine I/O error, that error wins (the
//! other direction is still awaited so its task isn't leaked); if it
//! reports a clean EOF, we wait for the second direction and only fail if
//! *that* one errored.
//!
//! `tokio::io::copy_bidirectional` copies both directions under one future
//! and doesn't expose per-direction EOF ordering, so this uses two spawned
//! tasks joined by hand instead.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Any owned, erasable duplex byte stream a protocol handler can hand off
/// to the tunnel once it has decided where the other end of the
/// connection lives.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Connection for T {}

enum Direction {
    Forward,
    Reverse,
}

/// Splice `a` and `b`. Returns `Ok(())` once both directions have reached
/// a clean EOF, or the first genuine I/O error observed (after draining
/// the other direction's task).
pub async fn splice<A, B>(a: A, b: B) -> Result<()>
where
    A: Connection + 'static,
    B: Connection + 'static,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let forward = tokio::spawn(async move {
        let res = tokio::io::copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
        res
    });
    let reverse = tokio::spawn(async move {
        let res = tokio::io::copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
        res
    });

    tokio::pin!(forward);
    tokio::pin!(reverse);

    let (first, which) = tokio::select! {
        res = &mut forward => (res, Direction::Forward),
        res = &mut reverse => (res, Direction::Reverse),
    };
    let first = first.context("tunnel task panicked")?;

    match first {
        Err(e) => {
            // Drain the other direction so its task isn't leaked, but the
            // first non-EOF error is what we report.
            let _ = match which {
                Direction::Forward => reverse.await,
                Direction::Reverse => forward.await,
            };
            Err(e).context("tunnel io error")
        }
        Ok(_eof) => {
            let second = match which {
                Direction::Forward => reverse.await,
                Direction::Reverse => forward.await,
            }
            .context("tunnel task panicked")?;
            second.map(|_| ()).context("tunnel io error")
        }
    }
}
