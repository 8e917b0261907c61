//! Byte accounting for the session stream.
//!
//! [`Meter`] wraps the session stream and is otherwise transparent: reads
//! and writes are delegated untouched. Bytes that actually crossed the
//! stream are counted, each direction independently.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes accepted by the session stream
//! `bytes_read`: Bytes received from the session stream
//!

use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use metrics::{Counter, counter};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use trafficgen_signal::Watcher;

#[derive(Debug, Default)]
/// Totals of bytes moved through a [`Meter`].
///
/// Each counter has exactly one incrementing task, the reader or the writer,
/// and any number of observers.
pub struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Counters {
    /// Bytes successfully read so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Bytes successfully written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }
}

/// A counting wrapper around a duplex stream.
///
/// Once the bound scope is finished every poll fails immediately with the
/// scope's [`trafficgen_signal::Reason`], never touching the inner stream.
pub struct Meter<S> {
    inner: S,
    scope: Watcher,
    counters: Arc<Counters>,
    read_counter: Counter,
    write_counter: Counter,
}

impl<S> Meter<S> {
    /// Wrap `inner`, failing fast once `scope` is finished.
    pub fn new(inner: S, scope: Watcher, metric_labels: Vec<(String, String)>) -> Self {
        Self {
            inner,
            scope,
            counters: Arc::new(Counters::default()),
            read_counter: counter!("bytes_read", &metric_labels),
            write_counter: counter!("bytes_written", &metric_labels),
        }
    }

    /// A shared handle on this meter's totals, valid after the meter drops.
    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    #[cfg(test)]
    fn into_inner(self) -> S {
        self.inner
    }

    fn check_scope(&self) -> io::Result<()> {
        match self.scope.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }
}

impl<S> fmt::Debug for Meter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("scope", &self.scope)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl<S> AsyncRead for Meter<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_scope()?;

        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = (buf.filled().len() - before) as u64;
            this.counters.bytes_read.fetch_add(n, Ordering::AcqRel);
            this.read_counter.increment(n);
        }
        res
    }
}

impl<S> AsyncWrite for Meter<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_scope()?;

        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            let n = n as u64;
            this.counters.bytes_written.fetch_add(n, Ordering::AcqRel);
            this.write_counter.increment(n);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_scope()?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    // Shutdown closes the stream and must work after the scope is done.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
