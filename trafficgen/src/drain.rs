//! The drain reader.
//!
//! Whatever the remote side sends is read a byte at a time and thrown away.
//! Reads happen on a detached task reporting each outcome to a coordinating
//! loop; when the scope finishes the coordinator stops listening and returns
//! at once. A read blocked on a silent remote cannot hold up the deadline.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};
use tracing::trace;
use trafficgen_signal::{Reason, Watcher, signal};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`drain`].
pub enum Error {
    /// The session stream failed for a reason other than ending.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Drain `src` until it ends or the scope finishes.
///
/// Received bytes are accumulated into a buffer of `buffer_size` bytes,
/// which is discarded each time it fills. The reading task is not joined on
/// return; it exits once it observes the stop signal or its read completes.
///
/// # Errors
///
/// Function will return an error if a read fails for any reason other than
/// the stream ending or the scope finishing.
pub async fn drain<R>(mut scope: Watcher, src: R, buffer_size: usize) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (outcome_snd, mut outcome_rcv) = mpsc::channel(1);
    let (done_watcher, done) = signal();
    tokio::spawn(read_bytes(src, buffer_size, outcome_snd, done_watcher));

    let finished = scope.recv();
    tokio::pin!(finished);
    loop {
        tokio::select! {
            biased;

            reason = &mut finished => {
                trace!(?reason, "drain stopping");
                done.signal();
                return Ok(());
            }
            outcome = outcome_rcv.recv() => {
                match outcome {
                    Some(Ok(0)) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) if is_clean_end(&err) => return Ok(()),
                    Some(Err(err)) => return Err(Error::Io(err)),
                }
            }
        }
    }
}

/// Read `src` a byte at a time, reporting each outcome. Stops after the first
/// end-of-stream or error, when `done` fires, or when nobody is listening.
async fn read_bytes<R>(
    mut src: R,
    buffer_size: usize,
    outcomes: mpsc::Sender<io::Result<usize>>,
    mut done: Watcher,
) where
    R: AsyncRead + Unpin,
{
    let capacity = buffer_size.max(1);
    let mut buf = BytesMut::with_capacity(capacity);
    let mut byte = [0u8; 1];

    let stop = done.recv();
    tokio::pin!(stop);
    loop {
        let res = tokio::select! {
            biased;

            _ = &mut stop => return,
            res = src.read(&mut byte) => res,
        };

        let last = !matches!(res, Ok(n) if n > 0);
        if let Ok(n) = res {
            if buf.len() + n > capacity {
                buf.clear();
            }
            buf.put_slice(&byte[..n]);
        }

        if outcomes.send(res).await.is_err() || last {
            return;
        }
    }
}

fn is_clean_end(err: &io::Error) -> bool {
    Reason::from_io_error(err).is_some() || err.kind() == io::ErrorKind::UnexpectedEof
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf, duplex};
    use trafficgen_signal::{Reason, signal};

    use super::{Error, drain};

    /// Yields `data`, then fails with `kind`.
    struct Failing {
        data: &'static [u8],
        kind: io::ErrorKind,
    }

    impl AsyncRead for Failing {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let data = self.data;
            if let Some((first, rest)) = data.split_first() {
                buf.put_slice(&[*first]);
                self.data = rest;
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(io::Error::from(self.kind)))
        }
    }

    #[tokio::test]
    async fn remote_close_ends_drain() {
        let (watcher, _broadcaster) = signal();
        let (local, mut remote) = duplex(64);

        remote.write_all(b"some output").await.unwrap();
        drop(remote);

        assert!(drain(watcher, local, 8).await.is_ok());
    }

    #[tokio::test]
    async fn read_error_is_fatal() {
        let (watcher, _broadcaster) = signal();
        let src = Failing {
            data: b"abc",
            kind: io::ErrorKind::ConnectionReset,
        };

        match drain(watcher, src, 2).await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scope_error_is_clean() {
        let (watcher, _broadcaster) = signal();
        let src = Failing {
            data: b"",
            kind: io::ErrorKind::UnexpectedEof,
        };
        assert!(drain(watcher, src, 2).await.is_ok());

        let (watcher, _broadcaster) = signal();
        struct Expired;
        impl AsyncRead for Expired {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(Reason::DeadlineExceeded.into()))
            }
        }
        assert!(drain(watcher, Expired, 2).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_remote_abandoned_at_deadline() {
        let (watcher, _broadcaster) = signal();
        let start = tokio::time::Instant::now();
        let scoped = watcher.with_deadline(start + Duration::from_millis(500));
        // The remote half stays open and never writes.
        let (local, _remote) = duplex(64);

        assert!(drain(scoped, local, 8).await.is_ok());
        let elapsed = tokio::time::Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn caller_cancel_stops_drain() {
        let (watcher, broadcaster) = signal();
        let (local, mut remote) = duplex(64);

        let handle = tokio::spawn(drain(watcher, local, 8));
        remote.write_all(b"xyz").await.unwrap();
        broadcaster.signal();

        assert!(handle.await.unwrap().is_ok());
        // The reading task let go of the stream once told to stop.
        tokio::time::timeout(Duration::from_secs(5), async {
            while remote.write_all(b"x").await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("local half was never dropped");
    }
}
