//! The paced writer.
//!
//! Once per tick one envelope is built and written into the session stream a
//! single byte at a time, until the scope finishes. Byte-sized writes keep
//! the time between scope checks short and make a write cut off by the
//! deadline observable.

use std::{io, num::NonZeroU32};

use async_trait::async_trait;
use rand::Rng;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{Duration, Instant, Interval, MissedTickBehavior},
};
use tracing::trace;
use trafficgen_signal::{Reason, Watcher};

use crate::payload;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`write_random_data`].
pub enum Error {
    /// The session stream failed for a reason other than ending.
    #[error("write failed after {bytes_sent} bytes of the current payload: {source}")]
    Io {
        /// Bytes of the current payload accepted before the error
        bytes_sent: usize,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The envelope could not be serialized.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
/// The source of ticks pacing the writer.
pub trait Ticker {
    /// Wait for the next tick.
    async fn tick(&mut self);
}

#[async_trait]
impl Ticker for Interval {
    async fn tick(&mut self) {
        Interval::tick(self).await;
    }
}

/// An [`Interval`] whose first tick lands one `period` from now, dropping
/// ticks the writer was too busy to take.
#[must_use]
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Write one random envelope of `bytes_per_tick` data bytes per tick until
/// the scope finishes.
///
/// The stream ending, or the scope finishing mid-payload, stops the writer
/// without error.
///
/// # Errors
///
/// Function will return an error if an envelope cannot be serialized or the
/// stream fails before the scope is finished.
pub async fn write_random_data<W, T, R>(
    mut scope: Watcher,
    dst: &mut W,
    bytes_per_tick: NonZeroU32,
    ticker: &mut T,
    rng: &mut R,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    T: Ticker + Send + ?Sized,
    R: Rng + Send + ?Sized,
{
    loop {
        tokio::select! {
            biased;

            reason = scope.recv() => {
                trace!(?reason, "writer stopping");
                return Ok(());
            }
            () = ticker.tick() => {
                let data = payload::envelope(rng, bytes_per_tick)?;
                match copy_bytes(&scope, dst, &data).await {
                    Ok(Copied::Complete) => {}
                    Ok(Copied::Stopped(sent)) => {
                        trace!(sent, total = data.len(), "payload cut short");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Copied {
    Complete,
    Stopped(usize),
}

/// Copy `src` into `dst` one byte at a time, honoring the scope between and
/// during writes.
async fn copy_bytes<W>(scope: &Watcher, dst: &mut W, src: &[u8]) -> Result<Copied, Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // One wait for the whole payload, polled alongside every byte write.
    let mut watcher = scope.clone();
    let finished = watcher.recv();
    tokio::pin!(finished);

    let mut sent = 0;
    for byte in src.chunks(1) {
        if scope.is_done() {
            return Ok(Copied::Stopped(sent));
        }

        // A write blocked in the stream is abandoned, never half-counted,
        // when the scope finishes.
        let res = tokio::select! {
            biased;

            _ = &mut finished => return Ok(Copied::Stopped(sent)),
            res = dst.write(byte) => res,
        };

        match res {
            Ok(0) => return Ok(Copied::Stopped(sent)),
            Ok(n) => sent += n,
            Err(err) if is_clean_stop(scope, &err) => {
                trace!("write stopped: {err}");
                return Ok(Copied::Stopped(sent));
            }
            Err(source) => {
                return Err(Error::Io {
                    bytes_sent: sent,
                    source,
                });
            }
        }
    }
    Ok(Copied::Complete)
}

/// Whether a write error means the run is over rather than broken.
///
/// The stream having ended and the scope having finished both qualify; any
/// error observed once the scope is finished does too. Everything else,
/// resets included, is fatal.
fn is_clean_stop(scope: &Watcher, err: &io::Error) -> bool {
    if Reason::from_io_error(err).is_some() || scope.is_done() {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        num::NonZeroU32,
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        task::{Context, Poll},
        time::Duration,
    };

    use async_trait::async_trait;
    use rand::{SeedableRng, rngs::SmallRng};
    use tokio::io::{AsyncReadExt, AsyncWrite, duplex};
    use trafficgen_signal::signal;

    use super::{Error, Ticker, ticker, write_random_data};
    use crate::payload::PtyRequest;

    /// Fires a fixed number of ticks, then never again.
    struct Countdown(usize);

    #[async_trait]
    impl Ticker for Countdown {
        async fn tick(&mut self) {
            if self.0 == 0 {
                std::future::pending::<()>().await;
            }
            self.0 -= 1;
        }
    }

    /// Accepts `limit` bytes, then fails every write with `kind`, or blocks
    /// forever if `kind` is `None`.
    struct Faulty {
        accepted: Arc<AtomicUsize>,
        limit: usize,
        kind: Option<io::ErrorKind>,
    }

    impl AsyncWrite for Faulty {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.accepted.load(Ordering::SeqCst) < self.limit {
                self.accepted.fetch_add(buf.len(), Ordering::SeqCst);
                return Poll::Ready(Ok(buf.len()));
            }
            match self.kind {
                Some(kind) => Poll::Ready(Err(io::Error::from(kind))),
                None => Poll::Pending,
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn faulty(limit: usize, kind: Option<io::ErrorKind>) -> (Faulty, Arc<AtomicUsize>) {
        let accepted = Arc::new(AtomicUsize::new(0));
        let dst = Faulty {
            accepted: Arc::clone(&accepted),
            limit,
            kind,
        };
        (dst, accepted)
    }

    #[tokio::test(start_paused = true)]
    async fn writes_one_envelope_per_tick() {
        let (watcher, broadcaster) = signal();
        let (mut local, mut remote) = duplex(1 << 16);
        let mut rng = SmallRng::seed_from_u64(7);
        let size = NonZeroU32::new(32).unwrap();

        let writer = tokio::spawn(async move {
            let mut ticks = Countdown(3);
            write_random_data(watcher, &mut local, size, &mut ticks, &mut rng).await
        });

        // Three envelopes, each a JSON object with a 32 byte data field.
        let envelope_len = br#"{"data":""}"#.len() + 32;
        let mut buf = vec![0u8; 3 * envelope_len];
        remote.read_exact(&mut buf).await.unwrap();
        for chunk in buf.chunks(envelope_len) {
            let request: PtyRequest = serde_json::from_slice(chunk).unwrap();
            assert!(request.data.starts_with('#'));
            assert_eq!(request.data.len(), 32);
        }

        broadcaster.signal();
        assert!(writer.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_writer_between_ticks() {
        let (watcher, _broadcaster) = signal();
        let scoped = watcher.with_deadline(tokio::time::Instant::now() + Duration::from_millis(350));
        let (mut local, _remote) = duplex(1 << 16);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ticks = ticker(Duration::from_millis(100));

        let res = write_random_data(
            scoped,
            &mut local,
            NonZeroU32::new(10).unwrap(),
            &mut ticks,
            &mut rng,
        )
        .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn ended_stream_is_clean_stop() {
        let (watcher, _broadcaster) = signal();
        let (mut dst, accepted) = faulty(5, Some(io::ErrorKind::BrokenPipe));
        let mut rng = SmallRng::seed_from_u64(0);

        let res = write_random_data(
            watcher,
            &mut dst,
            NonZeroU32::new(100).unwrap(),
            &mut Countdown(1),
            &mut rng,
        )
        .await;
        assert!(res.is_ok());
        assert_eq!(accepted.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn reset_before_deadline_is_fatal() {
        let (watcher, _broadcaster) = signal();
        let (mut dst, _accepted) = faulty(5, Some(io::ErrorKind::ConnectionReset));
        let mut rng = SmallRng::seed_from_u64(0);

        let res = write_random_data(
            watcher,
            &mut dst,
            NonZeroU32::new(100).unwrap(),
            &mut Countdown(1),
            &mut rng,
        )
        .await;
        match res {
            Err(Error::Io { bytes_sent, source }) => {
                assert_eq!(bytes_sent, 5);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected fatal write error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_after_cancel_is_clean_stop() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal();
        let (mut dst, _accepted) = faulty(0, Some(io::ErrorKind::ConnectionReset));

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(super::is_clean_stop(&watcher, &err));

        let res = super::copy_bytes(&watcher, &mut dst, b"abc").await;
        assert!(matches!(res, Ok(super::Copied::Stopped(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_write_abandoned_on_cancel() {
        let (watcher, broadcaster) = signal();
        let (mut dst, accepted) = faulty(49, None);
        let mut rng = SmallRng::seed_from_u64(0);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            broadcaster.signal();
        });

        let res = write_random_data(
            watcher,
            &mut dst,
            NonZeroU32::new(100).unwrap(),
            &mut Countdown(1),
            &mut rng,
        )
        .await;
        assert!(res.is_ok());
        assert_eq!(accepted.load(Ordering::SeqCst), 49);
    }
}
