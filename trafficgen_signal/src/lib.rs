//! Cancellation scopes for trafficgen.
//!
//! A run of trafficgen is bounded twice over: by its caller, which may give
//! up at any time, and by a wall-clock deadline fixed when the run starts.
//! Both are expressed here as a single mechanism with two components, a
//! `Broadcaster` and a `Watcher`. The `Broadcaster` signals every `Watcher`
//! derived from it that the scope is finished. A `Watcher` may additionally
//! be bound to an absolute deadline, after which it considers the scope
//! finished whether or not the `Broadcaster` has spoken.
//!
//! Each scope has one `Broadcaster` and potentially many `Watcher` instances.
//! Once a `Watcher` observes the scope as finished it does so forever.

use std::{
    future::{self, Future},
    io,
    pin::Pin,
    task::Poll,
};

use tokio::{
    sync::watch,
    time::{self, Instant},
};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // NOTE the channel never carries a value. Closing it -- by dropping the
    // sender -- is the signal, which means a `Broadcaster` lost to a panic
    // still releases its watchers.
    let (sender, receiver) = watch::channel(());

    let w = Watcher {
        receivers: vec![receiver],
        deadline: None,
    };
    let b = Broadcaster { sender };

    (w, b)
}

/// Why a scope finished.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The `Broadcaster` signaled, or was dropped.
    #[error("scope canceled")]
    Canceled,
    /// The deadline bound to the `Watcher` passed.
    #[error("scope deadline exceeded")]
    DeadlineExceeded,
}

impl Reason {
    /// Recover the `Reason` carried by an `io::Error` built from one, if any.
    #[must_use]
    pub fn from_io_error(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<Reason>())
            .copied()
    }
}

impl From<Reason> for io::Error {
    fn from(reason: Reason) -> Self {
        let kind = match reason {
            Reason::Canceled => io::ErrorKind::Interrupted,
            Reason::DeadlineExceeded => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, reason)
    }
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that the scope is
/// finished.
pub struct Broadcaster {
    /// Transmission point for the signal to `Watcher` instances. Never sent
    /// on, only dropped.
    sender: watch::Sender<()>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until peers have observed the signal.
    pub fn signal(self) {
        drop(self.sender);
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for the end of a scope.
pub struct Watcher {
    /// One receiver per `Broadcaster` this instance answers to: its own,
    /// then those of the scopes it was derived from. Any one closing
    /// finishes the scope.
    receivers: Vec<watch::Receiver<()>>,
    /// Absolute time after which the scope is finished, if bound.
    deadline: Option<Instant>,
}

impl Watcher {
    /// Derive a `Watcher` that additionally finishes at `deadline`.
    ///
    /// The derived instance still observes the `Broadcaster` of `self`. If
    /// `self` already carries an earlier deadline that one is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            receivers: self.receivers.clone(),
            deadline: Some(deadline),
        }
    }

    /// Derive a `Watcher` with a `Broadcaster` of its own.
    ///
    /// The derived instance finishes when either its own `Broadcaster` or
    /// that of `self` signals, and keeps any deadline of `self`. Signaling
    /// the returned `Broadcaster` leaves `self` untouched.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, Broadcaster) {
        let (child, broadcaster) = signal();
        let mut receivers = child.receivers;
        receivers.extend(self.receivers.iter().cloned());

        let w = Self {
            receivers,
            deadline: self.deadline,
        };
        (w, broadcaster)
    }

    /// The deadline bound to this instance, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if the scope is finished without blocking.
    ///
    /// Returns `None` while the scope is live. Cancellation by the
    /// `Broadcaster` takes precedence over an expired deadline.
    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        if self.receivers.iter().any(|r| r.has_changed().is_err()) {
            return Some(Reason::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Reason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Check if the scope is finished without blocking.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait for the scope to finish, returning why.
    ///
    /// If the scope is already finished this function returns immediately.
    /// Safe to use as a `select!` branch: dropping the returned future loses
    /// nothing.
    pub async fn recv(&mut self) -> Reason {
        if let Some(reason) = self.reason() {
            return reason;
        }

        let mut waits: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = self
            .receivers
            .iter_mut()
            .map(|receiver| {
                Box::pin(async move {
                    // `changed` only errors once the sender is gone, and
                    // nothing is ever sent, so this loop runs exactly once in
                    // practice.
                    while receiver.changed().await.is_ok() {}
                }) as Pin<Box<dyn Future<Output = ()> + Send + '_>>
            })
            .collect();
        let closed = future::poll_fn(move |cx| {
            for wait in &mut waits {
                if wait.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        });

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;

                    () = closed => Reason::Canceled,
                    () = time::sleep_until(deadline) => Reason::DeadlineExceeded,
                }
            }
            None => {
                closed.await;
                Reason::Canceled
            }
        }
    }
}
