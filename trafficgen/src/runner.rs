//! The session runner.
//!
//! A [`Runner`] owns one session from open to close. It opens the session,
//! bounds the run by a deadline, and drives the paced writer and drain
//! reader concurrently against the metered stream. Once both have finished
//! it closes the stream and reports what crossed it.
//!
//! ## Metrics
//!
//! `runs`: Runs started
//! `connection_failure`: Sessions that could not be opened
//!
//! Additional metrics are emitted by the [`crate::meter`].
//!

use std::{io, time::Duration};

use metrics::counter;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{io::AsyncWriteExt, task::JoinError, time::Instant};
use tracing::{Instrument, debug, error, info, info_span};
use trafficgen_signal::Watcher;
use uuid::Uuid;

use crate::{
    config::{self, Config, Plan},
    drain,
    meter::Meter,
    session::{Connector, OpenRequest},
    writer,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Runner`].
pub enum Error {
    /// The configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// The session could not be opened.
    #[error("Failed to connect to agent {target_id}: {source}")]
    Connect {
        /// Target agent
        target_id: Uuid,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The writer failed.
    #[error("Write to stream for agent {target_id} failed: {source}")]
    Write {
        /// Target agent
        target_id: Uuid,
        /// Underlying writer error
        #[source]
        source: writer::Error,
    },
    /// The reader failed.
    #[error("Read from stream for agent {target_id} failed: {source}")]
    Read {
        /// Target agent
        target_id: Uuid,
        /// Underlying drain error
        #[source]
        source: drain::Error,
    },
    /// Child sub-task error.
    #[error("Child join error: {0}")]
    Child(JoinError),
}

/// What a completed run moved across its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Wall-clock time from session open to close
    pub elapsed: Duration,
    /// Bytes accepted by the session stream
    pub bytes_written: u64,
    /// Bytes received from the session stream
    pub bytes_read: u64,
}

#[derive(Debug)]
/// Drives synthetic traffic through one session.
pub struct Runner<C> {
    connector: C,
    plan: Plan,
}

impl<C> Runner<C>
where
    C: Connector + Send + Sync,
{
    /// Create a new [`Runner`], validating `config`.
    ///
    /// # Errors
    ///
    /// Function will return an error if `config` is invalid. No session is
    /// opened.
    pub fn new(connector: C, config: &Config) -> Result<Self, Error> {
        let plan = config.plan()?;
        Ok(Self::with_plan(connector, plan))
    }

    /// Create a new [`Runner`] from an already validated [`Plan`].
    #[must_use]
    pub fn with_plan(connector: C, plan: Plan) -> Self {
        Self { connector, plan }
    }

    /// Run one session to completion.
    ///
    /// The run ends when the configured duration elapses, when `scope`
    /// finishes, or when the remote side closes the stream. None of these is
    /// an error.
    ///
    /// # Errors
    ///
    /// Function will return an error if the session cannot be opened or if
    /// writing or reading fails. A write failure takes precedence over a read
    /// failure.
    pub async fn run(&self, scope: Watcher, label: &str) -> Result<Report, Error> {
        let span = info_span!("trafficgen", label, target_id = %self.plan.target_id);
        self.spin(scope, label).instrument(span).await
    }

    async fn spin(&self, scope: Watcher, label: &str) -> Result<Report, Error> {
        let Plan {
            target_id,
            tick_interval,
            bytes_per_tick,
            duration,
        } = self.plan;
        let metric_labels = vec![
            ("component".to_string(), "trafficgen".to_string()),
            ("label".to_string(), label.to_string()),
        ];
        counter!("runs", &metric_labels).increment(1);

        let request = OpenRequest::new(target_id);
        debug!(reconnect = %request.reconnect, "connect to agent");
        let stream = match self.connector.open(&request).await {
            Ok(stream) => stream,
            Err(source) => {
                error!("connect to agent failed: {source}");
                counter!("connection_failure", &metric_labels).increment(1);
                return Err(Error::Connect {
                    target_id,
                    source: Box::new(source),
                });
            }
        };

        // Dropping `stop` on any path below finishes the scope for both
        // tasks.
        let start = Instant::now();
        let (scope, stop) = scope.with_deadline(start + duration).with_cancel();

        let meter = Meter::new(stream, scope.clone(), metric_labels);
        let counters = meter.counters();
        let (rd, mut wr) = tokio::io::split(meter);

        let mut deadline_watch = scope.clone();
        tokio::spawn(
            async move {
                let reason = deadline_watch.recv().await;
                debug!(?reason, elapsed = ?start.elapsed(), "scope finished");
            }
            .in_current_span(),
        );

        // The writer also stops once the reader is done with the stream. A
        // failed read hands `end_of_stream` back unsignaled so the writer
        // runs on until the scope finishes.
        let (writer_scope, end_of_stream) = scope.with_cancel();
        let reader_scope = scope;
        let buffer_size = bytes_per_tick.get() as usize * 2;
        let reader = tokio::spawn(
            async move {
                debug!("reading from agent");
                let res = drain::drain(reader_scope, rd, buffer_size).await;
                debug!("done reading from agent");
                match res {
                    Ok(()) => {
                        end_of_stream.signal();
                        (Ok(()), None)
                    }
                    Err(err) => (Err(err), Some(end_of_stream)),
                }
            }
            .in_current_span(),
        );

        let mut ticker = writer::ticker(tick_interval);
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let writer = tokio::spawn(
            async move {
                debug!("writing to agent");
                let res = writer::write_random_data(
                    writer_scope,
                    &mut wr,
                    bytes_per_tick,
                    &mut ticker,
                    &mut rng,
                )
                .await;
                debug!("done writing to agent");
                (wr, res)
            }
            .in_current_span(),
        );

        // Writer first, then reader, so a write error always wins.
        let (mut wr, write_res) = writer.await.map_err(Error::Child)?;
        let read_res = if write_res.is_ok() {
            let res = reader.await;
            stop.signal();
            res
        } else {
            stop.signal();
            reader.await
        };

        debug!("close agent connection");
        if let Err(err) = wr.shutdown().await {
            debug!("close agent connection failed: {err}");
        }
        drop(wr);

        let elapsed = start.elapsed();
        write_res.map_err(|source| Error::Write { target_id, source })?;
        let (read_res, _end_of_stream) = read_res.map_err(Error::Child)?;
        read_res.map_err(|source| Error::Read { target_id, source })?;

        let report = Report {
            elapsed,
            bytes_written: counters.bytes_written(),
            bytes_read: counters.bytes_read(),
        };
        info!(
            duration = ?report.elapsed,
            sent = report.bytes_written,
            rcvd = report.bytes_read,
            "results"
        );
        Ok(report)
    }
}
