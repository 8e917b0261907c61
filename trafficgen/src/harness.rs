//! The contract between a runner and whatever schedules it.
//!
//! A scheduling harness holds many runners at once and drives each through
//! [`Runnable::run`], then [`Cleanable::cleanup`]. The `label` distinguishes
//! runs in logs and metrics.

use async_trait::async_trait;
use trafficgen_signal::Watcher;

use crate::{
    runner::{Error, Report, Runner},
    session::Connector,
};

#[async_trait]
/// Something a harness can run.
pub trait Runnable {
    /// Run to completion or until `scope` finishes.
    async fn run(&self, scope: Watcher, label: &str) -> Result<Report, Error>;
}

#[async_trait]
/// Something a harness tidies up after running.
pub trait Cleanable {
    /// Release whatever the run left behind.
    async fn cleanup(&self, label: &str) -> Result<(), Error>;
}

#[async_trait]
impl<C> Runnable for Runner<C>
where
    C: Connector + Send + Sync,
{
    async fn run(&self, scope: Watcher, label: &str) -> Result<Report, Error> {
        Runner::run(self, scope, label).await
    }
}

#[async_trait]
impl<C> Cleanable for Runner<C>
where
    C: Connector + Send + Sync,
{
    // Every run closes its own session.
    async fn cleanup(&self, _label: &str) -> Result<(), Error> {
        Ok(())
    }
}
