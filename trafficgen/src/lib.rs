//! The trafficgen synthetic session traffic generator.
//!
//! This library supports the trafficgen binary found elsewhere in this
//! project. A run opens one interactive session against a remote agent,
//! writes random payloads into it at a fixed byte rate while draining
//! whatever comes back, and reports the bytes that crossed the session once
//! its duration is up.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod drain;
pub mod harness;
pub mod meter;
pub mod payload;
pub mod runner;
pub mod session;
pub mod writer;
