//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Invalid rates are
//! rejected here, before any session is opened.
use std::{
    io,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The tick rate was zero.
    #[error("ticks_per_second must not be zero")]
    ZeroTicks,
    /// The run duration was zero.
    #[error("duration_millis must not be zero")]
    ZeroDuration,
    /// Bytes per second divided by ticks per second came to zero.
    #[error("bytes_per_second {bytes_per_second} is less than ticks_per_second {ticks_per_second}")]
    ZeroBytesPerTick {
        /// Configured byte rate
        bytes_per_second: Byte,
        /// Configured tick rate
        ticks_per_second: u32,
    },
    /// The tick rate is finer than the timer can pace.
    #[error("ticks_per_second {0} leaves no time between ticks")]
    TickRateTooHigh(u32),
    /// A derived value does not fit the platform.
    #[error("bytes_per_second {0} exceeds maximum supported value")]
    ValueTooLarge(Byte),
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The remote agent the session is opened against
    pub target_id: Uuid,
    /// Address of the session endpoint, used by the TCP connector
    #[serde(default)]
    pub addr: Option<String>,
    /// How many payloads to send per second
    pub ticks_per_second: u32,
    /// The bytes per second to send to the target, spread across ticks
    pub bytes_per_second: Byte,
    /// Total wall-clock length of the run
    pub duration_millis: u64,
}

/// Run parameters derived from a valid [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// The remote agent the session is opened against
    pub target_id: Uuid,
    /// Time between two payloads
    pub tick_interval: Duration,
    /// Size of one payload's data field, marker included
    pub bytes_per_tick: NonZeroU32,
    /// Total wall-clock length of the run
    pub duration: Duration,
}

impl Config {
    /// Parse a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Function will return an error if the YAML is malformed or carries
    /// unknown fields.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a [`Config`] from a YAML file on disk.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Validate this configuration, deriving the run [`Plan`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the tick rate or duration is zero, if
    /// the tick rate exceeds one tick per nanosecond, or if fewer bytes per
    /// second than ticks per second are requested, leaving no room for a
    /// single byte per tick.
    pub fn plan(&self) -> Result<Plan, Error> {
        let ticks = NonZeroU32::new(self.ticks_per_second).ok_or(Error::ZeroTicks)?;
        let tick_interval = Duration::from_secs(1) / ticks.get();
        if tick_interval.is_zero() {
            return Err(Error::TickRateTooHigh(ticks.get()));
        }
        if self.duration_millis == 0 {
            return Err(Error::ZeroDuration);
        }

        let bytes_per_second = u32::try_from(self.bytes_per_second.as_u64())
            .map_err(|_| Error::ValueTooLarge(self.bytes_per_second))?;
        let bytes_per_tick =
            NonZeroU32::new(bytes_per_second / ticks).ok_or(Error::ZeroBytesPerTick {
                bytes_per_second: self.bytes_per_second,
                ticks_per_second: self.ticks_per_second,
            })?;

        Ok(Plan {
            target_id: self.target_id,
            tick_interval,
            bytes_per_tick,
            duration: Duration::from_millis(self.duration_millis),
        })
    }
}
