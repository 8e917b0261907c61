//! Payload envelopes sent once per tick.
//!
//! An envelope is the session protocol's request object with its `data`
//! field set to a marker byte followed by random printable bytes. The marker
//! keeps the payload recognizable as a data message -- as opposed to a
//! resize -- after framing.

use std::num::NonZeroU32;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Marks the data field of every envelope as a data message.
pub const DATA_MARKER: char = '#';

pub(crate) const ALPHANUM: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A request written into a reconnecting pseudo-terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyRequest {
    /// Input for the remote terminal
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// New terminal height, if resizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u16>,
    /// New terminal width, if resizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,
}

impl PtyRequest {
    /// Construct a data request carrying `data`.
    #[must_use]
    pub fn data(data: String) -> Self {
        Self {
            data,
            height: None,
            width: None,
        }
    }
}

/// Produce `len` random printable bytes.
///
/// Callers supply the generator; trafficgen always passes one seeded from
/// the operating system.
pub fn random_string<R>(rng: &mut R, len: usize) -> String
where
    R: Rng + ?Sized,
{
    (0..len)
        .map(|_| char::from(ALPHANUM[rng.random_range(0..ALPHANUM.len())]))
        .collect()
}

/// Build one envelope: `size - 1` random bytes behind the data marker,
/// serialized into the wire format.
///
/// # Errors
///
/// Function will return an error if serialization fails.
pub fn envelope<R>(rng: &mut R, size: NonZeroU32) -> Result<Vec<u8>, serde_json::Error>
where
    R: Rng + ?Sized,
{
    let random = (size.get() - 1) as usize;
    let mut data = String::with_capacity(random + 1);
    data.push(DATA_MARKER);
    data.push_str(&random_string(rng, random));

    serde_json::to_vec(&PtyRequest::data(data))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::{ALPHANUM, DATA_MARKER, PtyRequest, envelope, random_string};

    // Every envelope decodes to a data request of exactly the requested size
    // that begins with the marker.
    proptest! {
        #[test]
        fn envelope_shape(seed: u64, size in 1u32..8_192) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let size = NonZeroU32::new(size).expect("size is non-zero");

            let bytes = envelope(&mut rng, size)?;
            let request: PtyRequest = serde_json::from_slice(&bytes)?;

            prop_assert!(request.data.starts_with(DATA_MARKER));
            prop_assert_eq!(request.data.len(), size.get() as usize);
            prop_assert!(request.height.is_none());
            prop_assert!(request.width.is_none());
        }

        #[test]
        fn random_string_is_printable(seed: u64, len in 0usize..4_096) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let s = random_string(&mut rng, len);
            prop_assert_eq!(s.len(), len);
            prop_assert!(s.bytes().all(|b| ALPHANUM.contains(&b)));
        }
    }

    #[test]
    fn single_byte_envelope_is_marker_only() {
        let mut rng = SmallRng::seed_from_u64(0);
        let bytes = envelope(&mut rng, NonZeroU32::MIN).expect("serializes");
        assert_eq!(bytes, br##"{"data":"#"}"##);
    }

    #[test]
    fn resize_request_omits_data() {
        let request = PtyRequest {
            data: String::new(),
            height: Some(24),
            width: Some(80),
        };
        let bytes = serde_json::to_vec(&request).expect("serializes");
        assert_eq!(bytes, br#"{"height":24,"width":80}"#);
    }
}
