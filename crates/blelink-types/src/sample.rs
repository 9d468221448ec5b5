//! Fixed-size sample windows read from a sensor characteristic.

use core::fmt;

use crate::error::ParseError;

/// Number of samples in one window.
pub const SAMPLES_PER_WINDOW: usize = 64;

/// Exact payload size of one window on the wire (64 x u16).
pub const SAMPLE_PAYLOAD_LEN: usize = SAMPLES_PER_WINDOW * 2;

/// One reading of a device's rolling sample buffer.
///
/// A window is always exactly [`SAMPLES_PER_WINDOW`] unsigned 16-bit values,
/// ordered as they appeared on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleWindow([u16; SAMPLES_PER_WINDOW]);

impl SampleWindow {
    /// Decode a window from a raw characteristic payload.
    ///
    /// The byte format is 64 consecutive little-endian `u16` values.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidLength`] unless `data` is exactly
    /// [`SAMPLE_PAYLOAD_LEN`] (128) bytes long. Shorter and longer payloads
    /// are both rejected.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        use bytes::Buf;

        if data.len() != SAMPLE_PAYLOAD_LEN {
            return Err(ParseError::InvalidLength {
                expected: SAMPLE_PAYLOAD_LEN,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let mut samples = [0u16; SAMPLES_PER_WINDOW];
        for sample in &mut samples {
            *sample = buf.get_u16_le();
        }

        Ok(Self(samples))
    }

    /// Encode the window back into its 128-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        use bytes::BufMut;

        let mut out = Vec::with_capacity(SAMPLE_PAYLOAD_LEN);
        for sample in &self.0 {
            out.put_u16_le(*sample);
        }
        out
    }

    /// The samples as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }

    /// Copy the samples into a new vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u16> {
        self.0.to_vec()
    }

    /// Number of samples (always [`SAMPLES_PER_WINDOW`]).
    #[must_use]
    pub const fn len(&self) -> usize {
        SAMPLES_PER_WINDOW
    }

    /// Always `false`; present for API symmetry with slices.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl From<[u16; SAMPLES_PER_WINDOW]> for SampleWindow {
    fn from(samples: [u16; SAMPLES_PER_WINDOW]) -> Self {
        Self(samples)
    }
}

impl TryFrom<&[u16]> for SampleWindow {
    type Error = ParseError;

    fn try_from(samples: &[u16]) -> Result<Self, Self::Error> {
        let array: [u16; SAMPLES_PER_WINDOW] =
            samples.try_into().map_err(|_| ParseError::InvalidLength {
                expected: SAMPLES_PER_WINDOW,
                actual: samples.len(),
            })?;
        Ok(Self(array))
    }
}

impl AsRef<[u16]> for SampleWindow {
    fn as_ref(&self) -> &[u16] {
        &self.0
    }
}

impl fmt::Debug for SampleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 64 values per line is noise in logs; show the edges only.
        f.debug_struct("SampleWindow")
            .field("first", &self.0[0])
            .field("last", &self.0[SAMPLES_PER_WINDOW - 1])
            .finish_non_exhaustive()
    }
}
