// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::{fmt, str::FromStr, time::Duration};

use crate::error::LoadError;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;
pub const MAX_CHANNELS: u16 = 8;

/// Sample format enumeration for audio processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Integer samples (e.g., 8-bit, 16-bit, 24-bit, 32-bit)
    #[default]
    Int,
    /// Floating point samples (32-bit float)
    Float,
}

impl FromStr for SampleFormat {
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "float" | "Float" => Ok(SampleFormat::Float),
            "int" | "Int" => Ok(SampleFormat::Int),
            _ => Err(format!("Unsupported sample format: {}", s)),
        }
    }

    type Err = String;
}

impl SampleFormat {
    /// Convert to string representation
    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::Float => "float",
            SampleFormat::Int => "int",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Describes the layout of raw interleaved little-endian PCM bytes.
///
/// The default descriptor is all zeros and never valid. Decoders start from
/// it so that a header they couldn't fully parse is caught by [`validate`]
/// instead of flowing downstream as a zero sample rate.
///
/// [`validate`]: PcmDescriptor::validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PcmDescriptor {
    /// Number of interleaved channels.
    pub channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
    /// Bits per single sample.
    pub bits_per_sample: u16,
    /// Bytes per frame as reported by the container.
    pub block_align: u16,
    /// Integer or float samples.
    pub sample_format: SampleFormat,
}

impl PcmDescriptor {
    /// Creates a descriptor, computing the block alignment and checking ranges.
    pub fn new(
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
        sample_format: SampleFormat,
    ) -> Result<PcmDescriptor, LoadError> {
        let descriptor = PcmDescriptor {
            channels,
            sample_rate,
            bits_per_sample,
            block_align: channels.saturating_mul(bits_per_sample / 8),
            sample_format,
        };
        descriptor.check_ranges()?;
        Ok(descriptor)
    }

    /// The block alignment implied by the channel count and bit depth.
    pub fn computed_block_align(&self) -> u16 {
        self.channels.saturating_mul(self.bits_per_sample / 8)
    }

    /// Bytes per single sample.
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes per second of playback.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * usize::from(self.block_align)
    }

    /// The byte value that plays back as silence. 8-bit PCM is unsigned.
    pub fn silence(&self) -> u8 {
        if self.bits_per_sample == 8 {
            0x80
        } else {
            0
        }
    }

    /// Playback length of the given number of PCM bytes.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let byte_rate = self.byte_rate();
        if byte_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / byte_rate as f64)
    }

    /// Number of bytes covering the given duration, rounded down to whole
    /// frames and never smaller than a single frame.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let align = usize::from(self.block_align).max(1);
        let bytes = (self.byte_rate() as u128 * duration.as_nanos() / 1_000_000_000) as usize;
        (bytes - bytes % align).max(align)
    }

    /// Checks every field and that the block alignment evenly divides `len`.
    pub fn validate(&self, len: usize) -> Result<(), LoadError> {
        self.check_ranges()?;
        if self.block_align != self.computed_block_align() {
            return Err(LoadError::UnsupportedFormat(format!(
                "block alignment {} doesn't match {} channels of {} bits",
                self.block_align, self.channels, self.bits_per_sample
            )));
        }
        if len == 0 {
            return Err(LoadError::UnsupportedFormat(
                "no audio data found".to_string(),
            ));
        }
        if len % usize::from(self.block_align) != 0 {
            return Err(LoadError::UnsupportedFormat(format!(
                "{} bytes of audio data is not a multiple of the {} byte block alignment",
                len, self.block_align
            )));
        }
        Ok(())
    }

    fn check_ranges(&self) -> Result<(), LoadError> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(LoadError::UnsupportedFormat(format!(
                "{} channels (expected 1-{})",
                self.channels, MAX_CHANNELS
            )));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(LoadError::UnsupportedFormat(format!(
                "sample rate of {}Hz (expected {}-{}Hz)",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(LoadError::UnsupportedFormat(format!(
                "{} bits per sample",
                self.bits_per_sample
            )));
        }
        if self.sample_format == SampleFormat::Float && self.bits_per_sample != 32 {
            return Err(LoadError::UnsupportedFormat(format!(
                "{}-bit float samples",
                self.bits_per_sample
            )));
        }
        Ok(())
    }

    /// Converts one encoded sample to a float in [-1.0, 1.0].
    /// `bytes` must be exactly `bytes_per_sample()` long.
    pub fn decode_sample(&self, bytes: &[u8]) -> f32 {
        match (self.sample_format, bytes) {
            (SampleFormat::Float, &[a, b, c, d]) => f32::from_le_bytes([a, b, c, d]),
            (SampleFormat::Int, &[a]) => (f32::from(a) - 128.0) / 128.0,
            (SampleFormat::Int, &[a, b]) => f32::from(i16::from_le_bytes([a, b])) / 32_768.0,
            (SampleFormat::Int, &[a, b, c]) => {
                // Sign extend through the top byte of an i32.
                let value = i32::from_le_bytes([0, a, b, c]) >> 8;
                value as f32 / 8_388_608.0
            }
            (SampleFormat::Int, &[a, b, c, d]) => {
                i32::from_le_bytes([a, b, c, d]) as f32 / 2_147_483_648.0
            }
            _ => 0.0,
        }
    }
}

impl fmt::Display for PcmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz, {} channel(s), {}-bit {}",
            self.sample_rate, self.channels, self.bits_per_sample, self.sample_format
        )
    }
}
