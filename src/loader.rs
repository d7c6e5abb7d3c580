// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
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

//! Reads audio files into memory and decodes them into raw PCM.

use std::{
    fs::File,
    io::{self, Cursor, Read},
    path::Path,
    sync::Arc,
};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F64BE, CODEC_TYPE_PCM_F64LE,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info, span, Level};

use crate::audio::{PcmDescriptor, SampleFormat};
use crate::buffer::{AudioBuffer, LoadedAudio};
use crate::error::{LoadError, PlayerError, StateError};

/// Growable PCM output that never aborts on allocation failure.
#[derive(Default)]
pub struct PcmSink {
    data: Vec<u8>,
}

impl PcmSink {
    /// Reserves room for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) -> Result<(), LoadError> {
        self.data
            .try_reserve_exact(additional)
            .map_err(|_| {
                LoadError::AllocationFailed(self.data.len().saturating_add(additional))
            })
    }

    /// Appends bytes, growing the allocation as needed.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        if self.data.capacity() - self.data.len() < bytes.len() {
            let grow = bytes.len().max(self.data.len() / 2);
            self.data
                .try_reserve(grow)
                .map_err(|_| LoadError::AllocationFailed(self.data.len() + grow))?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Turns the raw bytes of a file into interleaved little-endian PCM.
pub trait Decoder: Send + Sync {
    /// Fills in `descriptor` and appends PCM bytes to `sink`. The descriptor
    /// starts zeroed and is validated by the caller afterwards.
    fn decode(
        &self,
        file: Vec<u8>,
        extension: Option<&str>,
        descriptor: &mut PcmDescriptor,
        sink: &mut PcmSink,
    ) -> Result<(), LoadError>;
}

/// Decodes anything symphonia can probe, keeping the file's native bit depth.
#[derive(Default)]
pub struct SymphoniaDecoder;

fn native_bits(bits: Option<u32>) -> u16 {
    match bits.unwrap_or(16) {
        0..=8 => 8,
        9..=16 => 16,
        17..=24 => 24,
        _ => 32,
    }
}

/// Encodes one full-scale i32 sample at the given width.
fn encode_int(sample: i32, bits: u16, out: &mut Vec<u8>) {
    match bits {
        8 => out.push(((sample >> 24) + 128) as u8),
        16 => out.extend_from_slice(&((sample >> 16) as i16).to_le_bytes()),
        24 => out.extend_from_slice(&(sample >> 8).to_le_bytes()[..3]),
        _ => out.extend_from_slice(&sample.to_le_bytes()),
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(
        &self,
        file: Vec<u8>,
        extension: Option<&str>,
        descriptor: &mut PcmDescriptor,
        sink: &mut PcmSink,
    ) -> Result<(), LoadError> {
        let unsupported = |e: SymphoniaError| LoadError::UnsupportedFormat(e.to_string());

        let mss = MediaSourceStream::new(Box::new(Cursor::new(file)), Default::default());
        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(unsupported)?;
        let mut reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| LoadError::UnsupportedFormat("no audio track found".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let float = params.codec == CODEC_TYPE_PCM_F32LE
            || params.codec == CODEC_TYPE_PCM_F32BE
            || params.codec == CODEC_TYPE_PCM_F64LE
            || params.codec == CODEC_TYPE_PCM_F64BE;
        descriptor.sample_format = if float {
            SampleFormat::Float
        } else {
            SampleFormat::Int
        };
        descriptor.bits_per_sample = if float {
            32
        } else {
            native_bits(params.bits_per_sample)
        };
        descriptor.sample_rate = params.sample_rate.unwrap_or(0);
        descriptor.channels = params.channels.map_or(0, |c| c.count() as u16);
        descriptor.block_align = descriptor.computed_block_align();

        if let Some(frames) = params.n_frames {
            let expected = (frames as usize).saturating_mul(usize::from(descriptor.block_align));
            sink.reserve(expected)?;
        }

        let mut decoder = get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(unsupported)?;

        let mut ints: Option<SampleBuffer<i32>> = None;
        let mut floats: Option<SampleBuffer<f32>> = None;
        let mut encoded: Vec<u8> = Vec::new();
        loop {
            let packet = match reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    break
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => return Err(unsupported(e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!(err = e, "Skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(unsupported(e)),
            };

            // Containers don't always carry the layout up front.
            let spec = *decoded.spec();
            if descriptor.channels == 0 {
                descriptor.channels = spec.channels.count() as u16;
                descriptor.block_align = descriptor.computed_block_align();
            }
            if descriptor.sample_rate == 0 {
                descriptor.sample_rate = spec.rate;
            }

            encoded.clear();
            if float {
                let buffer = floats.get_or_insert_with(|| {
                    SampleBuffer::new(decoded.capacity() as u64, spec)
                });
                buffer.copy_interleaved_ref(decoded);
                for sample in buffer.samples() {
                    encoded.extend_from_slice(&sample.to_le_bytes());
                }
            } else {
                let buffer =
                    ints.get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
                buffer.copy_interleaved_ref(decoded);
                for sample in buffer.samples() {
                    encode_int(*sample, descriptor.bits_per_sample, &mut encoded);
                }
            }
            sink.extend(&encoded)?;
        }

        Ok(())
    }
}

/// Loads whole files into memory and decodes them.
#[derive(Clone)]
pub struct FileLoader {
    decoder: Arc<dyn Decoder>,
}

impl Default for FileLoader {
    fn default() -> Self {
        FileLoader::new(Arc::new(SymphoniaDecoder))
    }
}

impl FileLoader {
    pub fn new(decoder: Arc<dyn Decoder>) -> FileLoader {
        FileLoader { decoder }
    }

    /// Reads and decodes the file at `path`.
    pub fn load(&self, path: &Path) -> Result<LoadedAudio, LoadError> {
        let span = span!(Level::INFO, "load", path = %path.display());
        let _enter = span.enter();

        let (file, file_size) = read_file(path)?;

        let mut descriptor = PcmDescriptor::default();
        let mut sink = PcmSink::default();
        let extension = path.extension().and_then(|ext| ext.to_str());
        self.decoder
            .decode(file, extension, &mut descriptor, &mut sink)?;
        descriptor.validate(sink.len())?;

        info!(
            format = %descriptor,
            bytes = sink.len(),
            file_size,
            "Loaded audio file"
        );
        Ok(LoadedAudio {
            buffer: AudioBuffer::new(sink.into_inner(), path, file_size),
            descriptor,
        })
    }

    /// Replaces the contents of `slot` with the file at `path`. A slot that is
    /// still streaming is left untouched.
    pub fn reload(&self, slot: &mut LoadedAudio, path: &Path) -> Result<(), PlayerError> {
        if slot.buffer.is_streaming() {
            return Err(StateError::invalid("streaming", "load").into());
        }

        let loaded = self.load(path)?;
        slot.release();
        *slot = loaded;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<(Vec<u8>, u64), LoadError> {
    if path.as_os_str().is_empty() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }

    let read_failed = |source: io::Error| {
        if source.kind() == io::ErrorKind::NotFound {
            LoadError::NotFound(path.to_path_buf())
        } else {
            LoadError::ReadFailed {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let mut file = File::open(path).map_err(read_failed)?;
    let file_size = file.metadata().map_err(read_failed)?.len();
    let len = usize::try_from(file_size).map_err(|_| LoadError::AllocationFailed(usize::MAX))?;

    let mut contents = Vec::new();
    contents
        .try_reserve_exact(len)
        .map_err(|_| LoadError::AllocationFailed(len))?;
    file.read_to_end(&mut contents).map_err(read_failed)?;
    Ok((contents, file_size))
}
