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

//! In-memory PCM storage and the read cursor that streams it.
//!
//! An [`AudioBuffer`] owns the decoded bytes until it is released. Playback
//! never copies the allocation: sessions hold a shared, read-only view of it,
//! so releasing the buffer while a session still reads it only drops the
//! buffer's own reference.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::debug;

use crate::audio::PcmDescriptor;
use crate::error::BackendError;

/// Decoded PCM bytes plus the file they came from.
#[derive(Default)]
pub struct AudioBuffer {
    data: Option<Arc<Vec<u8>>>,
    path: PathBuf,
    file_size: u64,
    streaming: Arc<AtomicBool>,
}

impl AudioBuffer {
    /// Wraps a filled allocation.
    pub fn new(data: Vec<u8>, path: &Path, file_size: u64) -> AudioBuffer {
        AudioBuffer {
            data: Some(Arc::new(data)),
            path: path.to_path_buf(),
            file_size,
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true while the buffer holds data.
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// The number of PCM bytes held, zero once released.
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.len())
    }

    /// Returns true if the buffer holds no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The PCM bytes, if loaded.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|data| data.as_slice())
    }

    /// The source path. Diagnostic only.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the source file on disk.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns true while a session is streaming from this buffer.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Frees the allocation. Calling it again, or on an empty buffer, does nothing.
    pub fn release(&mut self) {
        if let Some(data) = self.data.take() {
            debug!(path = ?self.path, bytes = data.len(), "Released audio buffer");
        }
        self.file_size = 0;
    }

    /// Takes the single streaming lease for this buffer.
    pub(crate) fn lease(&self) -> Result<StreamLease, BackendError> {
        if self
            .streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackendError::AlreadyPlaying);
        }
        Ok(StreamLease {
            streaming: self.streaming.clone(),
        })
    }

    fn shared(&self) -> Option<Arc<Vec<u8>>> {
        self.data.clone()
    }
}

/// Marks a buffer as streaming until dropped.
pub struct StreamLease {
    streaming: Arc<AtomicBool>,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.streaming.store(false, Ordering::Release);
    }
}

/// A buffer and the descriptor of its contents, produced together by one load.
#[derive(Default)]
pub struct LoadedAudio {
    pub buffer: AudioBuffer,
    pub descriptor: PcmDescriptor,
}

impl LoadedAudio {
    /// An empty slot.
    pub fn empty() -> LoadedAudio {
        LoadedAudio::default()
    }

    /// Returns true if the slot holds data.
    pub fn is_loaded(&self) -> bool {
        self.buffer.is_loaded()
    }

    /// Releases the buffer and zeroes the descriptor.
    pub fn release(&mut self) {
        self.buffer.release();
        self.descriptor = PcmDescriptor::default();
    }

    /// Creates a cursor over the loaded bytes.
    pub fn cursor(&self, policy: EndPolicy) -> Option<PcmCursor> {
        self.buffer
            .shared()
            .map(|data| PcmCursor::new(data, policy, self.descriptor.silence()))
    }
}

/// What happens when the cursor reaches the end of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndPolicy {
    /// Wrap to the start and keep going without a gap.
    Loop,
    /// Pad with silence and signal the end of the stream.
    #[default]
    Stop,
}

impl EndPolicy {
    pub fn from_loop_on_end(loop_on_end: bool) -> EndPolicy {
        if loop_on_end {
            EndPolicy::Loop
        } else {
            EndPolicy::Stop
        }
    }
}

/// The result of copying one unit of work out of the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes copied from the source.
    pub source_bytes: usize,
    /// Silence bytes written after the source ran out.
    pub padding: usize,
    /// Times the cursor wrapped back to the start.
    pub wraps: usize,
    /// The source has been fully consumed and won't produce more.
    pub exhausted: bool,
}

/// Read cursor over shared PCM bytes.
pub struct PcmCursor {
    data: Arc<Vec<u8>>,
    position: usize,
    policy: EndPolicy,
    silence: u8,
}

impl PcmCursor {
    pub fn new(data: Arc<Vec<u8>>, policy: EndPolicy, silence: u8) -> PcmCursor {
        PcmCursor {
            data,
            position: 0,
            policy,
            silence,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn policy(&self) -> EndPolicy {
        self.policy
    }

    pub fn silence(&self) -> u8 {
        self.silence
    }

    /// Returns true once a non-looping cursor has handed out every byte.
    pub fn is_exhausted(&self) -> bool {
        match self.policy {
            EndPolicy::Loop => self.data.is_empty(),
            EndPolicy::Stop => self.position >= self.data.len(),
        }
    }

    /// Fills all of `out`: source bytes first, wrapping under the loop policy,
    /// then silence once a non-looping source runs out.
    pub fn fill(&mut self, out: &mut [u8]) -> Chunk {
        let mut chunk = self.copy(out);
        if chunk.source_bytes < out.len() {
            out[chunk.source_bytes..].fill(self.silence);
            chunk.padding = out.len() - chunk.source_bytes;
        }
        chunk
    }

    /// Appends up to `max` source bytes to `out` without padding.
    pub fn read_into(&mut self, out: &mut Vec<u8>, max: usize) -> Chunk {
        let start = out.len();
        out.resize(start + max, self.silence);
        let chunk = self.copy(&mut out[start..]);
        out.truncate(start + chunk.source_bytes);
        chunk
    }

    /// Hands out the rest of the source in one piece.
    pub fn take_remaining(&mut self) -> (Arc<Vec<u8>>, usize) {
        let start = self.position;
        self.position = self.data.len();
        (self.data.clone(), start)
    }

    fn copy(&mut self, out: &mut [u8]) -> Chunk {
        let mut chunk = Chunk::default();
        while chunk.source_bytes < out.len() && !self.data.is_empty() {
            if self.position >= self.data.len() {
                if self.policy == EndPolicy::Stop {
                    break;
                }
                self.position = 0;
                chunk.wraps += 1;
            }

            let n = (self.data.len() - self.position).min(out.len() - chunk.source_bytes);
            out[chunk.source_bytes..chunk.source_bytes + n]
                .copy_from_slice(&self.data[self.position..self.position + n]);
            self.position += n;
            chunk.source_bytes += n;
        }
        chunk.exhausted = self.is_exhausted();
        chunk
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::SampleFormat;

    fn loaded(data: Vec<u8>) -> LoadedAudio {
        LoadedAudio {
            buffer: AudioBuffer::new(data, Path::new("test.wav"), 44),
            descriptor: PcmDescriptor::new(1, 8_000, 16, SampleFormat::Int).unwrap(),
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut audio = loaded(vec![1, 2, 3, 4]);
        assert!(audio.is_loaded());
        assert_eq!(audio.buffer.len(), 4);

        for _ in 0..3 {
            audio.release();
            assert!(!audio.is_loaded());
            assert!(audio.buffer.is_empty());
            assert_eq!(audio.buffer.file_size(), 0);
            assert!(audio.buffer.bytes().is_none());
            assert_eq!(audio.descriptor, PcmDescriptor::default());
        }

        // Releasing a buffer that never held anything is fine too.
        let mut empty = AudioBuffer::default();
        empty.release();
        empty.release();
        assert!(!empty.is_loaded());
    }

    #[test]
    fn test_release_keeps_readers_alive() {
        let mut audio = loaded(vec![1, 2, 3, 4]);
        let mut cursor = audio.cursor(EndPolicy::Stop).unwrap();
        audio.release();

        let mut out = [0u8; 4];
        let chunk = cursor.fill(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(chunk.exhausted);
    }

    #[test]
    fn test_single_lease() {
        let audio = loaded(vec![0; 4]);
        let lease = audio.buffer.lease().unwrap();
        assert!(audio.buffer.is_streaming());
        assert!(matches!(
            audio.buffer.lease(),
            Err(BackendError::AlreadyPlaying)
        ));
        drop(lease);
        assert!(!audio.buffer.is_streaming());
        assert!(audio.buffer.lease().is_ok());
    }

    #[test]
    fn test_fill_pads_tail() {
        let mut cursor = PcmCursor::new(Arc::new(vec![1u8; 10]), EndPolicy::Stop, 0);
        let mut out = [9u8; 6];

        let chunk = cursor.fill(&mut out);
        assert_eq!(chunk.source_bytes, 6);
        assert!(!chunk.exhausted);

        let chunk = cursor.fill(&mut out);
        assert_eq!(chunk.source_bytes, 4);
        assert_eq!(chunk.padding, 2);
        assert!(chunk.exhausted);
        assert_eq!(out, [1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_fill_eight_bit_silence() {
        let mut cursor = PcmCursor::new(Arc::new(vec![5u8; 2]), EndPolicy::Stop, 0x80);
        let mut out = [0u8; 4];
        cursor.fill(&mut out);
        assert_eq!(out, [5, 5, 0x80, 0x80]);
    }

    #[test]
    fn test_fill_wraps_without_gap() {
        let mut cursor = PcmCursor::new(Arc::new(vec![1u8, 2, 3]), EndPolicy::Loop, 0);
        let mut out = [0u8; 8];

        let chunk = cursor.fill(&mut out);
        assert_eq!(out, [1, 2, 3, 1, 2, 3, 1, 2]);
        assert_eq!(chunk.source_bytes, 8);
        assert_eq!(chunk.padding, 0);
        assert_eq!(chunk.wraps, 2);
        assert!(!chunk.exhausted);
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn test_read_into_is_unpadded() {
        let mut cursor = PcmCursor::new(Arc::new(vec![1u8, 2, 3, 4, 5]), EndPolicy::Stop, 0);
        let mut block = Vec::new();

        let chunk = cursor.read_into(&mut block, 3);
        assert_eq!(block, vec![1, 2, 3]);
        assert!(!chunk.exhausted);

        block.clear();
        let chunk = cursor.read_into(&mut block, 3);
        assert_eq!(block, vec![4, 5]);
        assert!(chunk.exhausted);
    }

    #[test]
    fn test_take_remaining() {
        let mut cursor = PcmCursor::new(Arc::new(vec![1u8, 2, 3, 4]), EndPolicy::Stop, 0);
        let mut out = [0u8; 1];
        cursor.fill(&mut out);

        let (data, start) = cursor.take_remaining();
        assert_eq!(&data[start..], &[2, 3, 4]);
        assert!(cursor.is_exhausted());
    }
}
