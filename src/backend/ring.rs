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
use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::debug;

use super::{BackendKind, BackendOptions, BackendState, DeviceLink, FillStats, PlaybackBackend};
use crate::audio::{Device, PcmDescriptor, RenderFn};
use crate::buffer::PcmCursor;
use crate::error::{BackendError, PlayerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Played, waiting for new data.
    Free,
    /// Holds data the device hasn't reached yet.
    Filled,
    /// Holds the tail of the source.
    Final,
}

/// The looping device buffer, split into equal regions.
struct Ring {
    data: Vec<u8>,
    regions: Vec<Region>,
    region_bytes: usize,
    play_region: usize,
    play_offset: usize,
    write_region: usize,
    final_region: Option<usize>,
    drained: bool,
    silence: u8,
    period: Duration,
    stats: FillStats,
}

impl Ring {
    /// Allocates `count` regions of `region_bytes`, failing instead of
    /// aborting when the ring doesn't fit in memory.
    fn new(
        count: usize,
        region_bytes: usize,
        silence: u8,
        period: Duration,
    ) -> Result<Ring, BackendError> {
        let total = count.checked_mul(region_bytes).ok_or_else(|| {
            BackendError::BufferAllocation(format!(
                "{} regions of {} bytes overflow",
                count, region_bytes
            ))
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| BackendError::BufferAllocation(format!("{} bytes: {}", total, e)))?;
        data.resize(total, silence);

        Ok(Ring {
            data,
            regions: vec![Region::Free; count],
            region_bytes,
            play_region: 0,
            play_offset: 0,
            write_region: 0,
            final_region: None,
            drained: false,
            silence,
            period,
            stats: FillStats::default(),
        })
    }

    fn empty() -> Ring {
        Ring {
            data: Vec::new(),
            regions: Vec::new(),
            region_bytes: 0,
            play_region: 0,
            play_offset: 0,
            write_region: 0,
            final_region: None,
            drained: false,
            silence: 0,
            period: Duration::ZERO,
            stats: FillStats::default(),
        }
    }

    /// Copies the next source bytes into the write region. Returns false when
    /// there is no free region or the tail has already been written.
    fn fill_next(&mut self, cursor: &mut PcmCursor) -> bool {
        if self.regions.is_empty() || self.final_region.is_some() {
            return false;
        }
        let index = self.write_region;
        if self.regions[index] != Region::Free {
            return false;
        }

        let start = index * self.region_bytes;
        let chunk = cursor.fill(&mut self.data[start..start + self.region_bytes]);
        self.stats.fills += 1;
        self.stats.source_bytes += chunk.source_bytes;
        self.stats.padding_bytes += chunk.padding;
        self.stats.wraps += chunk.wraps;

        if chunk.exhausted {
            self.regions[index] = Region::Final;
            self.final_region = Some(index);
        } else {
            self.regions[index] = Region::Filled;
        }
        self.write_region = (index + 1) % self.regions.len();
        true
    }

    /// Device side. Plays regions in ring order and frees each one it
    /// finishes. Returns true if any region was freed.
    fn render(&mut self, out: &mut [u8]) -> bool {
        let mut freed = false;
        let mut written = 0;
        while written < out.len() {
            if self.drained || self.regions.is_empty() {
                out[written..].fill(self.silence);
                break;
            }

            let index = self.play_region;
            let status = self.regions[index];
            if status == Region::Free {
                self.stats.underruns += 1;
                out[written..].fill(self.silence);
                break;
            }

            let start = index * self.region_bytes + self.play_offset;
            let n = (self.region_bytes - self.play_offset).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.data[start..start + n]);
            written += n;
            self.play_offset += n;

            if self.play_offset == self.region_bytes {
                self.regions[index] = Region::Free;
                self.play_offset = 0;
                self.play_region = (index + 1) % self.regions.len();
                freed = true;
                if status == Region::Final {
                    self.drained = true;
                }
            }
        }
        freed
    }
}

/// Streams through a looping device buffer of `region_count` regions, each
/// holding one notify period of audio. The device frees regions as it plays
/// them and the fill side writes the next source bytes into them.
pub struct RingBufferBackend {
    link: DeviceLink,
    ring: Arc<Mutex<Ring>>,
}

impl RingBufferBackend {
    pub fn new(device: Arc<dyn Device>, options: BackendOptions) -> RingBufferBackend {
        RingBufferBackend {
            link: DeviceLink::new(device, options),
            ring: Arc::new(Mutex::new(Ring::empty())),
        }
    }

    /// Bytes per region, zero before configure.
    pub fn region_bytes(&self) -> usize {
        self.ring.lock().region_bytes
    }

    /// Number of regions, zero before configure.
    pub fn region_count(&self) -> usize {
        self.ring.lock().regions.len()
    }
}

impl PlaybackBackend for RingBufferBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RingBuffer
    }

    fn state(&self) -> BackendState {
        self.link.state()
    }

    fn configure(&self, descriptor: &PcmDescriptor) -> Result<(), PlayerError> {
        let options = self.link.options();
        let region_bytes = options.unit_bytes(descriptor);
        let count = options.clamped_region_count();
        let period = descriptor.duration_of(region_bytes);

        self.link.open(descriptor, || {
            *self.ring.lock() = Ring::new(count, region_bytes, descriptor.silence(), period)?;
            debug!(regions = count, region_bytes, ?period, "Ring buffer allocated");

            let ring = self.ring.clone();
            let notify = self.link.notifier();
            let render: RenderFn = Box::new(move |out: &mut [u8]| {
                let freed = ring.lock().render(out);
                if freed {
                    let _ = notify.try_send(());
                }
            });
            Ok(render)
        })
    }

    fn enqueue(&self, cursor: &mut PcmCursor) -> Result<usize, PlayerError> {
        let mut filled = 0;
        // The state is checked before every region so a stop from another
        // thread ends the loop promptly.
        while self.link.may_enqueue()? {
            if !self.ring.lock().fill_next(cursor) {
                break;
            }
            filled += 1;
        }
        Ok(filled)
    }

    fn play(&self) -> Result<(), PlayerError> {
        self.link.start()
    }

    fn stop(&self) -> Result<(), PlayerError> {
        self.link.stop()
    }

    fn release(&self) -> Result<(), PlayerError> {
        self.link.release()
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.link.wait(timeout)
    }

    fn is_drained(&self) -> bool {
        self.ring.lock().drained
    }

    fn period(&self) -> Duration {
        self.ring.lock().period
    }

    fn stats(&self) -> FillStats {
        self.ring.lock().stats
    }
}
