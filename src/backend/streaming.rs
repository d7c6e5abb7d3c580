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
use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::{BackendKind, BackendOptions, BackendState, DeviceLink, FillStats, PlaybackBackend};
use crate::audio::{Device, PcmDescriptor, RenderFn};
use crate::buffer::PcmCursor;
use crate::error::PlayerError;

/// Blocks handed to the device at once: the one playing and the next one.
pub const MAX_QUEUED_BLOCKS: usize = 2;

#[derive(Default)]
struct Queue {
    blocks: VecDeque<Vec<u8>>,
    /// Spent blocks kept for reuse.
    spare: Vec<Vec<u8>>,
    offset: usize,
    block_bytes: usize,
    exhausted: bool,
    drained: bool,
    silence: u8,
    period: Duration,
    stats: FillStats,
}

impl Queue {
    fn render(&mut self, out: &mut [u8]) -> bool {
        let mut done = false;
        let mut written = 0;
        while written < out.len() {
            let Some(block) = self.blocks.front() else {
                if self.exhausted {
                    self.drained = true;
                } else {
                    self.stats.underruns += 1;
                }
                out[written..].fill(self.silence);
                break;
            };

            let n = (block.len() - self.offset).min(out.len() - written);
            out[written..written + n].copy_from_slice(&block[self.offset..self.offset + n]);
            written += n;
            self.offset += n;

            if self.offset == block.len() {
                if let Some(mut spent) = self.blocks.pop_front() {
                    spent.clear();
                    self.spare.push(spent);
                }
                self.offset = 0;
                done = true;
            }
        }
        if self.blocks.is_empty() && self.exhausted {
            self.drained = true;
        }
        done
    }
}

/// Feeds the device a queue of blocks, each at most one notify period long.
/// Blocks are never padded: the last one is as short as the source tail.
pub struct StreamingBackend {
    link: DeviceLink,
    queue: Arc<Mutex<Queue>>,
}

impl StreamingBackend {
    pub fn new(device: Arc<dyn Device>, options: BackendOptions) -> StreamingBackend {
        StreamingBackend {
            link: DeviceLink::new(device, options),
            queue: Arc::new(Mutex::new(Queue::default())),
        }
    }

    /// Blocks waiting for or being played by the device.
    pub fn queued(&self) -> usize {
        self.queue.lock().blocks.len()
    }
}

impl PlaybackBackend for StreamingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    fn state(&self) -> BackendState {
        self.link.state()
    }

    fn configure(&self, descriptor: &PcmDescriptor) -> Result<(), PlayerError> {
        let block_bytes = self.link.options().unit_bytes(descriptor);
        let period = descriptor.duration_of(block_bytes);

        self.link.open(descriptor, || {
            *self.queue.lock() = Queue {
                block_bytes,
                silence: descriptor.silence(),
                period,
                ..Default::default()
            };

            let queue = self.queue.clone();
            let notify = self.link.notifier();
            let render: RenderFn = Box::new(move |out: &mut [u8]| {
                let done = queue.lock().render(out);
                if done {
                    let _ = notify.try_send(());
                }
            });
            Ok(render)
        })
    }

    fn enqueue(&self, cursor: &mut PcmCursor) -> Result<usize, PlayerError> {
        let mut queued = 0;
        while self.link.may_enqueue()? {
            let mut queue = self.queue.lock();
            if queue.exhausted || queue.blocks.len() >= MAX_QUEUED_BLOCKS {
                break;
            }

            let mut block = queue.spare.pop().unwrap_or_default();
            let chunk = cursor.read_into(&mut block, queue.block_bytes);
            queue.exhausted = chunk.exhausted;
            if chunk.source_bytes == 0 {
                break;
            }
            queue.stats.fills += 1;
            queue.stats.source_bytes += chunk.source_bytes;
            queue.stats.wraps += chunk.wraps;
            queue.blocks.push_back(block);
            queued += 1;
        }
        Ok(queued)
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
        self.queue.lock().drained
    }

    fn period(&self) -> Duration {
        self.queue.lock().period
    }

    fn stats(&self) -> FillStats {
        self.queue.lock().stats
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::mock;
    use crate::buffer::EndPolicy;
    use crate::testutil::{cd_descriptor, loaded, pattern};

    fn backend(device: &Arc<mock::Device>, block_bytes: usize) -> StreamingBackend {
        StreamingBackend::new(
            device.clone(),
            BackendOptions {
                region_bytes: Some(block_bytes),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_blocks_are_unpadded() {
        let source = pattern(1_000);
        let audio = loaded(cd_descriptor(), source.clone());
        let mut cursor = audio.cursor(EndPolicy::Stop).unwrap();
        let device = Arc::new(mock::Device::manual("mock"));
        let backend = backend(&device, 400);

        backend.configure(&cd_descriptor()).unwrap();
        assert_eq!(backend.enqueue(&mut cursor).unwrap(), 2);
        assert_eq!(backend.queued(), MAX_QUEUED_BLOCKS);
        // Nothing more until the device finishes a block.
        assert_eq!(backend.enqueue(&mut cursor).unwrap(), 0);
        backend.play().unwrap();

        device.pump(400);
        assert!(backend.wait(Duration::from_secs(1)));
        assert_eq!(backend.enqueue(&mut cursor).unwrap(), 1);
        assert!(!backend.is_drained());

        device.pump(600);
        assert!(backend.is_drained());

        let stats = backend.stats();
        assert_eq!(stats.fills, 3);
        assert_eq!(stats.source_bytes, 1_000);
        assert_eq!(stats.padding_bytes, 0);
        assert_eq!(stats.underruns, 0);
        assert_eq!(&device.rendered()[..1_000], source.as_slice());
        backend.release().unwrap();
    }

    #[test]
    fn test_one_block_per_done() {
        let audio = loaded(cd_descriptor(), pattern(10_000));
        let mut cursor = audio.cursor(EndPolicy::Stop).unwrap();
        let device = Arc::new(mock::Device::manual("mock"));
        let backend = backend(&device, 400);

        backend.configure(&cd_descriptor()).unwrap();
        backend.enqueue(&mut cursor).unwrap();
        backend.play().unwrap();

        for _ in 0..5 {
            device.pump(400);
            assert_eq!(backend.enqueue(&mut cursor).unwrap(), 1);
            assert!(backend.queued() <= MAX_QUEUED_BLOCKS);
        }
        backend.release().unwrap();
    }

    #[test]
    fn test_loop_is_seamless() {
        let source = pattern(300);
        let audio = loaded(cd_descriptor(), source.clone());
        let mut cursor = audio.cursor(EndPolicy::Loop).unwrap();
        let device = Arc::new(mock::Device::manual("mock"));
        let backend = backend(&device, 200);

        backend.configure(&cd_descriptor()).unwrap();
        backend.enqueue(&mut cursor).unwrap();
        backend.play().unwrap();
        for _ in 0..6 {
            device.pump(200);
            backend.enqueue(&mut cursor).unwrap();
        }

        let expected: Vec<u8> = source.iter().cycle().take(1_200).copied().collect();
        assert_eq!(device.rendered(), expected);
        assert!(backend.stats().wraps >= 3);
        assert!(!backend.is_drained());
        backend.release().unwrap();
    }

    #[test]
    fn test_starved_queue_counts_underrun() {
        let audio = loaded(cd_descriptor(), pattern(10_000));
        let mut cursor = audio.cursor(EndPolicy::Stop).unwrap();
        let device = Arc::new(mock::Device::manual("mock"));
        let backend = backend(&device, 400);

        backend.configure(&cd_descriptor()).unwrap();
        backend.enqueue(&mut cursor).unwrap();
        backend.play().unwrap();
        device.pump(1_000);

        assert_eq!(backend.stats().underruns, 1);
        assert!(!backend.is_drained());
        backend.release().unwrap();
    }
}
