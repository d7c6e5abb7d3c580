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
use crate::buffer::{EndPolicy, PcmCursor};
use crate::error::PlayerError;

#[derive(Default)]
struct Whole {
    data: Option<Arc<Vec<u8>>>,
    position: usize,
    looping: bool,
    drained: bool,
    silence: u8,
    period: Duration,
    stats: FillStats,
}

impl Whole {
    fn render(&mut self, out: &mut [u8]) -> bool {
        let Some(data) = self.data.as_ref().filter(|data| !data.is_empty()) else {
            out.fill(self.silence);
            return false;
        };

        let mut written = 0;
        while written < out.len() {
            if self.position >= data.len() {
                if !self.looping {
                    out[written..].fill(self.silence);
                    self.drained = true;
                    return true;
                }
                self.position = 0;
                self.stats.wraps += 1;
            }
            let n = (data.len() - self.position).min(out.len() - written);
            out[written..written + n].copy_from_slice(&data[self.position..self.position + n]);
            written += n;
            self.position += n;
        }

        if !self.looping && self.position >= data.len() {
            self.drained = true;
            return true;
        }
        false
    }
}

/// Hands the device the whole buffer once. There is no refilling: the device
/// plays straight from memory and wraps by itself when looping.
pub struct SimpleBackend {
    link: DeviceLink,
    whole: Arc<Mutex<Whole>>,
}

impl SimpleBackend {
    pub fn new(device: Arc<dyn Device>, options: BackendOptions) -> SimpleBackend {
        SimpleBackend {
            link: DeviceLink::new(device, options),
            whole: Arc::new(Mutex::new(Whole::default())),
        }
    }
}

impl PlaybackBackend for SimpleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simple
    }

    fn state(&self) -> BackendState {
        self.link.state()
    }

    fn configure(&self, descriptor: &PcmDescriptor) -> Result<(), PlayerError> {
        // Nothing to refill, so just check in now and then.
        let period = self.link.options().notify_period;

        self.link.open(descriptor, || {
            *self.whole.lock() = Whole {
                silence: descriptor.silence(),
                period,
                ..Default::default()
            };

            let whole = self.whole.clone();
            let notify = self.link.notifier();
            let render: RenderFn = Box::new(move |out: &mut [u8]| {
                if whole.lock().render(out) {
                    let _ = notify.try_send(());
                }
            });
            Ok(render)
        })
    }

    fn enqueue(&self, cursor: &mut PcmCursor) -> Result<usize, PlayerError> {
        if !self.link.may_enqueue()? {
            return Ok(0);
        }

        let mut whole = self.whole.lock();
        if whole.data.is_some() {
            return Ok(0);
        }

        let (data, start) = cursor.take_remaining();
        whole.stats.fills = 1;
        whole.stats.source_bytes = data.len() - start;
        whole.position = start;
        whole.looping = cursor.policy() == EndPolicy::Loop;
        debug!(bytes = data.len() - start, looping = whole.looping, "Submitted whole buffer");
        whole.data = Some(data);
        Ok(1)
    }

    fn play(&self) -> Result<(), PlayerError> {
        self.link.start()
    }

    fn stop(&self) -> Result<(), PlayerError> {
        self.link.stop()
    }

    fn release(&self) -> Result<(), PlayerError> {
        let result = self.link.release();
        self.whole.lock().data = None;
        result
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.link.wait(timeout)
    }

    fn is_drained(&self) -> bool {
        self.whole.lock().drained
    }

    fn period(&self) -> Duration {
        self.whole.lock().period
    }

    fn stats(&self) -> FillStats {
        self.whole.lock().stats
    }
}
