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
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::debug;

use crate::config;
use crate::error::BackendError;

pub mod cpal;
pub mod format;
pub mod mock;
pub mod thread_priority;

pub use format::{PcmDescriptor, SampleFormat};

/// Pulls the next PCM bytes, laid out per the stream's descriptor, into the
/// device buffer. Implementations must fill the whole slice.
pub type RenderFn = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// Receives asynchronous device errors raised while a stream is running.
pub type ErrorFn = Box<dyn Fn(String) + Send + 'static>;

/// Which buffering strategies a device can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Looping device buffer split into notification regions.
    pub ring_buffer: bool,
    /// Queue of sequentially submitted blocks.
    pub streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            ring_buffer: true,
            streaming: true,
        }
    }
}

/// An audio output device.
pub trait Device: fmt::Display + Send + Sync {
    /// The device name.
    fn name(&self) -> &str;

    /// The buffering strategies this device supports.
    fn capabilities(&self) -> Capabilities;

    /// Binds the device for exclusive use by one backend.
    fn claim(&self) -> Result<DeviceBinding, BackendError>;

    /// Opens an output stream. The stream is created paused.
    fn open(
        &self,
        descriptor: &PcmDescriptor,
        render: RenderFn,
        on_error: ErrorFn,
    ) -> Result<Box<dyn Stream>, BackendError>;
}

/// An open output stream.
pub trait Stream: Send {
    /// Starts or resumes pulling from the render callback.
    fn play(&mut self) -> Result<(), BackendError>;

    /// Stops pulling from the render callback.
    fn pause(&mut self) -> Result<(), BackendError>;

    /// Closes the stream, waiting at most `timeout` for the device to let go.
    fn close(self: Box<Self>, timeout: Duration) -> Result<(), BackendError>;
}

/// Tracks whether a device is bound to a backend.
#[derive(Clone, Default)]
pub struct BindingSlot {
    bound: Arc<AtomicBool>,
}

impl BindingSlot {
    /// Binds the slot, failing if another backend already holds it.
    pub fn claim(&self, device: &str) -> Result<DeviceBinding, BackendError> {
        if self
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackendError::DeviceUnavailable(format!(
                "{} is already bound to another backend",
                device
            )));
        }
        debug!(device, "Device bound");
        Ok(DeviceBinding {
            bound: self.bound.clone(),
        })
    }

    /// Returns true if a backend currently holds the device.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }
}

/// Exclusive use of a device. Dropping it unbinds the device.
pub struct DeviceBinding {
    bound: Arc<AtomicBool>,
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        self.bound.store(false, Ordering::Release);
    }
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, BackendError> {
    cpal::Device::list()
}

/// Gets a device with the given name.
pub fn get_device(config: &config::Playback) -> Result<Arc<dyn Device>, BackendError> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device)));
    };

    Ok(Arc::new(cpal::Device::get(config)?))
}
