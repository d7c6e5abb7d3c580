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
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BindingSlot, Capabilities, DeviceBinding, ErrorFn, PcmDescriptor, RenderFn};
use crate::error::BackendError;

/// What the mock device has been asked to do so far.
#[derive(Default)]
struct Output {
    render: Option<RenderFn>,
    on_error: Option<ErrorFn>,
    generation: u64,
    open: bool,
    playing: bool,
    rendered: Vec<u8>,
    streams_opened: usize,
}

/// A mock device. Doesn't actually play anything, but pulls bytes through the
/// render callback either when told to (`pump`) or on a clock.
#[derive(Clone)]
pub struct Device {
    name: String,
    capabilities: Capabilities,
    slot: BindingSlot,
    open_delay: Duration,
    reject_formats: bool,
    play_failures: Arc<AtomicUsize>,
    clock: Option<(usize, Duration)>,
    output: Arc<Mutex<Output>>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            capabilities: Capabilities::default(),
            slot: BindingSlot::default(),
            open_delay: Duration::ZERO,
            reject_formats: false,
            play_failures: Arc::new(AtomicUsize::new(0)),
            clock: Some((4096, Duration::from_millis(1))),
            output: Arc::new(Mutex::new(Output::default())),
        }
    }

    /// A mock device that only renders when `pump` is called.
    pub fn manual(name: &str) -> Device {
        Device {
            clock: None,
            ..Device::get(name)
        }
    }

    /// Renders `chunk` bytes every `tick` while playing.
    pub fn with_clock(mut self, chunk: usize, tick: Duration) -> Device {
        self.clock = Some((chunk, tick));
        self
    }

    /// Overrides the supported buffering strategies.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Device {
        self.capabilities = capabilities;
        self
    }

    /// Simulates a driver that takes `delay` to answer an open request.
    pub fn with_open_delay(mut self, delay: Duration) -> Device {
        self.open_delay = delay;
        self
    }

    /// Simulates a device that refuses every format.
    pub fn rejecting_formats(mut self) -> Device {
        self.reject_formats = true;
        self
    }

    /// Makes the next `count` play requests fail.
    pub fn failing_play(self, count: usize) -> Device {
        self.play_failures.store(count, Ordering::Relaxed);
        self
    }

    /// Pulls `bytes` bytes through the render callback of the open stream.
    /// Returns the number of bytes rendered, which is zero when nothing is playing.
    pub fn pump(&self, bytes: usize) -> usize {
        pump(&self.output, bytes)
    }

    /// Everything rendered so far.
    pub fn rendered(&self) -> Vec<u8> {
        self.output.lock().rendered.clone()
    }

    /// Returns true if the device is currently playing.
    pub fn is_playing(&self) -> bool {
        let output = self.output.lock();
        output.open && output.playing
    }

    /// Returns true if a stream is open.
    pub fn is_open(&self) -> bool {
        self.output.lock().open
    }

    /// Returns true if a backend holds the device.
    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    /// The number of streams opened over the device's lifetime.
    pub fn streams_opened(&self) -> usize {
        self.output.lock().streams_opened
    }

    /// Reports an asynchronous device error to the open stream.
    pub fn raise_error(&self, message: &str) {
        let output = self.output.lock();
        if let Some(on_error) = output.on_error.as_ref() {
            on_error(message.to_string());
        }
    }
}

fn pump(output: &Mutex<Output>, bytes: usize) -> usize {
    let (mut render, generation) = {
        let mut output = output.lock();
        if !output.open || !output.playing {
            return 0;
        }
        match output.render.take() {
            Some(render) => (render, output.generation),
            None => return 0,
        }
    };

    // Render outside of the lock so the backend can take its own locks.
    let mut buffer = vec![0u8; bytes];
    render(&mut buffer);

    let mut output = output.lock();
    if output.open && output.generation == generation {
        output.render = Some(render);
    }
    // A pause that lands mid-render cuts the output off.
    if !output.playing {
        return 0;
    }
    output.rendered.extend_from_slice(&buffer);
    bytes
}

impl super::Device for Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn claim(&self) -> Result<DeviceBinding, BackendError> {
        self.slot.claim(&self.name)
    }

    fn open(
        &self,
        descriptor: &PcmDescriptor,
        render: RenderFn,
        on_error: ErrorFn,
    ) -> Result<Box<dyn super::Stream>, BackendError> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        if self.reject_formats {
            return Err(BackendError::FormatRejected(descriptor.to_string()));
        }

        let mut output = self.output.lock();
        if output.open {
            return Err(BackendError::DeviceUnavailable(format!(
                "{} already has an open stream",
                self.name
            )));
        }
        output.generation += 1;
        output.open = true;
        output.playing = false;
        output.render = Some(render);
        output.on_error = Some(on_error);
        output.streams_opened += 1;

        info!(device = self.name, format = %descriptor, "Opened mock stream.");
        Ok(Box::new(Stream {
            output: self.output.clone(),
            play_failures: self.play_failures.clone(),
            clock: self.clock,
            clock_thread: None,
            clock_running: Arc::new(AtomicBool::new(false)),
        }))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

/// A stream opened on the mock device.
struct Stream {
    output: Arc<Mutex<Output>>,
    play_failures: Arc<AtomicUsize>,
    clock: Option<(usize, Duration)>,
    clock_thread: Option<thread::JoinHandle<()>>,
    clock_running: Arc<AtomicBool>,
}

impl Stream {
    fn stop_clock(&mut self) {
        self.clock_running.store(false, Ordering::Release);
        if let Some(thread) = self.clock_thread.take() {
            let _ = thread.join();
        }
    }
}

impl super::Stream for Stream {
    fn play(&mut self) -> Result<(), BackendError> {
        if self
            .play_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::DeviceUnavailable(
                "mock device refused to start".to_string(),
            ));
        }

        self.output.lock().playing = true;
        if let (Some((chunk, tick)), None) = (self.clock, self.clock_thread.as_ref()) {
            self.clock_running.store(true, Ordering::Release);
            let output = self.output.clone();
            let running = self.clock_running.clone();
            let thread = thread::Builder::new()
                .name("pcmplay-mock-clock".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        pump(&output, chunk);
                        thread::sleep(tick);
                    }
                })
                .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?;
            self.clock_thread = Some(thread);
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), BackendError> {
        self.output.lock().playing = false;
        Ok(())
    }

    fn close(mut self: Box<Self>, _timeout: Duration) -> Result<(), BackendError> {
        self.stop_clock();
        let mut output = self.output.lock();
        output.open = false;
        output.playing = false;
        output.render = None;
        output.on_error = None;
        debug!("Closed mock stream.");
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::{Device as _, SampleFormat};

    fn descriptor() -> PcmDescriptor {
        PcmDescriptor::new(1, 8_000, 8, SampleFormat::Int).unwrap()
    }

    #[test]
    fn test_manual_pump() {
        let device = Device::manual("mock");
        let mut stream = device
            .open(
                &descriptor(),
                Box::new(|out: &mut [u8]| out.fill(7)),
                Box::new(|_| {}),
            )
            .unwrap();

        // Paused streams don't render.
        assert_eq!(device.pump(4), 0);

        stream.play().unwrap();
        assert!(device.is_playing());
        assert_eq!(device.pump(4), 4);
        assert_eq!(device.rendered(), vec![7, 7, 7, 7]);

        stream.close(Duration::ZERO).unwrap();
        assert!(!device.is_open());
        assert_eq!(device.pump(4), 0);
    }

    #[test]
    fn test_single_open_stream() {
        let device = Device::manual("mock");
        let _stream = device
            .open(&descriptor(), Box::new(|_| {}), Box::new(|_| {}))
            .unwrap();
        assert!(device
            .open(&descriptor(), Box::new(|_| {}), Box::new(|_| {}))
            .is_err());
        assert_eq!(device.streams_opened(), 1);
    }

    #[test]
    fn test_failing_play() {
        let device = Device::manual("mock").failing_play(1);
        let mut stream = device
            .open(&descriptor(), Box::new(|_| {}), Box::new(|_| {}))
            .unwrap();
        assert!(stream.play().is_err());
        assert!(stream.play().is_ok());
    }

    #[test]
    fn test_rejecting_formats() {
        let device = Device::manual("mock").rejecting_formats();
        assert!(matches!(
            device.open(&descriptor(), Box::new(|_| {}), Box::new(|_| {})),
            Err(BackendError::FormatRejected(_))
        ));
    }
}
