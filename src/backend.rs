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

//! Playback backends move PCM bytes from a cursor into a device stream.
//!
//! Every backend walks the same state machine:
//!
//! ```text
//! Unconfigured -> Configured -> Playing -> Stopped -> Released
//! ```
//!
//! Backends are shared between the thread that fills them and the thread that
//! stops them, so every method takes `&self`. Two locks are involved: the
//! control lock in [`DeviceLink`] guards the state and the device stream, and
//! each backend keeps its render data behind a second lock that the device
//! callback takes. The device is never called while the render lock is held.

use std::{fmt, str::FromStr, sync::Arc, thread, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{
    Capabilities, Device, DeviceBinding, ErrorFn, PcmDescriptor, RenderFn, Stream,
};
use crate::buffer::PcmCursor;
use crate::error::{BackendError, PlayerError, StateError};

pub mod ring;
pub mod simple;
pub mod streaming;

pub use crate::buffer::EndPolicy;

pub const DEFAULT_NOTIFY_PERIOD: Duration = Duration::from_millis(25);
/// Longest region the ring will allocate for.
pub const MAX_NOTIFY_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_REGION_COUNT: usize = 4;
pub const DEFAULT_CONFIGURE_TIMEOUT: Duration = Duration::from_secs(2);
pub const MIN_REGION_COUNT: usize = 2;
pub const MAX_REGION_COUNT: usize = 8;

/// The buffering strategy of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Looping device buffer refilled region by region.
    RingBuffer,
    /// Sequential queue of variable length blocks.
    Streaming,
    /// The whole buffer handed over at once.
    Simple,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                BackendKind::RingBuffer => "ring",
                BackendKind::Streaming => "streaming",
                BackendKind::Simple => "simple",
            }
        )
    }
}

/// Which backend the player should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferredBackend {
    /// The first backend the device can drive, in ring, streaming, simple order.
    #[default]
    Auto,
    Ring,
    Streaming,
    Simple,
}

impl FromStr for PreferredBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(PreferredBackend::Auto),
            "ring" | "ring_buffer" | "ringbuffer" => Ok(PreferredBackend::Ring),
            "streaming" | "stream" => Ok(PreferredBackend::Streaming),
            "simple" => Ok(PreferredBackend::Simple),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// The backends worth trying for the given preference, in order.
///
/// An explicit preference the device can't drive yields nothing rather than
/// quietly switching strategy.
pub fn candidates(preferred: PreferredBackend, capabilities: Capabilities) -> Vec<BackendKind> {
    match preferred {
        PreferredBackend::Auto => {
            let mut kinds = Vec::with_capacity(3);
            if capabilities.ring_buffer {
                kinds.push(BackendKind::RingBuffer);
            }
            if capabilities.streaming {
                kinds.push(BackendKind::Streaming);
            }
            kinds.push(BackendKind::Simple);
            kinds
        }
        PreferredBackend::Ring if capabilities.ring_buffer => vec![BackendKind::RingBuffer],
        PreferredBackend::Streaming if capabilities.streaming => vec![BackendKind::Streaming],
        PreferredBackend::Simple => vec![BackendKind::Simple],
        _ => Vec::new(),
    }
}

/// Creates a backend of the given kind bound to `device`.
pub fn create(
    kind: BackendKind,
    device: Arc<dyn Device>,
    options: BackendOptions,
) -> Arc<dyn PlaybackBackend> {
    match kind {
        BackendKind::RingBuffer => Arc::new(ring::RingBufferBackend::new(device, options)),
        BackendKind::Streaming => Arc::new(streaming::StreamingBackend::new(device, options)),
        BackendKind::Simple => Arc::new(simple::SimpleBackend::new(device, options)),
    }
}

/// Lifecycle of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unconfigured,
    Configured,
    Playing,
    Stopped,
    Released,
}

/// Operations that move a backend through its states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Configure,
    Enqueue,
    Play,
    Stop,
    Release,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Configure => "configure",
            Action::Enqueue => "enqueue",
            Action::Play => "play",
            Action::Stop => "stop",
            Action::Release => "release",
        }
    }
}

impl BackendState {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Unconfigured => "unconfigured",
            BackendState::Configured => "configured",
            BackendState::Playing => "playing",
            BackendState::Stopped => "stopped",
            BackendState::Released => "released",
        }
    }

    /// Returns an error if `action` isn't allowed from this state.
    pub fn check(self, action: Action) -> Result<(), StateError> {
        use BackendState::*;

        let allowed = match action {
            Action::Configure => self == Unconfigured,
            Action::Enqueue => matches!(self, Configured | Playing),
            Action::Play => self == Configured,
            Action::Stop => self != Unconfigured,
            Action::Release => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(StateError::invalid(self.as_str(), action.as_str()))
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters kept by the fill side and the render side of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    /// Regions or blocks written.
    pub fills: usize,
    /// Source bytes written.
    pub source_bytes: usize,
    /// Silence written after the source ran out.
    pub padding_bytes: usize,
    /// Times the source wrapped back to its start.
    pub wraps: usize,
    /// Device callbacks that found nothing ready to play.
    pub underruns: usize,
}

/// Tuning shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// How much audio each region or block holds.
    pub notify_period: Duration,
    /// Number of regions in the ring.
    pub region_count: usize,
    /// Explicit region size, overriding `notify_period`.
    pub region_bytes: Option<usize>,
    /// Bound on opening and closing the device stream.
    pub configure_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            notify_period: DEFAULT_NOTIFY_PERIOD,
            region_count: DEFAULT_REGION_COUNT,
            region_bytes: None,
            configure_timeout: DEFAULT_CONFIGURE_TIMEOUT,
        }
    }
}

impl BackendOptions {
    /// Bytes per region or block for the given format, a whole number of frames.
    pub fn unit_bytes(&self, descriptor: &PcmDescriptor) -> usize {
        match self.region_bytes {
            Some(bytes) => {
                let align = usize::from(descriptor.block_align).max(1);
                (bytes / align * align).max(align)
            }
            None => descriptor.bytes_for(self.notify_period),
        }
    }

    /// Region count clamped to what the ring supports.
    pub fn clamped_region_count(&self) -> usize {
        self.region_count.clamp(MIN_REGION_COUNT, MAX_REGION_COUNT)
    }
}

/// A strategy for feeding a device stream.
pub trait PlaybackBackend: Send + Sync {
    /// The buffering strategy.
    fn kind(&self) -> BackendKind;

    /// The current lifecycle state.
    fn state(&self) -> BackendState;

    /// Binds the device and opens a paused stream for `descriptor`.
    fn configure(&self, descriptor: &PcmDescriptor) -> Result<(), PlayerError>;

    /// Moves as much of the cursor into the backend as there is room for.
    /// Returns the number of regions or blocks written. Returns zero once the
    /// backend has been stopped.
    fn enqueue(&self, cursor: &mut PcmCursor) -> Result<usize, PlayerError>;

    /// Starts the device.
    fn play(&self) -> Result<(), PlayerError>;

    /// Stops the device. Safe to call repeatedly and from any thread.
    fn stop(&self) -> Result<(), PlayerError>;

    /// Closes the stream and unbinds the device. Safe to call repeatedly.
    fn release(&self) -> Result<(), PlayerError>;

    /// Blocks until the device frees room or `timeout` passes. Returns true
    /// if woken by the device or by a stop.
    fn wait(&self, timeout: Duration) -> bool;

    /// Returns true once the device has played everything handed to it and
    /// the source is exhausted.
    fn is_drained(&self) -> bool;

    /// How long one region or block takes to play.
    fn period(&self) -> Duration;

    /// Fill and render counters.
    fn stats(&self) -> FillStats;
}

/// Device side state guarded by the control lock.
struct Control {
    state: BackendState,
    binding: Option<DeviceBinding>,
    stream: Option<Box<dyn Stream>>,
}

/// The device plumbing every backend shares: binding, stream lifecycle,
/// state machine, fault reporting and the notification channel.
pub(crate) struct DeviceLink {
    device: Arc<dyn Device>,
    options: BackendOptions,
    control: Mutex<Control>,
    fault: Arc<Mutex<Option<String>>>,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
}

impl DeviceLink {
    pub(crate) fn new(device: Arc<dyn Device>, options: BackendOptions) -> DeviceLink {
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(MAX_REGION_COUNT + 1);
        DeviceLink {
            device,
            options,
            control: Mutex::new(Control {
                state: BackendState::Unconfigured,
                binding: None,
                stream: None,
            }),
            fault: Arc::new(Mutex::new(None)),
            notify_tx,
            notify_rx,
        }
    }

    pub(crate) fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> BackendState {
        self.control.lock().state
    }

    /// Sender the render callback uses to report freed room.
    pub(crate) fn notifier(&self) -> Sender<()> {
        self.notify_tx.clone()
    }

    /// Binds the device and opens a stream on a helper thread, giving up after
    /// the configure timeout. Any failure, including `build` failing to set up
    /// its buffers, leaves the link unconfigured and the device unbound.
    pub(crate) fn open<F>(&self, descriptor: &PcmDescriptor, build: F) -> Result<(), PlayerError>
    where
        F: FnOnce() -> Result<RenderFn, BackendError>,
    {
        let mut control = self.control.lock();
        control.state.check(Action::Configure)?;

        let binding = self.device.claim()?;
        *self.fault.lock() = None;
        while self.notify_rx.try_recv().is_ok() {}

        let render = build()?;
        let on_error = self.error_fn();
        let device = self.device.clone();
        let descriptor = *descriptor;
        let timeout = self.options.configure_timeout;
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        thread::Builder::new()
            .name("pcmplay-configure".to_string())
            .spawn(move || {
                let result = device.open(&descriptor, render, on_error);
                if let Err(crossbeam_channel::SendError(Ok(stream))) = result_tx.send(result) {
                    // Nobody waited for this stream.
                    debug!("Closing stream opened after the configure timeout");
                    if let Err(e) = stream.close(timeout) {
                        warn!(err = %e, "Unable to close late stream");
                    }
                }
            })
            .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?;

        let stream = match result_rx.recv_timeout(timeout) {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(RecvTimeoutError::Timeout) => {
                return Err(BackendError::DeviceUnavailable(format!(
                    "{} did not open a stream within {:?}",
                    self.device.name(),
                    timeout
                ))
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(BackendError::DeviceUnavailable(
                    "configure thread exited without a result".to_string(),
                )
                .into())
            }
        };

        control.binding = Some(binding);
        control.stream = Some(stream);
        control.state = BackendState::Configured;
        info!(device = self.device.name(), format = %descriptor, "Backend configured");
        Ok(())
    }

    fn error_fn(&self) -> ErrorFn {
        let fault = self.fault.clone();
        let notify = self.notify_tx.clone();
        Box::new(move |message: String| {
            fault.lock().get_or_insert(message);
            let _ = notify.try_send(());
        })
    }

    /// Checks whether the fill side may keep writing. Returns false once the
    /// link has been stopped or released, and reports a pending device fault
    /// exactly once.
    pub(crate) fn may_enqueue(&self) -> Result<bool, PlayerError> {
        let mut control = self.control.lock();
        if let Some(message) = self.fault.lock().take() {
            if matches!(
                control.state,
                BackendState::Configured | BackendState::Playing
            ) {
                control.state = BackendState::Stopped;
                if let Some(stream) = control.stream.as_mut() {
                    let _ = stream.pause();
                }
                warn!(err = message, "Audio device failed mid-stream");
                return Err(BackendError::DeviceUnavailable(message).into());
            }
        }

        match control.state {
            BackendState::Stopped | BackendState::Released => Ok(false),
            state => {
                state.check(Action::Enqueue)?;
                Ok(true)
            }
        }
    }

    /// Starts the stream, retrying a failed start once.
    pub(crate) fn start(&self) -> Result<(), PlayerError> {
        let mut control = self.control.lock();
        control.state.check(Action::Play)?;

        let stream = control.stream.as_mut().ok_or_else(|| {
            BackendError::DeviceUnavailable("backend has no open stream".to_string())
        })?;
        if let Err(e) = stream.play() {
            warn!(err = %e, "Device failed to start, retrying once");
            stream.play()?;
        }
        control.state = BackendState::Playing;
        debug!(device = self.device.name(), "Playback started");
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<(), PlayerError> {
        let mut control = self.control.lock();
        control.state.check(Action::Stop)?;

        if matches!(
            control.state,
            BackendState::Configured | BackendState::Playing
        ) {
            if let Some(stream) = control.stream.as_mut() {
                if let Err(e) = stream.pause() {
                    warn!(err = %e, "Unable to pause device stream");
                }
            }
            control.state = BackendState::Stopped;
            debug!(device = self.device.name(), "Playback stopped");
        }
        let _ = self.notify_tx.try_send(());
        Ok(())
    }

    pub(crate) fn release(&self) -> Result<(), PlayerError> {
        let (stream, binding) = {
            let mut control = self.control.lock();
            control.state = BackendState::Released;
            (control.stream.take(), control.binding.take())
        };
        let _ = self.notify_tx.try_send(());

        let result = match stream {
            Some(stream) => stream.close(self.options.configure_timeout),
            None => Ok(()),
        };
        if binding.is_some() {
            debug!(device = self.device.name(), "Device released");
        }
        drop(binding);
        result.map_err(PlayerError::from)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.notify_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if self.control.get_mut().binding.is_some() {
            let leak = BackendError::ResourceLeak(format!(
                "backend dropped while still bound to {}",
                self.device.name()
            ));
            warn!(err = %leak, "Releasing device on drop");
            if let Err(e) = self.release() {
                warn!(err = %e, "Unable to release device on drop");
            }
        }
    }
}
