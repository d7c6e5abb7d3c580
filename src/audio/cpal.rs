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
use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use super::{
    BindingSlot, Capabilities, DeviceBinding, ErrorFn, PcmDescriptor, RenderFn, SampleFormat,
};
use crate::backend::DEFAULT_CONFIGURE_TIMEOUT;
use crate::{config, error::BackendError};

/// A small wrapper around a cpal::Device. Used for storing the output format
/// and binding state alongside the device.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
    /// Sample format handed to the device.
    sample_format: SampleFormat,
    /// Integer width handed to the device.
    bits_per_sample: u16,
    /// Exclusive binding state.
    slot: BindingSlot,
    /// Bound on each play or pause round trip to the output thread.
    command_timeout: Duration,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

/// Commands sent to the output thread that owns the cpal stream.
enum Command {
    Play,
    Pause,
}

/// Callback that renders PCM bytes and converts them to the device sample type.
fn create_callback<T>(
    descriptor: PcmDescriptor,
    mut render: RenderFn,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let bytes_per_sample = descriptor.bytes_per_sample();
    let mut scratch: Vec<u8> = Vec::new();
    move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        scratch.resize(data.len() * bytes_per_sample, 0);
        render(&mut scratch);

        for (dst, src) in data.iter_mut().zip(scratch.chunks_exact(bytes_per_sample)) {
            *dst = T::from_sample(descriptor.decode_sample(src));
        }
    }
}

fn build_error(err: cpal::BuildStreamError) -> BackendError {
    match err {
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => BackendError::FormatRejected(err.to_string()),
        _ => BackendError::DeviceUnavailable(err.to_string()),
    }
}

impl Device {
    /// Lists the names of all cpal output devices.
    pub fn list() -> Result<Vec<String>, BackendError> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| device.to_string())
            .collect())
    }

    /// Lists cpal devices.
    fn list_cpal_devices() -> Result<Vec<Device>, BackendError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout().ok();
        let _shh_stderr = shh::stderr().ok();

        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host = cpal::host_from_id(host_id)
                .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?;
            let host_devices = match host.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|output_config| output_config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    let Ok(name) = device.name() else {
                        continue;
                    };
                    devices.push(Device {
                        name,
                        max_channels,
                        host_id,
                        device,
                        sample_format: SampleFormat::Int,
                        bits_per_sample: 16,
                        slot: BindingSlot::default(),
                        command_timeout: DEFAULT_CONFIGURE_TIMEOUT,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the given cpal device. "default" selects the host's default output.
    pub fn get(config: &config::Playback) -> Result<Device, BackendError> {
        let name = config.device();
        let sample_format = config
            .sample_format()
            .map_err(BackendError::FormatRejected)?;

        let mut device = if name == "default" {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or_else(|| {
                BackendError::DeviceUnavailable("no default output device".to_string())
            })?;
            let max_channels = device
                .supported_output_configs()
                .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?
                .map(|output_config| output_config.channels())
                .max()
                .unwrap_or(0);
            Device {
                name: device.name().unwrap_or_else(|_| name.to_string()),
                max_channels,
                host_id: host.id(),
                device,
                sample_format,
                bits_per_sample: 16,
                slot: BindingSlot::default(),
                command_timeout: DEFAULT_CONFIGURE_TIMEOUT,
            }
        } else {
            Device::list_cpal_devices()?
                .into_iter()
                .find(|device| device.name.trim() == name)
                .ok_or_else(|| {
                    BackendError::DeviceUnavailable(format!("no device found with name {}", name))
                })?
        };

        device.sample_format = sample_format;
        device.bits_per_sample = config.bits_per_sample();
        device.command_timeout = config
            .configure_timeout()
            .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?;
        Ok(device)
    }

    fn build_stream(
        device: &cpal::Device,
        descriptor: PcmDescriptor,
        sample_format: SampleFormat,
        bits_per_sample: u16,
        render: RenderFn,
        on_error: ErrorFn,
    ) -> Result<cpal::Stream, BackendError> {
        let config = cpal::StreamConfig {
            channels: descriptor.channels,
            sample_rate: cpal::SampleRate(descriptor.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let error_callback = move |err: cpal::StreamError| {
            error!("CPAL output stream error: {}", err);
            on_error(err.to_string());
        };

        match (sample_format, bits_per_sample) {
            (SampleFormat::Float, _) => device
                .build_output_stream(
                    &config,
                    create_callback::<f32>(descriptor, render),
                    error_callback,
                    None,
                )
                .map_err(build_error),
            (SampleFormat::Int, 16) => device
                .build_output_stream(
                    &config,
                    create_callback::<i16>(descriptor, render),
                    error_callback,
                    None,
                )
                .map_err(build_error),
            (SampleFormat::Int, 32) => device
                .build_output_stream(
                    &config,
                    create_callback::<i32>(descriptor, render),
                    error_callback,
                    None,
                )
                .map_err(build_error),
            (format, bits) => Err(BackendError::FormatRejected(format!(
                "unsupported device format {}-bit {}",
                bits, format
            ))),
        }
    }
}

impl super::Device for Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
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
        if descriptor.channels > self.max_channels {
            return Err(BackendError::FormatRejected(format!(
                "{} channels requested, audio device {} only has {}",
                descriptor.channels, self.name, self.max_channels
            )));
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();

        let device = self.device.clone();
        let descriptor = *descriptor;
        let sample_format = self.sample_format;
        let bits_per_sample = self.bits_per_sample;
        let command_timeout = self.command_timeout;

        // cpal streams can't always cross threads, so the stream lives and dies
        // on its own output thread.
        let output_thread = thread::Builder::new()
            .name("pcmplay-cpal-output".to_string())
            .spawn(move || {
                let stream = match Device::build_stream(
                    &device,
                    descriptor,
                    sample_format,
                    bits_per_sample,
                    render,
                    on_error,
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Runs until the command sender is dropped.
                for command in command_rx {
                    let result = match command {
                        Command::Play => stream.play().map_err(|e| e.to_string()),
                        Command::Pause => stream.pause().map_err(|e| e.to_string()),
                    };
                    let _ = reply_tx.send(result.map_err(BackendError::DeviceUnavailable));
                }
                debug!("CPAL output thread exiting");
            })
            .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(device = self.name, format = %descriptor, "CPAL output stream created");
                Ok(Box::new(OutputStream {
                    commands: Some(command_tx),
                    replies: reply_rx,
                    timeout: command_timeout,
                    thread: Some(output_thread),
                }))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::DeviceUnavailable(
                "output thread exited before creating a stream".to_string(),
            )),
        }
    }
}

/// Handle to a cpal stream living on its output thread.
struct OutputStream {
    commands: Option<Sender<Command>>,
    replies: Receiver<Result<(), BackendError>>,
    timeout: Duration,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputStream {
    fn send(&self, command: Command) -> Result<(), BackendError> {
        let commands = self.commands.as_ref().ok_or_else(|| {
            BackendError::DeviceUnavailable("output stream is closed".to_string())
        })?;
        round_trip(commands, &self.replies, command, self.timeout)
    }
}

/// Sends `command` to the output thread and waits at most `timeout` for its
/// answer, so a hung driver can't block the caller forever.
fn round_trip(
    commands: &Sender<Command>,
    replies: &Receiver<Result<(), BackendError>>,
    command: Command,
    timeout: Duration,
) -> Result<(), BackendError> {
    // Drop answers to commands that timed out earlier.
    while replies.try_recv().is_ok() {}
    commands
        .send(command)
        .map_err(|_| BackendError::DeviceUnavailable("output thread has exited".to_string()))?;
    match replies.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(BackendError::DeviceUnavailable(format!(
            "output thread did not answer within {:?}",
            timeout
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(BackendError::DeviceUnavailable(
            "output thread has exited".to_string(),
        )),
    }
}

impl super::Stream for OutputStream {
    fn play(&mut self) -> Result<(), BackendError> {
        self.send(Command::Play)
    }

    fn pause(&mut self) -> Result<(), BackendError> {
        self.send(Command::Pause)
    }

    fn close(mut self: Box<Self>, timeout: Duration) -> Result<(), BackendError> {
        // Dropping the sender ends the output thread's command loop.
        self.commands.take();
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(BackendError::ResourceLeak(
                    "CPAL output thread did not exit".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = handle.join();
        Ok(())
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.commands.take();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip_answered() {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        let responder = thread::spawn(move || {
            for command in command_rx {
                let result = match command {
                    Command::Play => Ok(()),
                    Command::Pause => Err(BackendError::DeviceUnavailable("paused".to_string())),
                };
                let _ = reply_tx.send(result);
            }
        });

        let timeout = Duration::from_secs(5);
        assert!(round_trip(&command_tx, &reply_rx, Command::Play, timeout).is_ok());
        assert!(round_trip(&command_tx, &reply_rx, Command::Pause, timeout).is_err());
        drop(command_tx);
        responder.join().unwrap();
    }

    #[test]
    fn test_round_trip_hung_driver_times_out() {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<Result<(), BackendError>>();

        let started = Instant::now();
        assert!(matches!(
            round_trip(&command_tx, &reply_rx, Command::Pause, Duration::from_millis(50)),
            Err(BackendError::DeviceUnavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));

        // A late answer to the timed out command isn't mistaken for the next one.
        assert!(command_rx.try_recv().is_ok());
        reply_tx.send(Ok(())).unwrap();
        let responder = thread::spawn(move || {
            if command_rx.recv().is_ok() {
                let _ = reply_tx.send(Err(BackendError::DeviceUnavailable("refused".to_string())));
            }
        });
        assert!(round_trip(&command_tx, &reply_rx, Command::Play, Duration::from_secs(5)).is_err());
        responder.join().unwrap();
    }

    #[test]
    fn test_round_trip_exited_thread() {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<Result<(), BackendError>>();
        drop(reply_tx);
        assert!(round_trip(&command_tx, &reply_rx, Command::Play, Duration::from_secs(5)).is_err());

        drop(command_rx);
        assert!(round_trip(&command_tx, &reply_rx, Command::Play, Duration::from_secs(5)).is_err());
    }
}
