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

//! The player ties a loaded buffer, a device and a backend together and is
//! what a shell drives: load, play, tick, stop, release.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing::{info, span, warn, Level};

use crate::audio::{self, Device, PcmDescriptor};
use crate::backend::{
    self, BackendKind, BackendOptions, EndPolicy, FillStats, PlaybackBackend, PreferredBackend,
};
use crate::buffer::LoadedAudio;
use crate::config;
use crate::error::{BackendError, PlayerError, StateError};
use crate::loader::FileLoader;
use crate::playback_thread::{PlaybackHandle, PlaybackThread};
use crate::session::{PlaybackSession, SessionStatus};
use crate::util::{duration_minutes_seconds, filename_display, kilobytes};

/// How the player chooses and drives its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerSettings {
    pub preferred: PreferredBackend,
    pub policy: EndPolicy,
    /// Run ring buffer playback on its own thread instead of from `tick`.
    pub playback_thread: bool,
    pub backend: BackendOptions,
}

/// What `tick` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    /// Nothing is playing.
    Idle,
    /// Playback is in progress.
    Playing,
    /// Playback ended since the last tick.
    Finished(FillStats),
}

/// Diagnostic details about the loaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub data_size: usize,
    pub descriptor: PcmDescriptor,
    pub duration: Duration,
}

impl PlayerInfo {
    /// Describes `loaded`, or returns None if nothing is loaded.
    pub fn of(loaded: &LoadedAudio) -> Option<PlayerInfo> {
        if !loaded.is_loaded() {
            return None;
        }
        let buffer = &loaded.buffer;
        Some(PlayerInfo {
            path: buffer.path().to_path_buf(),
            file_size: buffer.file_size(),
            data_size: buffer.len(),
            descriptor: loaded.descriptor,
            duration: loaded.descriptor.duration_of(buffer.len()),
        })
    }
}

impl fmt::Display for PlayerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File path: {}", self.path.display())?;
        writeln!(f, "File name: {}", filename_display(&self.path))?;
        writeln!(f, "File size: {}KB", kilobytes(self.data_size as u64))?;
        writeln!(f, "Sample channels: {}", self.descriptor.channels)?;
        writeln!(f, "Sample rate: {}", self.descriptor.sample_rate)?;
        writeln!(f, "Bits: {}", self.descriptor.bits_per_sample)?;
        write!(f, "Duration: {}", duration_minutes_seconds(self.duration))
    }
}

enum Active {
    /// Filled from `tick` on the caller's thread.
    Session(PlaybackSession),
    /// Filled by a playback thread.
    Thread(PlaybackHandle),
}

/// Owns the loaded audio and the current playback, if any.
pub struct Player {
    device: Arc<dyn Device>,
    settings: PlayerSettings,
    loader: FileLoader,
    slot: LoadedAudio,
    active: Option<Active>,
}

impl Player {
    pub fn new(device: Arc<dyn Device>, settings: PlayerSettings) -> Player {
        Player::with_loader(device, settings, FileLoader::default())
    }

    pub fn with_loader(
        device: Arc<dyn Device>,
        settings: PlayerSettings,
        loader: FileLoader,
    ) -> Player {
        Player {
            device,
            settings,
            loader,
            slot: LoadedAudio::empty(),
            active: None,
        }
    }

    /// Creates a player from a playback configuration.
    pub fn from_config(config: &config::Playback) -> Result<Player, Box<dyn std::error::Error>> {
        let settings = config.to_settings()?;
        let device = audio::get_device(config)?;
        info!(device = %device, "Using audio device");
        Ok(Player::new(device, settings))
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Loads `path`, replacing the current buffer. Fails without touching the
    /// current buffer while it is still playing.
    pub fn load(&mut self, path: &Path) -> Result<(), PlayerError> {
        if let Err(e) = self.tick() {
            warn!(err = %e, "Playback ended with an error");
        }
        if self.is_playing() {
            return Err(StateError::invalid("playing", "load").into());
        }
        self.active = None;
        self.loader.reload(&mut self.slot, path)
    }

    /// Returns true if a buffer is loaded.
    pub fn is_loaded(&self) -> bool {
        self.slot.is_loaded()
    }

    /// Starts playing the loaded buffer.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        if self.is_playing() {
            return Err(BackendError::AlreadyPlaying.into());
        }
        if !self.slot.is_loaded() {
            return Err(StateError::invalid("empty", "play").into());
        }
        self.active = None;

        let span = span!(Level::INFO, "play", path = %self.slot.buffer.path().display());
        let _enter = span.enter();

        let kinds = backend::candidates(self.settings.preferred, self.device.capabilities());
        if kinds.is_empty() {
            return Err(BackendError::DeviceUnavailable(format!(
                "{} can't drive the {:?} backend",
                self.device.name(),
                self.settings.preferred
            ))
            .into());
        }

        if self.settings.playback_thread && kinds[0] == BackendKind::RingBuffer {
            let backend = self.backend(BackendKind::RingBuffer);
            let handle = PlaybackThread::begin(&self.slot, backend, self.settings.policy)?;
            self.active = Some(Active::Thread(handle));
            return Ok(());
        }

        let last = kinds.len() - 1;
        for (i, kind) in kinds.into_iter().enumerate() {
            let mut session =
                PlaybackSession::new(&self.slot, self.backend(kind), self.settings.policy)?;
            match session.start() {
                Ok(()) => {
                    self.active = Some(Active::Session(session));
                    return Ok(());
                }
                Err(PlayerError::Backend(e)) if i < last => {
                    warn!(
                        err = %e,
                        backend = %kind,
                        "Backend failed to start, trying the next one"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(BackendError::DeviceUnavailable(format!(
            "no backend could start on {}",
            self.device.name()
        ))
        .into())
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn PlaybackBackend> {
        backend::create(kind, self.device.clone(), self.settings.backend)
    }

    /// Advances playback. Synchronous sessions are refilled here; threaded
    /// playback is only checked for completion.
    pub fn tick(&mut self) -> Result<PlayerStatus, PlayerError> {
        let status = match self.active.as_mut() {
            None => return Ok(PlayerStatus::Idle),
            Some(Active::Session(session)) => match session.pump() {
                Ok(SessionStatus::Playing) => return Ok(PlayerStatus::Playing),
                Ok(_) => None,
                Err(e) => Some(e),
            },
            Some(Active::Thread(handle)) => {
                if !handle.is_finished() {
                    return Ok(PlayerStatus::Playing);
                }
                None
            }
        };

        let finished = self.active.take();
        if let Some(e) = status {
            return Err(e);
        }
        let stats = match finished {
            Some(Active::Session(session)) => session.finish()?,
            Some(Active::Thread(handle)) => handle.join()?.stats,
            None => FillStats::default(),
        };
        Ok(PlayerStatus::Finished(stats))
    }

    /// Blocks until the device wants more data or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        match self.active.as_ref() {
            Some(Active::Session(session)) => {
                session.backend().wait(timeout);
            }
            Some(Active::Thread(handle)) => {
                handle.wait(timeout);
            }
            None => {}
        }
    }

    /// Returns true while a playback is in progress.
    pub fn is_playing(&self) -> bool {
        match self.active.as_ref() {
            None => false,
            Some(Active::Session(session)) => {
                let backend = session.backend();
                backend.state() == backend::BackendState::Playing && !backend.is_drained()
            }
            Some(Active::Thread(handle)) => !handle.is_finished(),
        }
    }

    /// The backend of the current playback.
    pub fn active_backend(&self) -> Option<&Arc<dyn PlaybackBackend>> {
        match self.active.as_ref()? {
            Active::Session(session) => Some(session.backend()),
            Active::Thread(handle) => Some(handle.backend()),
        }
    }

    /// Stops the current playback and releases its backend. Does nothing when
    /// idle.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        match self.active.take() {
            None => Ok(()),
            Some(Active::Session(session)) => {
                session.stop()?;
                session.finish().map(|_| ())
            }
            Some(Active::Thread(handle)) => {
                handle.request_stop();
                handle.join().map(|_| ())
            }
        }
    }

    /// Stops playback and frees the loaded buffer.
    pub fn release(&mut self) -> Result<(), PlayerError> {
        let stopped = self.stop();
        self.slot.release();
        stopped
    }

    /// Details about the loaded file, if any.
    pub fn info(&self) -> Option<PlayerInfo> {
        PlayerInfo::of(&self.slot)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(err = %e, "Error stopping playback");
        }
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use super::*;
    use crate::audio::{mock, Capabilities};
    use crate::testutil::write_wav_i16;

    fn settings(preferred: PreferredBackend, playback_thread: bool) -> PlayerSettings {
        PlayerSettings {
            preferred,
            policy: EndPolicy::Stop,
            playback_thread,
            backend: BackendOptions {
                region_bytes: Some(400),
                ..Default::default()
            },
        }
    }

    fn wav(dir: &Path, name: &str, frames: usize) -> Result<PathBuf, Box<dyn Error>> {
        let path = dir.join(name);
        let samples: Vec<i16> = (0..frames * 2).map(|i| (i % 1000) as i16).collect();
        write_wav_i16(&path, 2, 44_100, &samples)?;
        Ok(path)
    }

    fn run_to_end(player: &mut Player) -> FillStats {
        loop {
            match player.tick().unwrap() {
                PlayerStatus::Playing => player.wait(Duration::from_millis(10)),
                PlayerStatus::Finished(stats) => return stats,
                PlayerStatus::Idle => panic!("Player went idle without finishing"),
            }
        }
    }

    #[test]
    fn test_play_on_thread() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 5_000)?;
        let device = Arc::new(mock::Device::get("mock").with_clock(400, Duration::from_millis(1)));
        let mut player = Player::new(device.clone(), settings(PreferredBackend::Auto, true));

        player.load(&path)?;
        player.play()?;
        assert_eq!(
            player.active_backend().map(|b| b.kind()),
            Some(BackendKind::RingBuffer)
        );

        let stats = run_to_end(&mut player);
        assert_eq!(stats.source_bytes, 20_000);
        assert_eq!(player.tick()?, PlayerStatus::Idle);
        assert!(!device.is_bound());
        Ok(())
    }

    #[test]
    fn test_play_from_tick() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 5_000)?;

        for preferred in [
            PreferredBackend::Ring,
            PreferredBackend::Streaming,
            PreferredBackend::Simple,
        ] {
            let device =
                Arc::new(mock::Device::get("mock").with_clock(400, Duration::from_millis(1)));
            let mut player = Player::new(device.clone(), settings(preferred, false));
            player.load(&path)?;
            player.play()?;
            assert!(player.is_playing());

            let stats = run_to_end(&mut player);
            assert_eq!(stats.source_bytes, 20_000, "{:?}", preferred);
            assert!(!player.is_playing());
            assert!(!device.is_bound());
        }
        Ok(())
    }

    #[test]
    fn test_auto_falls_back() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 1_000)?;
        let device = Arc::new(mock::Device::manual("mock").failing_play(2));
        let mut player = Player::new(device.clone(), settings(PreferredBackend::Auto, false));

        player.load(&path)?;
        player.play()?;
        assert_eq!(
            player.active_backend().map(|b| b.kind()),
            Some(BackendKind::Streaming)
        );
        assert_eq!(device.streams_opened(), 2);
        player.stop()?;
        assert!(!device.is_bound());
        Ok(())
    }

    #[test]
    fn test_capabilities_select_backend() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 1_000)?;
        let device = Arc::new(mock::Device::manual("mock").with_capabilities(Capabilities {
            ring_buffer: false,
            streaming: false,
        }));

        let mut player = Player::new(device.clone(), settings(PreferredBackend::Ring, true));
        player.load(&path)?;
        assert!(matches!(
            player.play(),
            Err(PlayerError::Backend(BackendError::DeviceUnavailable(_)))
        ));

        let mut player = Player::new(device.clone(), settings(PreferredBackend::Auto, true));
        player.load(&path)?;
        player.play()?;
        assert_eq!(
            player.active_backend().map(|b| b.kind()),
            Some(BackendKind::Simple)
        );
        player.release()?;
        Ok(())
    }

    #[test]
    fn test_load_while_playing_is_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let first = wav(dir.path(), "first.wav", 1_000)?;
        let second = wav(dir.path(), "second.wav", 500)?;
        let device = Arc::new(mock::Device::manual("mock"));
        let mut player = Player::new(device.clone(), settings(PreferredBackend::Ring, false));

        player.load(&first)?;
        player.play()?;
        assert!(matches!(player.load(&second), Err(PlayerError::State(_))));
        assert_eq!(player.info().map(|info| info.data_size), Some(4_000));

        player.stop()?;
        player.load(&second)?;
        assert_eq!(player.info().map(|info| info.data_size), Some(2_000));
        Ok(())
    }

    #[test]
    fn test_play_twice_is_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 1_000)?;
        let device = Arc::new(mock::Device::manual("mock"));
        let mut player = Player::new(device, settings(PreferredBackend::Ring, true));

        player.load(&path)?;
        player.play()?;
        assert!(matches!(
            player.play(),
            Err(PlayerError::Backend(BackendError::AlreadyPlaying))
        ));
        player.stop()?;
        player.stop()?;
        Ok(())
    }

    #[test]
    fn test_play_without_load() {
        let device = Arc::new(mock::Device::manual("mock"));
        let mut player = Player::new(device, settings(PreferredBackend::Auto, false));
        assert!(matches!(player.play(), Err(PlayerError::State(_))));
        assert!(player.info().is_none());
        assert_eq!(player.tick().unwrap(), PlayerStatus::Idle);
    }

    #[test]
    fn test_release() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 1_000)?;
        let device = Arc::new(mock::Device::get("mock"));
        let mut player = Player::new(device.clone(), settings(PreferredBackend::Ring, true));

        player.load(&path)?;
        player.play()?;
        player.release()?;
        player.release()?;
        assert!(!player.is_loaded());
        assert!(!device.is_bound());
        Ok(())
    }

    #[test]
    fn test_drop_stops_playback() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 1_000)?;
        let device = Arc::new(mock::Device::manual("mock"));
        {
            let mut player = Player::new(device.clone(), settings(PreferredBackend::Ring, false));
            player.load(&path)?;
            player.play()?;
            assert!(device.is_playing());
        }
        assert!(!device.is_bound());
        assert!(!device.is_open());
        Ok(())
    }

    #[test]
    fn test_info() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = wav(dir.path(), "song.wav", 44_100)?;
        let device = Arc::new(mock::Device::manual("mock"));
        let mut player = Player::new(device, PlayerSettings::default());
        player.load(&path)?;

        let info = player.info().unwrap();
        assert_eq!(info.data_size, 176_400);
        assert_eq!(info.duration, Duration::from_secs(1));
        let text = info.to_string();
        assert!(text.contains("File name: song.wav"));
        assert!(text.contains("File size: 172KB"));
        assert!(text.contains("Sample channels: 2"));
        assert!(text.contains("Sample rate: 44100"));
        assert!(text.contains("Bits: 16"));
        assert!(text.contains("Duration: 0:01"));
        Ok(())
    }
}
