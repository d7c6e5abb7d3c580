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
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::PcmDescriptor;
use crate::backend::{BackendState, FillStats, PlaybackBackend};
use crate::buffer::{EndPolicy, LoadedAudio, PcmCursor, StreamLease};
use crate::error::{PlayerError, StateError};
use crate::playsync::CancelHandle;

/// Where a session stands after a round of filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Still feeding the device.
    Playing,
    /// The device played the whole source.
    Drained,
    /// Stopped before the end.
    Stopped,
}

/// One play of a loaded buffer through one backend.
///
/// The session holds the buffer's streaming lease for its whole life and
/// releases the backend when dropped, whatever path it exits through.
pub struct PlaybackSession {
    backend: Arc<dyn PlaybackBackend>,
    cursor: PcmCursor,
    descriptor: PcmDescriptor,
    _lease: StreamLease,
}

impl PlaybackSession {
    /// Creates a session over `loaded`. Fails if the buffer is empty or
    /// already streaming.
    pub fn new(
        loaded: &LoadedAudio,
        backend: Arc<dyn PlaybackBackend>,
        policy: EndPolicy,
    ) -> Result<PlaybackSession, PlayerError> {
        let cursor = loaded
            .cursor(policy)
            .ok_or_else(|| StateError::invalid("empty", "play"))?;
        let lease = loaded.buffer.lease()?;
        Ok(PlaybackSession {
            backend,
            cursor,
            descriptor: loaded.descriptor,
            _lease: lease,
        })
    }

    pub fn backend(&self) -> &Arc<dyn PlaybackBackend> {
        &self.backend
    }

    /// Configures the backend, primes it and starts the device.
    pub fn start(&mut self) -> Result<(), PlayerError> {
        self.backend.configure(&self.descriptor)?;
        let primed = self.backend.enqueue(&mut self.cursor)?;
        debug!(backend = %self.backend.kind(), primed, "Primed backend");
        if let Err(e) = self.backend.play() {
            if self.backend.state() == BackendState::Stopped {
                debug!("Stopped before the device started");
                return Ok(());
            }
            return Err(e);
        }
        info!(
            backend = %self.backend.kind(),
            format = %self.descriptor,
            policy = ?self.cursor.policy(),
            "Playback started"
        );
        Ok(())
    }

    /// Refills whatever room the device has freed.
    pub fn pump(&mut self) -> Result<SessionStatus, PlayerError> {
        self.backend.enqueue(&mut self.cursor)?;
        if matches!(
            self.backend.state(),
            BackendState::Stopped | BackendState::Released
        ) {
            return Ok(SessionStatus::Stopped);
        }
        if self.backend.is_drained() {
            return Ok(SessionStatus::Drained);
        }
        Ok(SessionStatus::Playing)
    }

    /// Fills until the source drains, the backend stops, or `cancel` fires.
    /// Sleeps on the device notifications between rounds, at most one period.
    pub fn run(&mut self, cancel: &CancelHandle) -> Result<SessionStatus, PlayerError> {
        let period = self.backend.period();
        loop {
            if cancel.is_cancelled() {
                self.backend.stop()?;
                return Ok(SessionStatus::Stopped);
            }
            match self.pump()? {
                SessionStatus::Playing => {
                    self.backend.wait(period);
                }
                status => return Ok(status),
            }
        }
    }

    /// Stops the device.
    pub fn stop(&self) -> Result<(), PlayerError> {
        self.backend.stop()
    }

    /// Releases the backend and returns its counters.
    pub fn finish(self) -> Result<FillStats, PlayerError> {
        let stats = self.backend.stats();
        self.backend.release()?;
        info!(
            fills = stats.fills,
            source_bytes = stats.source_bytes,
            padding_bytes = stats.padding_bytes,
            wraps = stats.wraps,
            underruns = stats.underruns,
            "Playback finished"
        );
        Ok(stats)
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        if let Err(e) = self.backend.release() {
            warn!(err = %e, "Unable to release backend");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use super::*;
    use crate::audio::mock;
    use crate::backend::{self, BackendKind, BackendOptions};
    use crate::error::BackendError;
    use crate::testutil::{cd_descriptor, loaded, pattern};

    fn options() -> BackendOptions {
        BackendOptions {
            region_bytes: Some(400),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_to_drain() {
        let source = pattern(40_000);
        let audio = loaded(cd_descriptor(), source.clone());

        for kind in [
            BackendKind::RingBuffer,
            BackendKind::Streaming,
            BackendKind::Simple,
        ] {
            let device =
                Arc::new(mock::Device::get("mock").with_clock(400, Duration::from_millis(1)));
            let backend = backend::create(kind, device.clone(), options());
            let mut session = PlaybackSession::new(&audio, backend, EndPolicy::Stop).unwrap();
            assert!(audio.buffer.is_streaming());

            session.start().unwrap();
            assert_eq!(
                session.run(&CancelHandle::new()).unwrap(),
                SessionStatus::Drained,
                "{} backend",
                kind
            );
            let stats = session.finish().unwrap();
            assert_eq!(stats.source_bytes, 40_000, "{} backend", kind);
            assert!(!audio.buffer.is_streaming());
            assert!(!device.is_bound());
            // A slow fill round lets silence in; only a clean run is comparable.
            if stats.underruns == 0 {
                assert_eq!(&device.rendered()[..40_000], source.as_slice());
            }
        }
    }

    #[test]
    fn test_cancel_stops_run() {
        let audio = loaded(cd_descriptor(), pattern(4_000));
        let device = Arc::new(mock::Device::get("mock"));
        let backend = backend::create(BackendKind::RingBuffer, device.clone(), options());
        let mut session = PlaybackSession::new(&audio, backend, EndPolicy::Loop).unwrap();
        session.start().unwrap();

        let cancel = CancelHandle::new();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let status = session.run(&cancel);
                (status, session.finish())
            })
        };
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        let (status, stats) = join.join().unwrap();
        assert_eq!(status.unwrap(), SessionStatus::Stopped);
        assert!(stats.unwrap().wraps > 0);
        assert!(!device.is_bound());
    }

    #[test]
    fn test_one_session_per_buffer() {
        let audio = loaded(cd_descriptor(), pattern(4_000));
        let device = Arc::new(mock::Device::manual("mock"));
        let first = PlaybackSession::new(
            &audio,
            backend::create(BackendKind::Simple, device.clone(), options()),
            EndPolicy::Stop,
        )
        .unwrap();
        assert!(matches!(
            PlaybackSession::new(
                &audio,
                backend::create(BackendKind::Simple, device.clone(), options()),
                EndPolicy::Stop,
            ),
            Err(PlayerError::Backend(BackendError::AlreadyPlaying))
        ));
        drop(first);
        assert!(!audio.buffer.is_streaming());
    }

    #[test]
    fn test_empty_buffer_cannot_play() {
        let device = Arc::new(mock::Device::manual("mock"));
        let result = PlaybackSession::new(
            &LoadedAudio::empty(),
            backend::create(BackendKind::Simple, device, options()),
            EndPolicy::Stop,
        );
        assert!(matches!(result, Err(PlayerError::State(_))));
    }

    #[test]
    fn test_drop_releases_after_failed_start() {
        let audio = loaded(cd_descriptor(), pattern(4_000));
        let device = Arc::new(mock::Device::manual("mock").failing_play(2));
        let backend = backend::create(BackendKind::RingBuffer, device.clone(), options());
        let mut session = PlaybackSession::new(&audio, backend.clone(), EndPolicy::Stop).unwrap();

        assert!(session.start().is_err());
        assert!(device.is_bound());
        drop(session);
        assert!(!device.is_bound());
        assert_eq!(backend.state(), BackendState::Released);
        assert!(!audio.buffer.is_streaming());
    }
}
