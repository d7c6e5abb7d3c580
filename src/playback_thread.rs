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

//! Runs a playback session on its own high priority thread.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{error, span, warn, Level};

use crate::audio::thread_priority::{
    playback_thread_priority, raise_current_thread_priority, rt_audio_enabled,
};
use crate::backend::{FillStats, PlaybackBackend};
use crate::buffer::{EndPolicy, LoadedAudio};
use crate::error::{BackendError, PlayerError};
use crate::playsync::CancelHandle;
use crate::session::{PlaybackSession, SessionStatus};

/// How a playback thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackOutcome {
    pub status: SessionStatus,
    pub stats: FillStats,
}

/// Sets the finished flag and wakes waiters however the thread exits.
struct FinishGuard {
    finished: Arc<AtomicBool>,
    cancel: CancelHandle,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
        self.cancel.notify();
    }
}

pub struct PlaybackThread;

impl PlaybackThread {
    /// Starts playing `loaded` through `backend` on a new thread.
    ///
    /// The buffer's streaming lease is taken before the thread starts, so a
    /// second call for the same buffer fails with `AlreadyPlaying` right away.
    pub fn begin(
        loaded: &LoadedAudio,
        backend: Arc<dyn PlaybackBackend>,
        policy: EndPolicy,
    ) -> Result<PlaybackHandle, PlayerError> {
        let session = PlaybackSession::new(loaded, backend.clone(), policy)?;
        let cancel = CancelHandle::new();
        let finished = Arc::new(AtomicBool::new(false));
        let priority = playback_thread_priority();
        let rt_audio = rt_audio_enabled();

        let join = {
            let cancel = cancel.clone();
            let finished = finished.clone();
            thread::Builder::new()
                .name("pcmplay-playback".to_string())
                .spawn(move || -> Result<PlaybackOutcome, PlayerError> {
                    let _finish = FinishGuard {
                        finished,
                        cancel: cancel.clone(),
                    };
                    // Declared after the guard so the session is released first.
                    let mut session = session;
                    raise_current_thread_priority(priority, rt_audio);

                    let span = span!(Level::INFO, "playback thread");
                    let _enter = span.enter();

                    session.start()?;
                    let status = session.run(&cancel)?;
                    let stats = session.finish()?;
                    Ok(PlaybackOutcome { status, stats })
                })
                .map_err(|e| BackendError::DeviceUnavailable(e.to_string()))?
        };

        Ok(PlaybackHandle {
            cancel,
            finished,
            backend,
            join: Some(join),
        })
    }
}

/// Controls a running playback thread. Dropping the handle stops the thread
/// and waits for it, unless it was detached.
pub struct PlaybackHandle {
    cancel: CancelHandle,
    finished: Arc<AtomicBool>,
    backend: Arc<dyn PlaybackBackend>,
    join: Option<JoinHandle<Result<PlaybackOutcome, PlayerError>>>,
}

impl PlaybackHandle {
    /// The backend the thread is feeding.
    pub fn backend(&self) -> &Arc<dyn PlaybackBackend> {
        &self.backend
    }

    /// Asks the thread to stop. Returns immediately.
    pub fn request_stop(&self) {
        self.cancel.cancel();
        // The backend may not be configured yet, in which case the cancel is
        // picked up once the fill loop starts.
        let _ = self.backend.stop();
    }

    /// Returns true once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Waits up to `timeout` for the thread to exit or be cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.cancel.wait(&self.finished, timeout)
    }

    /// Waits for the thread and returns how it ended.
    pub fn join(mut self) -> Result<PlaybackOutcome, PlayerError> {
        match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|_| {
                error!("Playback thread panicked");
                Err(PlayerError::ThreadPanicked)
            }),
            None => Err(PlayerError::ThreadPanicked),
        }
    }

    /// Lets the thread run to completion on its own.
    pub fn detach(mut self) {
        self.join.take();
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.request_stop();
            match join.join() {
                Ok(Err(e)) => warn!(err = %e, "Playback thread failed"),
                Err(_) => error!("Playback thread panicked"),
                Ok(Ok(_)) => {}
            }
        }
    }
}
