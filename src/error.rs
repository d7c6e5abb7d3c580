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
use std::path::PathBuf;

/// Errors produced while reading and decoding a file into memory.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Unable to allocate {0} bytes for audio data")]
    AllocationFailed(usize),
}

/// Errors produced by playback backends and the devices underneath them.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio format rejected by device: {0}")]
    FormatRejected(String),

    #[error("Audio buffer is already playing")]
    AlreadyPlaying,

    #[error("Unable to allocate the device buffer: {0}")]
    BufferAllocation(String),

    #[error("Device resources were not released: {0}")]
    ResourceLeak(String),
}

/// An operation was attempted from a state that doesn't allow it.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
}

/// Umbrella error for the player and the playback pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Playback thread panicked")]
    ThreadPanicked,
}

impl StateError {
    pub(crate) fn invalid(from: &'static str, action: &'static str) -> StateError {
        StateError::InvalidTransition { from, action }
    }
}
