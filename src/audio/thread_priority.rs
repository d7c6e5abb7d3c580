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

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Default priority for the playback thread when PCMPLAY_THREAD_PRIORITY is unset.
const DEFAULT_PLAYBACK_THREAD_PRIORITY: u8 = 70;

/// Reads PCMPLAY_THREAD_PRIORITY (0-99), falling back to the default when unset or invalid.
pub fn playback_thread_priority() -> ThreadPriorityValue {
    std::env::var("PCMPLAY_THREAD_PRIORITY")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|n| *n < 100)
        .and_then(|n| ThreadPriorityValue::try_from(n).ok())
        .unwrap_or_else(|| ThreadPriorityValue::try_from(DEFAULT_PLAYBACK_THREAD_PRIORITY).unwrap())
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Returns whether we should attempt RT (SCHED_FIFO) scheduling for the playback thread.
/// Default: enabled. Opt out with PCMPLAY_DISABLE_RT_AUDIO=1.
pub fn rt_audio_enabled() -> bool {
    !env_flag("PCMPLAY_DISABLE_RT_AUDIO")
}

/// Raises the priority of the calling thread. Failures are logged and ignored:
/// playback still works at normal priority.
pub fn raise_current_thread_priority(priority: ThreadPriorityValue, rt_audio: bool) {
    let tp = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(tp) {
        warn!(error = %e, "Failed to raise playback thread priority");
    }

    #[cfg(unix)]
    if rt_audio {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        match set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => {
                info!("Enabled RT SCHED_FIFO for playback thread");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to set RT SCHED_FIFO for playback thread"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = rt_audio;
}

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_priority_from_env() {
        let default = ThreadPriorityValue::try_from(DEFAULT_PLAYBACK_THREAD_PRIORITY).unwrap();

        std::env::set_var("PCMPLAY_THREAD_PRIORITY", "42");
        assert_eq!(
            playback_thread_priority(),
            ThreadPriorityValue::try_from(42u8).unwrap()
        );

        std::env::set_var("PCMPLAY_THREAD_PRIORITY", "250");
        assert_eq!(playback_thread_priority(), default);

        std::env::set_var("PCMPLAY_THREAD_PRIORITY", "loud");
        assert_eq!(playback_thread_priority(), default);

        std::env::remove_var("PCMPLAY_THREAD_PRIORITY");
        assert_eq!(playback_thread_priority(), default);
    }

    #[test]
    #[serial]
    fn test_rt_audio_flag() {
        std::env::remove_var("PCMPLAY_DISABLE_RT_AUDIO");
        assert!(rt_audio_enabled());

        std::env::set_var("PCMPLAY_DISABLE_RT_AUDIO", "yes");
        assert!(!rt_audio_enabled());

        std::env::remove_var("PCMPLAY_DISABLE_RT_AUDIO");
    }
}
