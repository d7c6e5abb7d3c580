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
use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, File};
use duration_string::DurationString;
use serde::Deserialize;

use super::error::ConfigError;
use crate::audio::SampleFormat;
use crate::backend::{
    BackendOptions, EndPolicy, PreferredBackend, DEFAULT_CONFIGURE_TIMEOUT, DEFAULT_NOTIFY_PERIOD,
    DEFAULT_REGION_COUNT, MAX_NOTIFY_PERIOD,
};
use crate::player::PlayerSettings;

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

/// A YAML representation of the playback configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Playback {
    /// The output device. Names starting with "mock" select the mock device.
    device: Option<String>,

    /// Preferred backend: ring, streaming, simple or auto.
    backend: Option<String>,

    /// Loop back to the start instead of stopping at the end.
    loop_on_end: Option<bool>,

    /// Run ring buffer playback on its own thread.
    playback_thread: Option<bool>,

    /// Duration of one ring region, e.g. "25ms".
    notify_period: Option<String>,

    /// Number of regions in the ring (2 to 8).
    region_count: Option<usize>,

    /// How long to wait for the device to open a stream.
    configure_timeout: Option<String>,

    /// Device side sample format (default: "int").
    sample_format: Option<String>,

    /// Device side integer width (default: 16).
    bits_per_sample: Option<u16>,
}

fn parse_duration(
    key: &str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))?
            .into()),
        None => Ok(default),
    }
}

impl Playback {
    /// New will create a playback configuration for the given device.
    pub fn new(device: &str) -> Playback {
        Playback {
            device: Some(device.to_string()),
            ..Default::default()
        }
    }

    /// Parse a playback configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Playback, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Playback>()?)
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn set_device(&mut self, device: &str) {
        self.device = Some(device.to_string());
    }

    /// Returns the preferred backend (default: auto).
    pub fn backend(&self) -> Result<PreferredBackend, ConfigError> {
        match self.backend.as_deref() {
            Some(backend) => PreferredBackend::from_str(backend).map_err(ConfigError::Invalid),
            None => Ok(PreferredBackend::Auto),
        }
    }

    pub fn set_backend(&mut self, backend: &str) {
        self.backend = Some(backend.to_string());
    }

    /// Returns whether playback loops at the end (default: false).
    pub fn loop_on_end(&self) -> bool {
        self.loop_on_end.unwrap_or(false)
    }

    pub fn set_loop_on_end(&mut self, loop_on_end: bool) {
        self.loop_on_end = Some(loop_on_end);
    }

    /// Returns whether ring buffer playback runs on its own thread (default: true).
    pub fn playback_thread(&self) -> bool {
        self.playback_thread.unwrap_or(true)
    }

    pub fn set_playback_thread(&mut self, playback_thread: bool) {
        self.playback_thread = Some(playback_thread);
    }

    /// Returns the region duration (default: 25ms, at most 1s).
    pub fn notify_period(&self) -> Result<Duration, ConfigError> {
        let period = parse_duration("notify_period", &self.notify_period, DEFAULT_NOTIFY_PERIOD)?;
        if period.is_zero() {
            return Err(ConfigError::Invalid(
                "notify_period must be greater than zero".to_string(),
            ));
        }
        if period > MAX_NOTIFY_PERIOD {
            return Err(ConfigError::Invalid(format!(
                "notify_period of {:?} is longer than {:?}",
                period, MAX_NOTIFY_PERIOD
            )));
        }
        Ok(period)
    }

    /// Returns the number of ring regions (default: 4). Backends clamp it to 2..=8.
    pub fn region_count(&self) -> usize {
        self.region_count.unwrap_or(DEFAULT_REGION_COUNT)
    }

    /// Returns the bound on opening the device (default: 2s).
    pub fn configure_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "configure_timeout",
            &self.configure_timeout,
            DEFAULT_CONFIGURE_TIMEOUT,
        )
    }

    /// Returns the device side sample format (default: int).
    pub fn sample_format(&self) -> Result<SampleFormat, String> {
        match self.sample_format.as_deref() {
            Some(format) => SampleFormat::from_str(format),
            None => Ok(SampleFormat::Int),
        }
    }

    /// Returns the device side integer width (default: 16).
    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample.unwrap_or(DEFAULT_BITS_PER_SAMPLE)
    }

    /// Resolves the configuration into player settings.
    pub fn to_settings(&self) -> Result<PlayerSettings, ConfigError> {
        self.sample_format().map_err(ConfigError::Invalid)?;
        Ok(PlayerSettings {
            preferred: self.backend()?,
            policy: EndPolicy::from_loop_on_end(self.loop_on_end()),
            playback_thread: self.playback_thread(),
            backend: BackendOptions {
                notify_period: self.notify_period()?,
                region_count: self.region_count(),
                region_bytes: None,
                configure_timeout: self.configure_timeout()?,
            },
        })
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use config::FileFormat;

    use super::*;

    fn parse(yaml: &str) -> Playback {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let playback = parse("{}");
        assert_eq!(playback.device(), "default");

        let settings = playback.to_settings().unwrap();
        assert_eq!(settings.preferred, PreferredBackend::Auto);
        assert_eq!(settings.policy, EndPolicy::Stop);
        assert!(settings.playback_thread);
        assert_eq!(settings.backend, BackendOptions::default());
        assert_eq!(settings.backend.notify_period, DEFAULT_NOTIFY_PERIOD);
        assert_eq!(settings.backend.region_count, DEFAULT_REGION_COUNT);
        assert_eq!(settings.backend.configure_timeout, DEFAULT_CONFIGURE_TIMEOUT);
        assert_eq!(playback.sample_format(), Ok(SampleFormat::Int));
        assert_eq!(playback.bits_per_sample(), 16);
    }

    #[test]
    fn test_full_config() {
        let playback = parse(
            r#"
            device: mock-device
            backend: streaming
            loop_on_end: true
            playback_thread: false
            notify_period: 50ms
            region_count: 6
            configure_timeout: 500ms
            sample_format: float
            bits_per_sample: 32
        "#,
        );

        assert_eq!(playback.device(), "mock-device");
        assert_eq!(playback.sample_format(), Ok(SampleFormat::Float));
        assert_eq!(playback.bits_per_sample(), 32);

        let settings = playback.to_settings().unwrap();
        assert_eq!(settings.preferred, PreferredBackend::Streaming);
        assert_eq!(settings.policy, EndPolicy::Loop);
        assert!(!settings.playback_thread);
        assert_eq!(settings.backend.notify_period, Duration::from_millis(50));
        assert_eq!(settings.backend.region_count, 6);
        assert_eq!(
            settings.backend.configure_timeout,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse("backend: directsound").to_settings().is_err());
        assert!(parse("notify_period: soon").to_settings().is_err());
        assert!(parse("notify_period: 0ms").to_settings().is_err());
        assert!(matches!(
            parse("notify_period: 100000h").to_settings(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(parse("notify_period: 1001ms").to_settings().is_err());
        assert_eq!(
            parse("notify_period: 1s").notify_period().unwrap(),
            MAX_NOTIFY_PERIOD
        );
        assert!(parse("sample_format: double").to_settings().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut playback = Playback::new("mock");
        playback.set_backend("simple");
        playback.set_loop_on_end(true);
        playback.set_playback_thread(false);

        let settings = playback.to_settings().unwrap();
        assert_eq!(playback.device(), "mock");
        assert_eq!(settings.preferred, PreferredBackend::Simple);
        assert_eq!(settings.policy, EndPolicy::Loop);
        assert!(!settings.playback_thread);
    }

    #[test]
    fn test_deserialize_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pcmplay.yaml");
        std::fs::write(&path, "device: mock\nregion_count: 3\n")?;

        let playback = Playback::deserialize(&path)?;
        assert_eq!(playback.device(), "mock");
        assert_eq!(playback.region_count(), 3);

        assert!(Playback::deserialize(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
