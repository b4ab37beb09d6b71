//! Session configuration, loaded from an optional TOML file

use std::path::Path;
use std::time::Duration;

use cmsisdebug_engine::SwdConfig;
use serde::{Deserialize, Serialize};

use crate::classify::KNOWN_PROBE_VENDORS;
use crate::SessionError;

/// Longest nRESET pulse a CMSIS-DAP probe times for us
pub const MAX_RESET_PULSE_MS: u64 = 3000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub swd: SwdSection,
    pub reset: ResetSection,
    pub probe: ProbeSection,
    pub usb: UsbSection,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwdSection {
    pub clock_hz: u32,
    pub idle_cycles: u8,
    pub wait_retry: u16,
    pub match_retry: u16,
    /// Raw DAP_SWD_Configure byte: turnaround in bits 1:0, data phase in bit 2
    pub swd_configure: u8,
}

impl Default for SwdSection {
    fn default() -> Self {
        Self {
            clock_hz: 100_000,
            idle_cycles: 0,
            wait_retry: 64,
            match_retry: 0,
            swd_configure: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResetSection {
    pub pulse_ms: u64,
}

impl Default for ResetSection {
    fn default() -> Self {
        Self { pulse_ms: 100 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSection {
    pub allowed_vendors: Vec<u16>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            allowed_vendors: KNOWN_PROBE_VENDORS.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsbSection {
    pub timeout_ms: u64,
}

impl Default for UsbSection {
    fn default() -> Self {
        Self { timeout_ms: 1000 }
    }
}

impl SessionConfig {
    /// Loads and validates `path`, or returns the defaults when there is none
    pub fn load(path: Option<&Path>) -> Result<Self, SessionError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("reading {}: {e}", path.display())))?;
        let config = Self::from_toml(&content)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, SessionError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SessionError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, SessionError> {
        toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.swd.clock_hz == 0 {
            return Err(SessionError::Config("swd.clock_hz must be > 0".into()));
        }
        if self.probe.allowed_vendors.is_empty() {
            return Err(SessionError::Config(
                "probe.allowed_vendors must not be empty".into(),
            ));
        }
        if self.reset.pulse_ms > MAX_RESET_PULSE_MS {
            log::warn!(
                "reset.pulse_ms = {} exceeds {MAX_RESET_PULSE_MS}, clamping",
                self.reset.pulse_ms
            );
        }
        Ok(())
    }

    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb.timeout_ms)
    }

    pub fn swd_config(&self) -> SwdConfig {
        SwdConfig {
            clock_hz: self.swd.clock_hz,
            idle_cycles: self.swd.idle_cycles,
            wait_retry: self.swd.wait_retry,
            match_retry: self.swd.match_retry,
            swd_configure: self.swd.swd_configure,
            reset_pulse: Duration::from_millis(self.reset.pulse_ms.min(MAX_RESET_PULSE_MS)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.swd_config(), SwdConfig::default());
        assert_eq!(config.probe.allowed_vendors, vec![0xC251, 0x0D28, 0x03EB]);
        assert_eq!(config.usb_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = SessionConfig::from_toml(
            r#"
            [swd]
            clock_hz = 1000000

            [reset]
            pulse_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.swd.clock_hz, 1_000_000);
        assert_eq!(config.swd.wait_retry, 64);
        assert_eq!(config.swd_config().reset_pulse, Duration::from_millis(3000));
        assert_eq!(config.usb.timeout_ms, 1000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            SessionConfig::from_toml("[swd]\nclock_hz = 0\n"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml("[probe]\nallowed_vendors = []\n"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml("[swd]\nspeed = 3\n"),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn serialized_config_loads_back() {
        let mut config = SessionConfig::default();
        config.probe.allowed_vendors.push(0x1366);
        let text = config.to_toml().unwrap();
        assert_eq!(SessionConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(SessionConfig::load(None).unwrap(), SessionConfig::default());
    }
}
