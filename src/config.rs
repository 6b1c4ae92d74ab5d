//! Init-time configuration knobs (`Session::open`'s `InitConfig` argument).
//!
//! Every field here corresponds to one sub-step of `Protocol::init_machine`
//! and mirrors a parameter the vendor configuration tool exposes. Defaults
//! are the vendor tool's own defaults, read off `balor.sender.Sender`'s
//! `_init_machine` call sequence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Init-time parameters for [`crate::engine::Session::open`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub control_mode_s: u16,
    pub control_mode_v: u16,
    pub laser_mode_s: u16,
    pub laser_mode_v: u16,
    pub delay_mode_s: u16,
    pub delay_mode_v: u16,
    pub timing_s: u16,
    pub timing_v: u16,
    pub standby_v1: u16,
    pub standby_v2: u16,
    pub standby_v3: u16,
    pub standby_v: u16,
    pub first_pulse_killer_s: u16,
    pub first_pulse_killer: u16,
    pub pwm_half_period_s: u16,
    pub pwm_half_period: u16,
    pub pwm_pulse_width_s: u16,
    pub pwm_pulse_width: u16,
    pub fpk2_p1: u16,
    pub fpk2_p2: u16,
    pub fpk2_p3: u16,
    pub fpk2_p4: u16,
    pub fly_res_p1: u16,
    pub fly_res_p2: u16,
    pub fly_res_p3: u16,
    pub fly_res_p4: u16,
    /// Settling delay after the last init write. The board needs this
    /// window before it reliably accepts the first real job; shortening it
    /// reproduces intermittent first-job failures.
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,
}

impl Default for InitConfig {
    fn default() -> Self {
        InitConfig {
            control_mode_s: 0,
            control_mode_v: 0,
            laser_mode_s: 1,
            laser_mode_v: 0,
            delay_mode_s: 1,
            delay_mode_v: 0,
            timing_s: 1,
            timing_v: 0,
            standby_v1: 2000,
            standby_v2: 20,
            standby_v3: 0,
            standby_v: 0,
            first_pulse_killer_s: 200,
            first_pulse_killer: 0,
            pwm_half_period_s: 1,
            pwm_half_period: 125,
            pwm_pulse_width_s: 1,
            pwm_pulse_width: 125,
            fpk2_p1: 0x0FFB,
            fpk2_p2: 1,
            fpk2_p3: 409,
            fpk2_p4: 100,
            fly_res_p1: 0,
            fly_res_p2: 99,
            fly_res_p3: 1000,
            fly_res_p4: 25,
            settle_delay: Duration::from_millis(50),
        }
    }
}

impl InitConfig {
    /// Load configuration from a TOML file; unspecified fields fall back to
    /// [`InitConfig::default`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Serialize to TOML, for example to seed a config file with defaults.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("InitConfig always serializes")
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let config = InitConfig::default();
        let text = config.to_toml_string();
        let parsed = InitConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed = InitConfig::from_toml_str("control_mode_v = 7\n").unwrap();
        assert_eq!(parsed.control_mode_v, 7);
        assert_eq!(parsed.standby_v1, InitConfig::default().standby_v1);
    }
}
