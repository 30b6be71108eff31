use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, telemetry};

pub const FAN_SPEED_MAX: u16 = 1023;
pub const DOOR_ANGLE_MAX: u16 = 180;
pub const WATER_POWER_MAX: u16 = u16::MAX;

/// Remote settings applied to the actuators. Every field is already clamped
/// to its valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub fan_speed: u16,
    pub door_angle: u16,
    pub water_interval_s: Option<u32>,
    pub water_power: u16,
    pub master: bool,
}

impl Configuration {
    pub fn from_static(runtime: &RuntimeConfig) -> Self {
        let mut config = Self {
            fan_speed: 0,
            door_angle: 0,
            water_interval_s: match runtime.watering.mode {
                WateringMode::Remote => Some(runtime.watering.interval_s),
                WateringMode::Manual => None,
            },
            water_power: runtime.watering.power,
            master: false,
        };
        config.sanitize();
        config
    }

    pub fn sanitize(&mut self) {
        self.fan_speed = self.fan_speed.min(FAN_SPEED_MAX);
        self.door_angle = self.door_angle.min(DOOR_ANGLE_MAX);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringMode {
    /// Interval is part of the remote settings document.
    Remote,
    /// No interval; the manual override drives the water output.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub token: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "greenhouse-1".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub https: bool,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// PEM certificate the TLS peer must chain to. When unset the platform's
    /// CA bundle is trusted.
    #[serde(default)]
    pub pinned_cert: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "api.simsva.se".to_string(),
            port: 443,
            base_path: "/wexteras".to_string(),
            https: true,
            retries: 60,
            retry_delay_ms: 100,
            connect_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            pinned_cert: None,
        }
    }
}

impl ApiConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn path(&self, resource: &str) -> String {
        format!("{}/{resource}", self.base_path.trim_end_matches('/'))
    }

    /// The pinned certificate as the NUL-terminated PEM the TLS stack reads.
    pub fn pinned_cert_pem(&self) -> Option<Vec<u8>> {
        let pem = self.pinned_cert.as_deref()?.trim();
        let mut bytes = Vec::with_capacity(pem.len() + 2);
        bytes.extend_from_slice(pem.as_bytes());
        bytes.extend_from_slice(b"\n\0");
        Some(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    pub config_sync_ms: u64,
    pub telemetry_ms: u64,
    pub water_open_ms: u64,
    pub loop_pause_ms: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            config_sync_ms: 1_000,
            telemetry_ms: 1_000,
            water_open_ms: 1_000,
            loop_pause_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WateringConfig {
    pub mode: WateringMode,
    pub interval_s: u32,
    pub power: u16,
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            mode: WateringMode::Remote,
            interval_s: 3_600,
            power: WATER_POWER_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub fallback_fan_speed: u16,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            fallback_fan_speed: FAN_SPEED_MAX / 2 + 1,
        }
    }
}

/// Build-time configuration. Nothing in here changes while the loop runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub api: ApiConfig,
    pub intervals: IntervalConfig,
    pub watering: WateringConfig,
    pub actuators: ActuatorConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.api.retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if let Some(pem) = &self.api.pinned_cert {
            if !self.api.https {
                return Err(ConfigError::PinWithoutTls);
            }
            if !is_pem_certificate(pem) {
                return Err(ConfigError::MalformedPin);
            }
        }
        if !is_form_safe(&self.device.id) {
            return Err(ConfigError::InvalidCredential { field: "device id" });
        }
        if !is_form_safe(&self.device.token) {
            return Err(ConfigError::InvalidCredential {
                field: "device token",
            });
        }

        let needed = telemetry::max_body_len(&self.device);
        if needed > telemetry::TELEMETRY_BODY_CAPACITY {
            return Err(ConfigError::TelemetryBodyTooLarge {
                needed,
                capacity: telemetry::TELEMETRY_BODY_CAPACITY,
            });
        }

        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.actuators.fallback_fan_speed = self.actuators.fallback_fan_speed.min(FAN_SPEED_MAX);
        self.intervals.water_open_ms = self.intervals.water_open_ms.max(1);
    }
}

fn is_pem_certificate(pem: &str) -> bool {
    let pem = pem.trim();
    pem.starts_with("-----BEGIN CERTIFICATE-----")
        && pem.ends_with("-----END CERTIFICATE-----")
        && !pem.contains('\0')
}

// Id and token go into a form body and a query string unescaped.
fn is_form_safe(value: &str) -> bool {
    value
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'))
}
