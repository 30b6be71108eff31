use log::debug;
use serde::Deserialize;

use crate::{
    buffer::BoundedBuffer,
    codec::{self, ResponseReader},
    config::{
        ApiConfig, Configuration, DeviceConfig, WateringMode, DOOR_ANGLE_MAX, FAN_SPEED_MAX,
        WATER_POWER_MAX,
    },
    error::HttpError,
    transport::{Dialer, Session, Sleeper},
};

pub const SETTINGS_BODY_CAPACITY: usize = 256;

const BASE_FIELDS: &str = "rpm,door,master,water";
const INTERVAL_FIELD: &str = "interval";

/// Settings object as served by the API. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub rpm: Option<f64>,
    #[serde(default)]
    pub door: Option<f64>,
    #[serde(default)]
    pub master: Option<bool>,
    #[serde(default)]
    pub water: Option<f64>,
    #[serde(default)]
    pub interval: Option<f64>,
}

impl SettingsDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, HttpError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Builds the replacement configuration. Absent numbers read as zero and
    /// an absent `master` as false; an absent interval keeps the current one.
    pub fn to_configuration(&self, current: &Configuration, mode: WateringMode) -> Configuration {
        let water_interval_s = match mode {
            WateringMode::Manual => None,
            WateringMode::Remote => self
                .interval
                .map(|raw| clamp_raw(raw, u32::MAX.into()) as u32)
                .or(current.water_interval_s),
        };

        Configuration {
            fan_speed: clamp_raw(self.rpm.unwrap_or_default(), FAN_SPEED_MAX.into()) as u16,
            door_angle: clamp_raw(self.door.unwrap_or_default(), DOOR_ANGLE_MAX.into()) as u16,
            water_interval_s,
            water_power: clamp_raw(self.water.unwrap_or_default(), WATER_POWER_MAX.into()) as u16,
            master: self.master.unwrap_or(false),
        }
    }
}

fn clamp_raw(raw: f64, max: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, max)
}

pub struct ConfigSynchronizer {
    host: String,
    path: String,
    mode: WateringMode,
}

impl ConfigSynchronizer {
    pub fn new(api: &ApiConfig, device: &DeviceConfig, mode: WateringMode) -> Self {
        let fields = match mode {
            WateringMode::Remote => format!("{BASE_FIELDS},{INTERVAL_FIELD}"),
            WateringMode::Manual => BASE_FIELDS.to_string(),
        };
        Self {
            host: api.host.clone(),
            path: format!("{}?id={}&fields={fields}", api.path("settings"), device.id),
            mode,
        }
    }

    pub fn request_path(&self) -> &str {
        &self.path
    }

    /// Fetches settings and returns the configuration that replaces `current`.
    /// On any failure `current` stays authoritative.
    pub fn sync<D: Dialer, S: Sleeper>(
        &self,
        session: &mut Session<D, S>,
        current: &Configuration,
    ) -> Result<Configuration, HttpError> {
        let document = session.exchange(|conn| {
            codec::write_get(conn, &self.host, &self.path)?;

            let mut reader = ResponseReader::new(conn);
            reader.expect_status_ok()?;
            let framing = reader.read_headers()?;

            let mut body = BoundedBuffer::<SETTINGS_BODY_CAPACITY>::new();
            reader.read_body(framing, &mut body)?;
            debug!("settings body: {}", String::from_utf8_lossy(body.as_bytes()));

            SettingsDocument::parse(body.as_bytes())
        })?;

        Ok(document.to_configuration(current, self.mode))
    }
}
