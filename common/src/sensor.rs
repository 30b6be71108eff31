use crate::{error::SensorError, telemetry::TelemetrySample};

/// Temperature/humidity probe. Accessors are only meaningful after a
/// successful `measure`.
pub trait Hygrometer {
    fn measure(&mut self) -> Result<(), SensorError>;
    fn temperature(&self) -> f32;
    fn humidity(&self) -> f32;
}

pub struct SensorSampler<H> {
    sensor: H,
    last: Option<TelemetrySample>,
}

impl<H: Hygrometer> SensorSampler<H> {
    pub fn new(sensor: H) -> Self {
        Self { sensor, last: None }
    }

    /// Takes a fresh reading. A failed measurement leaves the cached sample
    /// untouched.
    pub fn sample(&mut self) -> Result<TelemetrySample, SensorError> {
        self.sensor.measure()?;
        let sample = TelemetrySample {
            temperature: self.sensor.temperature(),
            humidity: self.sensor.humidity(),
        };
        self.last = Some(sample);
        Ok(sample)
    }

    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.last
    }
}
