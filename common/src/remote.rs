use crate::{
    config::{Configuration, RuntimeConfig},
    error::HttpError,
    settings::ConfigSynchronizer,
    telemetry::{TelemetryReporter, TelemetrySample},
    transport::{Dialer, RetryPolicy, Session, Sleeper},
};

/// The API service as seen by the control loop.
pub trait Remote {
    fn fetch_settings(&mut self, current: &Configuration) -> Result<Configuration, HttpError>;
    fn post_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), HttpError>;
}

/// Settings sync and telemetry sharing one HTTP session.
pub struct HttpRemote<D: Dialer, S: Sleeper> {
    session: Session<D, S>,
    settings: ConfigSynchronizer,
    telemetry: TelemetryReporter,
}

impl<D: Dialer, S: Sleeper> HttpRemote<D, S> {
    pub fn new(runtime: &RuntimeConfig, dialer: D, sleeper: S) -> Self {
        Self {
            session: Session::new(
                dialer,
                sleeper,
                RetryPolicy::from_api(&runtime.api),
                runtime.api.endpoint(),
            ),
            settings: ConfigSynchronizer::new(
                &runtime.api,
                &runtime.device,
                runtime.watering.mode,
            ),
            telemetry: TelemetryReporter::new(&runtime.api, &runtime.device),
        }
    }

    pub fn session(&self) -> &Session<D, S> {
        &self.session
    }
}

impl<D: Dialer, S: Sleeper> Remote for HttpRemote<D, S> {
    fn fetch_settings(&mut self, current: &Configuration) -> Result<Configuration, HttpError> {
        self.settings.sync(&mut self.session, current)
    }

    fn post_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), HttpError> {
        self.telemetry.report(&mut self.session, sample)
    }
}

/// Stand-in for builds with no network at all.
pub enum Offline {}

impl Remote for Offline {
    fn fetch_settings(&mut self, _current: &Configuration) -> Result<Configuration, HttpError> {
        match *self {}
    }

    fn post_telemetry(&mut self, _sample: &TelemetrySample) -> Result<(), HttpError> {
        match *self {}
    }
}
