pub mod actuator;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod manual;
pub mod remote;
pub mod scheduler;
pub mod sensor;
pub mod settings;
pub mod tcp;
pub mod telemetry;
pub mod transport;
pub mod watering;

#[cfg(test)]
mod testing;

pub use actuator::{ActuatorController, ActuatorLevels, Outputs};
pub use buffer::BoundedBuffer;
pub use config::{Configuration, RuntimeConfig, WateringMode};
pub use error::{ConfigError, FailureClass, HttpError, LineKind, SensorError};
pub use manual::{status_line, ManualOverride};
pub use remote::{HttpRemote, Offline, Remote};
pub use scheduler::{
    Clock, ControlLoop, IterationReport, MonotonicClock, PeriodicTask, SampleOutcome, SyncOutcome,
};
pub use sensor::{Hygrometer, SensorSampler};
pub use tcp::{TcpConnection, TcpDialer};
pub use telemetry::TelemetrySample;
pub use transport::{Connection, Dialer, Session, Sleeper, ThreadSleeper};
pub use watering::{WateringMachine, WateringState, WateringTransition};
