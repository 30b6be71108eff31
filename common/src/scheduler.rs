use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    actuator::{water_level, ActuatorController, ActuatorLevels, Outputs},
    config::{Configuration, RuntimeConfig},
    error::{FailureClass, SensorError},
    manual::ManualOverride,
    remote::Remote,
    sensor::{Hygrometer, SensorSampler},
    telemetry::TelemetrySample,
    transport::Sleeper,
    watering::{WateringMachine, WateringTransition},
};

pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Due-time bookkeeping for one periodic task.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTask {
    interval_ms: u64,
    last_run_ms: Option<u64>,
}

impl PeriodicTask {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_run_ms: None,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_run_ms
            .map(|last| now_ms >= last.saturating_add(self.interval_ms))
            .unwrap_or(true)
    }

    /// Claims the slot if due. The run is stamped before it executes so a
    /// slow run does not make the task due again immediately.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_run_ms = Some(now_ms);
        true
    }

    pub fn last_run_ms(&self) -> Option<u64> {
        self.last_run_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Failed(FailureClass),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Reported(TelemetrySample),
    ReportFailed(TelemetrySample, FailureClass),
    /// Sampled with no remote to report to.
    Local(TelemetrySample),
    SensorFailed(SensorError),
}

/// What happened during one pass of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub levels: ActuatorLevels,
    pub sync: Option<SyncOutcome>,
    pub watering: Option<WateringTransition>,
    pub sample: Option<SampleOutcome>,
}

/// Owns every piece of controller state and runs the tasks in a fixed order
/// on one thread.
pub struct ControlLoop<R, H, O> {
    config: Configuration,
    watering: WateringMachine,
    actuators: ActuatorController<O>,
    sampler: SensorSampler<H>,
    remote: Option<R>,
    manual: Option<ManualOverride>,
    sync_task: PeriodicTask,
    sample_task: PeriodicTask,
    loop_pause: Duration,
}

impl<R: Remote, H: Hygrometer, O: Outputs> ControlLoop<R, H, O> {
    pub fn new(
        runtime: &RuntimeConfig,
        remote: Option<R>,
        sensor: H,
        outputs: O,
        now_ms: u64,
    ) -> Self {
        let config = Configuration::from_static(runtime);
        Self {
            watering: WateringMachine::new(runtime.intervals.water_open_ms, &config, now_ms),
            config,
            actuators: ActuatorController::new(outputs, runtime.actuators.fallback_fan_speed),
            sampler: SensorSampler::new(sensor),
            remote,
            manual: None,
            sync_task: PeriodicTask::new(runtime.intervals.config_sync_ms),
            sample_task: PeriodicTask::new(runtime.intervals.telemetry_ms),
            loop_pause: Duration::from_millis(runtime.intervals.loop_pause_ms),
        }
    }

    pub fn with_manual_override(mut self, manual: ManualOverride) -> Self {
        self.manual = Some(manual);
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn watering(&self) -> &WateringMachine {
        &self.watering
    }

    pub fn sampler(&self) -> &SensorSampler<H> {
        &self.sampler
    }

    pub fn outputs(&self) -> &O {
        self.actuators.outputs()
    }

    pub fn remote(&self) -> Option<&R> {
        self.remote.as_ref()
    }

    /// Feeds one override command; returns the setpoint to echo, if any.
    pub fn manual_command(&mut self, command: u8) -> Option<u16> {
        self.manual.as_mut()?.apply(command)
    }

    pub fn step(&mut self, now_ms: u64) -> IterationReport {
        // Outputs reflect the configuration as it stood when the pass began.
        let levels = self
            .actuators
            .refresh(&self.config, &self.watering, self.manual.as_ref());

        let sync = self.run_sync(now_ms);

        let watering = self.watering.tick(now_ms, &self.config);
        if let Some(transition) = watering {
            match transition {
                WateringTransition::Opened { power } => info!("watering started at duty {power}"),
                WateringTransition::Closed => info!("watering stopped"),
            }
            self.actuators
                .apply_water(water_level(&self.watering, self.manual.as_ref()));
        }

        let sample = self.run_sample(now_ms);

        IterationReport {
            levels,
            sync,
            watering,
            sample,
        }
    }

    pub fn run_until<C: Clock, S: Sleeper>(
        &mut self,
        clock: &C,
        sleeper: &mut S,
        stop: &AtomicBool,
    ) {
        info!("control loop running");
        while !stop.load(Ordering::Relaxed) {
            self.step(clock.now_ms());
            sleeper.sleep(self.loop_pause);
        }
        info!("control loop stopped");
    }

    fn run_sync(&mut self, now_ms: u64) -> Option<SyncOutcome> {
        let remote = self.remote.as_mut()?;
        if !self.sync_task.poll(now_ms) {
            return None;
        }

        match remote.fetch_settings(&self.config) {
            Ok(config) => {
                if config != self.config {
                    info!("configuration updated: {config:?}");
                }
                self.config = config;
                Some(SyncOutcome::Applied)
            }
            Err(err) => {
                warn!("settings sync failed ({} failure): {err}", err.class().as_str());
                Some(SyncOutcome::Failed(err.class()))
            }
        }
    }

    fn run_sample(&mut self, now_ms: u64) -> Option<SampleOutcome> {
        if !self.sample_task.poll(now_ms) {
            return None;
        }

        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(err) => {
                warn!("sensor read skipped: {err}");
                return Some(SampleOutcome::SensorFailed(err));
            }
        };
        debug!("sampled {:.1}C {:.1}%", sample.temperature, sample.humidity);

        let Some(remote) = self.remote.as_mut() else {
            return Some(SampleOutcome::Local(sample));
        };
        match remote.post_telemetry(&sample) {
            Ok(()) => Some(SampleOutcome::Reported(sample)),
            Err(err) => {
                warn!("telemetry post failed ({} failure): {err}", err.class().as_str());
                Some(SampleOutcome::ReportFailed(sample, err.class()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, convert::Infallible, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::WateringMode, error::HttpError, remote::Offline};

    #[derive(Default)]
    struct FakeRemote {
        settings: VecDeque<Result<Configuration, HttpError>>,
        posted: Rc<RefCell<Vec<TelemetrySample>>>,
    }

    impl Remote for FakeRemote {
        fn fetch_settings(&mut self, _current: &Configuration) -> Result<Configuration, HttpError> {
            self.settings.pop_front().unwrap_or(Err(HttpError::Timeout))
        }

        fn post_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), HttpError> {
            self.posted.borrow_mut().push(*sample);
            Ok(())
        }
    }

    struct FakeSensor {
        results: VecDeque<Result<(f32, f32), SensorError>>,
        current: (f32, f32),
    }

    impl FakeSensor {
        fn new(results: Vec<Result<(f32, f32), SensorError>>) -> Self {
            Self {
                results: results.into(),
                current: (0.0, 0.0),
            }
        }
    }

    impl Hygrometer for FakeSensor {
        fn measure(&mut self) -> Result<(), SensorError> {
            self.current = self.results.pop_front().unwrap_or(Ok(self.current))?;
            Ok(())
        }

        fn temperature(&self) -> f32 {
            self.current.0
        }

        fn humidity(&self) -> f32 {
            self.current.1
        }
    }

    #[derive(Default)]
    struct Recorder {
        fan: Vec<u16>,
        door: Vec<u16>,
        water: Vec<u16>,
    }

    impl Outputs for Recorder {
        type Error = Infallible;

        fn set_fan(&mut self, duty: u16) -> Result<(), Infallible> {
            self.fan.push(duty);
            Ok(())
        }

        fn set_door(&mut self, angle: u16) -> Result<(), Infallible> {
            self.door.push(angle);
            Ok(())
        }

        fn set_water(&mut self, duty: u16) -> Result<(), Infallible> {
            self.water.push(duty);
            Ok(())
        }
    }

    fn runtime() -> RuntimeConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.intervals.config_sync_ms = 1_000;
        runtime.intervals.telemetry_ms = 5_000;
        runtime.intervals.water_open_ms = 2_000;
        runtime.watering.interval_s = 10;
        runtime
    }

    fn remote_config() -> Configuration {
        Configuration {
            fan_speed: 700,
            door_angle: 90,
            water_interval_s: Some(10),
            water_power: 30_000,
            master: true,
        }
    }

    fn idle_loop() -> ControlLoop<Offline, FakeSensor, Recorder> {
        ControlLoop::new(&runtime(), None, FakeSensor::new(vec![]), Recorder::default(), 0)
    }

    #[test]
    fn periodic_task_fires_first_then_on_interval() {
        let mut task = PeriodicTask::new(1_000);

        assert!(task.poll(50));
        assert!(!task.poll(1_049));
        assert!(task.poll(1_050));
        assert_eq!(task.last_run_ms(), Some(1_050));
    }

    #[test]
    fn outputs_use_configuration_from_start_of_iteration() {
        let remote = FakeRemote {
            settings: VecDeque::from([Ok(remote_config())]),
            ..FakeRemote::default()
        };
        let sensor = FakeSensor::new(vec![Ok((20.0, 40.0))]);
        let mut control = ControlLoop::new(&runtime(), Some(remote), sensor, Recorder::default(), 0);

        let first = control.step(0);
        assert_eq!(first.sync, Some(SyncOutcome::Applied));
        assert_eq!(first.levels.fan, 512);
        assert_eq!(first.levels.door, 0);

        let second = control.step(10);
        assert_eq!(second.levels.fan, 700);
        assert_eq!(second.levels.door, 90);
        assert_eq!(second.sync, None);
        assert_eq!(control.outputs().fan, vec![512, 700]);
    }

    #[test]
    fn failed_sync_keeps_last_good_configuration() {
        let remote = FakeRemote {
            settings: VecDeque::from([Ok(remote_config()), Err(HttpError::Timeout)]),
            ..FakeRemote::default()
        };
        let mut control = ControlLoop::new(
            &runtime(),
            Some(remote),
            FakeSensor::new(vec![]),
            Recorder::default(),
            0,
        );

        control.step(0);
        let report = control.step(1_000);

        assert_eq!(report.sync, Some(SyncOutcome::Failed(FailureClass::Protocol)));
        assert_eq!(*control.configuration(), remote_config());
    }

    #[test]
    fn sensor_failure_skips_telemetry_and_keeps_cache() {
        let remote = FakeRemote::default();
        let posted = remote.posted.clone();
        let sensor = FakeSensor::new(vec![Ok((21.0, 45.0)), Err(SensorError::Checksum)]);
        let mut control = ControlLoop::new(&runtime(), Some(remote), sensor, Recorder::default(), 0);

        let first = control.step(0);
        let second = control.step(5_000);

        let cached = TelemetrySample {
            temperature: 21.0,
            humidity: 45.0,
        };
        assert_eq!(first.sample, Some(SampleOutcome::Reported(cached)));
        assert_eq!(second.sample, Some(SampleOutcome::SensorFailed(SensorError::Checksum)));
        assert_eq!(*posted.borrow(), vec![cached]);
        assert_eq!(control.sampler().last_sample(), Some(cached));
    }

    #[test]
    fn watering_opens_at_interval_and_drives_water_output() {
        let mut control = idle_loop();

        assert_eq!(control.step(9_999).watering, None);
        assert_eq!(
            control.step(10_000).watering,
            Some(WateringTransition::Opened { power: u16::MAX })
        );
        assert_eq!(control.step(12_000).watering, Some(WateringTransition::Closed));

        assert_eq!(control.outputs().water, vec![0, u16::MAX, 0]);
    }

    #[test]
    fn stand_alone_loop_samples_locally_and_obeys_override() {
        let mut runtime = runtime();
        runtime.watering.mode = WateringMode::Manual;
        let sensor = FakeSensor::new(vec![Ok((18.0, 60.0))]);
        let mut control = ControlLoop::new(&runtime, None::<Offline>, sensor, Recorder::default(), 0)
            .with_manual_override(ManualOverride::default());

        let report = control.step(0);
        assert_eq!(
            report.sample,
            Some(SampleOutcome::Local(TelemetrySample {
                temperature: 18.0,
                humidity: 60.0
            }))
        );
        assert_eq!(report.sync, None);

        assert_eq!(control.manual_command(b'0'), Some(0));
        control.step(10);
        assert_eq!(control.outputs().water, vec![32_767, 0]);
        assert!(control.watering().state() == crate::watering::WateringState::Waiting { due_ms: None });
    }

    #[test]
    fn stop_flag_ends_run() {
        struct FixedClock;
        impl Clock for FixedClock {
            fn now_ms(&self) -> u64 {
                0
            }
        }

        struct StopAfter<'a>(&'a AtomicBool, u32);
        impl Sleeper for StopAfter<'_> {
            fn sleep(&mut self, _duration: Duration) {
                self.1 += 1;
                if self.1 == 3 {
                    self.0.store(true, Ordering::Relaxed);
                }
            }
        }

        let stop = AtomicBool::new(false);
        let mut sleeper = StopAfter(&stop, 0);
        let mut control = idle_loop();

        control.run_until(&FixedClock, &mut sleeper, &stop);

        assert_eq!(sleeper.1, 3);
    }
}
