use std::{
    io::Read,
    sync::mpsc::{self, Receiver},
    thread,
    time::Duration,
};

use anyhow::Context;
use dht_sensor::{dht22, DhtError};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::Hertz,
};
use esp_idf_svc::{hal::prelude::Peripherals, log::EspLogger, sys::EspError};
use log::{info, warn};

use greenhouse_common::{
    config::FAN_SPEED_MAX, manual::SETPOINT_MAX, status_line, Clock, ControlLoop, Hygrometer,
    ManualOverride, MonotonicClock, Offline, Outputs, RuntimeConfig, SampleOutcome, SensorError,
    WateringMode,
};

const FAN_PWM_HZ: u32 = 1_000;
const SERVO_HZ: u32 = 50;
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_US: u32 = 500;
const SERVO_MAX_US: u32 = 2_500;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    runtime.watering.mode = WateringMode::Manual;
    runtime.intervals.telemetry_ms = 5_000;
    runtime.sanitize();

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let ledc = peripherals.ledc;

    let sensor = DeviceHygrometer::new(pins.gpio4.downgrade())
        .context("failed to initialize DHT22")?;

    let fan_timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig {
            frequency: Hertz(FAN_PWM_HZ),
            resolution: Resolution::Bits10,
            ..Default::default()
        },
    )?;
    let servo_timer = LedcTimerDriver::new(
        ledc.timer1,
        &TimerConfig {
            frequency: Hertz(SERVO_HZ),
            resolution: Resolution::Bits14,
            ..Default::default()
        },
    )?;
    let outputs = BenchOutputs {
        fan: LedcDriver::new(ledc.channel0, &fan_timer, pins.gpio18)?,
        door: LedcDriver::new(ledc.channel1, &servo_timer, pins.gpio19)?,
        water: LedcDriver::new(ledc.channel2, &servo_timer, pins.gpio21)?,
    };

    let commands = spawn_console_reader().context("failed to start console reader")?;

    let clock = MonotonicClock::new();
    let mut control = ControlLoop::new(&runtime, None::<Offline>, sensor, outputs, clock.now_ms())
        .with_manual_override(ManualOverride::default());
    let loop_pause = Duration::from_millis(runtime.intervals.loop_pause_ms);

    info!("bench ready; commands: + - 1 0 = p");
    loop {
        for command in commands.try_iter() {
            if let Some(setpoint) = control.manual_command(command) {
                println!("{}", status_line(setpoint));
            }
        }

        let report = control.step(clock.now_ms());
        if let Some(SampleOutcome::Local(sample)) = report.sample {
            info!("{:.1}C {:.1}%", sample.temperature, sample.humidity);
        }
        thread::sleep(loop_pause);
    }
}

fn spawn_console_reader() -> anyhow::Result<Receiver<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console".into())
        .stack_size(4096)
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut byte = [0_u8; 1];
            loop {
                match stdin.read(&mut byte) {
                    Ok(1) => {
                        if tx.send(byte[0]).is_err() {
                            break;
                        }
                    }
                    // The UART console reports "no data" as an empty read.
                    Ok(_) => thread::sleep(Duration::from_millis(20)),
                    Err(err) => {
                        warn!("console read failed: {err}");
                        thread::sleep(Duration::from_millis(200));
                    }
                }
            }
        })?;
    Ok(rx)
}

fn servo_duty(channel: &LedcDriver<'_>, angle: u32) -> u32 {
    let max = u64::from(channel.get_max_duty());
    let pulse_us = SERVO_MIN_US + angle.min(180) * (SERVO_MAX_US - SERVO_MIN_US) / 180;
    (max * u64::from(pulse_us) / u64::from(SERVO_PERIOD_US)) as u32
}

/// Fan on PWM; door and water valve on hobby servos.
struct BenchOutputs<'d> {
    fan: LedcDriver<'d>,
    door: LedcDriver<'d>,
    water: LedcDriver<'d>,
}

impl Outputs for BenchOutputs<'_> {
    type Error = EspError;

    fn set_fan(&mut self, duty: u16) -> Result<(), EspError> {
        let scaled = u32::from(duty) * self.fan.get_max_duty() / u32::from(FAN_SPEED_MAX);
        self.fan.set_duty(scaled)
    }

    fn set_door(&mut self, angle: u16) -> Result<(), EspError> {
        let duty = servo_duty(&self.door, u32::from(angle));
        self.door.set_duty(duty)
    }

    fn set_water(&mut self, duty: u16) -> Result<(), EspError> {
        // Undo the duty scaling so the valve sits at the setpoint angle.
        let angle = (u32::from(duty) * SETPOINT_MAX as u32 + u32::from(u16::MAX) / 2)
            / u32::from(u16::MAX);
        let servo = servo_duty(&self.water, angle);
        self.water.set_duty(servo)
    }
}

struct DeviceHygrometer {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    temperature: f32,
    humidity: f32,
}

impl DeviceHygrometer {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        Ok(Self {
            pin,
            delay: Ets,
            temperature: 0.0,
            humidity: 0.0,
        })
    }
}

impl Hygrometer for DeviceHygrometer {
    fn measure(&mut self) -> Result<(), SensorError> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to release DHT22 line: {err:?}");
            return Err(SensorError::Offline);
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                self.temperature = reading.temperature;
                self.humidity = reading.relative_humidity;
                Ok(())
            }
            Err(DhtError::ChecksumMismatch) => Err(SensorError::Checksum),
            Err(err) => {
                warn!("DHT22 read failed: {err:?}");
                Err(SensorError::Offline)
            }
        }
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }

    fn humidity(&self) -> f32 {
        self.humidity
    }
}
