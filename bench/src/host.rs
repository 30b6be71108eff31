use std::{
    convert::Infallible,
    io::Read,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use tracing::{info, warn};

use greenhouse_common::{
    status_line, Clock, ControlLoop, Hygrometer, ManualOverride, MonotonicClock, Offline, Outputs,
    RuntimeConfig, SampleOutcome, SensorError, WateringMode,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = RuntimeConfig::default();
    runtime.watering.mode = WateringMode::Manual;
    runtime.intervals.telemetry_ms = std::env::var("SAMPLE_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(5_000);
    runtime.sanitize();

    let commands = spawn_console_reader().context("failed to start console reader")?;
    info!("bench ready; commands: + - 1 0 = p");

    let clock = MonotonicClock::new();
    let mut control = ControlLoop::new(
        &runtime,
        None::<Offline>,
        WobblyHygrometer::default(),
        LoggingOutputs,
        clock.now_ms(),
    )
    .with_manual_override(ManualOverride::default());
    let loop_pause = Duration::from_millis(runtime.intervals.loop_pause_ms);

    let stop = Arc::new(AtomicBool::new(false));
    let worker = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || {
            while !stop.load(Ordering::Relaxed) {
                for command in commands.try_iter() {
                    if let Some(setpoint) = control.manual_command(command) {
                        println!("{}", status_line(setpoint));
                    }
                }

                let report = control.step(clock.now_ms());
                if let Some(SampleOutcome::Local(sample)) = report.sample {
                    info!(
                        "{:.1}C {:.1}% at water duty {}",
                        sample.temperature,
                        sample.humidity,
                        report.levels.water
                    );
                }
                thread::sleep(loop_pause);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    stop.store(true, Ordering::Relaxed);

    worker.await.context("bench loop thread failed")?;
    Ok(())
}

fn spawn_console_reader() -> anyhow::Result<Receiver<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for byte in std::io::stdin().lock().bytes() {
                match byte {
                    Ok(byte) => {
                        if tx.send(byte).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("console read failed: {err}");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

#[derive(Default)]
struct WobblyHygrometer {
    tick: u64,
}

impl Hygrometer for WobblyHygrometer {
    fn measure(&mut self) -> Result<(), SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(())
    }

    fn temperature(&self) -> f32 {
        20.0 + (self.tick % 10) as f32 * 0.1
    }

    fn humidity(&self) -> f32 {
        60.0 - (self.tick % 4) as f32
    }
}

struct LoggingOutputs;

impl Outputs for LoggingOutputs {
    type Error = Infallible;

    fn set_fan(&mut self, duty: u16) -> Result<(), Infallible> {
        info!("fan duty {duty}");
        Ok(())
    }

    fn set_door(&mut self, angle: u16) -> Result<(), Infallible> {
        info!("door angle {angle}");
        Ok(())
    }

    fn set_water(&mut self, duty: u16) -> Result<(), Infallible> {
        info!("water duty {duty}");
        Ok(())
    }
}
