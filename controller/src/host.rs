use std::{
    convert::Infallible,
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context};
use tracing::{info, warn};

use greenhouse_common::{
    Clock, ControlLoop, Hygrometer, HttpRemote, MonotonicClock, Outputs, RuntimeConfig,
    SensorError, TcpDialer, ThreadSleeper,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config().await?;
    apply_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();
    runtime
        .validate()
        .context("invalid runtime configuration")?;

    if runtime.api.https {
        bail!("TLS is only available in ESP32 builds; set API_HTTPS=false");
    }

    info!(
        "controller `{}` using http://{}{} ({:?} watering)",
        runtime.device.id,
        runtime.api.endpoint(),
        runtime.api.base_path,
        runtime.watering.mode
    );

    let clock = MonotonicClock::new();
    let remote = HttpRemote::new(&runtime, TcpDialer::new(&runtime.api), ThreadSleeper);
    let mut control = ControlLoop::new(
        &runtime,
        Some(remote),
        SimulatedHygrometer::default(),
        LoggingOutputs,
        clock.now_ms(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let worker = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || control.run_until(&clock, &mut ThreadSleeper, &stop)
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    stop.store(true, Ordering::Relaxed);

    worker.await.context("control loop thread failed")?;
    Ok(())
}

async fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let Ok(path) = std::env::var("GREENHOUSE_CONFIG") else {
        return Ok(host_defaults());
    };

    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("failed to parse runtime config `{path}`")),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("runtime config `{path}` not found; using host defaults");
            Ok(host_defaults())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read runtime config `{path}`")),
    }
}

fn host_defaults() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.api.host = "127.0.0.1".to_string();
    runtime.api.port = 8080;
    runtime.api.https = false;
    runtime
}

fn apply_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("API_HOST") {
        runtime.api.host = host;
    }
    if let Some(port) = lookup("API_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.api.port = port;
    }
    if let Some(base_path) = lookup("API_BASEPATH") {
        runtime.api.base_path = base_path;
    }
    if let Some(https) = lookup("API_HTTPS").and_then(|value| value.parse::<bool>().ok()) {
        runtime.api.https = https;
    }
    if let Some(id) = lookup("DEVICE_ID") {
        runtime.device.id = id;
    }
    if let Some(token) = lookup("DEVICE_TOKEN") {
        runtime.device.token = token;
    }
    if let Some(interval_s) = lookup("WATER_INTERVAL_S").and_then(|value| value.parse::<u32>().ok())
    {
        runtime.watering.interval_s = interval_s;
    }
}

/// Drifting readings with the odd corrupt frame, like a DHT22 on a long lead.
#[derive(Default)]
struct SimulatedHygrometer {
    tick: u64,
    temperature: f32,
    humidity: f32,
}

impl Hygrometer for SimulatedHygrometer {
    fn measure(&mut self) -> Result<(), SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 17 == 0 {
            return Err(SensorError::Checksum);
        }

        self.temperature = 22.0 + (self.tick % 8) as f32 * 0.2;
        self.humidity = 55.0 + (self.tick % 6) as f32 * 0.5;
        Ok(())
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }

    fn humidity(&self) -> f32 {
        self.humidity
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
