use core::convert::TryInto;
use std::{
    io::{self, ErrorKind, Read, Write},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use dht_sensor::{dht22, DhtError};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sys::EspError,
    tls::{Config as TlsConfig, EspTls, InternalSocket, X509},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use greenhouse_common::{
    config::{NetworkConfig, FAN_SPEED_MAX},
    Clock, Connection, ControlLoop, Dialer, HttpRemote, Hygrometer, MonotonicClock, Outputs,
    RuntimeConfig, SensorError, TcpConnection, TcpDialer, ThreadSleeper,
};

use crate::link::{LinkEvent, OutageTimer};

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const FAN_PWM_HZ: u32 = 1_000;
const SERVO_HZ: u32 = 50;
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_US: u32 = 500;
const SERVO_MAX_US: u32 = 2_500;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = build_runtime_config();
    runtime.sanitize();
    runtime
        .validate()
        .context("invalid build-time configuration")?;

    info!(
        "controller `{}` using {}{} (tls={})",
        runtime.device.id,
        runtime.api.endpoint(),
        runtime.api.base_path,
        runtime.api.https
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let sensor = DeviceHygrometer::new(pins.gpio4.downgrade())
        .context("failed to initialize DHT22")?;

    let ledc = peripherals.ledc;
    let pwm_timer = LedcTimerDriver::new(
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
    let outputs = LedcOutputs {
        fan: LedcDriver::new(ledc.channel0, &pwm_timer, pins.gpio18)?,
        water: LedcDriver::new(ledc.channel1, &pwm_timer, pins.gpio21)?,
        door: LedcDriver::new(ledc.channel2, &servo_timer, pins.gpio19)?,
    };

    let wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let clock = MonotonicClock::new();
    let remote = HttpRemote::new(&runtime, DeviceDialer::new(&runtime), ThreadSleeper);
    let mut control = ControlLoop::new(&runtime, Some(remote), sensor, outputs, clock.now_ms());
    let loop_pause = Duration::from_millis(runtime.intervals.loop_pause_ms);

    let mut watchdog = WifiWatchdog::new(wifi);

    info!("control loop running");
    loop {
        let now_ms = clock.now_ms();
        watchdog.check(now_ms);
        control.step(now_ms);
        thread::sleep(loop_pause);
    }
}

fn build_runtime_config() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();

    if let Some(ssid) = option_env!("GREENHOUSE_WIFI_SSID") {
        runtime.network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("GREENHOUSE_WIFI_PASS") {
        runtime.network.wifi_pass = pass.to_string();
    }
    if let Some(id) = option_env!("GREENHOUSE_DEVICE_ID") {
        runtime.device.id = id.to_string();
    }
    if let Some(token) = option_env!("GREENHOUSE_DEVICE_TOKEN") {
        runtime.device.token = token.to_string();
    }
    if let Some(host) = option_env!("GREENHOUSE_API_HOST") {
        runtime.api.host = host.to_string();
    }
    if let Some(pem) = option_env!("GREENHOUSE_API_CERT_PEM") {
        runtime.api.pinned_cert = Some(pem.to_string());
    }

    runtime
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        bail!("wifi ssid missing; set GREENHOUSE_WIFI_SSID at build time");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow::Error::from(err).context(format!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"
        )));
    }

    drop(wifi);
    Ok(esp_wifi)
}

/// Owns the station and restarts the chip once the link has been down for
/// longer than `WIFI_RESTART_GRACE_MS` of loop time.
struct WifiWatchdog {
    wifi: EspWifi<'static>,
    outage: OutageTimer,
}

impl WifiWatchdog {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            outage: OutageTimer::new(WIFI_RESTART_GRACE_MS),
        }
    }

    fn check(&mut self, now_ms: u64) {
        let connected = self.wifi.is_connected().unwrap_or(false);
        match self.outage.observe(connected, now_ms) {
            LinkEvent::Up | LinkEvent::Down { .. } => {}
            LinkEvent::Restored => info!("wifi link restored"),
            LinkEvent::Lost => warn!("wifi link lost"),
            LinkEvent::Expired { for_ms } => {
                warn!("wifi down for {}s; restarting", for_ms / 1_000);
                thread::sleep(Duration::from_millis(100));
                esp_idf_svc::hal::reset::restart();
            }
        }
    }
}

/// Plain sockets for `http`; ESP-TLS for `https`, checked against the pinned
/// certificate when one is configured and the certificate bundle otherwise.
enum DeviceDialer {
    Plain(TcpDialer),
    Tls(TlsDialer),
}

impl DeviceDialer {
    fn new(runtime: &RuntimeConfig) -> Self {
        if runtime.api.https {
            Self::Tls(TlsDialer {
                host: runtime.api.host.clone(),
                port: runtime.api.port,
                timeout_ms: runtime
                    .api
                    .connect_timeout_ms
                    .max(runtime.api.read_timeout_ms)
                    .try_into()
                    .unwrap_or(u32::MAX),
                pinned_pem: runtime.api.pinned_cert_pem(),
            })
        } else {
            Self::Plain(TcpDialer::new(&runtime.api))
        }
    }
}

impl Dialer for DeviceDialer {
    type Conn = DeviceConnection;

    fn dial(&mut self) -> io::Result<Self::Conn> {
        match self {
            Self::Plain(dialer) => dialer.dial().map(DeviceConnection::Plain),
            Self::Tls(dialer) => dialer.dial().map(DeviceConnection::Tls),
        }
    }
}

struct TlsDialer {
    host: String,
    port: u16,
    timeout_ms: u32,
    pinned_pem: Option<Vec<u8>>,
}

impl TlsDialer {
    fn dial(&mut self) -> io::Result<EspTls<InternalSocket>> {
        let mut tls = EspTls::new().map_err(io::Error::other)?;
        // A pin replaces the bundle; the peer must chain to that one certificate.
        let pinned = self.pinned_pem.as_deref().map(X509::pem_until_nul);
        tls.connect(
            &self.host,
            self.port,
            &TlsConfig {
                common_name: Some(self.host.as_str()),
                ca_cert: pinned,
                use_crt_bundle_attach: self.pinned_pem.is_none(),
                timeout_ms: self.timeout_ms,
                ..TlsConfig::new()
            },
        )
        .map_err(io::Error::other)?;
        Ok(tls)
    }
}

enum DeviceConnection {
    Plain(TcpConnection),
    Tls(EspTls<InternalSocket>),
}

impl Read for DeviceConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(conn) => conn.read(buf),
            Self::Tls(tls) => tls.read(buf).map_err(io::Error::other),
        }
    }
}

impl Write for DeviceConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(conn) => conn.write(buf),
            Self::Tls(tls) => tls.write(buf).map_err(io::Error::other),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(conn) => conn.flush(),
            Self::Tls(_) => Ok(()),
        }
    }
}

impl Connection for DeviceConnection {
    fn discard_pending(&mut self) -> io::Result<usize> {
        match self {
            Self::Plain(conn) => conn.discard_pending(),
            // Records already decrypted are invisible from here; start over.
            Self::Tls(_) => Err(ErrorKind::Unsupported.into()),
        }
    }
}

struct LedcOutputs<'d> {
    fan: LedcDriver<'d>,
    water: LedcDriver<'d>,
    door: LedcDriver<'d>,
}

impl Outputs for LedcOutputs<'_> {
    type Error = EspError;

    fn set_fan(&mut self, duty: u16) -> Result<(), EspError> {
        let max = self.fan.get_max_duty();
        self.fan.set_duty(u32::from(duty) * max / u32::from(FAN_SPEED_MAX))
    }

    fn set_door(&mut self, angle: u16) -> Result<(), EspError> {
        let max = u64::from(self.door.get_max_duty());
        let pulse_us = SERVO_MIN_US + u32::from(angle) * (SERVO_MAX_US - SERVO_MIN_US) / 180;
        self.door
            .set_duty((max * u64::from(pulse_us) / u64::from(SERVO_PERIOD_US)) as u32)
    }

    fn set_water(&mut self, duty: u16) -> Result<(), EspError> {
        let max = u64::from(self.water.get_max_duty());
        self.water
            .set_duty((u64::from(duty) * max / u64::from(u16::MAX)) as u32)
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
