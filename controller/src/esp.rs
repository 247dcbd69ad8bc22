use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use chrono::{Datelike, Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{
        AnyIOPin, AnyOutputPin, Gpio34, IOPin, Input, InterruptType, Level, Output, OutputPin,
        PinDriver, Pins, Pull,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use sha2::{Digest, Sha256};

use pool_common::{
    apply_config, execute_config_actions, read_form_body, render_page, CellController, CellIo,
    ConfigRequest, ControlConfig, ControlState, ElectrodeDrive, FlowSignal, IoError,
    KeyValueStore, NetworkConfig, Notice, PageView, ProbeSample, RecvError, RuntimeConfig,
    Schedule, ScheduleStore, SharedLog, StoreError, UpgradeFlag,
};

const NVS_NAMESPACE: &str = "pool";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const SCHEDULE_KEYS: [&str; 3] = [
    pool_common::store::KEY_START_HOUR,
    pool_common::store::KEY_START_MINUTE,
    pool_common::store::KEY_DURATION,
];
const OTA_CHUNK_SIZE: usize = 4096;
const OTA_TIMEOUT_SECS: u64 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_WAIT_MS: u64 = 10_000;
const RESTART_DELAY_MS: u64 = 500;
const HTTPD_SOCK_ERR_TIMEOUT: i32 = -3;
const MIN_VALID_YEAR: i32 = 2024;

#[derive(Clone)]
struct SharedState {
    schedule: Arc<Mutex<Schedule>>,
    store: Arc<Mutex<ScheduleStore<NvsStore>>>,
    control: Arc<Mutex<ControlState>>,
    log: SharedLog,
    upgrade: UpgradeFlag,
    upgrading: Arc<AtomicBool>,
    flow: FlowSignal,
    config: Arc<ControlConfig>,
    timezone: Arc<String>,
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.control.sanitize();
    ensure_network_defaults(&mut runtime.network);
    info!(
        "runtime config loaded: ssid=`{}`, timezone={}",
        runtime.network.wifi_ssid, runtime.timezone
    );

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let mut wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &runtime.network)
        .context("wifi startup failed")?;

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    wait_for_time_sync(&sntp);

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let log = SharedLog::new(runtime.control.log_capacity);
    let mut store = ScheduleStore::new(NvsStore::new(nvs_partition)?);
    let now = now_in_timezone(&runtime.timezone).unwrap_or_else(|| Utc::now().fixed_offset());
    let schedule = store.load(now, runtime.control.default_duration_hours);
    info!(
        "schedule start {} for {}h",
        schedule.start(),
        schedule.duration_hours()
    );

    let shared_state = SharedState {
        schedule: Arc::new(Mutex::new(schedule)),
        store: Arc::new(Mutex::new(store)),
        control: Arc::new(Mutex::new(ControlState::default())),
        log,
        upgrade: UpgradeFlag::new(),
        upgrading: Arc::new(AtomicBool::new(false)),
        flow: FlowSignal::new(),
        config: Arc::new(runtime.control.clone()),
        timezone: Arc::new(runtime.timezone.clone()),
    };

    spawn_control_loop(shared_state.clone(), pins, adc1)?;
    let server = create_http_server(shared_state.clone())?;

    // Keep services alive for the program lifetime.
    let _server = server;
    let _sntp = sntp;

    loop {
        thread::sleep(Duration::from_millis(shared_state.config.upgrade_poll_ms));

        if shared_state.upgrade.take() {
            start_upgrade(&shared_state, &runtime.network);
        }

        if !wifi.is_connected().unwrap_or(false) {
            warn!("wifi disconnected, reconnecting");
            if let Err(err) = wifi.wifi_mut().connect() {
                warn!("wifi reconnect failed: {err}");
            }
        }
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }

    if network.ota_url.is_empty() {
        if let Some(url) = option_env!("OTA_URL") {
            network.ota_url = url.to_string();
        }
    }
}

fn wait_for_time_sync(sntp: &EspSntp<'_>) {
    let started = monotonic_ms();
    while sntp.get_sync_status() != SyncStatus::Completed {
        if monotonic_ms().saturating_sub(started) >= SNTP_WAIT_MS {
            warn!("SNTP not synced after {}s, continuing", SNTP_WAIT_MS / 1000);
            return;
        }
        thread::sleep(Duration::from_millis(200));
    }
    info!("SNTP synced");
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let full_log = req.uri().contains("log=all");
            let page = build_page(&state, None, full_log);
            req.into_response(200, None, &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Post, move |mut req| {
            let len = req.content_len().unwrap_or(0) as usize;
            let body = read_form_body(len, |buf| {
                req.read(buf).map_err(|err| {
                    if err.0.code() == HTTPD_SOCK_ERR_TIMEOUT {
                        RecvError::Timeout
                    } else {
                        RecvError::Failed(err.to_string())
                    }
                })
            });

            let (notice, restart) = match body {
                Ok(body) => handle_config(&state, &body),
                Err(err) => {
                    warn!("config request body rejected: {err}");
                    state.log.record(format!("Request ignored: {err}"));
                    (None, false)
                }
            };

            let page = build_page(&state, notice, false);
            req.into_response(200, None, &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;

            if restart {
                schedule_restart();
            }
            Ok(())
        })?;
    }

    Ok(server)
}

fn handle_config(state: &SharedState, body: &str) -> (Option<Notice>, bool) {
    let request = ConfigRequest::parse(body);
    let now = now_in_timezone(&state.timezone).unwrap_or_else(|| Utc::now().fixed_offset());

    let outcome = {
        let mut schedule = lock(&state.schedule);
        apply_config(
            &request,
            &mut schedule,
            now,
            state.config.default_duration_hours,
            &state.log,
        )
    };

    let restart = execute_config_actions(
        outcome.actions,
        &mut *lock(&state.store),
        &state.upgrade,
        &state.log,
    );

    (outcome.notice, restart)
}

fn build_page(state: &SharedState, notice: Option<Notice>, full_log: bool) -> String {
    let view = PageView {
        schedule: *lock(&state.schedule),
        control: *lock(&state.control),
        upgrading: state.upgrade.is_pending() || state.upgrading.load(Ordering::Acquire),
        notice,
        now: now_in_timezone(&state.timezone),
    };
    let lines = if full_log {
        state.log.replay()
    } else {
        state.log.drain()
    };
    render_page(&view, &lines)
}

fn spawn_control_loop(state: SharedState, pins: Pins, adc1: ADC1) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("pool-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut cell = match EspCell::new(pins, adc1, state.flow.clone()) {
                Ok(cell) => cell,
                Err(err) => {
                    warn!("cell hardware init failed, control loop stopped: {err:#}");
                    state.log.record("Cell hardware init failed");
                    return;
                }
            };

            let mut controller = CellController::new((*state.config).clone());
            *lock(&state.control) = controller.start(&mut cell, &state.log);
            info!("starting pool main loop");

            loop {
                thread::sleep(Duration::from_millis(state.config.tick_ms));

                let active = match now_in_timezone(&state.timezone) {
                    Some(now) => lock(&state.schedule).is_active(now),
                    None => false,
                };
                let flow_changed = state.flow.take();
                if flow_changed {
                    cell.rearm_flow_interrupt();
                }

                let snapshot =
                    controller.tick(monotonic_ms(), active, flow_changed, &mut cell, &state.log);
                *lock(&state.control) = snapshot;
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

struct EspCell {
    wat_minus: PinDriver<'static, AnyOutputPin, Output>,
    wat_plus: PinDriver<'static, AnyOutputPin, Output>,
    cl_minus: PinDriver<'static, AnyOutputPin, Output>,
    cl_plus: PinDriver<'static, AnyOutputPin, Output>,
    power: PinDriver<'static, AnyOutputPin, Output>,
    fan: PinDriver<'static, AnyOutputPin, Output>,
    flow: PinDriver<'static, AnyIOPin, Input>,
    probe: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl EspCell {
    fn new(pins: Pins, adc1: ADC1, signal: FlowSignal) -> anyhow::Result<Self> {
        let mut flow = PinDriver::input(pins.gpio15.downgrade())?;
        flow.set_pull(Pull::Up)?;
        flow.set_interrupt_type(InterruptType::AnyEdge)?;
        // SAFETY: the callback only performs an atomic store.
        unsafe { flow.subscribe(move || signal.notify())? };
        flow.enable_interrupt()?;

        let adc = AdcDriver::new(adc1)?;
        let probe = AdcChannelDriver::new(
            adc,
            pins.gpio34,
            &AdcChannelConfig {
                attenuation: attenuation::NONE,
                ..Default::default()
            },
        )?;

        Ok(Self {
            wat_minus: PinDriver::output(pins.gpio4.downgrade_output())?,
            wat_plus: PinDriver::output(pins.gpio18.downgrade_output())?,
            cl_minus: PinDriver::output(pins.gpio19.downgrade_output())?,
            cl_plus: PinDriver::output(pins.gpio5.downgrade_output())?,
            power: PinDriver::output(pins.gpio23.downgrade_output())?,
            fan: PinDriver::output(pins.gpio21.downgrade_output())?,
            flow,
            probe,
        })
    }

    fn rearm_flow_interrupt(&mut self) {
        if let Err(err) = self.flow.enable_interrupt() {
            warn!("failed to re-enable flow interrupt: {err}");
        }
    }
}

fn drive(
    pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    name: &'static str,
    on: bool,
) -> Result<(), IoError> {
    pin.set_level(Level::from(on)).map_err(|err| IoError::Gpio {
        pin: name,
        reason: err.to_string(),
    })
}

impl CellIo for EspCell {
    fn flow_ok(&mut self) -> Result<bool, IoError> {
        Ok(self.flow.is_low())
    }

    fn set_power(&mut self, on: bool) -> Result<(), IoError> {
        drive(&mut self.power, "power", on)
    }

    fn set_fan(&mut self, on: bool) -> Result<(), IoError> {
        drive(&mut self.fan, "fan", on)
    }

    fn set_electrodes(&mut self, electrodes: ElectrodeDrive) -> Result<(), IoError> {
        let levels = electrodes.levels();
        drive(&mut self.wat_minus, "wat-", levels.wat_minus)?;
        drive(&mut self.wat_plus, "wat+", levels.wat_plus)?;
        drive(&mut self.cl_minus, "cl-", levels.cl_minus)?;
        drive(&mut self.cl_plus, "cl+", levels.cl_plus)
    }

    fn sample_probe(&mut self) -> Result<ProbeSample, IoError> {
        let raw = self
            .probe
            .read_raw()
            .map_err(|err| IoError::Adc(err.to_string()))?;
        let millivolts = self
            .probe
            .raw_to_mv(raw)
            .map_err(|err| IoError::Adc(err.to_string()))?;
        Ok(ProbeSample {
            raw,
            millivolts: u32::from(millivolts),
        })
    }
}

fn start_upgrade(state: &SharedState, network: &NetworkConfig) {
    if network.ota_url.is_empty() {
        warn!("upgrade requested but no OTA URL is configured");
        state.log.record("Upgrade failed: no OTA URL configured");
        return;
    }
    if state.upgrading.swap(true, Ordering::AcqRel) {
        return;
    }

    state.log.record(format!("Upgrading from {}", network.ota_url));
    let url = network.ota_url.clone();
    let expected_sha = network
        .ota_sha256
        .as_ref()
        .map(|value| value.trim().to_ascii_lowercase());
    let log = state.log.clone();
    let upgrading = state.upgrading.clone();

    let spawn_result = thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || match download_and_apply_ota(&url, expected_sha.as_deref()) {
            Ok(image) => {
                info!("OTA image written ({} bytes, sha256 {})", image.bytes, image.sha256);
                log.record("Upgrade complete, restarting");
                thread::sleep(Duration::from_millis(800));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
            Err(err) => {
                warn!("OTA apply failed: {err:#}");
                log.record(format!("Upgrade failed: {err}"));
                upgrading.store(false, Ordering::Release);
            }
        });

    if let Err(err) = spawn_result {
        warn!("failed to spawn OTA thread: {err}");
        state.upgrading.store(false, Ordering::Release);
    }
}

struct FirmwareImage {
    bytes: u64,
    sha256: String,
}

fn download_and_apply_ota(
    url: &str,
    expected_sha256: Option<&str>,
) -> anyhow::Result<FirmwareImage> {
    let connection = EspHttpConnection::new(&HttpClientConfiguration {
        timeout: Some(Duration::from_secs(OTA_TIMEOUT_SECS)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    })?;
    let mut client = HttpClient::wrap(connection);
    let mut response = client
        .get(url)
        .context("failed to open image request")?
        .submit()
        .context("image request failed")?;
    match response.status() {
        200..=299 => {}
        status => bail!("image download failed with HTTP {status}"),
    }

    let mut ota = EspOta::new().context("OTA partition unavailable")?;
    let mut update = ota.initiate_update().context("failed to start OTA update")?;
    let streamed = stream_image(&mut response, |chunk| {
        update
            .write_all(chunk)
            .map_err(|err| anyhow!("flash write failed: {err:?}"))
    });

    let image = match streamed.and_then(|image| verify_image(image, expected_sha256)) {
        Ok(image) => image,
        Err(err) => {
            if let Err(abort_err) = update.abort() {
                warn!("failed to abort OTA update: {abort_err}");
            }
            return Err(err);
        }
    };
    update.complete().context("failed to finalize OTA image")?;
    Ok(image)
}

fn stream_image<R: Read>(
    reader: &mut R,
    mut sink: impl FnMut(&[u8]) -> anyhow::Result<()>,
) -> anyhow::Result<FirmwareImage> {
    let mut hasher = Sha256::new();
    let mut bytes = 0_u64;
    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|err| anyhow!("image read failed: {err:?}"))?;
        if read == 0 {
            break;
        }
        sink(&chunk[..read])?;
        hasher.update(&chunk[..read]);
        bytes += read as u64;
    }
    if bytes == 0 {
        bail!("image download is empty");
    }

    let sha256 = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    Ok(FirmwareImage { bytes, sha256 })
}

fn verify_image(
    image: FirmwareImage,
    expected_sha256: Option<&str>,
) -> anyhow::Result<FirmwareImage> {
    match expected_sha256 {
        Some(expected) if expected != image.sha256 => {
            bail!("sha256 mismatch: expected {expected}, got {}", image.sha256)
        }
        _ => Ok(image),
    }
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(2 * 1024)
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            info!("restarting on request");
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread, restarting now: {err}");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let station = station_configuration(network)?;
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    wifi.set_configuration(&station)?;
    wifi.start()?;
    info!("joining `{}`", network.wifi_ssid);

    let mut attempt = 1;
    loop {
        let joined = wifi.connect().and_then(|()| wifi.wait_netif_up());
        match joined {
            Ok(()) => {
                info!("wifi up after {attempt} attempt(s)");
                break;
            }
            Err(err) if attempt == WIFI_CONNECT_ATTEMPTS => {
                warn!("wifi join failed ({err}), reconnecting from the main loop");
                break;
            }
            Err(err) => {
                warn!("wifi join attempt {attempt} failed: {err}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                attempt += 1;
            }
        }
    }
    Ok(wifi)
}

fn station_configuration(network: &NetworkConfig) -> anyhow::Result<Configuration> {
    let ssid = network.wifi_ssid.trim();
    if ssid.is_empty() {
        bail!("wifi ssid is not configured");
    }
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    Ok(Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid `{ssid}` is too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password is too long"))?,
        auth_method,
        ..Default::default()
    }))
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

fn nvs_error(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl KeyValueStore for NvsStore {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        self.nvs.get_i32(key).map_err(nvs_error)
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.nvs.set_i32(key, value).map_err(nvs_error)
    }

    // network settings under runtime_json stay
    fn erase_all(&mut self) -> Result<(), StoreError> {
        for key in SCHEDULE_KEYS {
            self.nvs.remove(key).map_err(nvs_error)?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    if local.year() < MIN_VALID_YEAR {
        return None;
    }
    Some(local.with_timezone(&local.offset().fix()))
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
