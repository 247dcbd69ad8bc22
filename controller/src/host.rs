use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};

use pool_common::{
    apply_config, execute_config_actions, render_page, CellController, CellIo, ConfigAction,
    ConfigRequest, ControlConfig, ControlState, ElectrodeDrive, FlowSignal, IoError,
    KeyValueStore, Notice, PageView, ProbeSample, RuntimeConfig, Schedule, ScheduleStore,
    SharedLog, StoreError, UpgradeFlag, MAX_FORM_BODY,
};

const SETTINGS_FILE: &str = "settings.json";
const RUNTIME_FILE: &str = "runtime.json";
const RESTART_DELAY_MS: u64 = 500;

#[derive(Clone)]
struct AppState {
    schedule: Arc<Mutex<Schedule>>,
    store: Arc<Mutex<ScheduleStore<FileStore>>>,
    control: Arc<Mutex<ControlState>>,
    log: SharedLog,
    upgrade: UpgradeFlag,
    flow: FlowSignal,
    sim_flow: Arc<AtomicBool>,
    config: Arc<ControlConfig>,
    timezone: Arc<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SimFlowResponse {
    #[serde(rename = "flowOk")]
    flow_ok: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("POOL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.pool"));

    let mut runtime = load_runtime_config(&data_dir.join(RUNTIME_FILE))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });
    runtime.control.sanitize();
    if let Ok(timezone) = std::env::var("POOL_TIMEZONE") {
        runtime.timezone = timezone;
    }
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}, cell stays off", runtime.timezone);
    }

    let log = SharedLog::new(runtime.control.log_capacity);
    let mut store = ScheduleStore::new(FileStore::open(data_dir.join(SETTINGS_FILE)));
    let now = now_in_timezone(&runtime.timezone).unwrap_or_else(|| Utc::now().fixed_offset());
    let schedule = store.load(now, runtime.control.default_duration_hours);
    info!(
        "schedule start {} for {}h",
        schedule.start(),
        schedule.duration_hours()
    );

    let app_state = AppState {
        schedule: Arc::new(Mutex::new(schedule)),
        store: Arc::new(Mutex::new(store)),
        control: Arc::new(Mutex::new(ControlState::default())),
        log,
        upgrade: UpgradeFlag::new(),
        flow: FlowSignal::new(),
        sim_flow: Arc::new(AtomicBool::new(true)),
        config: Arc::new(runtime.control),
        timezone: Arc::new(runtime.timezone),
    };

    spawn_control_loop(app_state.clone());
    spawn_upgrade_poll_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_get_page).post(handle_post_config))
        .route("/sim/flow", post(handle_sim_flow))
        .layer(RequestBodyLimitLayer::new(MAX_FORM_BODY))
        .with_state(app_state);

    let port = std::env::var("POOL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind pool server at {addr}"))?;

    info!("pool controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut controller = CellController::new((*app_state.config).clone());
        let mut cell = SimCell::new(app_state.sim_flow.clone());
        let snapshot = controller.start(&mut cell, &app_state.log);
        *app_state.control.lock().await = snapshot;

        let mut interval =
            tokio::time::interval(Duration::from_millis(app_state.config.tick_ms));
        loop {
            interval.tick().await;

            let active = match now_in_timezone(&app_state.timezone) {
                Some(now) => app_state.schedule.lock().await.is_active(now),
                None => false,
            };
            let flow_changed = app_state.flow.take();
            let snapshot =
                controller.tick(monotonic_ms(), active, flow_changed, &mut cell, &app_state.log);
            *app_state.control.lock().await = snapshot;
        }
    });
}

fn spawn_upgrade_poll_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(app_state.config.upgrade_poll_ms));
        loop {
            interval.tick().await;
            if app_state.upgrade.take() {
                warn!("firmware upgrade requested on host build, ignoring");
                app_state
                    .log
                    .record("Firmware upgrade is only available in ESP32 builds");
            }
        }
    });
}

async fn handle_get_page(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let full_log = params.get("log").is_some_and(|value| value == "all");
    render(&state, None, full_log).await
}

async fn handle_post_config(State(state): State<AppState>, body: String) -> impl IntoResponse {
    debug!("config form: {body}");
    let request = ConfigRequest::parse(&body);
    let now = now_in_timezone(&state.timezone).unwrap_or_else(|| Utc::now().fixed_offset());

    let outcome = {
        let mut schedule = state.schedule.lock().await;
        apply_config(
            &request,
            &mut schedule,
            now,
            state.config.default_duration_hours,
            &state.log,
        )
    };

    if run_config_actions(&state, outcome.actions).await {
        schedule_restart();
    }

    render(&state, outcome.notice, false).await
}

async fn run_config_actions(state: &AppState, actions: Vec<ConfigAction>) -> bool {
    let store = state.store.clone();
    let upgrade = state.upgrade.clone();
    let log = state.log.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut store = store.blocking_lock();
        execute_config_actions(actions, &mut *store, &upgrade, &log)
    })
    .await;

    match joined {
        Ok(restart) => restart,
        Err(err) => {
            warn!("config action task failed: {err}");
            false
        }
    }
}

async fn handle_sim_flow(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("ok") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'ok' parameter");
    };
    let Ok(flow_ok) = value.parse::<bool>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'ok' value, use true or false");
    };

    state.sim_flow.store(flow_ok, Ordering::Release);
    state.flow.notify();
    Json(SimFlowResponse { flow_ok }).into_response()
}

async fn render(state: &AppState, notice: Option<Notice>, full_log: bool) -> Html<String> {
    let view = PageView {
        schedule: *state.schedule.lock().await,
        control: *state.control.lock().await,
        upgrading: state.upgrade.is_pending(),
        notice,
        now: now_in_timezone(&state.timezone),
    };
    let lines = if full_log {
        state.log.replay()
    } else {
        state.log.drain()
    };
    Html(render_page(&view, &lines))
}

fn schedule_restart() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
        info!("restarting on request");
        std::process::exit(0);
    });
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config in {}", path.display()))?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

struct FileStore {
    path: PathBuf,
    values: HashMap<String, i32>,
}

impl FileStore {
    fn open(path: PathBuf) -> Self {
        let values = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("ignoring corrupt settings file {}: {err}", path.display());
                HashMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!("failed to read settings file {}: {err}", path.display());
                HashMap::new()
            }
        };
        Self { path, values }
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&self.values)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        Ok(self.values.get(key).copied())
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.flush()
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

struct SimCell {
    flow_ok: Arc<AtomicBool>,
    power: bool,
    drive: ElectrodeDrive,
}

impl SimCell {
    fn new(flow_ok: Arc<AtomicBool>) -> Self {
        Self {
            flow_ok,
            power: false,
            drive: ElectrodeDrive::Off,
        }
    }
}

impl CellIo for SimCell {
    fn flow_ok(&mut self) -> Result<bool, IoError> {
        Ok(self.flow_ok.load(Ordering::Acquire))
    }

    fn set_power(&mut self, on: bool) -> Result<(), IoError> {
        if self.power != on {
            debug!("power {}", if on { "on" } else { "off" });
        }
        self.power = on;
        Ok(())
    }

    fn set_fan(&mut self, _on: bool) -> Result<(), IoError> {
        Ok(())
    }

    fn set_electrodes(&mut self, drive: ElectrodeDrive) -> Result<(), IoError> {
        if self.drive != drive {
            debug!("electrodes {:?}", drive.levels());
        }
        self.drive = drive;
        Ok(())
    }

    fn sample_probe(&mut self) -> Result<ProbeSample, IoError> {
        let raw = if self.power { 2048 } else { 0 };
        Ok(ProbeSample {
            raw,
            millivolts: u32::from(raw) * 1100 / 4095,
        })
    }
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
