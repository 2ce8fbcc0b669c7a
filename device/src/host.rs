use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use serde_json::Value;
use tokio::{net::TcpListener, runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use homuino_common::{
    paths::DEVICES_ROOT, Actuator, AuthState, BackendConfig, Clock, ConfigError, JoinError,
    LoopControl, NetworkCredentials, ProvisioningSubmission, RawStreamEvent, RecordStorage,
    RemoteBackend, ResetInput, RuntimeConfig, SubmissionError, Supervisor, SwitchState, SyncError,
    WifiRadio, RECORD_REGION_SIZE,
};

const MQTT_CLIENT_ID: &str = "homuino-device";
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const SAVE_OK_MESSAGE: &str = "WiFi connected. Configuring device...";

const PROVISIONING_FORM: &str = include_str!("../web/provisioning.html");

struct SubmissionRequest {
    submission: ProvisioningSubmission,
    reply: oneshot::Sender<Result<(), SubmissionError>>,
}

#[derive(Clone)]
struct AppState {
    submissions: mpsc::Sender<SubmissionRequest>,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store = AppStore::new();
    tokio::fs::create_dir_all(store.data_dir.as_ref())
        .await
        .with_context(|| format!("failed to create data dir {}", store.data_dir.display()))?;

    let runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });

    let (submissions, submissions_rx) = mpsc::channel();
    spawn_control_loop(runtime, store.data_dir.as_ref().clone(), submissions_rx);

    let app = Router::new()
        .route("/", get(handle_get_form))
        .route("/save", post(handle_save))
        .with_state(AppState { submissions });

    let port = std::env::var("HOMUINO_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {addr}"))?;

    info!("provisioning server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the engine on a blocking thread. A restart request rebuilds every
/// component from storage, as a reboot would.
fn spawn_control_loop(
    runtime: RuntimeConfig,
    data_dir: PathBuf,
    submissions: mpsc::Receiver<SubmissionRequest>,
) {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || loop {
        let platform = HostPlatform::new(&runtime, data_dir.clone());
        let storage = FileStorage::new(data_dir.join("record.bin"));
        let backend = MqttBackend::new(broker_settings(&runtime.backend), handle.clone());
        let mut supervisor = Supervisor::new(runtime.clone(), platform, storage, backend);

        let mut control = supervisor.boot();
        while control == LoopControl::Continue {
            while let Ok(request) = submissions.try_recv() {
                let result = supervisor.handle_submission(request.submission);
                if request.reply.send(result).is_err() {
                    debug!("submitter went away before the reply");
                }
            }
            control = supervisor.tick();
        }

        info!("restarting device");
        release_reset_input(&data_dir);
    });
}

async fn handle_get_form() -> impl IntoResponse {
    Html(PROVISIONING_FORM)
}

async fn handle_save(
    State(state): State<AppState>,
    Form(submission): Form<ProvisioningSubmission>,
) -> Response {
    let (reply, response) = oneshot::channel();
    if state
        .submissions
        .send(SubmissionRequest { submission, reply })
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "Device is restarting").into_response();
    }

    match response.await {
        Ok(Ok(())) => (StatusCode::OK, SAVE_OK_MESSAGE).into_response(),
        Ok(Err(err)) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            (status, err.to_string()).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Device is restarting").into_response(),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HOMUINO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.homuino"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct BrokerSettings {
    host: String,
    port: u16,
    user: String,
    pass: String,
}

/// `database_url` holds `host[:port]` of the broker on the host build.
fn broker_settings(backend: &BackendConfig) -> BrokerSettings {
    let configured = backend
        .database_url
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    let (configured_host, configured_port) = match configured.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>().ok()),
        None => (configured.to_string(), None),
    };
    let configured_host = if configured_host.is_empty() {
        "localhost".to_string()
    } else {
        configured_host
    };

    BrokerSettings {
        host: std::env::var("MQTT_HOST").unwrap_or(configured_host),
        port: std::env::var("MQTT_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .or(configured_port)
            .unwrap_or(1883),
        user: std::env::var("MQTT_USER").unwrap_or(backend.device_email.clone()),
        pass: std::env::var("MQTT_PASS").unwrap_or(backend.device_password.clone()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote store emulated on an MQTT broker: every backend path is a retained
/// topic holding the JSON value, and the stream follows one topic.
struct MqttBackend {
    settings: BrokerSettings,
    runtime: Handle,
    shared: Arc<BrokerShared>,
    client: Option<AsyncClient>,
    eventloop_task: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<RawStreamEvent>,
    events: mpsc::Receiver<RawStreamEvent>,
}

#[derive(Default)]
struct BrokerShared {
    retained: Mutex<HashMap<String, Value>>,
    stream_topic: Mutex<Option<String>>,
    connected: AtomicBool,
    rejected: Mutex<Option<String>>,
}

impl BrokerShared {
    fn on_publish(&self, topic: &str, payload: &[u8], events: &mpsc::Sender<RawStreamEvent>) {
        if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                topic,
                payload.len()
            );
            return;
        }

        let value = serde_json::from_slice::<Value>(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        lock(&self.retained).insert(topic.to_string(), value.clone());

        if lock(&self.stream_topic).as_deref() == Some(topic) {
            let _ = events.send(RawStreamEvent::Put {
                path: "/".to_string(),
                data: value,
            });
        }
    }
}

impl MqttBackend {
    fn new(settings: BrokerSettings, runtime: Handle) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            settings,
            runtime,
            shared: Arc::new(BrokerShared::default()),
            client: None,
            eventloop_task: None,
            events_tx,
            events,
        }
    }
}

impl Drop for MqttBackend {
    fn drop(&mut self) {
        if let Some(task) = self.eventloop_task.take() {
            task.abort();
        }
    }
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<BrokerShared>,
    events: mpsc::Sender<RawStreamEvent>,
) {
    let subscription = format!("{DEVICES_ROOT}/#");
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(err) = client.try_subscribe(subscription.as_str(), QoS::AtLeastOnce) {
                    warn!("mqtt subscribe failed: {err}");
                }
                shared.connected.store(true, Ordering::SeqCst);
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                shared.on_publish(&message.topic, &message.payload, &events);
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(
                code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
            )) => {
                warn!("mqtt broker rejected credentials: {code:?}");
                shared.connected.store(false, Ordering::SeqCst);
                *lock(&shared.rejected) = Some(format!("{code:?}"));
                return;
            }
            Err(err) => {
                let was_connected = shared.connected.swap(false, Ordering::SeqCst);
                if was_connected && lock(&shared.stream_topic).is_some() {
                    let _ = events.send(RawStreamEvent::Closed {
                        reason: err.to_string(),
                    });
                }
                warn!("mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

impl RemoteBackend for MqttBackend {
    fn begin(&mut self) {
        if let Some(task) = self.eventloop_task.take() {
            task.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        *lock(&self.shared.rejected) = None;

        let mut options = MqttOptions::new(
            MQTT_CLIENT_ID,
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if !self.settings.user.is_empty() {
            options.set_credentials(self.settings.user.clone(), self.settings.pass.clone());
        }

        info!(
            "connecting to mqtt broker {}:{}",
            self.settings.host, self.settings.port
        );
        let (client, eventloop) = AsyncClient::new(options, 64);
        self.eventloop_task = Some(self.runtime.spawn(run_eventloop(
            eventloop,
            client.clone(),
            self.shared.clone(),
            self.events_tx.clone(),
        )));
        self.client = Some(client);
    }

    fn auth_state(&mut self) -> AuthState {
        if let Some(reason) = lock(&self.shared.rejected).clone() {
            return AuthState::Rejected(reason);
        }
        if self.shared.connected.load(Ordering::SeqCst) {
            AuthState::Ready
        } else {
            AuthState::Pending
        }
    }

    fn get(&mut self, path: &str) -> Result<Value, SyncError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionLost);
        }
        Ok(lock(&self.shared.retained)
            .get(path)
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn set(&mut self, path: &str, value: &Value) -> Result<(), SyncError> {
        let Some(client) = self.client.as_ref() else {
            return Err(SyncError::NotReady);
        };
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionRefused);
        }

        let payload = serde_json::to_vec(value).map_err(|err| SyncError::Transport(err.to_string()))?;
        client
            .try_publish(path, QoS::AtLeastOnce, true, payload)
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        lock(&self.shared.retained).insert(path.to_string(), value.clone());
        Ok(())
    }

    fn open_stream(&mut self, path: &str) -> Result<(), SyncError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotReady);
        }
        *lock(&self.shared.stream_topic) = Some(path.to_string());

        // Like a fresh stream, start with the current value.
        if let Some(current) = lock(&self.shared.retained).get(path).cloned() {
            let _ = self.events_tx.send(RawStreamEvent::Put {
                path: "/".to_string(),
                data: current,
            });
        }
        Ok(())
    }

    fn poll_stream(&mut self) -> Option<RawStreamEvent> {
        self.events.try_recv().ok()
    }
}

/// Simulated radio, servo and button for running the engine on a workstation.
///
/// `HOMUINO_SIM_NETWORKS` lists joinable SSIDs (comma separated, any SSID when
/// unset). Creating `<data dir>/reset` holds the reset button down.
struct HostPlatform {
    timezone: String,
    time_synced: bool,
    reachable: Option<Vec<String>>,
    last_ssid: Option<String>,
    joined: bool,
    access_point: Option<String>,
    reset_path: PathBuf,
}

impl HostPlatform {
    fn new(runtime: &RuntimeConfig, data_dir: PathBuf) -> Self {
        let reachable = std::env::var("HOMUINO_SIM_NETWORKS").ok().map(|value| {
            value
                .split(',')
                .map(|ssid| ssid.trim().to_string())
                .filter(|ssid| !ssid.is_empty())
                .collect()
        });

        Self {
            timezone: runtime.timezone.clone(),
            time_synced: false,
            reachable,
            last_ssid: None,
            joined: false,
            access_point: None,
            reset_path: data_dir.join("reset"),
        }
    }

    fn is_reachable(&self, ssid: &str) -> bool {
        self.reachable
            .as_ref()
            .map(|networks| networks.iter().any(|network| network == ssid))
            .unwrap_or(true)
    }
}

impl Clock for HostPlatform {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn wall_clock(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        if !self.time_synced {
            return None;
        }
        now_in_timezone(&self.timezone)
    }

    fn start_time_sync(&mut self) {
        if now_in_timezone(&self.timezone).is_none() {
            warn!("unknown timezone `{}`; wall clock unavailable", self.timezone);
        }
        self.time_synced = true;
    }
}

impl WifiRadio for HostPlatform {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), JoinError> {
        self.last_ssid = Some(credentials.ssid.clone());
        self.joined = self.is_reachable(&credentials.ssid);
        debug!("joining `{}` (simulated)", credentials.ssid);
        Ok(())
    }

    fn is_joined(&mut self) -> bool {
        self.joined
    }

    fn reconnect(&mut self) {
        if let Some(ssid) = self.last_ssid.clone() {
            self.joined = self.is_reachable(&ssid);
        }
    }

    fn disconnect(&mut self) {
        self.joined = false;
        info!("wifi disconnected (simulated)");
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), JoinError> {
        info!("access point `{ssid}` up (simulated)");
        self.access_point = Some(ssid.to_string());
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), JoinError> {
        if let Some(ssid) = self.access_point.take() {
            info!("access point `{ssid}` down (simulated)");
        }
        Ok(())
    }

    fn associated_clients(&mut self) -> usize {
        0
    }
}

impl Actuator for HostPlatform {
    fn drive(&mut self, on: bool) {
        info!("servo -> {}", SwitchState::from(on).as_str());
    }

    fn set_indicator(&mut self, lit: bool) {
        debug!("led {}", if lit { "on" } else { "off" });
    }

    fn blink(&mut self, times: u8, period_ms: u64) {
        for _ in 0..times {
            self.set_indicator(true);
            self.sleep_ms(period_ms);
            self.set_indicator(false);
            self.sleep_ms(period_ms);
        }
    }
}

impl ResetInput for HostPlatform {
    fn is_held(&mut self) -> bool {
        self.reset_path.exists()
    }
}

fn release_reset_input(data_dir: &Path) {
    match std::fs::remove_file(data_dir.join("reset")) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to release reset input: {err}"),
    }
}

/// The reserved region as a file of exactly [`RECORD_REGION_SIZE`] bytes.
struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RecordStorage for FileStorage {
    fn read(&mut self, buf: &mut [u8; RECORD_REGION_SIZE]) -> Result<(), ConfigError> {
        buf.fill(0);
        match std::fs::read(&self.path) {
            Ok(raw) => {
                let len = raw.len().min(RECORD_REGION_SIZE);
                buf[..len].copy_from_slice(&raw[..len]);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ConfigError::Storage(err.to_string())),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConfigError> {
        if bytes.len() > RECORD_REGION_SIZE {
            return Err(ConfigError::Storage(format!(
                "{} bytes exceed the {RECORD_REGION_SIZE}-byte region",
                bytes.len()
            )));
        }

        let mut region = [0_u8; RECORD_REGION_SIZE];
        self.read(&mut region)?;
        region[..bytes.len()].copy_from_slice(bytes);
        std::fs::write(&self.path, region).map_err(|err| ConfigError::Storage(err.to_string()))
    }
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
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
