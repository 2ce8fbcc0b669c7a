use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Gpio14, Gpio2, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
        prelude::Peripherals,
        units::FromValueType,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use homuino_common::{
    Actuator, AuthState, BackendConfig, Clock, ConfigError, JoinError, LoopControl,
    NetworkCredentials, ProvisioningSubmission, RawStreamEvent, RecordStorage, RemoteBackend,
    ResetInput, RuntimeConfig, SseDecoder, SubmissionError, Supervisor, SyncError, WifiRadio,
    RECORD_REGION_SIZE,
};

const NVS_NAMESPACE: &str = "homuino";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_RECORD_KEY: &str = "record";
const MAX_HTTP_BODY: usize = 1024;
const MAX_RESPONSE_BYTES: usize = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_TIMEOUT: Duration = Duration::from_secs(45);
const SUBMISSION_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const SIGN_IN_URL: &str = "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";
// Tokens are refreshed this long before the backend expires them.
const TOKEN_EXPIRY_MARGIN_MS: u64 = 60_000;
const SIGN_IN_RETRY_MS: u64 = 500;
const SAVE_OK_MESSAGE: &str = "WiFi connected. Configuring device...";

const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_ON_PULSE_US: u32 = 2_400;
const SERVO_OFF_PULSE_US: u32 = 500;

const PROVISIONING_FORM: &str = include_str!("../web/provisioning.html");

struct SubmissionRequest {
    submission: ProvisioningSubmission,
    reply: mpsc::Sender<Result<(), SubmissionError>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_backend_defaults(&mut runtime.backend);
    runtime.sanitize();

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;

    let servo_timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::new()
            .frequency(50.Hz().into())
            .resolution(Resolution::Bits14),
    )?;
    let servo = LedcDriver::new(peripherals.ledc.channel0, servo_timer, pins.gpio13)?;

    let mut led = PinDriver::output(pins.gpio2)?;
    led.set_low()?;
    let mut reset_button = PinDriver::input(pins.gpio14)?;
    reset_button.set_pull(Pull::Up)?;

    let platform = EspPlatform {
        timezone: runtime.timezone.clone(),
        sntp: None,
        wifi,
        station: None,
        access_point: None,
        servo,
        led,
        reset_button,
    };
    let storage = NvsRecordStorage::new(&nvs_store)?;
    let backend = FirebaseBackend::new(&runtime.backend);

    let (submissions, submissions_rx) = mpsc::channel();
    let _server = create_provisioning_http_server(submissions)?;

    let mut supervisor = Supervisor::new(runtime, platform, storage, backend);
    let mut control = supervisor.boot();
    while control == LoopControl::Continue {
        while let Ok(request) = submissions_rx.try_recv() {
            let result = supervisor.handle_submission(request.submission);
            if request.reply.send(result).is_err() {
                debug!("submitter went away before the reply");
            }
        }
        control = supervisor.tick();
    }

    info!("restarting device");
    esp_idf_svc::hal::reset::restart();
}

/// Credentials baked in at build time fill whatever NVS leaves empty.
fn ensure_backend_defaults(backend: &mut BackendConfig) {
    for (field, value) in [
        (&mut backend.database_url, option_env!("FIREBASE_URL")),
        (&mut backend.api_key, option_env!("FIREBASE_API_KEY")),
        (&mut backend.device_email, option_env!("DEVICE_EMAIL")),
        (&mut backend.device_password, option_env!("DEVICE_PASSWORD")),
    ] {
        if field.is_empty() {
            if let Some(value) = value {
                *field = value.to_string();
            }
        }
    }
}

fn create_provisioning_http_server(
    submissions: mpsc::Sender<SubmissionRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in ["/", "/generate_204", "/hotspot-detect.html", "/connecttest.txt"] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PROVISIONING_FORM.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let submission: ProvisioningSubmission = match serde_urlencoded::from_bytes(&body) {
            Ok(submission) => submission,
            Err(err) => return write_text(req, 400, &format!("invalid form: {err}")),
        };

        let (reply, response) = mpsc::channel();
        if submissions
            .send(SubmissionRequest { submission, reply })
            .is_err()
        {
            return write_text(req, 503, "Device is restarting");
        }

        match response.recv_timeout(SUBMISSION_REPLY_TIMEOUT) {
            Ok(Ok(())) => write_text(req, 200, SAVE_OK_MESSAGE),
            Ok(Err(err)) => write_text(req, err.status_code(), &err.to_string()),
            Err(_) => write_text(req, 503, "Device is busy, try again"),
        }
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_text(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

struct EspPlatform {
    timezone: String,
    sntp: Option<EspSntp<'static>>,
    wifi: EspWifi<'static>,
    station: Option<ClientConfiguration>,
    access_point: Option<AccessPointConfiguration>,
    servo: LedcDriver<'static>,
    led: PinDriver<'static, Gpio2, Output>,
    reset_button: PinDriver<'static, Gpio14, Input>,
}

impl EspPlatform {
    /// Pushes the station/AP combination currently wanted to the radio.
    fn apply_wifi_configuration(&mut self) -> Result<(), EspError> {
        let configuration = match (&self.station, &self.access_point) {
            (Some(station), Some(ap)) => Configuration::Mixed(station.clone(), ap.clone()),
            (Some(station), None) => Configuration::Client(station.clone()),
            (None, Some(ap)) => Configuration::AccessPoint(ap.clone()),
            (None, None) => {
                if self.wifi.is_started()? {
                    self.wifi.stop()?;
                }
                return Ok(());
            }
        };

        self.wifi.set_configuration(&configuration)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }

    fn set_servo_pulse(&mut self, pulse_us: u32) {
        let duty = self.servo.get_max_duty() * pulse_us / SERVO_PERIOD_US;
        if let Err(err) = self.servo.set_duty(duty) {
            warn!("failed to drive servo: {err}");
        }
    }

    fn set_led(&mut self, lit: bool) {
        let result = if lit {
            self.led.set_high()
        } else {
            self.led.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        }
    }
}

fn driver_error(err: EspError) -> JoinError {
    JoinError::Driver(err.to_string())
}

impl Clock for EspPlatform {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn wall_clock(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        let sntp = self.sntp.as_ref()?;
        if !matches!(sntp.get_sync_status(), SyncStatus::Completed) {
            return None;
        }
        now_in_timezone(&self.timezone)
    }

    fn start_time_sync(&mut self) {
        if self.sntp.is_some() {
            return;
        }
        match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                self.sntp = Some(sntp);
            }
            Err(err) => warn!("failed to start SNTP: {err}"),
        }
    }
}

impl WifiRadio for EspPlatform {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), JoinError> {
        let auth_method = if credentials.passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.station = Some(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| JoinError::Driver("wifi ssid too long".to_string()))?,
            password: credentials
                .passphrase
                .as_str()
                .try_into()
                .map_err(|_| JoinError::Driver("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });
        self.apply_wifi_configuration().map_err(driver_error)?;
        info!("wifi started, connecting to `{}`", credentials.ssid);
        self.wifi.connect().map_err(driver_error)
    }

    fn is_joined(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn reconnect(&mut self) {
        if self.station.is_none() {
            return;
        }
        if let Err(err) = self.wifi.connect() {
            warn!("wifi reconnect request failed: {err}");
        }
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect failed: {err}");
        }
        self.station = None;
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), JoinError> {
        self.access_point = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| JoinError::Driver("provisioning AP SSID too long".to_string()))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        });
        self.apply_wifi_configuration().map_err(driver_error)?;
        info!("provisioning AP started on `{ssid}`");
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), JoinError> {
        if self.access_point.take().is_none() {
            return Ok(());
        }
        self.apply_wifi_configuration().map_err(driver_error)?;
        info!("provisioning AP stopped");
        Ok(())
    }

    fn associated_clients(&mut self) -> usize {
        if self.access_point.is_none() {
            return 0;
        }
        let mut stations = esp_idf_svc::sys::wifi_sta_list_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_ap_get_sta_list(&mut stations) };
        if rc != esp_idf_svc::sys::ESP_OK {
            debug!("esp_wifi_ap_get_sta_list failed: esp_err_t={rc}");
            return 0;
        }
        stations.num.max(0) as usize
    }
}

impl Actuator for EspPlatform {
    fn drive(&mut self, on: bool) {
        let pulse = if on {
            SERVO_ON_PULSE_US
        } else {
            SERVO_OFF_PULSE_US
        };
        self.set_servo_pulse(pulse);
        self.set_led(on);
    }

    fn set_indicator(&mut self, lit: bool) {
        self.set_led(lit);
    }

    fn blink(&mut self, times: u8, period_ms: u64) {
        for _ in 0..times {
            self.set_led(true);
            thread::sleep(Duration::from_millis(period_ms));
            self.set_led(false);
            thread::sleep(Duration::from_millis(period_ms));
        }
    }
}

impl ResetInput for EspPlatform {
    fn is_held(&mut self) -> bool {
        self.reset_button.is_low()
    }
}

/// The record region as a single NVS blob.
struct NvsRecordStorage {
    nvs: EspNvs<NvsDefault>,
}

impl NvsRecordStorage {
    fn new(store: &NvsStore) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(store.partition.clone(), NVS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl RecordStorage for NvsRecordStorage {
    fn read(&mut self, buf: &mut [u8; RECORD_REGION_SIZE]) -> Result<(), ConfigError> {
        let len = match self.nvs.get_blob(NVS_RECORD_KEY, &mut buf[..]) {
            Ok(Some(stored)) => stored.len(),
            Ok(None) => 0,
            Err(err) => return Err(ConfigError::Storage(err.to_string())),
        };
        buf[len..].fill(0);
        Ok(())
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
        self.nvs
            .set_blob(NVS_RECORD_KEY, &region)
            .map_err(|err| ConfigError::Storage(err.to_string()))
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)
                .context("invalid runtime config in NVS")?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    expires_in: String,
}

struct IdToken {
    value: String,
    expires_at_ms: u64,
}

/// Realtime database over REST, with server-sent events for the stream.
struct FirebaseBackend {
    database_url: String,
    api_key: String,
    email: String,
    password: String,
    began: bool,
    last_sign_in_ms: Option<u64>,
    auth: AuthState,
    token: Option<IdToken>,
    stream_generation: Arc<AtomicU32>,
    events_tx: mpsc::Sender<RawStreamEvent>,
    events: mpsc::Receiver<RawStreamEvent>,
}

impl FirebaseBackend {
    fn new(config: &BackendConfig) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            database_url: config.database_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            email: config.device_email.clone(),
            password: config.device_password.clone(),
            began: false,
            last_sign_in_ms: None,
            auth: AuthState::Pending,
            token: None,
            stream_generation: Arc::new(AtomicU32::new(0)),
            events_tx,
            events,
        }
    }

    fn sign_in(&mut self) {
        self.last_sign_in_ms = Some(monotonic_ms());
        match self.request_token() {
            Ok(token) => {
                info!("backend authenticated");
                self.token = Some(token);
                self.auth = AuthState::Ready;
            }
            Err(SyncError::Rejected { reason, .. }) => {
                warn!("backend sign-in rejected: {reason}");
                self.token = None;
                self.auth = AuthState::Rejected(reason);
            }
            Err(err) => {
                debug!("backend sign-in unavailable: {err}");
                self.token = None;
                self.auth = AuthState::Pending;
            }
        }
    }

    fn request_token(&self) -> Result<IdToken, SyncError> {
        let url = format!("{SIGN_IN_URL}?key={}", self.api_key);
        let body = serde_json::json!({
            "email": self.email,
            "password": self.password,
            "returnSecureToken": true,
        });
        let body = serde_json::to_vec(&body).map_err(|err| SyncError::Transport(err.to_string()))?;

        let (status, payload) = exchange(Method::Post, &url, Some(&body))?;
        match status {
            200 => {
                let response: SignInResponse =
                    serde_json::from_slice(&payload).map_err(|err| SyncError::Decode {
                        path: "signIn".to_string(),
                        reason: err.to_string(),
                    })?;
                let lifetime_ms = response.expires_in.parse::<u64>().unwrap_or(3_600) * 1_000;
                Ok(IdToken {
                    value: response.id_token,
                    expires_at_ms: monotonic_ms()
                        + lifetime_ms.saturating_sub(TOKEN_EXPIRY_MARGIN_MS),
                })
            }
            400..=499 => Err(SyncError::Rejected {
                code: status,
                reason: error_reason(&payload),
            }),
            _ => Err(SyncError::Transport(format!("sign-in failed with HTTP {status}"))),
        }
    }

    fn authorized_url(&mut self, path: &str) -> Result<String, SyncError> {
        let expired = self
            .token
            .as_ref()
            .is_some_and(|token| monotonic_ms() >= token.expires_at_ms);
        if expired {
            debug!("refreshing backend token");
            self.sign_in();
        }

        let token = self.token.as_ref().ok_or(SyncError::NotReady)?;
        Ok(format!(
            "{}/{}.json?auth={}",
            self.database_url,
            path.trim_start_matches('/'),
            token.value
        ))
    }

    fn check_status(&mut self, status: u16, payload: &[u8]) -> Result<(), SyncError> {
        match status {
            200..=299 => Ok(()),
            401 | 403 => {
                warn!("backend refused the session token (HTTP {status})");
                self.token = None;
                self.auth = AuthState::Pending;
                Err(SyncError::ConnectionRefused)
            }
            500..=599 => Err(SyncError::Transport(format!("HTTP {status}"))),
            _ => Err(SyncError::Rejected {
                code: status,
                reason: error_reason(payload),
            }),
        }
    }
}

impl RemoteBackend for FirebaseBackend {
    fn begin(&mut self) {
        self.began = true;
        self.sign_in();
    }

    fn auth_state(&mut self) -> AuthState {
        let retry_due = self
            .last_sign_in_ms
            .map_or(true, |last| monotonic_ms().saturating_sub(last) >= SIGN_IN_RETRY_MS);
        if self.began && self.auth == AuthState::Pending && retry_due {
            self.sign_in();
        }
        self.auth.clone()
    }

    fn get(&mut self, path: &str) -> Result<Value, SyncError> {
        let url = self.authorized_url(path)?;
        let (status, payload) = exchange(Method::Get, &url, None)?;
        self.check_status(status, &payload)?;
        serde_json::from_slice(&payload).map_err(|err| SyncError::Decode {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    fn set(&mut self, path: &str, value: &Value) -> Result<(), SyncError> {
        let url = self.authorized_url(path)?;
        let body = serde_json::to_vec(value).map_err(|err| SyncError::Transport(err.to_string()))?;
        let (status, payload) = exchange(Method::Put, &url, Some(&body))?;
        self.check_status(status, &payload)
    }

    fn open_stream(&mut self, path: &str) -> Result<(), SyncError> {
        let url = self.authorized_url(path)?;
        let generation = self.stream_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.stream_generation.clone();
        let events = self.events_tx.clone();

        // A stale reader may still be blocked in a read; anything it sees is dropped.
        while self.events.try_recv().is_ok() {}

        thread::Builder::new()
            .name("backend-stream".into())
            .stack_size(8 * 1024)
            .spawn(move || run_stream(&url, generation, &current, &events))
            .map_err(|err| SyncError::Transport(format!("failed to spawn stream reader: {err}")))?;
        Ok(())
    }

    fn poll_stream(&mut self) -> Option<RawStreamEvent> {
        self.events.try_recv().ok()
    }
}

fn run_stream(
    url: &str,
    generation: u32,
    current: &AtomicU32,
    events: &mpsc::Sender<RawStreamEvent>,
) {
    let reason = match read_stream(url, generation, current, events) {
        Ok(()) => "stream ended".to_string(),
        Err(err) => err.to_string(),
    };

    if current.load(Ordering::SeqCst) == generation {
        debug!("backend stream closed: {reason}");
        let _ = events.send(RawStreamEvent::Closed { reason });
    }
}

fn read_stream(
    url: &str,
    generation: u32,
    current: &AtomicU32,
    events: &mpsc::Sender<RawStreamEvent>,
) -> Result<(), SyncError> {
    let mut client = HttpClient::wrap(
        EspHttpConnection::new(&http_configuration(STREAM_TIMEOUT)).map_err(transport_error)?,
    );
    let request = client
        .request(Method::Get, url, &[("Accept", "text/event-stream")])
        .map_err(|_| SyncError::ConnectionRefused)?;
    let mut response = request.submit().map_err(|_| SyncError::ConnectionLost)?;

    let status = response.status();
    if status != 200 {
        return Err(SyncError::Transport(format!("stream refused with HTTP {status}")));
    }

    let mut decoder = SseDecoder::new();
    let mut pending = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(|_| SyncError::Timeout)?;
        if read == 0 || current.load(Ordering::SeqCst) != generation {
            return Ok(());
        }

        pending.extend_from_slice(&chunk[..read]);
        while let Some(end) = pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]);
            if let Some(event) = decoder.push_line(&line) {
                if events.send(event).is_err() {
                    return Ok(());
                }
            }
        }

        if pending.len() > MAX_RESPONSE_BYTES {
            return Err(SyncError::Transport("stream line too long".to_string()));
        }
    }
}

fn http_configuration(timeout: Duration) -> HttpClientConfiguration {
    HttpClientConfiguration {
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
        ..Default::default()
    }
}

/// One request/response round trip. Returns the status and the body.
fn exchange(method: Method, url: &str, body: Option<&[u8]>) -> Result<(u16, Vec<u8>), SyncError> {
    let mut client = HttpClient::wrap(
        EspHttpConnection::new(&http_configuration(REQUEST_TIMEOUT)).map_err(transport_error)?,
    );
    let content_length = body.map_or(0, <[u8]>::len).to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];

    let mut request = client
        .request(method, url, &headers)
        .map_err(|_| SyncError::ConnectionRefused)?;
    if let Some(body) = body {
        request
            .write_all(body)
            .map_err(|_| SyncError::ConnectionLost)?;
    }
    let mut response = request.submit().map_err(|_| SyncError::ConnectionLost)?;

    let status = response.status();
    let mut payload = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response
            .read(&mut chunk)
            .map_err(|_| SyncError::ConnectionLost)?;
        if read == 0 {
            break;
        }
        if payload.len() + read > MAX_RESPONSE_BYTES {
            return Err(SyncError::Transport("response too large".to_string()));
        }
        payload.extend_from_slice(&chunk[..read]);
    }

    Ok((status, payload))
}

fn transport_error(err: EspError) -> SyncError {
    SyncError::Transport(err.to_string())
}

/// Auth errors nest the message, database errors carry it as a string.
fn error_reason(payload: &[u8]) -> String {
    let parsed = serde_json::from_slice::<Value>(payload).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    match error {
        Some(Value::String(message)) => message.clone(),
        Some(body) => body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        None => String::from_utf8_lossy(payload).into_owned(),
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
