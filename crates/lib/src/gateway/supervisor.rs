//! Gateway supervisor: owns the child process and its connection, and exposes status, calls
//! and events to the rest of the app.
//!
//! Lifecycle operations (`start`, `stop`, `restart`) are serialized by one async lock. Status
//! is published through a watch channel, so reading it never waits on that lock. Every start
//! begins a new generation with one monitor task, which reports at most one failure.

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{Config, SupervisorOptions};
use crate::error::BridgeError;
use crate::gateway::correlator::Correlator;
use crate::gateway::events::{BridgeEvent, EventBus, SubscriptionId, Topic};
use crate::gateway::process::{ExitInfo, GatewayProcess, LaunchSpec};
use crate::gateway::protocol::{Frame, HEALTH_METHOD};
use crate::gateway::status::{GatewayState, GatewayStatus};
use crate::gateway::transport::{gateway_ws_url, Connection, Inbound};
use crate::secrets::{ConfigSecretStore, SecretStore};
use crate::token::{AccessToken, TOKEN_ENV};

/// Env var carrying the port the gateway should listen on.
pub const PORT_ENV: &str = "WARDEN_GATEWAY_PORT";

/// How long a transport close waits for the process exit, so a crash is reported as an exit.
const SETTLE_WINDOW: Duration = Duration::from_millis(250);

/// Result of a successful health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub latency_ms: u64,
    pub payload: Value,
}

/// What the UI needs to embed the gateway's own web UI.
#[derive(Clone, Serialize)]
pub struct EmbedInfo {
    /// `http://{bind}:{port}/?token={token}`
    pub url: String,
    pub port: u16,
    #[serde(serialize_with = "expose_token")]
    pub token: AccessToken,
}

fn expose_token<S: serde::Serializer>(token: &AccessToken, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(token.expose())
}

impl std::fmt::Debug for EmbedInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedInfo")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// One live connection and the calls waiting on it.
struct Link {
    conn: Connection,
    calls: Correlator,
}

/// Resources of the current generation. Guarded by the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    generation: u64,
    process: Option<Arc<GatewayProcess>>,
    link: Option<Arc<Link>>,
    monitor: Option<oneshot::Sender<()>>,
}

struct Inner {
    options: SupervisorOptions,
    token: AccessToken,
    secrets: Arc<dyn SecretStore>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    status_tx: watch::Sender<GatewayStatus>,
    events: EventBus,
    call_ids: Arc<AtomicU64>,
    /// Current link, readable by callers without the lifecycle lock.
    link: Mutex<Option<Arc<Link>>>,
    /// Most recent process, kept after it exits for its captured output.
    last_process: Mutex<Option<Arc<GatewayProcess>>>,
    /// Bumped by every `stop()` before it waits for the lifecycle lock.
    stop_requests: watch::Sender<u64>,
}

/// Supervises one gateway child process.
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, token: AccessToken, secrets: Arc<dyn SecretStore>) -> Self {
        let (status_tx, _) = watch::channel(GatewayStatus::stopped());
        let (stop_requests, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                options,
                token,
                secrets,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
                status_tx,
                events: EventBus::new(),
                call_ids: Arc::new(AtomicU64::new(0)),
                link: Mutex::new(None),
                last_process: Mutex::new(None),
                stop_requests,
            }),
        }
    }

    /// Supervisor for the `gateway` config section, with provider keys from `providers`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let token = AccessToken::resolve(config)?;
        let secrets = Arc::new(ConfigSecretStore::new(config.providers.clone()));
        Ok(Self::new(
            SupervisorOptions::from_config(&config.gateway),
            token,
            secrets,
        ))
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    /// Spawn the gateway and connect to it. No-op while starting or running.
    ///
    /// A `stop()` issued before this start has the gateway connected interrupts it: the child
    /// is released, the state goes to Stopped and the start fails with [`BridgeError::Connect`].
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut stops = self.inner.stop_requests.subscribe();
        let mut lc = self.inner.lifecycle.lock().await;
        self.inner.start_locked(&mut lc, &mut stops).await
    }

    /// Terminate the gateway, close the connection and reject outstanding calls. Idempotent.
    /// Interrupts a start that is still waiting for the gateway.
    pub async fn stop(&self) {
        self.inner.stop_requests.send_modify(|n| *n = n.wrapping_add(1));
        let mut lc = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(&mut lc).await;
    }

    /// Stop then start, with no other lifecycle operation in between. Waits for a start in
    /// progress instead of interrupting it.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let mut stops = self.inner.stop_requests.subscribe();
        let mut lc = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(&mut lc).await;
        self.inner.start_locked(&mut lc, &mut stops).await
    }

    pub fn status(&self) -> GatewayStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Receiver that always holds the latest status.
    pub fn watch_status(&self) -> watch::Receiver<GatewayStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current_link()
            .map(|link| !link.conn.is_closed())
            .unwrap_or(false)
    }

    /// Call `method` on the gateway. `timeout` defaults to the configured call timeout.
    pub async fn rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let link = self
            .inner
            .current_link()
            .ok_or_else(|| BridgeError::closed("gateway is not running"))?;
        let timeout = timeout.unwrap_or(self.inner.options.call_timeout);
        link.calls.call(&link.conn, method, params, timeout).await
    }

    /// Probe the gateway with a `health` call. Independent of the cached status, which it
    /// never changes.
    pub async fn check_health(&self) -> Result<HealthReport, BridgeError> {
        let started = Instant::now();
        match self
            .rpc(
                HEALTH_METHOD,
                Value::Object(Default::default()),
                Some(self.inner.options.health_timeout),
            )
            .await
        {
            Ok(payload) => Ok(HealthReport {
                latency_ms: started.elapsed().as_millis() as u64,
                payload,
            }),
            Err(e) => Err(BridgeError::HealthCheckFailed(e.to_string())),
        }
    }

    /// Embed URL, port and token; `None` unless running.
    pub fn embed_info(&self) -> Option<EmbedInfo> {
        let status = self.status();
        let port = status.port().filter(|_| status.is_running())?;
        Some(EmbedInfo {
            url: format!(
                "http://{}:{}/?token={}",
                self.inner.options.bind,
                port,
                urlencoding::encode(self.inner.token.expose())
            ),
            port,
            token: self.inner.token.clone(),
        })
    }

    /// Pid of the gateway process while it is alive.
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .last_process
            .lock()
            .ok()
            .and_then(|g| g.as_ref().filter(|p| p.try_exit().is_none()).and_then(|p| p.pid()))
    }

    /// Captured output of the current (or most recent) gateway process.
    pub fn output(&self) -> Vec<String> {
        self.inner
            .last_process
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|p| p.output()))
            .unwrap_or_default()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(topic, listener)
    }

    pub fn subscribe_channel(&self, topic: Topic) -> mpsc::UnboundedReceiver<BridgeEvent> {
        self.inner.events.subscribe_channel(topic)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropping the process handle kills the child.
        if let Ok(mut lc) = self.inner.lifecycle.try_lock() {
            if let Some(cancel) = lc.monitor.take() {
                let _ = cancel.send(());
            }
            if let Some(link) = lc.link.take() {
                link.conn.disconnect();
            }
            lc.process = None;
        }
        if let Ok(mut g) = self.inner.last_process.lock() {
            g.take();
        }
        if let Ok(mut g) = self.inner.link.lock() {
            g.take();
        }
    }
}

impl Inner {
    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().ok().and_then(|g| g.clone())
    }

    fn snapshot(&self) -> GatewayStatus {
        self.status_tx.borrow().clone()
    }

    /// Publish `status`; emits a status event only when it changed.
    fn set_status(&self, status: GatewayStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            self.announce(status);
        }
    }

    /// Move the snapshot to `next` without a status event; returns the previous snapshot.
    fn leave(&self, next: GatewayStatus) -> GatewayStatus {
        self.status_tx.send_replace(next)
    }

    fn announce(&self, status: GatewayStatus) {
        log::info!("gateway {}", status);
        self.events.publish(BridgeEvent::Status(status));
    }

    /// Release the current generation once the snapshot has moved on from `previous`.
    /// Events go out as exit, error, status; the status only if it differs from `previous`.
    async fn wind_down(
        &self,
        lc: &mut Lifecycle,
        previous: GatewayStatus,
        reason: &str,
        error: Option<String>,
    ) {
        self.teardown(lc, reason).await;
        if let Some(message) = error {
            self.events.publish(BridgeEvent::Error(message));
        }
        let current = self.snapshot();
        if current != previous {
            self.announce(current);
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        lc: &mut Lifecycle,
        stops: &mut watch::Receiver<u64>,
    ) -> Result<(), BridgeError> {
        let current = self.snapshot();
        if current.is_active() {
            log::warn!("gateway already {}, ignoring start", current);
            return Ok(());
        }
        if stops.has_changed().unwrap_or(false) {
            log::info!("stop requested, not starting the gateway");
            return Err(start_interrupted());
        }
        if current.state() == GatewayState::Error {
            self.teardown(lc, "gateway restarting").await;
        }

        lc.generation += 1;
        self.set_status(GatewayStatus::starting());
        let launched = tokio::select! {
            res = self.launch(lc) => Some(res),
            _ = stops.changed() => None,
        };
        let Some(launched) = launched else {
            log::info!("gateway start interrupted by stop");
            let previous = self.leave(GatewayStatus::stopped());
            self.wind_down(lc, previous, "gateway start interrupted", None).await;
            return Err(start_interrupted());
        };
        match launched {
            Ok(port) => {
                self.set_status(GatewayStatus::running(port));
                Ok(())
            }
            Err(e) => {
                log::warn!("starting gateway failed: {}", e);
                let previous = self.leave(GatewayStatus::error(e.to_string()));
                self.wind_down(lc, previous, "gateway failed to start", Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, lc: &mut Lifecycle) {
        let previous = self.leave(GatewayStatus::stopped());
        self.wind_down(lc, previous, "gateway stopped", None).await;
    }

    /// Spawn, wait for the port, connect, and start this generation's tasks.
    async fn launch(self: &Arc<Self>, lc: &mut Lifecycle) -> Result<u16, BridgeError> {
        let port = self.pick_port()?;
        let spec = self.launch_spec(port).await;
        let process = Arc::new(GatewayProcess::spawn(&spec)?);
        lc.process = Some(process.clone());
        if let Ok(mut g) = self.last_process.lock() {
            *g = Some(process.clone());
        }

        let addr = format!("{}:{}", self.options.bind, port);
        wait_until_listening(&addr, &process, self.options.startup_timeout).await?;

        let url = gateway_ws_url(&self.options.bind, port);
        let (conn, inbound) = tokio::select! {
            res = Connection::connect(&url, &self.token, self.options.connect_timeout) => res?,
            exit = process.wait_exit() => {
                return Err(BridgeError::Connect(format!("gateway exited during startup ({})", exit)));
            }
        };
        log::debug!("gateway speaks protocol {}", conn.protocol());

        let link = Arc::new(Link {
            conn,
            calls: Correlator::sharing(self.call_ids.clone()),
        });
        tokio::spawn(dispatch_frames(self.clone(), link.clone(), inbound));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(monitor(
            self.clone(),
            lc.generation,
            process,
            link.clone(),
            cancel_rx,
        ));

        lc.link = Some(link.clone());
        lc.monitor = Some(cancel_tx);
        if let Ok(mut g) = self.link.lock() {
            *g = Some(link);
        }
        Ok(port)
    }

    /// Configured port, or a free one when configured as 0.
    fn pick_port(&self) -> Result<u16, BridgeError> {
        if self.options.port != 0 {
            return Ok(self.options.port);
        }
        std::net::TcpListener::bind((self.options.bind.as_str(), 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .map_err(|e| BridgeError::Spawn {
                executable: self.options.executable.display().to_string(),
                reason: format!("no free port on {}: {}", self.options.bind, e),
            })
    }

    async fn launch_spec(&self, port: u16) -> LaunchSpec {
        let mut env = self.options.env.clone();
        match self.secrets.provider_keys().await {
            Ok(keys) => {
                log::debug!("passing {} provider key(s) to the gateway", keys.len());
                for key in keys {
                    env.insert(key.env_var, key.value);
                }
            }
            Err(e) => log::warn!("reading provider keys failed, starting without them: {:#}", e),
        }
        env.insert(TOKEN_ENV.to_string(), self.token.expose().to_string());
        env.insert(PORT_ENV.to_string(), port.to_string());
        LaunchSpec {
            executable: self.options.executable.clone(),
            args: self.options.args_for_port(port),
            env,
            output_lines: self.options.output_lines,
        }
    }

    /// Release every resource of the current generation. The child, if any, is terminated and
    /// its exit published; each handle is released exactly once.
    async fn teardown(&self, lc: &mut Lifecycle, reason: &str) {
        if let Some(cancel) = lc.monitor.take() {
            let _ = cancel.send(());
        }
        if let Ok(mut g) = self.link.lock() {
            g.take();
        }
        if let Some(link) = lc.link.take() {
            link.conn.disconnect();
            let rejected = link.calls.fail_all(reason);
            if rejected > 0 {
                log::debug!("rejected {} outstanding call(s): {}", rejected, reason);
            }
        }
        if let Some(process) = lc.process.take() {
            let exit = process.terminate(self.options.grace).await;
            log::info!("gateway process ended ({})", exit);
            self.events.publish(BridgeEvent::Exit(exit));
        }
    }
}

fn start_interrupted() -> BridgeError {
    BridgeError::Connect("gateway start interrupted by stop".to_string())
}

/// Poll until something accepts TCP connections on `addr`, the child exits, or `timeout`.
async fn wait_until_listening(
    addr: &str,
    process: &GatewayProcess,
    timeout: Duration,
) -> Result<(), BridgeError> {
    let poll = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(250))
        .with_factor(1.5)
        .with_max_times(usize::MAX);
    let probe = (|| tokio::net::TcpStream::connect(addr))
        .retry(poll)
        .notify(|e, after| log::debug!("gateway not listening on {} yet ({}), retry in {:?}", addr, e, after));

    tokio::select! {
        res = tokio::time::timeout(timeout, probe) => match res {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Connect(format!("{}: {}", addr, e))),
            Err(_) => Err(BridgeError::Connect(format!(
                "gateway did not listen on {} within {}ms",
                addr,
                timeout.as_millis()
            ))),
        },
        exit = process.wait_exit() => Err(BridgeError::Connect(format!(
            "gateway exited during startup ({})",
            exit
        ))),
    }
}

/// Route inbound frames in arrival order: results to the correlator, events to the bus.
/// Rejects whatever is still pending once the connection ends.
async fn dispatch_frames(inner: Arc<Inner>, link: Arc<Link>, mut inbound: Inbound) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Res(res) => {
                if let Some(late) = link.calls.resolve(res) {
                    log::debug!("discarding result for retired call {}", late.id);
                }
            }
            Frame::Event(ev) => inner.events.dispatch(ev),
            Frame::Req(req) => log::debug!("ignoring {} request from gateway", req.method),
        }
    }
    let reason = link
        .conn
        .close_reason()
        .unwrap_or_else(|| "connection dropped".to_string());
    let rejected = link.calls.fail_all(&reason);
    if rejected > 0 {
        log::debug!("rejected {} outstanding call(s): {}", rejected, reason);
    }
}

enum Failure {
    Exited(ExitInfo),
    Disconnected(String),
}

/// Watch one generation for an unexpected exit or connection loss and report it once.
async fn monitor(
    inner: Arc<Inner>,
    generation: u64,
    process: Arc<GatewayProcess>,
    link: Arc<Link>,
    cancel: oneshot::Receiver<()>,
) {
    let failure = tokio::select! {
        _ = cancel => return,
        exit = process.wait_exit() => Failure::Exited(exit),
        reason = link.conn.closed() => Failure::Disconnected(reason),
    };
    drop(link);

    let mut lc = inner.lifecycle.lock().await;
    if lc.generation != generation || lc.process.is_none() {
        // Stopped or restarted in the meantime.
        return;
    }
    let (previous, failure) = match failure {
        Failure::Disconnected(reason) => {
            // Never report Running without a connection; the status event waits for the exit.
            let previous =
                inner.leave(GatewayStatus::error(format!("gateway connection closed: {}", reason)));
            match tokio::time::timeout(SETTLE_WINDOW, process.wait_exit()).await {
                Ok(exit) => (previous, Failure::Exited(exit)),
                Err(_) => (previous, Failure::Disconnected(reason)),
            }
        }
        exited => (inner.snapshot(), exited),
    };
    drop(process);

    let message = match failure {
        Failure::Exited(exit) => format!("gateway exited unexpectedly ({})", exit),
        Failure::Disconnected(reason) => format!("gateway connection closed: {}", reason),
    };
    log::warn!("{}", message);
    inner.leave(GatewayStatus::error(message.clone()));
    inner.wind_down(&mut lc, previous, &message, Some(message.clone())).await;
}
