//! Test run sessions
//!
//! A [`RunSession`] owns one invocation of the test process: the child
//! process, its handshake channel and the inspector client. The process is
//! started paused; once the handshake channel reports that the inspector is
//! listening, the session attaches, enables the domains it relays and resumes
//! the process.
//!
//! [`SessionManager`] keeps at most one session alive. Starting a run tears
//! the previous one down first. [`RunQueue`] feeds it requests one at a time,
//! in the order clients sent them.

use crate::broadcast::{Broadcaster, RunSink};
use crate::config::RunnerConfig;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use testscope_common::protocol::{ExitInfo, TestError};
use testscope_common::{
    Error, InspectorClient, InspectorEvent, OutputStream, RelayMessage, Result, RunRequest,
    SignalChannel, SignalEvent,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands sent once the inspector is reachable, in order.
///
/// Failures reported by the inspector itself are logged and skipped; only a
/// broken transport aborts the attach.
const ENABLE_SEQUENCE: &[&str] = &[
    "Inspector.enable",
    "Runtime.enable",
    "Console.enable",
    "TestReporter.enable",
    "LifecycleReporter.enable",
    "Debugger.enable",
    "Debugger.setBreakpointsActive",
    "Inspector.initialized",
    "Debugger.resume",
];

/// How long a torn-down session may take to reap its process
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Output still buffered in the pipes after exit is drained for at most this long
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Lifecycle of a run session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Spawning,
    AwaitingSignal,
    ConnectingInspector,
    Attached,
    Exited,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Spawning => write!(f, "spawning"),
            SessionState::AwaitingSignal => write!(f, "awaiting-signal"),
            SessionState::ConnectingInspector => write!(f, "connecting-inspector"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Exited => write!(f, "exited"),
        }
    }
}

/// Outcome of asking the connect state for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Go ahead; carries the 1-based attempt number
    Attempt(u32),
    /// Already attached, attaching, or closed
    Skip,
    /// Out of attempts; the state is now closed
    GiveUp,
}

/// Bounded inspector attach bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectState {
    attempts: u32,
    max_attempts: u32,
    closed: bool,
    attached: bool,
    in_flight: bool,
}

impl ConnectState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            closed: false,
            attached: false,
            in_flight: false,
        }
    }

    pub fn next(&mut self) -> ConnectDecision {
        if self.closed || self.attached || self.in_flight {
            return ConnectDecision::Skip;
        }
        if self.attempts >= self.max_attempts {
            self.closed = true;
            return ConnectDecision::GiveUp;
        }
        self.attempts += 1;
        self.in_flight = true;
        ConnectDecision::Attempt(self.attempts)
    }

    pub fn succeeded(&mut self) {
        self.in_flight = false;
        self.attached = true;
    }

    /// Record a failed attempt; returns whether a retry should be scheduled.
    pub fn failed(&mut self) -> bool {
        self.in_flight = false;
        !self.closed
    }

    /// The inspector link dropped; a later signal may attach again.
    pub fn detached(&mut self) {
        self.attached = false;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Fully resolved process invocation
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the test process invocation for `request`.
///
/// Explicit files replace the default root/pattern; a name filter is passed
/// through the configured flag.
pub fn build_launch(
    runner: &RunnerConfig,
    request: &RunRequest,
    inspector_url: &str,
    signal_url: &str,
) -> Result<LaunchSpec> {
    let (program, base_args) = runner
        .command
        .split_first()
        .ok_or_else(|| Error::InvalidConfig("runner command is empty".to_string()))?;

    let mut args = base_args.to_vec();
    if request.files().is_empty() {
        args.extend(runner.test_root.iter().cloned());
        args.extend(runner.test_pattern.iter().cloned());
    } else {
        args.extend(request.files().iter().cloned());
    }
    if let Some(pattern) = request.name_pattern() {
        args.push(runner.name_filter_flag.clone());
        args.push(pattern.to_string());
    }

    let mut env = vec![
        (runner.inspect_env.clone(), format!("{}?wait=1", inspector_url)),
        (runner.notify_env.clone(), signal_url.to_string()),
        ("FORCE_COLOR".to_string(), "1".to_string()),
    ];
    env.extend(runner.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(LaunchSpec {
        program: program.clone(),
        args,
        env,
        cwd: runner.cwd.clone(),
    })
}

/// Inspector endpoint with a fresh random path
pub fn inspector_url(port: u16) -> String {
    let path: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("ws://127.0.0.1:{}/{}", port, path)
}

/// Find a free loopback port. The port is released before returning.
pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug)]
struct SessionShared {
    state: Mutex<SessionState>,
    connect: Mutex<ConnectState>,
}

impl SessionShared {
    fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            connect: Mutex::new(ConnectState::new(max_attempts)),
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state == SessionState::Exited || *state == next {
            return;
        }
        debug!("Session {} -> {}", *state, next);
        *state = next;
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Signal,
    Retry,
}

#[derive(Clone)]
struct AttachContext {
    inspector: InspectorClient,
    url: String,
    sink: RunSink,
    shared: Arc<SessionShared>,
    retry_delay: Duration,
    cancel: CancellationToken,
}

/// One test process invocation and everything attached to it
pub struct RunSession {
    generation: u64,
    request: RunRequest,
    inspector: InspectorClient,
    signal: Arc<SignalChannel>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    waiter: Option<JoinHandle<()>>,
}

impl RunSession {
    /// Spawn the test process for `request` and start waiting for its handshake.
    pub async fn start(runner: &RunnerConfig, request: RunRequest, sink: RunSink) -> Result<Self> {
        let shared = Arc::new(SessionShared::new(runner.connect_attempts));
        shared.set_state(SessionState::Spawning);

        let inspector_url = inspector_url(find_free_port()?);
        let (signal, signal_events) = SignalChannel::open(0).await?;
        let signal = Arc::new(signal);

        let inspector = InspectorClient::new();
        wire_relay(&inspector, &sink);
        {
            let shared = shared.clone();
            inspector.on(InspectorEvent::Disconnected, move |params| {
                shared.connect.lock().detached();
                if let Some(reason) = params.get("reason").and_then(Value::as_str) {
                    warn!("Inspector disconnected: {}", reason);
                }
            });
        }
        inspector.on(InspectorEvent::Error, |params| {
            warn!("Inspector error: {}", params);
        });

        let launch = build_launch(runner, &request, &inspector_url, &signal.url())?;
        info!("Spawning: {}", launch.command_line());
        debug!(
            "{}={}?wait=1 {}={}",
            runner.inspect_env,
            inspector_url,
            runner.notify_env,
            signal.url()
        );

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {}: {}", launch.program, e)))?;
        debug!("Test process pid {:?}", child.id());
        shared.set_state(SessionState::AwaitingSignal);

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                stdout,
                OutputStream::Stdout,
                sink.clone(),
                runner.mirror_output,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                stderr,
                OutputStream::Stderr,
                sink.clone(),
                runner.mirror_output,
            )));
        }

        let cancel = CancellationToken::new();
        let ctx = AttachContext {
            inspector: inspector.clone(),
            url: inspector_url,
            sink: sink.clone(),
            shared: shared.clone(),
            retry_delay: runner.retry_delay(),
            cancel: cancel.clone(),
        };
        let triggers = spawn_attach_driver(ctx);
        tokio::spawn(forward_signals(signal_events, triggers, cancel.clone()));

        let waiter = tokio::spawn(watch_exit(
            child,
            pumps,
            sink.clone(),
            shared.clone(),
            inspector.clone(),
            signal.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            generation: sink.generation(),
            request,
            inspector,
            signal,
            shared,
            cancel,
            waiter: Some(waiter),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect.lock().attempts()
    }

    /// Kill the process and release the inspector and handshake channel.
    ///
    /// Idempotent; the pieces may be released in any order.
    pub fn teardown(&self) {
        self.shared.connect.lock().close();
        self.cancel.cancel();
        self.inspector.close();
        self.signal.close();
    }

    /// Tear down and wait (bounded) for the process to be reaped.
    pub async fn shutdown(mut self) {
        self.teardown();
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, waiter).await.is_err() {
            warn!("Test process did not exit within {:?}", SHUTDOWN_GRACE);
        }
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Relay inspector events to clients, tagged with their message type.
fn wire_relay(inspector: &InspectorClient, sink: &RunSink) {
    let relays: [(InspectorEvent, fn(Value) -> RelayMessage); 4] = [
        (InspectorEvent::TestFound, RelayMessage::Found),
        (InspectorEvent::TestStart, RelayMessage::Start),
        (InspectorEvent::TestEnd, RelayMessage::End),
        (InspectorEvent::ConsoleApiCalled, RelayMessage::Console),
    ];
    for (event, wrap) in relays {
        let sink = sink.clone();
        inspector.on(event, move |params| {
            sink.send(wrap(params.clone()));
        });
    }

    let sink = sink.clone();
    inspector.on(InspectorEvent::LifecycleError, move |params| {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| params.to_string());
        sink.send(RelayMessage::Error(TestError {
            test_id: None,
            message,
        }));
    });
}

/// Spawn the task that turns handshake signals and retries into attach attempts.
fn spawn_attach_driver(ctx: AttachContext) -> mpsc::UnboundedSender<Trigger> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let retry_tx = tx.clone();

    tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let decision = ctx.shared.connect.lock().next();
            let attempt = match decision {
                ConnectDecision::Attempt(n) => n,
                ConnectDecision::Skip => continue,
                ConnectDecision::GiveUp => {
                    warn!(
                        "Inspector connect giving up after {} attempts",
                        ctx.shared.connect.lock().attempts()
                    );
                    continue;
                }
            };

            debug!("Attaching to inspector ({:?}, attempt {})", trigger, attempt);
            ctx.shared.set_state(SessionState::ConnectingInspector);

            match attach(&ctx.inspector, &ctx.url).await {
                Ok(()) => {
                    ctx.shared.connect.lock().succeeded();
                    ctx.shared.set_state(SessionState::Attached);
                    info!("Inspector ready");
                }
                Err(e) => {
                    let retry = ctx.shared.connect.lock().failed();
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    warn!("Inspector init failed (attempt {}): {}", attempt, e);
                    ctx.sink.send(RelayMessage::output(
                        OutputStream::Stderr,
                        format!("Inspector init failed: {}", e),
                    ));
                    if retry {
                        let tx = retry_tx.clone();
                        let delay = ctx.retry_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Trigger::Retry);
                        });
                    }
                }
            }
        }
        debug!("Attach driver stopped");
    });

    tx
}

/// Connect and run the enable sequence.
async fn attach(inspector: &InspectorClient, url: &str) -> Result<()> {
    inspector.connect(url).await?;

    for method in ENABLE_SEQUENCE {
        let params = (*method == "Debugger.setBreakpointsActive").then(|| json!({ "active": true }));
        match inspector.send(method, params).await {
            Ok(_) => debug!("{} ok", method),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) if e.is_already_enabled() => debug!("{}: {}", method, e),
            Err(e) => warn!("{} failed: {}", method, e),
        }
    }
    Ok(())
}

async fn forward_signals(
    mut events: mpsc::UnboundedReceiver<SignalEvent>,
    triggers: mpsc::UnboundedSender<Trigger>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            event if event.is_ready_signal() => {
                debug!("Handshake signal: {:?}", event);
                if triggers.send(Trigger::Signal).is_err() {
                    break;
                }
            }
            SignalEvent::Error(e) => warn!("Handshake channel error: {}", e),
            SignalEvent::Closed => break,
            other => debug!("Handshake event: {:?}", other),
        }
    }
}

async fn pump_output<R>(mut reader: R, stream: OutputStream, sink: RunSink, mirror: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    let mut decoder = Utf8Chunker::default();

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{} read failed: {}", stream, e);
                break;
            }
        };

        if mirror {
            let _ = match stream {
                OutputStream::Stdout => tokio::io::stdout().write_all(&buffer[..n]).await,
                OutputStream::Stderr => tokio::io::stderr().write_all(&buffer[..n]).await,
            };
        }

        if let Some(text) = decoder.push(&buffer[..n]) {
            sink.send(RelayMessage::output(stream, text));
        }
    }

    if let Some(rest) = decoder.finish() {
        sink.send(RelayMessage::output(stream, rest));
    }
}

async fn watch_exit(
    mut child: Child,
    pumps: Vec<JoinHandle<()>>,
    sink: RunSink,
    shared: Arc<SessionShared>,
    inspector: InspectorClient,
    signal: Arc<SignalChannel>,
    cancel: CancellationToken,
) {
    let mut superseded = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            debug!("Killing superseded test process");
            superseded = true;
            if let Err(e) = child.start_kill() {
                debug!("Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed waiting for test process: {}", e);
            None
        }
    };
    info!("Test process exited with code {:?}", code);

    // Let buffered output reach clients before the terminal message.
    let drained = futures::future::join_all(pumps);
    if tokio::time::timeout(OUTPUT_DRAIN, drained).await.is_err() {
        debug!("Output still open after exit");
    }

    // Test events the process wrote just before exiting may still be in
    // flight; the inspector socket closes once they have all been read.
    if !superseded && inspector.is_connected() {
        let drained = inspector.wait_disconnected();
        if tokio::time::timeout(OUTPUT_DRAIN, drained).await.is_err() {
            debug!("Inspector still open after exit");
        }
    }

    shared.connect.lock().close();
    shared.set_state(SessionState::Exited);
    sink.send(RelayMessage::Exit(ExitInfo { code }));

    inspector.close();
    signal.close();
    cancel.cancel();
}

/// Splits a byte stream into UTF-8 text without breaking multi-byte characters
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // incomplete sequence at the end: keep it for the next chunk
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        Some(text)
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Owns the single active session
pub struct SessionManager {
    runner: RunnerConfig,
    broadcaster: Broadcaster,
    current: tokio::sync::Mutex<Option<RunSession>>,
}

impl SessionManager {
    pub fn new(runner: RunnerConfig, broadcaster: Broadcaster) -> Self {
        Self {
            runner,
            broadcaster,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start a run, superseding any active one. Returns the run's generation.
    ///
    /// A spawn failure is reported to clients as stderr output plus an exit.
    pub async fn start_run(&self, request: RunRequest) -> Result<u64> {
        let mut current = self.current.lock().await;

        // Advance first so nothing from the old run goes out once we tear it down.
        let generation = self.broadcaster.advance();
        if let Some(previous) = current.take() {
            debug!("Superseding run {}", previous.generation());
            previous.shutdown().await;
        }

        info!(
            "Starting run {} (files: {:?}, pattern: {:?})",
            generation,
            request.files(),
            request.name_pattern()
        );

        let sink = self.broadcaster.sink(generation);
        match RunSession::start(&self.runner, request, sink.clone()).await {
            Ok(session) => {
                *current = Some(session);
                Ok(generation)
            }
            Err(e) => {
                warn!("Failed to start test run: {}", e);
                sink.send(RelayMessage::output(
                    OutputStream::Stderr,
                    format!("Failed to start test run: {}", e),
                ));
                sink.send(RelayMessage::Exit(ExitInfo { code: None }));
                Err(e)
            }
        }
    }

    /// Tear down the active session, if any.
    pub async fn stop(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.shutdown().await;
        }
    }

    pub async fn state(&self) -> Option<SessionState> {
        self.current.lock().await.as_ref().map(RunSession::state)
    }

    /// Request of the active session
    pub async fn current_request(&self) -> Option<RunRequest> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|session| session.request().clone())
    }
}

/// Hands run requests to the [`SessionManager`] one at a time.
///
/// Requests are started in arrival order. Requests that pile up while a
/// start is in progress collapse to the newest, since it would supersede
/// the others immediately anyway.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::UnboundedSender<RunRequest>,
}

impl RunQueue {
    pub fn spawn(sessions: Arc<SessionManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunRequest>();
        tokio::spawn(async move {
            while let Some(mut request) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    debug!("Run request {:?} superseded before it started", request);
                    request = newer;
                }
                if let Err(e) = sessions.start_run(request).await {
                    warn!("Run request failed: {}", e);
                }
            }
            debug!("Run queue stopped");
        });
        Self { tx }
    }

    pub fn submit(&self, request: RunRequest) {
        if self.tx.send(request).is_err() {
            warn!("Run queue is gone; dropping request");
        }
    }
}
