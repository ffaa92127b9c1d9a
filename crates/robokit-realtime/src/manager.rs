//! The connection manager: one background thread owning the socket.
//!
//! All socket I/O happens on a dedicated OS thread running a single-threaded
//! tokio runtime, so the rest of the framework (plain threads, no async)
//! talks to the session through a thread-safe facade: a command channel in,
//! atomic state and metrics out.  The loop is the only writer of
//! [`ConnectionState`]; every transition goes through
//! [`next_state`](crate::state::next_state).
//!
//! Failure handling:
//!
//! - A dropped or failed socket moves the loop to `Reconnecting`, waits out
//!   the capped exponential backoff, and tries again.
//! - Reconnect attempts are numbered per failure streak; once the upcoming
//!   attempt number exceeds `max_reconnect_attempts` the loop goes terminal:
//!   it lands in `Disconnected`, emits a single `connection.fatal` synthetic
//!   event, and answers `false` to every further send.
//! - Frames sent while the socket is down are buffered in a bounded queue
//!   and flushed in order on the next successful handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use robokit_types::{RealtimeConfig, RobotError};

use crate::backoff::ReconnectBackoff;
use crate::events::{ClientEvent, ServerEvent, synthetic};
use crate::handlers::{EventHandler, HandlerRegistry};
use crate::metrics::{ConnectionMetrics, MetricsCell};
use crate::queue::OutboundQueue;
use crate::state::{ConnectionState, StateCell, Trigger};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Instructions crossing from caller threads into the loop.
enum Command {
    Send {
        frame: String,
        reply: std::sync::mpsc::SyncSender<bool>,
    },
    Stop,
}

/// State the loop publishes and callers read.
struct Shared {
    state: StateCell,
    metrics: MetricsCell,
    /// Set once when the retry budget runs out; never cleared.
    gave_up: AtomicBool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Public facade
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe handle to the streaming session.
///
/// Construct with [`ConnectionManager::new`], register handlers, then call
/// [`start`](ConnectionManager::start) once.  All methods take `&self`, so
/// the manager is shared behind an [`Arc`] as-is.
pub struct ConnectionManager {
    config: RealtimeConfig,
    registry: HandlerRegistry,
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Validate `config` and build an idle manager.  No socket is touched
    /// until [`start`](ConnectionManager::start).
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Config`] when the endpoint URL or API key is
    /// missing, or the retry/queue settings are inconsistent.
    pub fn new(config: RealtimeConfig) -> Result<Self, RobotError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(config.outbound_queue_capacity);
        Ok(Self {
            config,
            registry: HandlerRegistry::new(),
            shared: Arc::new(Shared {
                state: StateCell::default(),
                metrics: MetricsCell::default(),
                gave_up: AtomicBool::new(false),
            }),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Register `handler` for inbound events of one `type`.
    pub fn on(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.registry.on(event_type, handler);
    }

    /// Register `handler` for every inbound event, including the synthetic
    /// `connection.*` events the loop injects.
    pub fn on_any(&self, handler: Arc<dyn EventHandler>) {
        self.registry.on_any(handler);
    }

    /// Spawn the connection thread and begin connecting.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Connection`] when called twice or when the OS
    /// refuses to spawn the thread.
    pub fn start(&self) -> Result<(), RobotError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RobotError::Connection(
                "connection manager already started".to_string(),
            ));
        }
        let cmd_rx = self
            .cmd_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| {
                RobotError::Connection("command receiver already consumed".to_string())
            })?;

        let event_loop = EventLoop {
            backoff: ReconnectBackoff::new(
                self.config.reconnect_base_delay(),
                self.config.reconnect_max_delay(),
            ),
            queue: OutboundQueue::new(self.config.outbound_queue_capacity),
            config: self.config.clone(),
            registry: self.registry.clone(),
            shared: Arc::clone(&self.shared),
            cmd_rx,
            attempt: 0,
            had_session: false,
        };
        let handle = thread::Builder::new()
            .name("realtime-conn".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        error!(%error, "failed to build connection runtime");
                        event_loop.shared.state.close();
                        return;
                    }
                };
                runtime.block_on(event_loop.run());
            })
            .map_err(|e| {
                RobotError::Connection(format!("failed to spawn connection thread: {e}"))
            })?;
        if let Ok(mut slot) = self.thread.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Send `event`, blocking the calling thread until it is written to the
    /// socket, buffered for later delivery, or refused.
    ///
    /// Returns `true` when the frame was written or queued, `false` when the
    /// session is terminally failed, stopped, not started, or the reply did
    /// not arrive within `send_timeout_s`.  The timeout is a hard cap on the
    /// whole call: enqueueing the command and waiting for the loop's reply
    /// share the same deadline.
    pub fn send_sync(&self, event: &ClientEvent) -> bool {
        if self.shared.gave_up.load(Ordering::Acquire)
            || !self.started.load(Ordering::Acquire)
            || self.shared.state.get() == ConnectionState::Closed
        {
            return false;
        }
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "refusing to send unserialisable event");
                return false;
            }
        };
        let deadline = Instant::now() + self.config.send_timeout();
        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        let mut command = Command::Send {
            frame,
            reply: reply_tx,
        };
        // The loop may be mid-handshake and not draining commands; poll for
        // channel capacity rather than parking past the deadline.
        loop {
            match self.cmd_tx.try_send(command) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    command = returned;
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        matches!(reply_rx.recv_timeout(remaining), Ok(true))
    }

    /// Ask the loop to close the socket and exit, then wait for the thread.
    /// Idempotent; safe to call even if `start` never ran.
    pub fn stop(&self) {
        let _ = self.cmd_tx.blocking_send(Command::Stop);
        if let Ok(mut slot) = self.thread.lock()
            && let Some(handle) = slot.take()
            && handle.join().is_err()
        {
            error!("connection thread panicked during shutdown");
        }
        self.shared.state.close();
    }

    /// Final teardown: stop the loop and refuse every future send.
    pub fn destroy(&self) {
        self.shared.gave_up.store(true, Ordering::Release);
        self.stop();
    }

    pub fn get_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn get_metrics(&self) -> ConnectionMetrics {
        self.shared.metrics.snapshot()
    }

    /// True once the retry budget has been exhausted and the session will
    /// never recover on its own.
    pub fn is_terminal(&self) -> bool {
        self.shared.gave_up.load(Ordering::Acquire)
            && self.shared.state.get() == ConnectionState::Disconnected
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event loop
// ─────────────────────────────────────────────────────────────────────────────

struct EventLoop {
    config: RealtimeConfig,
    registry: HandlerRegistry,
    shared: Arc<Shared>,
    cmd_rx: mpsc::Receiver<Command>,
    queue: OutboundQueue,
    backoff: ReconnectBackoff,
    /// Number of the reconnect attempt within the current failure streak,
    /// 1-based; 0 means no streak (connected, or still on the initial
    /// connect).  Incremented as each backoff wait begins, so the budget is
    /// checked *before* the attempt is made.
    attempt: u32,
    had_session: bool,
}

impl EventLoop {
    async fn run(mut self) {
        self.shared.state.apply(Trigger::Start);
        info!(url = %self.config.url, "connection loop started");
        loop {
            match self.shared.state.get() {
                ConnectionState::Connecting => self.try_connect().await,
                ConnectionState::Reconnecting => self.wait_backoff().await,
                ConnectionState::Disconnected => {
                    self.serve_terminal().await;
                    return;
                }
                ConnectionState::Closed => {
                    info!("connection loop stopped");
                    return;
                }
                // run_connected always applies a trigger before returning.
                ConnectionState::Connected => {
                    self.shared.state.apply(Trigger::SocketLost);
                }
            }
        }
    }

    async fn try_connect(&mut self) {
        self.shared.metrics.record_attempt(self.had_session);
        match self.connect().await {
            Ok(stream) => {
                self.attempt = 0;
                self.shared.state.apply(Trigger::HandshakeOk);
                self.shared.metrics.mark_connected();
                info!(queued = self.queue.len(), "session established");
                self.run_connected(stream).await;
                self.shared.metrics.mark_disconnected();
            }
            Err(error) => {
                warn!(
                    %error,
                    attempt = self.attempt,
                    budget = self.config.max_reconnect_attempts,
                    "connect attempt failed"
                );
                self.shared.state.apply(Trigger::SocketLost);
                self.registry.dispatch(&ServerEvent::synthetic(
                    synthetic::DISCONNECTED,
                    &error.to_string(),
                ));
            }
        }
    }

    /// TCP connect plus WebSocket upgrade, bounded by the handshake timeout.
    /// Credentials ride in the `Sec-WebSocket-Protocol` offer, as the
    /// realtime endpoint expects from browser-style clients.
    async fn connect(&self) -> Result<WsStream, RobotError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RobotError::Connection(format!("bad endpoint url: {e}")))?;
        let protocols = format!(
            "realtime, openai-insecure-api-key.{}, openai-beta.realtime-v1",
            self.config.api_key
        );
        let value = HeaderValue::from_str(&protocols)
            .map_err(|e| RobotError::Connection(format!("credential not header-safe: {e}")))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);

        let (stream, response) =
            tokio::time::timeout(self.config.connection_timeout(), connect_async(request))
                .await
                .map_err(|_| RobotError::Connection("handshake timed out".to_string()))?
                .map_err(|e| RobotError::Connection(e.to_string()))?;
        debug!(status = %response.status(), "websocket handshake accepted");
        Ok(stream)
    }

    async fn run_connected(&mut self, stream: WsStream) {
        let (mut sink, mut source) = stream.split();

        // Deliver everything buffered while the socket was down, oldest
        // first, before accepting live traffic.
        while let Some(frame) = self.queue.pop() {
            if let Err(error) = sink.send(WsMessage::Text(frame.into())).await {
                self.on_socket_lost(&format!("flush failed: {error}"));
                return;
            }
            self.shared.metrics.record_sent();
        }

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Send { frame, reply }) => {
                        match sink.send(WsMessage::Text(frame.clone().into())).await {
                            Ok(()) => {
                                self.shared.metrics.record_sent();
                                let _ = reply.try_send(true);
                            }
                            Err(error) => {
                                // The write failed but the frame is not lost:
                                // it goes to the queue for the next session.
                                self.queue.push(frame);
                                let _ = reply.try_send(true);
                                self.on_socket_lost(&format!("send failed: {error}"));
                                return;
                            }
                        }
                    }
                    Some(Command::Stop) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        self.shared.state.apply(Trigger::StopRequested);
                        return;
                    }
                },
                incoming = source.next() => {
                    if !self.handle_incoming(&mut sink, incoming).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `false` when the socket is gone and the session loop must
    /// unwind.
    async fn handle_incoming(
        &mut self,
        sink: &mut WsSink,
        incoming: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> bool {
        match incoming {
            Some(Ok(WsMessage::Text(text))) => {
                self.shared.metrics.record_received();
                match ServerEvent::parse(text.as_str()) {
                    Ok(event) => {
                        self.registry.dispatch(&event);
                    }
                    Err(error) => warn!(%error, "discarding undecodable frame"),
                }
                true
            }
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = sink.send(WsMessage::Pong(payload)).await;
                true
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                self.on_socket_lost("peer closed the connection");
                false
            }
            Some(Ok(_)) => true,
            Some(Err(error)) => {
                self.on_socket_lost(&format!("read failed: {error}"));
                false
            }
        }
    }

    fn on_socket_lost(&mut self, reason: &str) {
        self.had_session = true;
        self.shared.state.apply(Trigger::SocketLost);
        warn!(reason, "session lost; reconnecting");
        self.registry
            .dispatch(&ServerEvent::synthetic(synthetic::RECONNECTING, reason));
    }

    /// Number the upcoming reconnect attempt, go terminal if it would bust
    /// the budget, and otherwise sleep out its backoff delay, buffering any
    /// frames that arrive in the meantime.  Sends during the delay succeed
    /// (they are queued).
    async fn wait_backoff(&mut self) {
        self.attempt += 1;
        if self.attempt > self.config.max_reconnect_attempts {
            self.shared.state.apply(Trigger::AttemptsExhausted);
            return;
        }
        let delay = self.backoff.delay(self.attempt);
        debug!(delay_s = delay.as_secs_f64(), "waiting before reconnect");
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Send { frame, reply }) => {
                        self.queue.push(frame);
                        let _ = reply.try_send(true);
                    }
                    Some(Command::Stop) | None => {
                        self.shared.state.apply(Trigger::StopRequested);
                        return;
                    }
                }
            }
        }
        self.shared.state.apply(Trigger::BackoffElapsed);
    }

    /// The retry budget is spent.  Announce the failure exactly once, then
    /// answer `false` to any in-flight sends until the owner stops us.
    async fn serve_terminal(&mut self) {
        self.shared.gave_up.store(true, Ordering::Release);
        let attempts = self.config.max_reconnect_attempts;
        error!(attempts, "reconnect budget exhausted; session will not recover");
        self.registry.dispatch(&ServerEvent::synthetic(
            synthetic::FATAL,
            &RobotError::Terminal { attempts }.to_string(),
        ));
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                Command::Send { reply, .. } => {
                    let _ = reply.try_send(false);
                }
                Command::Stop => break,
            }
        }
        self.shared.state.apply(Trigger::StopRequested);
    }
}
