//! [`NodeRuntime`] – one OS thread per node.
//!
//! A node is anything implementing the [`Node`] trait:
//! `initialize` runs once on the node's dedicated thread, `main_loop` is
//! called repeatedly until a stop is requested or an error occurs, and
//! `cleanup` runs exactly once on every exit path – whatever `initialize`
//! acquired, `cleanup` releases.
//!
//! The runtime publishes a heartbeat on [`topics::HEARTBEAT`] between loop
//! iterations and a start/stop/error notice on [`topics::NODE_LIFECYCLE`].
//! Failures (an `Err` return *or* a panic) are contained to the failing node:
//! its state becomes [`NodeState::Error`] and sibling nodes never notice.
//!
//! The run loop sleeps at most `poll_interval` between iterations, so the
//! externally writable stop flag is observed promptly.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use robokit_bus::MessageBus;
use robokit_types::{HeartbeatData, NodeConfig, Payload, RobotError, topics};
use tracing::{debug, error, info, warn};

use crate::state::{NodeState, StateCell};

// ─────────────────────────────────────────────────────────────────────────────
// Node trait
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of behaviour hosted on its own thread by [`NodeRuntime`].
///
/// Implementations receive the bus (and any other collaborators) at
/// construction time; the runtime only drives the lifecycle.
pub trait Node: Send {
    /// Stable node name, used as the bus `source_node`, heartbeat identity,
    /// and supervisor key.
    fn name(&self) -> &str;

    /// One-time setup on the node's dedicated thread.  An error here aborts
    /// startup for this node only.
    fn initialize(&mut self) -> Result<(), RobotError>;

    /// One iteration of work.  Called repeatedly; should return promptly so
    /// the stop flag and heartbeat cadence are honoured.
    fn main_loop(&mut self) -> Result<(), RobotError>;

    /// Release whatever `initialize` acquired.  Invoked exactly once on every
    /// exit path, including after `initialize` itself failed.
    fn cleanup(&mut self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state and handle
// ─────────────────────────────────────────────────────────────────────────────

struct NodeShared {
    name: String,
    state: StateCell,
    /// The single externally writable field: set by `request_stop`, read by
    /// the node thread at least once per poll interval.
    stop_requested: AtomicBool,
}

/// Observer/controller handle returned by [`NodeRuntime::spawn`].
pub struct NodeHandle {
    shared: Arc<NodeShared>,
    thread: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current lifecycle state, readable from any thread.
    pub fn state(&self) -> NodeState {
        self.shared.state.get()
    }

    /// Ask the node thread to stop.  The thread takes the
    /// `Running → Stopping → Stopped` edges itself within one poll interval.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
    }

    /// `true` once the node thread has exited (any final state).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the node thread to exit.
    ///
    /// Returns `true` when the thread was joined.  On timeout the thread is
    /// abandoned (detached) and logged as a leak; the handle can no longer
    /// join it.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    node = %self.shared.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "cleanup did not finish in time; abandoning thread (leaked)"
                );
                drop(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().is_ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns and drives nodes.  Stateless – all per-node state lives in the
/// returned [`NodeHandle`].
pub struct NodeRuntime;

impl NodeRuntime {
    /// Spawn `node` on a dedicated thread and return its handle.
    ///
    /// The thread walks the lifecycle state machine; the caller observes it
    /// through the handle.  Spawning never blocks on `initialize`.
    pub fn spawn(mut node: Box<dyn Node>, bus: MessageBus, config: NodeConfig) -> NodeHandle {
        let shared = Arc::new(NodeShared {
            name: node.name().to_string(),
            state: StateCell::new(),
            stop_requested: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run_node(node.as_mut(), &thread_shared, &bus, &config))
            .unwrap_or_else(|e| {
                // Out of threads: treat like an initialize failure.
                error!(error = %e, "failed to spawn node thread");
                shared.state.transition_to(NodeState::Initializing);
                shared.state.transition_to(NodeState::Error);
                thread::spawn(|| {})
            });

        NodeHandle {
            shared,
            thread: Some(thread),
        }
    }
}

/// Thread body: init → run loop → cleanup, with `cleanup` guaranteed once on
/// every path.
fn run_node(node: &mut dyn Node, shared: &NodeShared, bus: &MessageBus, config: &NodeConfig) {
    let name = shared.name.clone();
    shared.state.transition_to(NodeState::Initializing);

    if let Err(details) = guarded(&name, "initialize", || node.initialize()) {
        shared.state.transition_to(NodeState::Error);
        publish_lifecycle(bus, &name, NodeState::Error, Some(&details));
        finish(node, shared, bus, &name);
        return;
    }

    shared.state.transition_to(NodeState::Running);
    publish_lifecycle(bus, &name, NodeState::Running, None);
    info!(node = %name, "node running");

    let started = Instant::now();
    let mut sampler = ProcessSampler::default();
    let mut next_heartbeat = Instant::now();

    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }

        if Instant::now() >= next_heartbeat {
            publish_heartbeat(bus, &name, shared.state.get(), started, &mut sampler);
            next_heartbeat = Instant::now() + config.heartbeat_interval();
        }

        if let Err(details) = guarded(&name, "main_loop", || node.main_loop()) {
            shared.state.transition_to(NodeState::Error);
            publish_lifecycle(bus, &name, NodeState::Error, Some(&details));
            finish(node, shared, bus, &name);
            return;
        }

        // Bounded wait so the stop flag is observed promptly.
        thread::sleep(config.poll_interval());
    }

    shared.state.transition_to(NodeState::Stopping);
    finish(node, shared, bus, &name);
    shared.state.transition_to(NodeState::Stopped);
    publish_lifecycle(bus, &name, NodeState::Stopped, None);
    info!(node = %name, "node stopped");
}

/// Run `cleanup` (panic-contained) and drop every bus registration the node
/// still holds.
fn finish(node: &mut dyn Node, shared: &NodeShared, bus: &MessageBus, name: &str) {
    if catch_unwind(AssertUnwindSafe(|| node.cleanup())).is_err() {
        error!(node = %name, "cleanup panicked");
    }
    bus.unsubscribe_all(name);
    debug!(node = %name, state = shared.state.get().as_str(), "node torn down");
}

/// Call a lifecycle method, converting both `Err` returns and panics into a
/// loggable failure description.
fn guarded<F>(name: &str, phase: &str, f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), RobotError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(node = %name, phase, error = %e, "node failed");
            Err(e.to_string())
        }
        Err(_) => {
            error!(node = %name, phase, "node panicked");
            Err(format!("{phase} panicked"))
        }
    }
}

fn publish_heartbeat(
    bus: &MessageBus,
    name: &str,
    state: NodeState,
    started: Instant,
    sampler: &mut ProcessSampler,
) {
    let (cpu_percent, memory_kb) = sampler.sample();
    let beat = HeartbeatData {
        node_name: name.to_string(),
        status: state.as_str().to_string(),
        cpu_percent,
        memory_kb,
        uptime_s: started.elapsed().as_secs_f64(),
    };
    // Best-effort: nobody listening is fine.
    let _ = bus.publish(name, topics::HEARTBEAT, beat.to_payload());
}

fn publish_lifecycle(bus: &MessageBus, name: &str, state: NodeState, details: Option<&str>) {
    let mut payload = Payload::new();
    payload.insert("node".to_string(), name.into());
    payload.insert("state".to_string(), state.as_str().into());
    if let Some(details) = details {
        payload.insert("details".to_string(), details.into());
    }
    let _ = bus.publish(name, topics::NODE_LIFECYCLE, payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Process sampling
// ─────────────────────────────────────────────────────────────────────────────

/// Best-effort CPU/memory sampling for heartbeats.
///
/// Reads `/proc/self` on Linux; reports zeros elsewhere.  CPU percent is the
/// process-wide share since the previous sample.
#[derive(Default)]
struct ProcessSampler {
    last: Option<(Instant, u64)>,
}

impl ProcessSampler {
    fn sample(&mut self) -> (f32, u64) {
        let memory_kb = read_memory_kb().unwrap_or(0);
        let Some(ticks) = read_cpu_ticks() else {
            return (0.0, memory_kb);
        };
        let now = Instant::now();
        let cpu_percent = match self.last {
            Some((at, prev_ticks)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    // CLK_TCK is 100 on every Linux target we ship.
                    let cpu_seconds = ticks.saturating_sub(prev_ticks) as f64 / 100.0;
                    (cpu_seconds / elapsed * 100.0) as f32
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, ticks));
        (cpu_percent, memory_kb)
    }
}

/// Sum of utime and stime from `/proc/self/stat`, in clock ticks.
#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The comm field (2) may contain spaces; fields 3.. start after the
    // closing paren.  utime/stime are overall fields 14 and 15.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Option<u64> {
    None
}

/// Resident set size from `/proc/self/statm`, in KiB.
#[cfg(target_os = "linux")]
fn read_memory_kb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4)
}

#[cfg(not(target_os = "linux"))]
fn read_memory_kb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use robokit_bus::MessageHandler;
    use robokit_types::Message;
    use std::sync::Mutex;

    /// Shared probe so tests can observe lifecycle calls from outside.
    #[derive(Default)]
    struct Probe {
        init_calls: usize,
        loop_calls: usize,
        cleanup_calls: usize,
    }

    struct TestNode {
        name: String,
        probe: Arc<Mutex<Probe>>,
        fail_init: bool,
        fail_on_loop_call: Option<usize>,
        panic_on_loop_call: Option<usize>,
        cleanup_delay: Option<Duration>,
    }

    impl TestNode {
        fn new(name: &str, probe: Arc<Mutex<Probe>>) -> Self {
            Self {
                name: name.to_string(),
                probe,
                fail_init: false,
                fail_on_loop_call: None,
                panic_on_loop_call: None,
                cleanup_delay: None,
            }
        }
    }

    impl Node for TestNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&mut self) -> Result<(), RobotError> {
            self.probe.lock().unwrap().init_calls += 1;
            if self.fail_init {
                return Err(RobotError::Node {
                    node: self.name.clone(),
                    details: "init failed".to_string(),
                });
            }
            Ok(())
        }

        fn main_loop(&mut self) -> Result<(), RobotError> {
            let calls = {
                let mut probe = self.probe.lock().unwrap();
                probe.loop_calls += 1;
                probe.loop_calls
            };
            if self.fail_on_loop_call == Some(calls) {
                return Err(RobotError::Node {
                    node: self.name.clone(),
                    details: "loop failed".to_string(),
                });
            }
            if self.panic_on_loop_call == Some(calls) {
                panic!("loop bug");
            }
            Ok(())
        }

        fn cleanup(&mut self) {
            self.probe.lock().unwrap().cleanup_calls += 1;
            if let Some(delay) = self.cleanup_delay {
                thread::sleep(delay);
            }
        }
    }

    fn fast_config() -> NodeConfig {
        NodeConfig {
            heartbeat_interval_s: 0.02,
            poll_interval_ms: 5,
            cleanup_timeout_s: 2.0,
        }
    }

    fn wait_for_state(handle: &NodeHandle, want: NodeState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if handle.state() == want {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: &Message) {
            self.seen.lock().unwrap().push(message.clone());
        }
    }

    #[test]
    fn normal_lifecycle_reaches_stopped() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let node = Box::new(TestNode::new("worker", probe.clone()));
        let mut handle = NodeRuntime::spawn(node, bus, fast_config());

        assert!(wait_for_state(&handle, NodeState::Running, Duration::from_secs(2)));
        handle.request_stop();
        assert!(handle.join(Duration::from_secs(2)));
        assert_eq!(handle.state(), NodeState::Stopped);

        let probe = probe.lock().unwrap();
        assert_eq!(probe.init_calls, 1);
        assert!(probe.loop_calls >= 1);
        assert_eq!(probe.cleanup_calls, 1, "cleanup exactly once");
    }

    #[test]
    fn init_failure_transitions_to_error_and_cleans_up() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let mut node = TestNode::new("broken", probe.clone());
        node.fail_init = true;
        let mut handle = NodeRuntime::spawn(Box::new(node), bus, fast_config());

        assert!(wait_for_state(&handle, NodeState::Error, Duration::from_secs(2)));
        assert!(handle.join(Duration::from_secs(2)));

        let probe = probe.lock().unwrap();
        assert_eq!(probe.loop_calls, 0, "run loop never entered");
        assert_eq!(probe.cleanup_calls, 1, "cleanup still runs once");
    }

    #[test]
    fn main_loop_failure_transitions_to_error_once() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let mut node = TestNode::new("flaky", probe.clone());
        node.fail_on_loop_call = Some(3);
        let mut handle = NodeRuntime::spawn(Box::new(node), bus, fast_config());

        assert!(wait_for_state(&handle, NodeState::Error, Duration::from_secs(2)));
        assert!(handle.join(Duration::from_secs(2)));

        let probe = probe.lock().unwrap();
        assert_eq!(probe.loop_calls, 3);
        assert_eq!(probe.cleanup_calls, 1);
    }

    #[test]
    fn main_loop_panic_is_contained() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let mut node = TestNode::new("panicky", probe.clone());
        node.panic_on_loop_call = Some(1);
        let mut handle = NodeRuntime::spawn(Box::new(node), bus, fast_config());

        assert!(wait_for_state(&handle, NodeState::Error, Duration::from_secs(2)));
        assert!(handle.join(Duration::from_secs(2)));
        assert_eq!(probe.lock().unwrap().cleanup_calls, 1);
    }

    #[test]
    fn sibling_nodes_are_isolated_from_failures() {
        let bus = MessageBus::new();
        let good_probe = Arc::new(Mutex::new(Probe::default()));
        let bad_probe = Arc::new(Mutex::new(Probe::default()));

        let mut bad = TestNode::new("bad", bad_probe);
        bad.fail_init = true;

        let good_handle = NodeRuntime::spawn(
            Box::new(TestNode::new("good", good_probe)),
            bus.clone(),
            fast_config(),
        );
        let bad_handle = NodeRuntime::spawn(Box::new(bad), bus, fast_config());

        assert!(wait_for_state(&bad_handle, NodeState::Error, Duration::from_secs(2)));
        assert!(wait_for_state(&good_handle, NodeState::Running, Duration::from_secs(2)));

        good_handle.request_stop();
    }

    #[test]
    fn heartbeats_are_published_with_node_identity() {
        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("monitor", topics::HEARTBEAT, recorder.clone())
            .unwrap();

        let probe = Arc::new(Mutex::new(Probe::default()));
        let mut handle = NodeRuntime::spawn(
            Box::new(TestNode::new("beater", probe)),
            bus,
            fast_config(),
        );

        // Two heartbeat intervals should be plenty for at least one beat.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !recorder.seen.lock().unwrap().is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        handle.request_stop();
        handle.join(Duration::from_secs(2));

        let seen = recorder.seen.lock().unwrap();
        assert!(!seen.is_empty(), "expected at least one heartbeat");
        assert_eq!(seen[0].payload["node_name"], "beater");
        assert_eq!(seen[0].payload["status"], "running");
        assert!(seen[0].payload.contains_key("cpu_percent"));
        assert!(seen[0].payload.contains_key("memory_kb"));
    }

    #[test]
    fn join_timeout_abandons_stuck_cleanup() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let mut node = TestNode::new("stuck", probe.clone());
        node.cleanup_delay = Some(Duration::from_millis(400));
        let mut handle = NodeRuntime::spawn(Box::new(node), bus, fast_config());

        assert!(wait_for_state(&handle, NodeState::Running, Duration::from_secs(2)));
        handle.request_stop();

        // Cleanup outlives the timeout: the thread is abandoned, not joined.
        assert!(!handle.join(Duration::from_millis(50)));
        // The handle gave the thread up; further joins are trivially done.
        assert!(handle.join(Duration::from_millis(1)));

        // The abandoned thread still finishes its cleanup on its own time.
        thread::sleep(Duration::from_millis(600));
        assert_eq!(probe.lock().unwrap().cleanup_calls, 1);
        assert_eq!(handle.state(), NodeState::Stopped);
    }

    #[test]
    fn stop_is_observed_within_poll_interval() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let bus = MessageBus::new();
        let mut handle = NodeRuntime::spawn(
            Box::new(TestNode::new("prompt", probe)),
            bus,
            fast_config(),
        );
        assert!(wait_for_state(&handle, NodeState::Running, Duration::from_secs(2)));

        let before = Instant::now();
        handle.request_stop();
        assert!(handle.join(Duration::from_secs(1)));
        // Generous bound: poll interval is 5 ms.
        assert!(before.elapsed() < Duration::from_millis(500));
    }
}
