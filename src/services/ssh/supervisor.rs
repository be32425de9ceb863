//! Public handle for one SSH tunnel.
//!
//! This module provides:
//! - `TunnelSupervisor` - connect/disconnect, published state, prompt answers
//! - `Shared` - the single mutex-guarded state the worker publishes through
//!
//! Every state change goes through `Shared::transition`, which mutates the
//! guarded fields and then notifies callbacks and subscribers, so observers
//! never see a state without its matching port or error. Callbacks run on
//! the worker thread only, never while a supervisor lock is held.

use super::credentials::CredentialSource;
use super::error::TunnelError;
use super::prompt::PromptRequest;
use super::types::{StateChange, TunnelConfig, TunnelSnapshot, TunnelState};
use super::worker::Worker;
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lines of ssh output kept for diagnostics; older lines are dropped
pub const DEBUG_LOG_CAPACITY: usize = 500;

/// Called with `(old, new)` on every state change
pub type StateCallback = Arc<dyn Fn(TunnelState, TunnelState) + Send + Sync>;

/// Called when a prompt needs an answer from the caller
pub type PromptCallback = Arc<dyn Fn(&PromptRequest) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One captured line of ssh output
#[derive(Debug, Clone)]
pub struct DebugEntry {
    pub at: DateTime<Local>,
    pub line: String,
}

/// Answer delivered to the worker for the outstanding prompt
#[derive(Debug)]
pub(crate) struct Answer {
    pub text: String,
    pub remember: bool,
}

/// The single prompt currently waiting on the caller
pub(crate) struct PendingPrompt {
    pub request: PromptRequest,
    pub reply: Sender<Answer>,
}

#[derive(Default)]
pub(crate) struct Inner {
    pub state: TunnelState,
    pub local_port: u16,
    pub last_error: Option<TunnelError>,
    pub debug_log: VecDeque<DebugEntry>,
    pub pending: Option<PendingPrompt>,
}

#[derive(Default)]
struct Observers {
    state: Vec<StateCallback>,
    prompt: Option<PromptCallback>,
    subscribers: Vec<Sender<StateChange>>,
}

/// State shared between the supervisor handle and its worker thread
#[derive(Default)]
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    settled: Condvar,
    observers: Mutex<Observers>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub fn state(&self) -> TunnelState {
        self.lock().state
    }

    /// Mutate and publish in one step.
    pub fn transition(&self, new: TunnelState, update: impl FnOnce(&mut Inner)) {
        if let Some(change) = self.apply(new, update) {
            self.publish(change);
        }
    }

    /// Mutate without notifying observers. Returns the change to publish,
    /// or `None` if the edge is not allowed or the state is unchanged.
    pub fn apply(&self, new: TunnelState, update: impl FnOnce(&mut Inner)) -> Option<StateChange> {
        let old = {
            let mut inner = self.lock();
            let old = inner.state;
            if !old.can_transition_to(new) {
                tracing::debug!("Ignoring tunnel transition {} -> {}", old, new);
                return None;
            }
            update(&mut inner);
            inner.state = new;
            old
        };
        self.settled.notify_all();
        (old != new).then_some(StateChange { old, new })
    }

    /// Tell callbacks and subscribers about an applied change.
    pub fn publish(&self, change: StateChange) {
        let StateChange { old, new } = change;
        tracing::debug!("Tunnel state {} -> {}", old, new);

        let callbacks = {
            let mut observers = lock(&self.observers);
            observers
                .subscribers
                .retain(|tx| !matches!(tx.try_send(change), Err(async_channel::TrySendError::Closed(_))));
            observers.state.clone()
        };
        for callback in callbacks {
            callback(old, new);
        }
    }

    /// Append a line of ssh output to the diagnostics log
    pub fn record(&self, line: &str) {
        let mut inner = self.lock();
        if inner.debug_log.len() >= DEBUG_LOG_CAPACITY {
            inner.debug_log.pop_front();
        }
        inner.debug_log.push_back(DebugEntry {
            at: Local::now(),
            line: line.to_string(),
        });
    }

    /// The last few output lines, for failure messages
    pub fn recent_output(&self, count: usize) -> String {
        let inner = self.lock();
        let start = inner.debug_log.len().saturating_sub(count);
        let lines: Vec<&str> = inner
            .debug_log
            .iter()
            .skip(start)
            .map(|e| e.line.as_str())
            .collect();
        if lines.is_empty() {
            "no output".to_string()
        } else {
            lines.join(" | ")
        }
    }

    pub fn set_pending(&self, pending: PendingPrompt) {
        self.lock().pending = Some(pending);
    }

    pub fn take_pending(&self) -> Option<PendingPrompt> {
        self.lock().pending.take()
    }

    pub fn clear_pending(&self) {
        self.lock().pending = None;
    }

    pub fn notify_prompt(&self, request: &PromptRequest) {
        let callback = lock(&self.observers).prompt.clone();
        match callback {
            Some(callback) => callback(request),
            None => tracing::warn!(
                "SSH is waiting for an answer but no prompt callback is registered: {}",
                request.text
            ),
        }
    }
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    stop_tx: Sender<()>,
}

/// Supervises one SSH local port forward.
///
/// `connect` returns immediately; a dedicated worker thread launches ssh,
/// answers its prompts, and publishes state changes. All accessors may be
/// called from any thread.
pub struct TunnelSupervisor {
    config: Mutex<TunnelConfig>,
    shared: Arc<Shared>,
    credentials: Mutex<Option<Arc<dyn CredentialSource>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config: Mutex::new(config),
            shared: Arc::new(Shared::default()),
            credentials: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> TunnelConfig {
        lock(&self.config).clone()
    }

    /// Answer prompts from this source before asking the caller
    pub fn set_credential_source(&self, source: Arc<dyn CredentialSource>) {
        *lock(&self.credentials) = Some(source);
    }

    pub fn clear_credential_source(&self) {
        *lock(&self.credentials) = None;
    }

    /// Register a callback invoked on the worker thread for each state change
    pub fn on_state_change(&self, callback: impl Fn(TunnelState, TunnelState) + Send + Sync + 'static) {
        lock(&self.shared.observers).state.push(Arc::new(callback));
    }

    /// Register the callback told about prompts that need an answer.
    /// Answer with `supply_password` or `supply_interactive_answer`.
    pub fn on_prompt(&self, callback: impl Fn(&PromptRequest) + Send + Sync + 'static) {
        lock(&self.shared.observers).prompt = Some(Arc::new(callback));
    }

    /// Subscribe to tunnel state changes
    pub fn subscribe(&self) -> Receiver<StateChange> {
        let (tx, rx) = async_channel::unbounded();
        lock(&self.shared.observers).subscribers.push(tx);
        rx
    }

    /// Start the tunnel in the background.
    ///
    /// Does nothing while a tunnel is already running. After a failure,
    /// calling `connect` again starts a fresh attempt. The state is
    /// Connecting on return; observers hear about it from the worker.
    pub fn connect(&self) {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref() {
            if !handle.thread.is_finished() {
                tracing::debug!("connect() ignored: tunnel is already running");
                return;
            }
        }
        if let Some(handle) = worker.take() {
            let _ = handle.thread.join();
        }

        let config = self.config();
        let credentials = lock(&self.credentials).clone();
        let (stop_tx, stop_rx) = async_channel::bounded(1);

        let started = self.shared.apply(TunnelState::Connecting, |inner| {
            inner.local_port = 0;
            inner.last_error = None;
            inner.debug_log.clear();
            inner.pending = None;
        });

        let task = Worker::new(config.clone(), self.shared.clone(), credentials, stop_rx)
            .announcing(started);
        let spawned = thread::Builder::new()
            .name(format!("ssh-tunnel-{}", config.ssh_host))
            .spawn(move || smol::block_on(task.run()));

        let error = match spawned {
            Ok(thread) => {
                *worker = Some(WorkerHandle { thread, stop_tx });
                return;
            }
            Err(e) => e,
        };
        drop(worker);

        tracing::error!("Failed to start tunnel worker: {}", error);
        if let Some(change) = started {
            self.shared.publish(change);
        }
        self.shared.transition(TunnelState::ForwardingFailed, |inner| {
            inner.last_error = Some(TunnelError::LaunchFailure {
                binary: config.ssh_binary.display().to_string(),
                reason: error.to_string(),
            });
        });
    }

    /// Replace the configuration and connect. Ignored while a tunnel is active.
    pub fn connect_with(&self, config: TunnelConfig) {
        if self.state().is_active() {
            tracing::warn!("connect_with() ignored: disconnect the running tunnel first");
            return;
        }
        *lock(&self.config) = config;
        self.connect();
    }

    /// Stop ssh and return to Idle. Safe to call from any state, repeatedly.
    pub fn disconnect(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.try_send(());
            if handle.thread.thread().id() == thread::current().id() {
                // Called from a callback on the worker itself; it stops on its own
                tracing::debug!("disconnect() called from the tunnel worker");
            } else if handle.thread.join().is_err() {
                tracing::error!("SSH tunnel worker panicked");
            }
        }
        self.shared.clear_pending();
        self.shared.transition(TunnelState::Idle, |inner| {
            inner.local_port = 0;
        });
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    /// All published fields read under one lock
    pub fn snapshot(&self) -> TunnelSnapshot {
        let inner = self.shared.lock();
        TunnelSnapshot {
            state: inner.state,
            local_port: if inner.state.is_connected() {
                inner.local_port
            } else {
                0
            },
            last_error: inner
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }

    /// The forwarded local port, or 0 unless connected
    pub fn local_port(&self) -> u16 {
        self.snapshot().local_port
    }

    /// Get the local address to connect to (e.g., "127.0.0.1:12345").
    pub fn local_addr(&self) -> Option<String> {
        self.snapshot().local_addr()
    }

    /// Why the tunnel failed; empty unless it has
    pub fn last_error(&self) -> String {
        self.snapshot().last_error
    }

    pub fn last_failure(&self) -> Option<TunnelError> {
        self.shared.lock().last_error.clone()
    }

    /// Captured ssh output of the current or last attempt
    pub fn debug_messages(&self) -> Vec<String> {
        self.shared
            .lock()
            .debug_log
            .iter()
            .map(|e| e.line.clone())
            .collect()
    }

    /// Timestamped ssh output, one line per entry
    pub fn debug_log_text(&self) -> String {
        self.shared
            .lock()
            .debug_log
            .iter()
            .map(|e| format!("[{}] {}\n", e.at.format("%H:%M:%S%.3f"), e.line))
            .collect()
    }

    /// The prompt currently waiting for an answer, if any
    pub fn pending_prompt(&self) -> Option<PromptRequest> {
        self.shared
            .lock()
            .pending
            .as_ref()
            .map(|p| p.request.clone())
    }

    /// Answer the outstanding password or passphrase prompt
    pub fn supply_password(&self, secret: &str) -> Result<(), TunnelError> {
        self.answer(secret, false)
    }

    /// Like `supply_password`, and store the secret in the credential
    /// source once the tunnel connects with it
    pub fn supply_password_and_remember(&self, secret: &str) -> Result<(), TunnelError> {
        self.answer(secret, true)
    }

    /// Answer the outstanding question (e.g. "yes" for an unknown host key)
    pub fn supply_interactive_answer(&self, answer: &str) -> Result<(), TunnelError> {
        self.answer(answer, false)
    }

    fn answer(&self, text: &str, remember: bool) -> Result<(), TunnelError> {
        let pending = self
            .shared
            .take_pending()
            .ok_or(TunnelError::NoPendingPrompt)?;
        pending
            .reply
            .try_send(Answer {
                text: text.to_string(),
                remember,
            })
            .map_err(|_| TunnelError::NoPendingPrompt)
    }

    /// Block until the tunnel is Connected or ForwardingFailed, or the
    /// timeout elapses. Returns the state at that point.
    pub fn wait_for_settled(&self, timeout: Duration) -> TunnelState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        loop {
            if inner.state.is_settled() {
                return inner.state;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return inner.state;
            }
            inner = self
                .shared
                .settled
                .wait_timeout(inner, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        // Ensure ssh is stopped when the owning connection goes away
        self.disconnect();
    }
}
