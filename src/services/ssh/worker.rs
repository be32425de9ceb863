//! The per-tunnel worker: launches ssh and drives the state machine.
//!
//! Runs on the tunnel's dedicated thread. stderr lines and askpass
//! questions arrive on one ordered event queue, so a second prompt is only
//! looked at after the first one is answered.
//!
//! The tunnel counts as up once ssh has proven authentication (a `-v`
//! "Authenticated to" notice, or a listening forward when not verbose) and
//! then stayed quiet for the configured period. Silence after a typed
//! password is not proof: servers delay rejections.

#[cfg(unix)]
use super::askpass::{AskpassBridge, AskpassRequest, askpass_prompt_kind};
use super::command::SshCommand;
use super::credentials::{CredentialKey, CredentialSource};
use super::error::TunnelError;
use super::port::{is_listening, pick_local_port, probe_port};
use super::prompt::{
    FatalKind, LineBuffer, LineClass, Notice, PromptKind, PromptMediator, PromptRequest,
    Resolution, check_host_key_answer, classify_line,
};
use super::supervisor::{Answer, PendingPrompt, Shared};
use super::types::{LOCAL_BIND_HOST, StateChange, TunnelConfig, TunnelState};
use async_channel::{Receiver, Sender};
use futures::FutureExt;
use smol::Timer;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::process::{Child, ChildStderr, ChildStdin, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the child is checked while nothing else happens
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time ssh gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// How long buffered output is awaited once ssh has exited
const EXIT_DRAIN: Duration = Duration::from_secs(1);

/// Output lines quoted when ssh exits for no recognised reason
const EXIT_CONTEXT_LINES: usize = 3;

enum Event {
    Line { generation: u64, line: String },
    StderrClosed { generation: u64 },
    #[cfg(unix)]
    Askpass(AskpassRequest),
}

enum Wake {
    Stop,
    Event(Event),
    Tick,
}

enum PromptWake {
    Stop,
    Answer(Answer),
    Tick,
}

/// Why supervision ended
#[derive(Debug)]
enum Exit {
    Stopped,
    Failed(TunnelError),
}

impl From<TunnelError> for Exit {
    fn from(error: TunnelError) -> Self {
        Exit::Failed(error)
    }
}

/// Where the answer to a prompt is written
enum AnswerSink {
    Stdin,
    #[cfg(unix)]
    Askpass(AskpassRequest),
}

/// One launched ssh process
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    port: u16,
    stderr_closed: bool,
    _reader: Option<smol::Task<()>>,
}

impl Session {
    async fn terminate(mut self) {
        // Closing stdin unblocks a pending read
        drop(self.stdin.take());
        if matches!(self.child.try_status(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        {
            // Send SIGTERM
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if !matches!(self.child.try_status(), Ok(None)) {
                return;
            }
            Timer::after(POLL_INTERVAL).await;
        }

        tracing::debug!("ssh did not exit after SIGTERM, killing it");
        let _ = self.child.kill();
        let _ = self.child.status().await;
    }
}

fn spawn_reader(mut stderr: ChildStderr, generation: u64, events: Sender<Event>) -> smol::Task<()> {
    smol::spawn(async move {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        if events.send(Event::Line { generation, line }).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("SSH stderr read error: {}", e);
                    break;
                }
            }
        }
        if let Some(line) = buffer.take_remainder() {
            let _ = events.send(Event::Line { generation, line }).await;
        }
        let _ = events.send(Event::StderrClosed { generation }).await;
    })
}

pub(crate) struct Worker {
    config: TunnelConfig,
    shared: Arc<Shared>,
    credentials: Option<Arc<dyn CredentialSource>>,
    stop_rx: Receiver<()>,
    /// Applied by `connect`, published once this thread runs
    announce: Option<StateChange>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    mediator: PromptMediator,
    session: Option<Session>,
    /// Bumped per launch; output of a replaced session is ignored
    generation: u64,
    fallback_used: bool,
    authenticated: bool,
    last_output: Instant,
    /// Secret the caller asked to keep once it proves correct
    remembered: Option<(CredentialKey, String)>,
    #[cfg(unix)]
    askpass: Option<Arc<AskpassBridge>>,
    #[cfg(unix)]
    _askpass_task: Option<smol::Task<()>>,
}

impl Worker {
    pub fn new(
        config: TunnelConfig,
        shared: Arc<Shared>,
        credentials: Option<Arc<dyn CredentialSource>>,
        stop_rx: Receiver<()>,
    ) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        let mediator = PromptMediator::new(&config);
        Self {
            config,
            shared,
            credentials,
            stop_rx,
            announce: None,
            events_tx,
            events_rx,
            mediator,
            session: None,
            generation: 0,
            fallback_used: false,
            authenticated: false,
            last_output: Instant::now(),
            remembered: None,
            #[cfg(unix)]
            askpass: None,
            #[cfg(unix)]
            _askpass_task: None,
        }
    }

    pub fn announcing(mut self, change: Option<StateChange>) -> Self {
        self.announce = change;
        self
    }

    /// Supervise until stopped or failed, then clean up and publish the outcome.
    pub async fn run(mut self) {
        if let Some(change) = self.announce.take() {
            self.shared.publish(change);
        }
        let exit = self.supervise().await;

        self.shared.clear_pending();
        if let Some(session) = self.session.take() {
            session.terminate().await;
        }
        #[cfg(unix)]
        {
            self._askpass_task = None;
            self.askpass = None;
        }

        match exit {
            Exit::Stopped => tracing::debug!("SSH tunnel to {} stopped", self.config.ssh_url()),
            Exit::Failed(error) if self.stop_rx.is_closed() || !self.stop_rx.is_empty() => {
                tracing::debug!("Ignoring failure during disconnect: {}", error);
            }
            Exit::Failed(error) => {
                tracing::error!("SSH tunnel to {} failed: {}", self.config.ssh_url(), error);
                self.shared
                    .transition(TunnelState::ForwardingFailed, |inner| {
                        inner.local_port = 0;
                        inner.last_error = Some(error);
                    });
            }
        }
    }

    async fn supervise(&mut self) -> Exit {
        if let Err(error) = self.start().await {
            return error.into();
        }
        loop {
            let result = match self.next_wake().await {
                Wake::Stop => return Exit::Stopped,
                Wake::Event(event) => self.on_event(event).await,
                Wake::Tick => self.poll_session().await,
            };
            if let Err(exit) = result {
                return exit;
            }
        }
    }

    async fn start(&mut self) -> Result<(), TunnelError> {
        let requested = self.config.requested_local_port;
        let port = pick_local_port(requested, self.config.local_port_fallback).await?;
        self.fallback_used = requested != 0 && port != requested;

        #[cfg(unix)]
        {
            if self.config.use_askpass {
                self.start_askpass()?;
            }
        }

        self.launch(port)
    }

    #[cfg(unix)]
    fn start_askpass(&mut self) -> Result<(), TunnelError> {
        let bridge = match &self.config.askpass_helper {
            Some(helper) => AskpassBridge::with_helper(helper),
            None => AskpassBridge::new(),
        }
        .map_err(|e| TunnelError::LaunchFailure {
            binary: "askpass helper".to_string(),
            reason: format!("{:#}", e),
        })?;
        let bridge = Arc::new(bridge);
        let listener = bridge.clone();
        let events = self.events_tx.clone();
        self._askpass_task = Some(smol::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(request) => {
                        if events.send(Event::Askpass(request)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Askpass listener stopped: {:#}", e);
                        break;
                    }
                }
            }
        }));
        self.askpass = Some(bridge);
        Ok(())
    }

    fn launch(&mut self, port: u16) -> Result<(), TunnelError> {
        #[allow(unused_mut)]
        let mut command = SshCommand::forward(&self.config, port);
        #[cfg(unix)]
        {
            if let Some(bridge) = &self.askpass {
                command = command.with_askpass(bridge.script_path());
            }
        }

        tracing::info!(
            "Starting SSH tunnel: {}:{} -> {}:{} via {}",
            LOCAL_BIND_HOST,
            port,
            self.config.remote_host,
            self.config.remote_port,
            self.config.ssh_url()
        );
        tracing::debug!("Full SSH command: {}", command.display());

        let mut cmd = smol::process::Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        // Kill the ssh process when this handle is dropped
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::launch(&command.program, &e))?;

        self.generation += 1;
        let stdin = child.stdin.take();
        let reader = child
            .stderr
            .take()
            .map(|stderr| spawn_reader(stderr, self.generation, self.events_tx.clone()));

        self.session = Some(Session {
            child,
            stdin,
            port,
            stderr_closed: reader.is_none(),
            _reader: reader,
        });
        self.last_output = Instant::now();
        Ok(())
    }

    async fn next_wake(&self) -> Wake {
        let stop = self.stop_rx.recv().fuse();
        let event = self.events_rx.recv().fuse();
        let tick = Timer::after(POLL_INTERVAL).fuse();
        futures::pin_mut!(stop, event, tick);
        futures::select_biased! {
            _ = stop => Wake::Stop,
            event = event => match event {
                Ok(event) => Wake::Event(event),
                Err(_) => Wake::Tick,
            },
            _ = tick => Wake::Tick,
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<(), Exit> {
        match event {
            Event::Line { generation, line } if generation == self.generation => {
                self.handle_line(line).await
            }
            Event::StderrClosed { generation } if generation == self.generation => {
                if let Some(session) = self.session.as_mut() {
                    session.stderr_closed = true;
                }
                Ok(())
            }
            #[cfg(unix)]
            Event::Askpass(request) => {
                let text = request.prompt.trim().to_string();
                let kind = askpass_prompt_kind(&text);
                self.shared.record(&text);
                self.last_output = Instant::now();
                self.handle_prompt(PromptRequest { kind, text }, AnswerSink::Askpass(request))
                    .await
            }
            // Output of a session that was replaced
            _ => Ok(()),
        }
    }

    async fn handle_line(&mut self, line: String) -> Result<(), Exit> {
        self.last_output = Instant::now();
        self.shared.record(&line);

        let class = classify_line(&line);
        if let Some(kind) = class.prompt_kind() {
            let request = PromptRequest {
                kind,
                text: line.trim().to_string(),
            };
            return self.handle_prompt(request, AnswerSink::Stdin).await;
        }

        match class {
            LineClass::FatalError(FatalKind::RemoteConnection) if self.shared.state().is_connected() => {
                // A forwarded connection failed; the tunnel itself is still up
                tracing::warn!("SSH: {}", line);
                Ok(())
            }
            LineClass::FatalError(kind) => Err(kind.into_error(&line).into()),
            LineClass::Informational(Notice::AuthRejected) => {
                tracing::warn!("SSH rejected the credentials for {}", self.config.ssh_url());
                self.remembered = None;
                Ok(())
            }
            LineClass::Informational(Notice::Authenticated) => {
                self.mark_authenticated();
                Ok(())
            }
            LineClass::Informational(Notice::ForwardEstablished) => {
                self.mark_authenticated();
                if self.shared.state() == TunnelState::Connecting {
                    self.declare_connected().await?;
                }
                Ok(())
            }
            LineClass::Informational(Notice::LocalPortInUse) => self.retry_on_fallback().await,
            _ => {
                tracing::debug!("SSH stderr: {}", line);
                Ok(())
            }
        }
    }

    async fn handle_prompt(&mut self, request: PromptRequest, sink: AnswerSink) -> Result<(), Exit> {
        self.shared.transition(TunnelState::WaitingForAuth, |_| {});
        if request.kind.is_secret() {
            // Being asked again means whatever came before did not get us in
            self.authenticated = false;
        }

        let credentials = self.credentials.clone();
        let (answer, remember) = match self.mediator.resolve(&request, credentials.as_deref()) {
            Resolution::Fail(error) => return Err(error.into()),
            Resolution::Answer { text, source } => {
                tracing::debug!("{:?} prompt answered from {:?}", request.kind, source);
                (text, false)
            }
            Resolution::AskCaller => {
                let Some(answer) = self.ask_caller(&request).await? else {
                    // ssh was relaunched on the fallback port; the question is moot
                    return Ok(());
                };
                if request.kind == PromptKind::HostKey {
                    check_host_key_answer(&request.text, &answer.text)?;
                }
                (answer.text, answer.remember)
            }
        };

        if remember {
            self.remembered = self
                .mediator
                .credential_key(&request)
                .map(|key| (key, answer.clone()));
        }

        if request.kind.is_secret() {
            tracing::debug!(
                "Answering {:?} prompt (attempt {} of {}): <redacted>",
                request.kind,
                self.mediator.attempts(request.kind),
                self.config.max_auth_attempts
            );
        } else {
            tracing::debug!("Answering {:?} prompt: {}", request.kind, answer);
        }

        match sink {
            AnswerSink::Stdin => self.write_stdin(&answer).await,
            #[cfg(unix)]
            AnswerSink::Askpass(request) => {
                if let Err(e) = request.respond(Some(&answer)).await {
                    tracing::debug!("Failed to answer askpass helper: {:#}", e);
                }
            }
        }

        self.last_output = Instant::now();
        self.shared.transition(TunnelState::Connecting, |_| {});
        Ok(())
    }

    async fn write_stdin(&mut self, answer: &str) {
        let Some(stdin) = self.session.as_mut().and_then(|s| s.stdin.as_mut()) else {
            return;
        };
        let line = format!("{}\n", answer);
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        // If ssh went away its exit is reported on the next poll
        if let Err(e) = written {
            tracing::debug!("Failed to write answer to ssh: {}", e);
        }
    }

    /// Publish the prompt and wait for `supply_*`. `None` means the session
    /// was replaced while waiting.
    async fn ask_caller(&mut self, request: &PromptRequest) -> Result<Option<Answer>, Exit> {
        let (reply, answers) = async_channel::bounded(1);
        self.shared.set_pending(PendingPrompt {
            request: request.clone(),
            reply,
        });
        tracing::info!("SSH is waiting for an answer: {}", request.text);
        self.shared.notify_prompt(request);

        let started = Instant::now();
        let timeout = self.config.prompt_timeout();
        let generation = self.generation;
        loop {
            let wake = {
                let stop = self.stop_rx.recv().fuse();
                let answer = answers.recv().fuse();
                let tick = Timer::after(POLL_INTERVAL).fuse();
                futures::pin_mut!(stop, answer, tick);
                futures::select_biased! {
                    _ = stop => PromptWake::Stop,
                    answer = answer => match answer {
                        Ok(answer) => PromptWake::Answer(answer),
                        Err(_) => PromptWake::Tick,
                    },
                    _ = tick => PromptWake::Tick,
                }
            };

            match wake {
                PromptWake::Stop => {
                    self.shared.clear_pending();
                    return Err(Exit::Stopped);
                }
                PromptWake::Answer(answer) => return Ok(Some(answer)),
                PromptWake::Tick => {}
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    self.shared.clear_pending();
                    return Err(TunnelError::AuthenticationFailure(format!(
                        "no answer to \"{}\" within {}s",
                        request.text,
                        timeout.as_secs()
                    ))
                    .into());
                }
            }

            let exited = match self.session.as_mut().map(|s| s.child.try_status()) {
                Some(Ok(Some(status))) => Some(status.to_string()),
                Some(Err(e)) => Some(e.to_string()),
                _ => None,
            };
            if let Some(status) = exited {
                self.shared.clear_pending();
                self.process_exited(status).await?;
                if self.generation != generation {
                    return Ok(None);
                }
            }
        }
    }

    async fn poll_session(&mut self) -> Result<(), Exit> {
        let exited = match self.session.as_mut().map(|s| s.child.try_status()) {
            None => return Ok(()),
            Some(Ok(None)) => None,
            Some(Ok(Some(status))) => Some(status.to_string()),
            Some(Err(e)) => Some(e.to_string()),
        };
        if let Some(status) = exited {
            return self.process_exited(status).await;
        }

        if self.shared.state() != TunnelState::Connecting || !self.quiet_period_elapsed() {
            return Ok(());
        }
        if !self.authenticated && !self.config.verbose && self.forward_listening().await {
            self.mark_authenticated();
        }
        if self.authenticated {
            self.declare_connected().await?;
        }
        Ok(())
    }

    fn quiet_period_elapsed(&self) -> bool {
        self.last_output.elapsed() >= self.config.quiet_period()
    }

    /// ssh only opens the local listener after authenticating
    async fn forward_listening(&self) -> bool {
        match self.session.as_ref() {
            Some(session) => is_listening(session.port).await,
            None => false,
        }
    }

    /// ssh got past authentication. A secret the caller asked to keep is
    /// stored now and not before.
    fn mark_authenticated(&mut self) {
        if !self.authenticated {
            tracing::debug!("SSH authenticated to {}", self.config.ssh_host);
        }
        self.authenticated = true;
        self.mediator.reset_attempts();

        if let Some((key, secret)) = self.remembered.take() {
            if let Some(source) = &self.credentials {
                match source.remember(&key, &secret) {
                    Ok(()) => tracing::debug!("Remembered SSH secret for {}", key),
                    Err(e) => tracing::warn!("Failed to remember SSH secret for {}: {:#}", key, e),
                }
            }
        }
    }

    /// ssh has exited. Drain what it printed last: a recognised failure wins,
    /// a busy local port relaunches on the fallback (returning `Ok`), and
    /// anything else is an unexpected exit.
    async fn process_exited(&mut self, status: String) -> Result<(), Exit> {
        let generation = self.generation;
        let deadline = Instant::now() + EXIT_DRAIN;

        while !self.session.as_ref().is_none_or(|s| s.stderr_closed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let next = {
                let event = self.events_rx.recv().fuse();
                let timeout = Timer::after(remaining).fuse();
                futures::pin_mut!(event, timeout);
                futures::select_biased! {
                    event = event => event.ok(),
                    _ = timeout => None,
                }
            };

            match next {
                Some(Event::Line { generation: g, line }) if g == generation => {
                    self.shared.record(&line);
                    match classify_line(&line) {
                        LineClass::FatalError(kind) => return Err(kind.into_error(&line).into()),
                        LineClass::Informational(Notice::LocalPortInUse) => {
                            return self.retry_on_fallback().await;
                        }
                        _ => tracing::debug!("SSH stderr: {}", line),
                    }
                }
                Some(Event::StderrClosed { generation: g }) if g == generation => break,
                Some(_) => {}
                None => break,
            }
        }

        tracing::debug!("ssh exited with {}", status);
        Err(TunnelError::UnexpectedProcessExit {
            status,
            output: self.shared.recent_output(EXIT_CONTEXT_LINES),
        }
        .into())
    }

    /// The local port is taken: relaunch once on the fallback port.
    async fn retry_on_fallback(&mut self) -> Result<(), Exit> {
        let current = self.session.as_ref().map(|s| s.port).unwrap_or_default();
        let fallback = self.config.local_port_fallback;
        let unavailable = TunnelError::PortUnavailable {
            preferred: self.config.requested_local_port,
            fallback,
        };

        // A live tunnel is never torn down for a relaunch
        if self.fallback_used || fallback == current || self.shared.state().is_connected() {
            return Err(unavailable.into());
        }
        let Some(port) = probe_port(fallback).await else {
            return Err(unavailable.into());
        };

        tracing::warn!(
            "Local port {} is in use, retrying SSH tunnel on port {}",
            current,
            port
        );
        self.fallback_used = true;
        if let Some(session) = self.session.take() {
            session.terminate().await;
        }
        self.shared.clear_pending();
        self.mediator = PromptMediator::new(&self.config);
        self.authenticated = false;
        self.remembered = None;
        self.shared.transition(TunnelState::Connecting, |_| {});
        Ok(self.launch(port)?)
    }

    async fn declare_connected(&mut self) -> Result<(), Exit> {
        let Some(port) = self.session.as_ref().map(|s| s.port) else {
            return Ok(());
        };

        if self.config.probe_forward && !is_listening(port).await {
            tracing::debug!("Forward on port {} is not accepting connections yet", port);
            self.last_output = Instant::now();
            return Ok(());
        }

        self.shared.transition(TunnelState::Connected, |inner| {
            inner.local_port = port;
            inner.last_error = None;
        });
        tracing::info!(
            "SSH tunnel established: {}:{} -> {}:{} via {}",
            LOCAL_BIND_HOST,
            port,
            self.config.remote_host,
            self.config.remote_port,
            self.config.ssh_url()
        );

        Ok(())
    }
}
