//! SSH tunnel configuration and state types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH server port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default number of credential attempts before the tunnel gives up
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;

/// Default quiet interval after which an authenticated tunnel counts as connected
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 1500;

/// Loopback address every forward is bound to
pub const LOCAL_BIND_HOST: &str = "127.0.0.1";

/// Value passed to ssh as `StrictHostKeyChecking=<policy>`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// ssh asks before adding an unknown key (the prompt is mediated)
    #[default]
    Ask,
    /// Unknown keys are added silently, changed keys are refused
    AcceptNew,
    /// Only keys already in known_hosts are accepted
    Yes,
    /// Host keys are never checked
    No,
}

impl HostKeyPolicy {
    pub fn as_ssh_value(&self) -> &'static str {
        match self {
            HostKeyPolicy::Ask => "ask",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Yes => "yes",
            HostKeyPolicy::No => "no",
        }
    }
}

/// Configuration for one local-to-remote SSH port forward.
///
/// The supervisor treats a config as immutable once `connect` has been
/// called; replacing it requires a disconnect first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelConfig {
    /// ssh client executable (default: `ssh` from PATH)
    pub ssh_binary: PathBuf,
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub ssh_login: String,
    /// Remote host to tunnel to (as seen from SSH server)
    pub remote_host: String,
    /// Remote port to tunnel to
    pub remote_port: u16,
    /// Local port to bind (0 for auto-assign)
    pub requested_local_port: u16,
    /// Local port tried when the requested one is taken (0 for auto-assign)
    pub local_port_fallback: u16,
    /// Private key passed to ssh with `-i`
    pub identity_file: Option<PathBuf>,
    pub host_key_policy: HostKeyPolicy,
    /// Answer "yes" to unknown host key questions without asking
    pub trust_unknown_hosts: bool,
    /// Consecutive credential attempts allowed before failing
    pub max_auth_attempts: u32,
    /// Output-free interval that marks an authenticated tunnel as connected
    pub quiet_period_ms: u64,
    /// Give up on an unanswered prompt after this long (None waits forever)
    pub prompt_timeout_ms: Option<u64>,
    pub connect_timeout_secs: u32,
    pub keepalive_interval_secs: u32,
    /// Request compression (`-C`)
    pub compression: bool,
    /// Cipher specification (`-c`)
    pub cipher: Option<String>,
    /// Run ssh with `-v` so authentication and forwarding are reported
    /// explicitly. Without it the forwarded port is probed instead.
    pub verbose: bool,
    /// Route prompts through SSH_ASKPASS instead of relying on stderr
    pub use_askpass: bool,
    /// Program run as `<helper> --askpass ...` (default: the current executable)
    pub askpass_helper: Option<PathBuf>,
    /// Connect to the forwarded port before declaring the tunnel up
    pub probe_forward: bool,
    /// Additional SSH arguments (e.g., from user's config)
    pub extra_args: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            ssh_host: String::new(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_login: String::new(),
            remote_host: String::new(),
            remote_port: 0,
            requested_local_port: 0,
            local_port_fallback: 0,
            identity_file: None,
            host_key_policy: HostKeyPolicy::default(),
            trust_unknown_hosts: false,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            prompt_timeout_ms: None,
            connect_timeout_secs: 10,
            keepalive_interval_secs: 15,
            compression: false,
            cipher: None,
            verbose: true,
            use_askpass: cfg!(unix),
            askpass_helper: None,
            probe_forward: false,
            extra_args: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Create a tunnel configuration with default ports and policies
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_login: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_login: ssh_login.into(),
            remote_host: remote_host.into(),
            remote_port,
            ..Self::default()
        }
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Set the requested and fallback local ports (0 for auto-assign)
    pub fn with_local_ports(mut self, requested: u16, fallback: u16) -> Self {
        self.requested_local_port = requested;
        self.local_port_fallback = fallback;
        self
    }

    pub fn with_ssh_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.ssh_binary = binary.into();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_trust_unknown_hosts(mut self, trust: bool) -> Self {
        self.trust_unknown_hosts = trust;
        self
    }

    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts.max(1);
        self
    }

    pub fn with_quiet_period(mut self, period: Duration) -> Self {
        self.quiet_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_askpass(mut self, enabled: bool) -> Self {
        self.use_askpass = enabled;
        self
    }

    /// Use `helper` as the askpass relay. Embedders whose binary does not
    /// call `handle_askpass_mode` point this at one that does.
    pub fn with_askpass_helper(mut self, helper: impl Into<PathBuf>) -> Self {
        self.askpass_helper = Some(helper.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = Some(cipher.into());
        self
    }

    pub fn with_probe_forward(mut self, probe: bool) -> Self {
        self.probe_forward = probe;
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build the SSH URL (user@host)
    pub fn ssh_url(&self) -> String {
        if self.ssh_login.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_login, self.ssh_host)
        }
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout_ms.map(Duration::from_millis)
    }
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TunnelState {
    /// Not connected; the only state in which `connect` starts a tunnel
    #[default]
    Idle,
    /// ssh is running and has not yet authenticated
    Connecting,
    /// A password, passphrase or host key question is being answered
    WaitingForAuth,
    /// Forwarding is up and the local port can be used
    Connected,
    /// The tunnel failed; see `last_error`
    ForwardingFailed,
}

impl TunnelState {
    /// Returns true if the tunnel is usable for connections
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Returns true once the tunnel has either come up or failed
    pub fn is_settled(&self) -> bool {
        matches!(self, TunnelState::Connected | TunnelState::ForwardingFailed)
    }

    /// Returns true while an ssh process is (or should be) running
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting | TunnelState::WaitingForAuth | TunnelState::Connected
        )
    }

    /// Edges the supervisor may take from this state.
    /// A failed tunnel stays failed until it is disconnected or reconnected,
    /// and a connected one only ends.
    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        match self {
            TunnelState::Connected => matches!(
                next,
                TunnelState::Idle | TunnelState::ForwardingFailed | TunnelState::Connected
            ),
            TunnelState::ForwardingFailed => matches!(
                next,
                TunnelState::Idle | TunnelState::Connecting | TunnelState::ForwardingFailed
            ),
            TunnelState::Idle => matches!(
                next,
                TunnelState::Idle | TunnelState::Connecting | TunnelState::ForwardingFailed
            ),
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::WaitingForAuth => "waiting for authentication",
            TunnelState::Connected => "connected",
            TunnelState::ForwardingFailed => "forwarding failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition as delivered to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: TunnelState,
    pub new: TunnelState,
}

/// Consistent view of everything the supervisor publishes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunnelSnapshot {
    pub state: TunnelState,
    /// Bound local port, 0 unless connected
    pub local_port: u16,
    /// Failure description, empty unless forwarding failed
    pub last_error: String,
}

impl TunnelSnapshot {
    /// Returns the local address if connected
    pub fn local_addr(&self) -> Option<String> {
        self.state
            .is_connected()
            .then(|| format!("{}:{}", LOCAL_BIND_HOST, self.local_port))
    }
}
