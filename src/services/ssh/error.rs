//! Failure taxonomy for SSH tunnels.

use thiserror::Error;

/// Everything that can go wrong with a tunnel.
///
/// All variants except `NoPendingPrompt` are fatal: the supervisor moves to
/// `ForwardingFailed`, kills ssh, and exposes the display text through
/// `last_error()`. Messages that originate from ssh keep its wording.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Failed to launch {binary}: {reason}")]
    LaunchFailure { binary: String, reason: String },

    #[error("No local port available (tried {preferred} and {fallback})")]
    PortUnavailable { preferred: u16, fallback: u16 },

    #[error("SSH authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Host key verification declined: {0}")]
    HostVerificationDeclined(String),

    #[error("SSH connection failed: {0}")]
    RemoteConnectionFailure(String),

    #[error("SSH exited unexpectedly ({status}): {output}")]
    UnexpectedProcessExit { status: String, output: String },

    #[error("No prompt is waiting for an answer")]
    NoPendingPrompt,
}

impl TunnelError {
    pub(crate) fn launch(binary: &std::path::Path, err: &std::io::Error) -> Self {
        TunnelError::LaunchFailure {
            binary: binary.display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether this error ends the tunnel
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TunnelError::NoPendingPrompt)
    }
}
