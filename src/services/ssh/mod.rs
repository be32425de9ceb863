//! SSH tunneling service for database connections.
//!
//! This module provides:
//! - `TunnelSupervisor` - runs one `ssh -N -L` forward and publishes its state
//! - `PromptMediator` - classifies ssh output and decides how prompts are answered
//! - `CredentialSource` - keychain or caller-provided secrets for prompts
//! - `AskpassBridge` - relays ssh's askpass questions over a Unix socket

mod askpass;
mod command;
mod credentials;
mod error;
mod port;
mod prompt;
mod supervisor;
mod types;
mod worker;

#[cfg(unix)]
pub use askpass::{AskpassBridge, AskpassRequest};
pub use askpass::{askpass_prompt_kind, handle_askpass_mode};
pub use command::SshCommand;
pub use credentials::{CredentialKey, CredentialSource, KeychainCredentials, StaticCredentials};
pub use error::TunnelError;
pub use port::{is_listening, pick_local_port, probe_port};
pub use prompt::{
    AnswerSource, FatalKind, LineBuffer, LineClass, Notice, PromptKind, PromptMediator,
    PromptRequest, Resolution, check_host_key_answer, classify_line,
};
pub use supervisor::{
    DEBUG_LOG_CAPACITY, DebugEntry, PromptCallback, StateCallback, TunnelSupervisor,
};
pub use types::{
    DEFAULT_MAX_AUTH_ATTEMPTS, DEFAULT_QUIET_PERIOD_MS, DEFAULT_SSH_PORT, HostKeyPolicy,
    LOCAL_BIND_HOST, StateChange, TunnelConfig, TunnelSnapshot, TunnelState,
};
