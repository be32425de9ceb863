//! Classification of ssh output and prompt answering policy.
//!
//! ssh reports everything on stderr: progress, warnings, authentication
//! questions, and the reason it gave up. Each line is matched against the
//! phrases OpenSSH actually prints. Prompts are usually written without a
//! trailing newline, so `LineBuffer` also releases a partial line once it
//! looks like a question.

use super::credentials::{CredentialKey, CredentialSource};
use super::error::TunnelError;
use super::types::TunnelConfig;

/// The kind of question ssh is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Password,
    Passphrase,
    HostKey,
}

impl PromptKind {
    /// Secrets are never logged or echoed
    pub fn is_secret(&self) -> bool {
        !matches!(self, PromptKind::HostKey)
    }
}

/// A question waiting for an answer, as shown to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub kind: PromptKind,
    pub text: String,
}

/// Refinement of informational output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Plain,
    /// "Permission denied, please try again."
    AuthRejected,
    /// Authentication completed (verbose output)
    Authenticated,
    /// Forwarding is known to be listening (verbose output)
    ForwardEstablished,
    /// The requested local port could not be bound
    LocalPortInUse,
}

/// Category of an unrecoverable ssh message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Authentication,
    HostVerification,
    RemoteConnection,
}

impl FatalKind {
    pub fn into_error(self, line: &str) -> TunnelError {
        let line = line.trim().to_string();
        match self {
            FatalKind::Authentication => TunnelError::AuthenticationFailure(line),
            FatalKind::HostVerification => TunnelError::HostVerificationDeclined(line),
            FatalKind::RemoteConnection => TunnelError::RemoteConnectionFailure(line),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    AuthPasswordPrompt,
    AuthPassphrasePrompt,
    HostKeyVerificationPrompt,
    Informational(Notice),
    FatalError(FatalKind),
}

impl LineClass {
    pub fn prompt_kind(&self) -> Option<PromptKind> {
        match self {
            LineClass::AuthPasswordPrompt => Some(PromptKind::Password),
            LineClass::AuthPassphrasePrompt => Some(PromptKind::Passphrase),
            LineClass::HostKeyVerificationPrompt => Some(PromptKind::HostKey),
            _ => None,
        }
    }
}

const HOST_KEY_PATTERNS: &[&str] = &["are you sure you want to continue connecting"];

const PASSPHRASE_PATTERNS: &[&str] = &["enter passphrase for", "passphrase for key"];

const AUTH_RETRY_PATTERNS: &[&str] = &["permission denied, please try again"];

const AUTHENTICATED_PATTERNS: &[&str] = &["authenticated to ", "authentication succeeded"];

const ESTABLISHED_PATTERNS: &[&str] = &[
    "entering interactive session",
    "local forwarding listening on",
];

const PORT_IN_USE_PATTERNS: &[&str] = &[
    "address already in use",
    "cannot listen to port",
    "could not request local forwarding",
];

const AUTH_FATAL_PATTERNS: &[&str] = &[
    "permission denied (",
    "too many authentication failures",
    "no more authentication methods",
    "no supported authentication methods",
    "authentication failed",
];

const HOST_VERIFICATION_FATAL_PATTERNS: &[&str] = &[
    "host key verification failed",
    "remote host identification has changed",
];

const REMOTE_FATAL_PATTERNS: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "connection refused",
    "connection timed out",
    "operation timed out",
    "no route to host",
    "network is unreachable",
    "connection closed by",
    "connection reset by",
    "open failed",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify one line of ssh stderr (or an askpass prompt).
pub fn classify_line(line: &str) -> LineClass {
    let lower = line.trim().to_lowercase();

    // Verbose chatter can mention refused addresses that ssh then retries;
    // only its explicit progress markers are meaningful.
    if lower.starts_with("debug") {
        if contains_any(&lower, ESTABLISHED_PATTERNS) {
            return LineClass::Informational(Notice::ForwardEstablished);
        }
        if contains_any(&lower, AUTHENTICATED_PATTERNS) {
            return LineClass::Informational(Notice::Authenticated);
        }
        return LineClass::Informational(Notice::Plain);
    }

    if contains_any(&lower, HOST_KEY_PATTERNS) {
        return LineClass::HostKeyVerificationPrompt;
    }
    if contains_any(&lower, PASSPHRASE_PATTERNS) || lower.ends_with("passphrase:") {
        return LineClass::AuthPassphrasePrompt;
    }
    if lower.ends_with("password:") || lower.contains("'s password:") {
        return LineClass::AuthPasswordPrompt;
    }
    if contains_any(&lower, AUTH_RETRY_PATTERNS) {
        return LineClass::Informational(Notice::AuthRejected);
    }
    if contains_any(&lower, PORT_IN_USE_PATTERNS) {
        return LineClass::Informational(Notice::LocalPortInUse);
    }
    if contains_any(&lower, AUTH_FATAL_PATTERNS) {
        return LineClass::FatalError(FatalKind::Authentication);
    }
    if contains_any(&lower, HOST_VERIFICATION_FATAL_PATTERNS) {
        return LineClass::FatalError(FatalKind::HostVerification);
    }
    if contains_any(&lower, REMOTE_FATAL_PATTERNS) {
        return LineClass::FatalError(FatalKind::RemoteConnection);
    }
    if contains_any(&lower, ESTABLISHED_PATTERNS) {
        return LineClass::Informational(Notice::ForwardEstablished);
    }
    if contains_any(&lower, AUTHENTICATED_PATTERNS) {
        return LineClass::Informational(Notice::Authenticated);
    }
    LineClass::Informational(Notice::Plain)
}

/// Whether an unterminated chunk of output is a question ssh is blocked on
pub fn looks_like_prompt(partial: &str) -> bool {
    let trimmed = partial.trim_end();
    (trimmed.ends_with(':') || trimmed.ends_with('?'))
        && classify_line(trimmed).prompt_kind().is_some()
}

/// Extract the key path from "Enter passphrase for key '/path/id_rsa':"
pub fn extract_key_path(prompt: &str) -> Option<&str> {
    let start = prompt.find('\'')? + 1;
    let len = prompt[start..].find('\'')?;
    let path = &prompt[start..start + len];
    (!path.is_empty()).then_some(path)
}

/// Splits a byte stream into lines, releasing unterminated prompts early.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line now complete, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }

        if !self.pending.is_empty() {
            let partial = String::from_utf8_lossy(&self.pending).into_owned();
            if looks_like_prompt(&partial) {
                self.pending.clear();
                lines.push(partial.trim_end_matches('\r').to_string());
            }
        }

        lines
    }

    /// Whatever is left once the stream ended
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Where an automatic answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSource {
    CredentialSource,
    TrustedHost,
}

/// What to do about a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write this answer back without involving the caller
    Answer { text: String, source: AnswerSource },
    /// Publish a pending prompt and wait for the caller
    AskCaller,
    /// Give up on the tunnel
    Fail(TunnelError),
}

/// Decides how each prompt of one connection attempt is answered.
///
/// Tracks per-kind attempt counts so a rejected secret is not replayed
/// forever, and remembers which stored secrets already failed.
#[derive(Debug)]
pub struct PromptMediator {
    trust_unknown_hosts: bool,
    max_auth_attempts: u32,
    password_attempts: u32,
    passphrase_attempts: u32,
    stored_password_tried: bool,
    stored_passphrase_tried: bool,
    ssh_login: String,
    ssh_host: String,
    ssh_port: u16,
    identity_file: Option<String>,
}

impl PromptMediator {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            trust_unknown_hosts: config.trust_unknown_hosts,
            max_auth_attempts: config.max_auth_attempts.max(1),
            password_attempts: 0,
            passphrase_attempts: 0,
            stored_password_tried: false,
            stored_passphrase_tried: false,
            ssh_login: config.ssh_login.clone(),
            ssh_host: config.ssh_host.clone(),
            ssh_port: config.ssh_port,
            identity_file: config
                .identity_file
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// The keychain key a secret prompt refers to
    pub fn credential_key(&self, request: &PromptRequest) -> Option<CredentialKey> {
        match request.kind {
            PromptKind::Password => Some(CredentialKey::password(
                &self.ssh_login,
                &self.ssh_host,
                self.ssh_port,
            )),
            PromptKind::Passphrase => {
                let path = extract_key_path(&request.text)
                    .map(str::to_string)
                    .or_else(|| self.identity_file.clone())
                    .unwrap_or_else(|| "key".to_string());
                Some(CredentialKey::passphrase(
                    &self.ssh_login,
                    &self.ssh_host,
                    self.ssh_port,
                    &path,
                ))
            }
            PromptKind::HostKey => None,
        }
    }

    /// Decide how to answer `request`, counting it as an attempt.
    pub fn resolve(
        &mut self,
        request: &PromptRequest,
        credentials: Option<&dyn CredentialSource>,
    ) -> Resolution {
        match request.kind {
            PromptKind::HostKey => {
                if self.trust_unknown_hosts {
                    Resolution::Answer {
                        text: "yes".to_string(),
                        source: AnswerSource::TrustedHost,
                    }
                } else {
                    Resolution::AskCaller
                }
            }
            PromptKind::Password | PromptKind::Passphrase => {
                let attempts = match request.kind {
                    PromptKind::Password => &mut self.password_attempts,
                    _ => &mut self.passphrase_attempts,
                };
                if *attempts >= self.max_auth_attempts {
                    return Resolution::Fail(TunnelError::AuthenticationFailure(format!(
                        "{} consecutive attempts were rejected",
                        self.max_auth_attempts
                    )));
                }
                *attempts += 1;

                let tried = match request.kind {
                    PromptKind::Password => &mut self.stored_password_tried,
                    _ => &mut self.stored_passphrase_tried,
                };
                if !*tried {
                    *tried = true;
                    let key = self.credential_key(request);
                    let stored = credentials
                        .zip(key)
                        .and_then(|(source, key)| source.lookup(&key));
                    if let Some(secret) = stored {
                        return Resolution::Answer {
                            text: secret,
                            source: AnswerSource::CredentialSource,
                        };
                    }
                }
                Resolution::AskCaller
            }
        }
    }

    /// Authentication went through; later prompts start a fresh count
    pub fn reset_attempts(&mut self) {
        self.password_attempts = 0;
        self.passphrase_attempts = 0;
    }

    pub fn attempts(&self, kind: PromptKind) -> u32 {
        match kind {
            PromptKind::Password => self.password_attempts,
            PromptKind::Passphrase => self.passphrase_attempts,
            PromptKind::HostKey => 0,
        }
    }
}

/// Anything other than "yes" or a fingerprint declines the host key.
pub fn check_host_key_answer(question: &str, answer: &str) -> Result<(), TunnelError> {
    let answer = answer.trim();
    if answer.eq_ignore_ascii_case("yes")
        || answer.starts_with("SHA256:")
        || answer.starts_with("MD5:")
    {
        Ok(())
    } else {
        Err(TunnelError::HostVerificationDeclined(
            question.trim().to_string(),
        ))
    }
}
