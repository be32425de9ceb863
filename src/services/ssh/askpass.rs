//! Prompt relay for SSH_ASKPASS via Unix socket.
//!
//! Without a terminal, OpenSSH asks for passwords, passphrases and host key
//! confirmation by running the `SSH_ASKPASS` program with the question as its
//! argument. Instead of a script that echoes a secret, we:
//!
//! 1. Create a Unix socket with restrictive permissions (0600)
//! 2. Write a minimal script that re-invokes this binary in `--askpass` mode
//! 3. Receive the question over the socket and answer it through the same
//!    prompt pipeline as stderr prompts
//!
//! Security properties:
//! - Secrets never written to filesystem
//! - Socket and temp directory are owner-only
//! - Requests must carry the per-tunnel token
//! - Temp directory cleaned up on drop
//!
//! # Usage in binaries
//!
//! Call `handle_askpass_mode()` at the very start of main() before any other
//! initialization. If the `--askpass` flag is present, it will relay the
//! question and exit. Otherwise, it returns and your program continues.

use anyhow::{Context, Result};
#[cfg(unix)]
use smol::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(unix)]
use smol::net::unix::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tempfile::TempDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::prompt::{PromptKind, classify_line};

/// Check for `--askpass` mode and handle it if present.
///
/// Expected arguments: `--askpass <socket_path> <token> <prompt...>`.
/// The answer is printed to stdout for ssh; an empty answer exits with
/// status 1, which ssh treats as a cancelled prompt.
pub fn handle_askpass_mode() {
    let args: Vec<String> = std::env::args().collect();

    if let Some(pos) = args.iter().position(|a| a == "--askpass") {
        let (Some(socket_path), Some(token)) = (args.get(pos + 1), args.get(pos + 2)) else {
            eprintln!("--askpass requires a socket path and token");
            std::process::exit(1);
        };
        let prompt = args[(pos + 3).min(args.len())..].join(" ");
        match relay_prompt(socket_path, token, &prompt) {
            Ok(true) => std::process::exit(0),
            Ok(false) => std::process::exit(1),
            Err(e) => {
                eprintln!("askpass error: {}", e);
                std::process::exit(1);
            }
        }
    }
    // If --askpass not present, return normally
}

/// Send the question to the tunnel and print its answer.
#[cfg(unix)]
fn relay_prompt(socket_path: &str, token: &str, prompt: &str) -> std::io::Result<bool> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)?;
    stream.write_all(token.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.write_all(prompt.as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut answer = String::new();
    stream.read_to_string(&mut answer)?;
    if answer.is_empty() {
        return Ok(false);
    }

    // Print to stdout (SSH reads from askpass stdout)
    println!("{}", answer);
    std::io::stdout().flush()?;
    Ok(true)
}

#[cfg(not(unix))]
fn relay_prompt(_socket_path: &str, _token: &str, _prompt: &str) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "askpass mode is only supported on Unix systems",
    ))
}

/// Map an askpass question onto a prompt kind.
pub fn askpass_prompt_kind(prompt: &str) -> PromptKind {
    if let Some(kind) = classify_line(prompt).prompt_kind() {
        return kind;
    }
    // Multi-line host key questions end with the yes/no line
    let last_line = prompt.trim_end().lines().last().unwrap_or_default();
    match classify_line(last_line).prompt_kind() {
        Some(kind) => kind,
        None if prompt.contains("(yes/no") => PromptKind::HostKey,
        None => PromptKind::Password,
    }
}

/// One question from an askpass helper, answered exactly once.
#[cfg(unix)]
pub struct AskpassRequest {
    pub prompt: String,
    stream: UnixStream,
}

#[cfg(unix)]
impl AskpassRequest {
    /// Send `Some(answer)`, or `None` to cancel the prompt.
    pub async fn respond(mut self, answer: Option<&str>) -> Result<()> {
        if let Some(answer) = answer {
            self.stream
                .write_all(answer.as_bytes())
                .await
                .context("Failed to write answer to askpass socket")?;
            self.stream
                .flush()
                .await
                .context("Failed to flush askpass socket")?;
        }
        // Close our end to signal EOF
        drop(self.stream);
        Ok(())
    }
}

/// Listens for askpass helpers of one tunnel.
#[cfg(unix)]
pub struct AskpassBridge {
    listener: UnixListener,
    script_path: PathBuf,
    #[allow(dead_code)]
    socket_path: PathBuf,
    token: String,
    _temp_dir: TempDir,
}

#[cfg(unix)]
impl AskpassBridge {
    /// Create the socket and helper script for the current executable.
    pub fn new() -> Result<Self> {
        let current_exe =
            std::env::current_exe().context("Failed to get current executable path")?;
        Self::with_helper(&current_exe)
    }

    /// Create the socket and a script that runs `helper --askpass ...`.
    pub fn with_helper(helper: &Path) -> Result<Self> {
        let temp_dir = TempDir::with_prefix("sqltunnel-ssh-")?;
        let socket_path = temp_dir.path().join("askpass.sock");
        let script_path = temp_dir.path().join("askpass.sh");
        let token = uuid::Uuid::new_v4().simple().to_string();

        // Set directory permissions to 0700 (owner rwx only)
        set_mode(temp_dir.path(), 0o700)?;

        let listener =
            UnixListener::bind(&socket_path).context("Failed to create askpass socket")?;
        set_mode(&socket_path, 0o600)?;

        let script = format!(
            "#!/bin/sh\n# askpass relay - the answer is delivered via Unix socket\nexec {} --askpass {} {} \"$@\"\n",
            shell_escape(&helper.to_string_lossy()),
            shell_escape(&socket_path.to_string_lossy()),
            shell_escape(&token)
        );
        std::fs::write(&script_path, &script).context("Failed to write askpass script")?;
        set_mode(&script_path, 0o700)?;

        tracing::debug!(
            "Created askpass bridge: socket={}, script={}",
            socket_path.display(),
            script_path.display()
        );

        Ok(Self {
            listener,
            script_path,
            socket_path,
            token,
            _temp_dir: temp_dir,
        })
    }

    /// Path to the askpass script (set as SSH_ASKPASS)
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Wait for the next helper carrying the right token.
    pub async fn accept(&self) -> Result<AskpassRequest> {
        loop {
            let (mut stream, _addr) = self
                .listener
                .accept()
                .await
                .context("Failed to accept askpass connection")?;

            let mut raw = Vec::new();
            if let Err(e) = stream.read_to_end(&mut raw).await {
                tracing::debug!("Dropping unreadable askpass request: {}", e);
                continue;
            }
            match parse_request(&raw, &self.token) {
                Some(prompt) => return Ok(AskpassRequest { prompt, stream }),
                None => tracing::warn!("Rejected askpass request with a bad token"),
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Split `<token>\n<prompt>` and check the token.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_request(raw: &[u8], token: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let (sent_token, prompt) = text.split_once('\n')?;
    (sent_token == token).then(|| prompt.to_string())
}

/// Shell-escape a string for safe inclusion in a shell script.
#[cfg_attr(not(unix), allow(dead_code))]
fn shell_escape(s: &str) -> String {
    // Replace single quotes with '\'' (end quote, escaped quote, start quote)
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(unix)]
impl Drop for AskpassBridge {
    fn drop(&mut self) {
        // TempDir handles cleanup, but log it for debugging
        tracing::debug!("Cleaning up askpass bridge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(
            parse_request(b"abc\nalice@host's password: ", "abc").as_deref(),
            Some("alice@host's password: ")
        );
        assert_eq!(parse_request(b"wrong\nprompt", "abc"), None);
        assert_eq!(parse_request(b"no-newline", "abc"), None);
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "'simple'");
        assert_eq!(shell_escape("/path/to/file"), "'/path/to/file'");
        assert_eq!(shell_escape("path with spaces"), "'path with spaces'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_askpass_prompt_kind() {
        assert_eq!(
            askpass_prompt_kind("alice@test.example's password: "),
            PromptKind::Password
        );
        assert_eq!(
            askpass_prompt_kind(
                "The authenticity of host 'test.example' can't be established.\n\
                 ED25519 key fingerprint is SHA256:abc.\n\
                 Are you sure you want to continue connecting (yes/no/[fingerprint])?"
            ),
            PromptKind::HostKey
        );
        assert_eq!(askpass_prompt_kind("Something unusual:"), PromptKind::Password);
    }

    #[cfg(unix)]
    #[test]
    fn test_bridge_script_contains_no_secret() {
        let bridge = AskpassBridge::with_helper(Path::new("/usr/local/bin/sqltunnel")).unwrap();
        assert!(bridge.script_path().exists());

        let script = std::fs::read_to_string(bridge.script_path()).unwrap();
        assert!(script.contains("--askpass"));
        assert!(script.contains(&bridge.token));
        assert!(!script.contains("secret"));
    }

    #[cfg(unix)]
    #[test]
    fn test_bridge_round_trip() {
        smol::block_on(async {
            let bridge = AskpassBridge::with_helper(Path::new("/bin/true")).unwrap();
            let socket_path = bridge.socket_path.clone();
            let token = bridge.token.clone();

            // Play the helper side in a thread, like ssh would via the script
            let helper = std::thread::spawn(move || {
                relay_prompt(&socket_path.to_string_lossy(), "bogus", "ignored").ok();
                let mut stream = std::os::unix::net::UnixStream::connect(&socket_path).unwrap();
                use std::io::{Read, Write};
                write!(stream, "{}\nalice@test.example's password: ", token).unwrap();
                stream.shutdown(std::net::Shutdown::Write).unwrap();
                let mut answer = String::new();
                stream.read_to_string(&mut answer).unwrap();
                answer
            });

            let request = bridge.accept().await.unwrap();
            assert_eq!(request.prompt, "alice@test.example's password: ");
            request.respond(Some("correct-secret")).await.unwrap();

            assert_eq!(helper.join().unwrap(), "correct-secret");
        });
    }
}
