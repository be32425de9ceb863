//! End-to-end supervisor behaviour against shell scripts posing as `ssh`.
//!
//! Each script reads answers from stdin and writes prompts and errors to
//! stderr, the way ssh does without a terminal. A script that "logs in"
//! prints the `-v` authentication notice before idling.
#![cfg(unix)]

use anyhow::Result;
use sqltunnel::ssh::{
    CredentialKey, CredentialSource, StaticCredentials, TunnelConfig, TunnelError, TunnelState,
    TunnelSupervisor,
};
use std::sync::Weak;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(10);

const PASSWORD_PROMPT: &str = "alice@test.example's password: ";

/// Report a successful login the way `ssh -v` does, then hold the forward
const SESSION: &str = r#"echo 'debug1: Authenticated to test.example ([192.0.2.10]:22) using "password".' >&2
exec sleep 30"#;

fn fake_ssh(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config(binary: &Path) -> TunnelConfig {
    TunnelConfig::new("test.example", "alice", "127.0.0.1", 3306)
        .with_ssh_binary(binary)
        .with_askpass(false)
        .with_quiet_period(Duration::from_millis(200))
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

type Transitions = Arc<Mutex<Vec<(TunnelState, TunnelState)>>>;

fn record_transitions(supervisor: &TunnelSupervisor) -> Transitions {
    let seen: Transitions = Arc::default();
    let sink = seen.clone();
    supervisor.on_state_change(move |old, new| sink.lock().unwrap().push((old, new)));
    seen
}

/// Counts prompt callbacks and forwards each prompt text
fn count_prompts(supervisor: &TunnelSupervisor) -> (Arc<AtomicUsize>, mpsc::Receiver<String>) {
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let seen = count.clone();
    let tx = Mutex::new(tx);
    supervisor.on_prompt(move |request| {
        seen.fetch_add(1, Ordering::SeqCst);
        let _ = tx.lock().unwrap().send(request.text.clone());
    });
    (count, rx)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn password_script(dir: &TempDir) -> PathBuf {
    fake_ssh(
        dir,
        "ssh-password",
        &format!(
            r#"printf "{PASSWORD_PROMPT}" >&2
read pw
if [ "$pw" = "correct-secret" ]; then
  {SESSION}
fi
echo "alice@test.example: Permission denied (password)." >&2
exit 255"#
        ),
    )
}

#[test]
fn test_connects_on_requested_port() {
    let dir = TempDir::new().unwrap();
    let args_file = dir.path().join("args");
    let ssh = fake_ssh(
        &dir,
        "ssh-ok",
        &format!(
            "echo \"$@\" > '{}'\necho \"Warning: Permanently added 'test.example' (ED25519) to the list of known hosts.\" >&2\n{}",
            args_file.display(),
            SESSION
        ),
    );
    let requested = free_port();
    let fallback = free_port();

    let supervisor = TunnelSupervisor::new(config(&ssh).with_local_ports(requested, fallback));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(supervisor.local_port(), requested);
    assert_eq!(
        supervisor.local_addr(),
        Some(format!("127.0.0.1:{}", requested))
    );
    assert_eq!(supervisor.last_error(), "");

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert!(args.contains(&format!("-L {}:127.0.0.1:3306", requested)));
    assert!(args.contains("BatchMode=no"));
    assert!(args.split_whitespace().any(|a| a == "-v"));
    assert!(args.trim_end().ends_with("alice@test.example"));
    assert!(
        supervisor
            .debug_messages()
            .iter()
            .any(|l| l.contains("Permanently added"))
    );
}

#[test]
fn test_busy_requested_port_uses_fallback() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = holder.local_addr().unwrap().port();
    let fallback = free_port();

    let supervisor = TunnelSupervisor::new(config(&ssh).with_local_ports(busy, fallback));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(supervisor.local_port(), fallback);
    drop(holder);
}

#[test]
fn test_bind_failure_reported_by_ssh_retries_on_fallback() {
    let dir = TempDir::new().unwrap();
    let requested = free_port();
    let fallback = free_port();
    let ssh = fake_ssh(
        &dir,
        "ssh-bind",
        &format!(
            r#"case "$*" in
  *"-L {requested}:"*)
    echo "bind [127.0.0.1]:{requested}: Address already in use" >&2
    echo "channel_setup_fwd_listener_tcpip: cannot listen to port: {requested}" >&2
    echo "Could not request local forwarding." >&2
    exit 255;;
esac
{SESSION}"#
        ),
    );

    let supervisor = TunnelSupervisor::new(config(&ssh).with_local_ports(requested, fallback));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(supervisor.local_port(), fallback);
}

#[test]
fn test_both_ports_busy_fails() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);
    let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let (pa, pb) = (a.local_addr().unwrap().port(), b.local_addr().unwrap().port());

    let supervisor = TunnelSupervisor::new(config(&ssh).with_local_ports(pa, pb));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert_eq!(
        supervisor.last_failure(),
        Some(TunnelError::PortUnavailable {
            preferred: pa,
            fallback: pb
        })
    );
    assert_eq!(supervisor.local_port(), 0);
}

#[test]
fn test_unreachable_host_fails_without_connecting() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-unresolved",
        "echo \"ssh: Could not resolve hostname nowhere.invalid: Name or service not known\" >&2\nexit 255",
    );

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let transitions = record_transitions(&supervisor);
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(!supervisor.last_error().is_empty());
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::RemoteConnectionFailure(_))
    ));
    assert!(
        transitions
            .lock()
            .unwrap()
            .iter()
            .all(|(_, new)| *new != TunnelState::Connected)
    );
}

#[test]
fn test_slow_unreachable_host_never_connects() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-slow-timeout",
        "sleep 2\necho \"ssh: connect to host test.example port 22: Connection timed out\" >&2\nexit 255",
    );

    // Default quiet period, shorter than the time ssh takes to give up
    let supervisor = TunnelSupervisor::new(
        TunnelConfig::new("test.example", "alice", "127.0.0.1", 3306)
            .with_ssh_binary(&ssh)
            .with_askpass(false),
    );
    let transitions = record_transitions(&supervisor);
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::RemoteConnectionFailure(_))
    ));
    assert!(
        transitions
            .lock()
            .unwrap()
            .iter()
            .all(|(_, new)| *new != TunnelState::Connected)
    );
}

#[test]
fn test_refused_connection_reports_ssh_text() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-refused",
        "echo \"ssh: connect to host test.example port 22: Connection refused\" >&2\nexit 255",
    );

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(supervisor.last_error().to_lowercase().contains("refused"));
}

#[test]
fn test_missing_binary_is_launch_failure() {
    let supervisor = TunnelSupervisor::new(config(Path::new("/nonexistent/ssh")));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::LaunchFailure { .. })
    ));
}

#[test]
fn test_unexpected_exit_keeps_output() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-odd", "echo \"kex_exchange_identification: banner line too long\" >&2\nexit 3");

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    match supervisor.last_failure() {
        Some(TunnelError::UnexpectedProcessExit { status, output }) => {
            assert!(status.contains('3'));
            assert!(output.contains("banner line too long"));
        }
        other => panic!("unexpected failure: {:?}", other),
    }
}

#[test]
fn test_disconnect_is_idempotent_and_stops_ssh() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("pid");
    let ssh = fake_ssh(
        &dir,
        "ssh-pid",
        &format!("echo $$ > '{}'\n{}", pid_file.display(), SESSION),
    );

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.disconnect();
    assert_eq!(supervisor.state(), TunnelState::Idle);

    supervisor.connect();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    supervisor.disconnect();
    supervisor.disconnect();
    assert_eq!(supervisor.state(), TunnelState::Idle);
    assert_eq!(supervisor.local_port(), 0);

    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "ssh process {} still running after disconnect", pid);

    // The supervisor can be reused
    supervisor.connect();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
}

#[test]
fn test_connect_while_running_is_ignored() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let transitions = record_transitions(&supervisor);
    supervisor.connect();
    supervisor.connect();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (TunnelState::Idle, TunnelState::Connecting),
            (TunnelState::Connecting, TunnelState::Connected),
        ]
    );
}

#[test]
fn test_credential_source_answers_without_asking() {
    let dir = TempDir::new().unwrap();
    let ssh = password_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh).with_local_ports(13306, 13307));
    supervisor.set_credential_source(Arc::new(StaticCredentials::new("correct-secret")));
    let transitions = record_transitions(&supervisor);
    let (prompts, _rx) = count_prompts(&supervisor);

    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(supervisor.local_port(), 13306);
    assert_eq!(prompts.load(Ordering::SeqCst), 0);
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (TunnelState::Idle, TunnelState::Connecting),
            (TunnelState::Connecting, TunnelState::WaitingForAuth),
            (TunnelState::WaitingForAuth, TunnelState::Connecting),
            (TunnelState::Connecting, TunnelState::Connected),
        ]
    );
}

#[test]
fn test_rejected_stored_secret_falls_back_to_caller() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-retry",
        &format!(
            r#"while true; do
  printf "{PASSWORD_PROMPT}" >&2
  read pw || exit 255
  if [ "$pw" = "correct-secret" ]; then
  {SESSION}
fi
  echo "Permission denied, please try again." >&2
done"#
        ),
    );

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.set_credential_source(Arc::new(StaticCredentials::new("stale-secret")));
    let (prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    let text = rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(text, PASSWORD_PROMPT.trim());
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    supervisor.supply_password("correct-secret").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_second_prompt_waits_for_first_answer() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-two-prompts",
        &format!(
            r#"printf "{PASSWORD_PROMPT}\n" >&2
printf "{PASSWORD_PROMPT}\n" >&2
read first
read second
{SESSION}"#
        ),
    );

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let (prompts, _rx) = count_prompts(&supervisor);
    supervisor.connect();

    wait_until("first prompt", || prompts.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.state(), TunnelState::WaitingForAuth);
    assert!(supervisor.pending_prompt().is_some());

    supervisor.supply_password("first").unwrap();
    wait_until("second prompt", || prompts.load(Ordering::SeqCst) == 2);
    supervisor.supply_password("second").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(prompts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_retry_limit_fails_after_n_wrong_answers() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-reprompt",
        &format!(
            r#"while true; do
  printf "{PASSWORD_PROMPT}" >&2
  read pw || exit 255
  echo "Permission denied, please try again." >&2
done"#
        ),
    );

    let supervisor = TunnelSupervisor::new(
        config(&ssh)
            .with_max_auth_attempts(3)
            .with_quiet_period(Duration::from_millis(500)),
    );
    let transitions = record_transitions(&supervisor);
    let (prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    for _ in 0..3 {
        rx.recv_timeout(SETTLE).unwrap();
        supervisor.supply_password("wrong-secret").unwrap();
    }

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert_eq!(prompts.load(Ordering::SeqCst), 3);
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::AuthenticationFailure(_))
    ));
    assert!(
        transitions
            .lock()
            .unwrap()
            .iter()
            .all(|(_, new)| *new != TunnelState::Connected)
    );
}

#[test]
fn test_wrong_password_fails_with_ssh_message() {
    let dir = TempDir::new().unwrap();
    let ssh = password_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    rx.recv_timeout(SETTLE).unwrap();
    supervisor.supply_password("nope").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(supervisor.last_error().contains("Permission denied"));
}

#[test]
fn test_supply_without_prompt_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.connect();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);

    assert_eq!(
        supervisor.supply_password("secret"),
        Err(TunnelError::NoPendingPrompt)
    );
    // Non-fatal
    assert_eq!(supervisor.state(), TunnelState::Connected);
}

fn host_key_script(dir: &TempDir) -> PathBuf {
    fake_ssh(
        dir,
        "ssh-host-key",
        &format!(
            r#"echo "The authenticity of host 'test.example (192.0.2.10)' can't be established." >&2
printf "Are you sure you want to continue connecting (yes/no/[fingerprint])? " >&2
read answer
if [ "$answer" = "yes" ]; then
  {SESSION}
fi
echo "Host key verification failed." >&2
exit 255"#
        ),
    )
}

#[test]
fn test_host_key_question_goes_to_caller() {
    let dir = TempDir::new().unwrap();
    let ssh = host_key_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    let text = rx.recv_timeout(SETTLE).unwrap();
    assert!(text.contains("continue connecting"));
    supervisor.supply_interactive_answer("yes").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
}

#[test]
fn test_declined_host_key_fails() {
    let dir = TempDir::new().unwrap();
    let ssh = host_key_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    rx.recv_timeout(SETTLE).unwrap();
    supervisor.supply_interactive_answer("no").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::HostVerificationDeclined(_))
    ));
}

#[test]
fn test_trusted_hosts_are_accepted_automatically() {
    let dir = TempDir::new().unwrap();
    let ssh = host_key_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh).with_trust_unknown_hosts(true));
    let (prompts, _rx) = count_prompts(&supervisor);
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(prompts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unanswered_prompt_times_out() {
    let dir = TempDir::new().unwrap();
    let ssh = password_script(&dir);

    let supervisor = TunnelSupervisor::new(
        config(&ssh).with_prompt_timeout(Some(Duration::from_millis(300))),
    );
    supervisor.connect();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::ForwardingFailed);
    assert!(matches!(
        supervisor.last_failure(),
        Some(TunnelError::AuthenticationFailure(_))
    ));
    assert!(supervisor.pending_prompt().is_none());
}

#[test]
fn test_disconnect_while_waiting_for_answer() {
    let dir = TempDir::new().unwrap();
    let ssh = password_script(&dir);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();
    rx.recv_timeout(SETTLE).unwrap();

    supervisor.disconnect();
    assert_eq!(supervisor.state(), TunnelState::Idle);
    assert!(supervisor.pending_prompt().is_none());
    assert_eq!(
        supervisor.supply_password("late"),
        Err(TunnelError::NoPendingPrompt)
    );
}

/// Remembers what it was asked to store
#[derive(Default)]
struct RecordingSource {
    stored: Mutex<Vec<(CredentialKey, String)>>,
}

impl CredentialSource for RecordingSource {
    fn lookup(&self, _key: &CredentialKey) -> Option<String> {
        None
    }

    fn remember(&self, key: &CredentialKey, secret: &str) -> Result<()> {
        self.stored
            .lock()
            .unwrap()
            .push((key.clone(), secret.to_string()));
        Ok(())
    }
}

#[test]
fn test_remembered_secret_is_stored_once_connected() {
    let dir = TempDir::new().unwrap();
    let ssh = password_script(&dir);
    let source = Arc::new(RecordingSource::default());

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.set_credential_source(source.clone());
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    rx.recv_timeout(SETTLE).unwrap();
    supervisor
        .supply_password_and_remember("correct-secret")
        .unwrap();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);

    assert_eq!(
        *source.stored.lock().unwrap(),
        vec![(
            CredentialKey::password("alice", "test.example", 22),
            "correct-secret".to_string()
        )]
    );
}

#[test]
fn test_delayed_rejection_is_not_success() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-slow-reject",
        &format!(
            r#"while true; do
  printf "{PASSWORD_PROMPT}" >&2
  read pw || exit 255
  if [ "$pw" = "correct-secret" ]; then
  {SESSION}
  fi
  sleep 1
  echo "Permission denied, please try again." >&2
done"#
        ),
    );
    let source = Arc::new(RecordingSource::default());

    let supervisor = TunnelSupervisor::new(config(&ssh));
    supervisor.set_credential_source(source.clone());
    let transitions = record_transitions(&supervisor);
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    rx.recv_timeout(SETTLE).unwrap();
    supervisor
        .supply_password_and_remember("wrong-secret")
        .unwrap();

    // The server takes longer to say no than the quiet period
    rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(supervisor.state(), TunnelState::WaitingForAuth);
    assert!(
        transitions
            .lock()
            .unwrap()
            .iter()
            .all(|(_, new)| *new != TunnelState::Connected)
    );
    assert!(source.stored.lock().unwrap().is_empty());

    supervisor
        .supply_password_and_remember("correct-secret")
        .unwrap();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    assert_eq!(
        *source.stored.lock().unwrap(),
        vec![(
            CredentialKey::password("alice", "test.example", 22),
            "correct-secret".to_string()
        )]
    );
}

#[test]
fn test_state_callback_may_disconnect() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);

    let supervisor = Arc::new(TunnelSupervisor::new(config(&ssh)));
    let handle: Weak<TunnelSupervisor> = Arc::downgrade(&supervisor);
    supervisor.on_state_change(move |_, new| {
        if new == TunnelState::Connecting {
            if let Some(supervisor) = handle.upgrade() {
                supervisor.disconnect();
            }
        }
    });

    let (done_tx, done_rx) = mpsc::channel();
    let connecting = supervisor.clone();
    std::thread::spawn(move || {
        connecting.connect();
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());

    wait_until("disconnect from callback", || {
        supervisor.state() == TunnelState::Idle
    });
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(supervisor.state(), TunnelState::Idle);
}

#[test]
fn test_askpass_helper_relays_answer() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(
        &dir,
        "ssh-askpass",
        &format!(
            r#"pw=$("$SSH_ASKPASS" "{PASSWORD_PROMPT}") || exit 255
if [ "$pw" = "correct-secret" ]; then
  {SESSION}
fi
echo "alice@test.example: Permission denied (password)." >&2
exit 255"#
        ),
    );

    let supervisor = TunnelSupervisor::new(
        config(&ssh)
            .with_askpass(true)
            .with_askpass_helper(env!("CARGO_BIN_EXE_sqltunnel")),
    );
    let (_prompts, rx) = count_prompts(&supervisor);
    supervisor.connect();

    let text = rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(text, PASSWORD_PROMPT.trim());
    supervisor.supply_password("correct-secret").unwrap();

    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
}

#[test]
fn test_subscribers_see_every_change() {
    let dir = TempDir::new().unwrap();
    let ssh = fake_ssh(&dir, "ssh-ok", SESSION);

    let supervisor = TunnelSupervisor::new(config(&ssh));
    let changes = supervisor.subscribe();
    supervisor.connect();
    assert_eq!(supervisor.wait_for_settled(SETTLE), TunnelState::Connected);
    supervisor.disconnect();

    let seen: Vec<TunnelState> = std::iter::from_fn(|| changes.try_recv().ok())
        .map(|change| change.new)
        .collect();
    assert_eq!(
        seen,
        vec![
            TunnelState::Connecting,
            TunnelState::Connected,
            TunnelState::Idle
        ]
    );
}
