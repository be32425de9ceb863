use anyhow::{Context, Result, bail};
use clap::Parser;
use sqltunnel::logging;
use sqltunnel::services::{TunnelProfile, default_profiles_path, find_profile, load_profiles, upsert_profile};
use sqltunnel::ssh::{
    CredentialKey, KeychainCredentials, PromptKind, PromptRequest, StateChange, TunnelConfig, TunnelState,
    TunnelSupervisor, handle_askpass_mode,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";

#[derive(Parser, Debug)]
#[command(author, version, about = "Hold an SSH port forward open for a database client", long_about = None)]
struct Cli {
    /// Saved tunnel profile to start from
    profile: Option<String>,
    #[arg(long, env = "SQLTUNNEL_SSH_HOST")]
    ssh_host: Option<String>,
    #[arg(long)]
    ssh_port: Option<u16>,
    #[arg(long, env = "SQLTUNNEL_LOGIN")]
    login: Option<String>,
    /// Database host as seen from the SSH server
    #[arg(long)]
    remote_host: Option<String>,
    #[arg(long)]
    remote_port: Option<u16>,
    /// Local port to listen on (0 picks a free one)
    #[arg(long)]
    local_port: Option<u16>,
    /// Local port used when --local-port is taken
    #[arg(long)]
    fallback_port: Option<u16>,
    /// Private key file passed to ssh
    #[arg(long)]
    identity: Option<PathBuf>,
    /// Accept unknown host keys without asking
    #[arg(long)]
    trust_unknown_hosts: bool,
    /// Neither read nor store secrets in the system keychain
    #[arg(long)]
    no_keychain: bool,
    /// Save the resulting configuration under this profile name
    #[arg(long, value_name = "NAME")]
    save: Option<String>,
    /// List saved profiles and exit
    #[arg(long)]
    list: bool,
    /// Delete the keychain secrets stored for this tunnel and exit
    #[arg(long, conflicts_with = "no_keychain")]
    forget_secrets: bool,
    #[arg(long, env = "SQLTUNNEL_LOG", default_value = "info")]
    log_level: String,
    #[arg(long)]
    no_color: bool,
}

fn main() -> Result<()> {
    // Handle --askpass mode first (before any other initialization)
    handle_askpass_mode();

    let cli = Cli::parse();
    logging::init(&cli.log_level, !cli.no_color);

    let profiles_path = default_profiles_path()?;
    if cli.list {
        return smol::block_on(list_profiles(&profiles_path));
    }

    let config = smol::block_on(resolve_config(&cli, &profiles_path))?;
    if let Some(name) = &cli.save {
        smol::block_on(upsert_profile(
            &profiles_path,
            TunnelProfile::new(name.clone(), config.clone()),
        ))?;
        println!("Saved profile '{}' to {}", name, profiles_path.display());
    }

    if cli.forget_secrets {
        return forget_secrets(&config);
    }

    run_tunnel(config, !cli.no_keychain)
}

fn forget_secrets(config: &TunnelConfig) -> Result<()> {
    let keychain = KeychainCredentials::new();
    for key in stored_secret_keys(config) {
        keychain.delete(&key)?;
        println!("Forgot {}", key);
    }
    Ok(())
}

/// Every keychain entry a tunnel with this config may have stored
fn stored_secret_keys(config: &TunnelConfig) -> Vec<CredentialKey> {
    let mut keys = vec![CredentialKey::password(
        &config.ssh_login,
        &config.ssh_host,
        config.ssh_port,
    )];
    if let Some(identity) = &config.identity_file {
        keys.push(CredentialKey::passphrase(
            &config.ssh_login,
            &config.ssh_host,
            config.ssh_port,
            &identity.to_string_lossy(),
        ));
    }
    keys
}

async fn list_profiles(path: &Path) -> Result<()> {
    let tunnels = load_profiles(path).await?;
    if tunnels.is_empty() {
        println!("No saved tunnels in {}", path.display());
        return Ok(());
    }
    for tunnel in tunnels {
        let config = &tunnel.config;
        println!(
            "{:<20} {}:{} -> {}:{} (local {}, fallback {})",
            tunnel.name,
            config.ssh_url(),
            config.ssh_port,
            config.remote_host,
            config.remote_port,
            config.requested_local_port,
            config.local_port_fallback
        );
    }
    Ok(())
}

/// Start from the named profile, if any, and apply command-line overrides.
async fn resolve_config(cli: &Cli, profiles_path: &Path) -> Result<TunnelConfig> {
    let mut config = match &cli.profile {
        Some(name) => find_profile(profiles_path, name)
            .await?
            .map(|p| p.config)
            .with_context(|| format!("No saved tunnel named '{}'", name))?,
        None => TunnelConfig::default(),
    };

    if let Some(host) = &cli.ssh_host {
        config.ssh_host = host.clone();
    }
    if let Some(port) = cli.ssh_port {
        config.ssh_port = port;
    }
    if let Some(login) = &cli.login {
        config.ssh_login = login.clone();
    }
    if let Some(host) = &cli.remote_host {
        config.remote_host = host.clone();
    }
    if let Some(port) = cli.remote_port {
        config.remote_port = port;
    }
    if let Some(port) = cli.local_port {
        config.requested_local_port = port;
    }
    if let Some(port) = cli.fallback_port {
        config.local_port_fallback = port;
    }
    if let Some(identity) = &cli.identity {
        config.identity_file = Some(identity.clone());
    }
    if cli.trust_unknown_hosts {
        config.trust_unknown_hosts = true;
    }
    if config.remote_host.is_empty() {
        config.remote_host = DEFAULT_REMOTE_HOST.to_string();
    }

    if config.ssh_host.is_empty() {
        bail!("--ssh-host is required (or name a saved profile)");
    }
    if config.ssh_login.is_empty() {
        bail!("--login is required (or name a saved profile)");
    }
    if config.remote_port == 0 {
        bail!("--remote-port is required (or name a saved profile)");
    }
    Ok(config)
}

fn run_tunnel(config: TunnelConfig, use_keychain: bool) -> Result<()> {
    // Set up interrupt handling
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })?;

    let supervisor = TunnelSupervisor::new(config);
    if use_keychain {
        supervisor.set_credential_source(Arc::new(KeychainCredentials::new()));
    }

    let (prompt_tx, prompt_rx) = async_channel::unbounded::<PromptRequest>();
    supervisor.on_prompt(move |request| {
        let _ = prompt_tx.try_send(request.clone());
    });
    let changes = supervisor.subscribe();

    supervisor.connect();
    println!("Connecting to {}...", supervisor.config().ssh_url());

    loop {
        if interrupted.load(Ordering::Relaxed) {
            println!("\nClosing tunnel...");
            break;
        }
        while let Ok(request) = prompt_rx.try_recv() {
            answer_prompt(&supervisor, &request, use_keychain)?;
        }
        while let Ok(change) = changes.try_recv() {
            report(&supervisor, change)?;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    supervisor.disconnect();
    Ok(())
}

fn report(supervisor: &TunnelSupervisor, change: StateChange) -> Result<()> {
    match change.new {
        TunnelState::Connected => {
            if let Some(addr) = supervisor.local_addr() {
                println!("Tunnel ready: point your client at {} (Ctrl-C to close)", addr);
            }
        }
        TunnelState::ForwardingFailed => {
            tracing::debug!("ssh output:\n{}", supervisor.debug_log_text());
            bail!("Tunnel failed: {}", supervisor.last_error());
        }
        TunnelState::WaitingForAuth | TunnelState::Connecting | TunnelState::Idle => {}
    }
    Ok(())
}

fn answer_prompt(supervisor: &TunnelSupervisor, request: &PromptRequest, remember: bool) -> Result<()> {
    let result = match request.kind {
        PromptKind::HostKey => {
            eprintln!("{}", request.text);
            eprint!("Type 'yes' to trust this host: ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            supervisor.supply_interactive_answer(line.trim())
        }
        PromptKind::Password | PromptKind::Passphrase => {
            let secret = rpassword::prompt_password(format!("{} ", request.text.trim_end()))
                .context("Failed to read secret from terminal")?;
            if remember {
                supervisor.supply_password_and_remember(&secret)
            } else {
                supervisor.supply_password(&secret)
            }
        }
    };
    if let Err(e) = result {
        tracing::warn!("Answer not delivered: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sqltunnel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_overrides_build_config() {
        smol::block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let path = temp_dir.path().join("tunnels.json");
            let cli = parse(&[
                "--ssh-host", "test.example", "--login", "alice", "--remote-port", "3306",
                "--local-port", "13306", "--fallback-port", "13307",
            ]);

            let config = resolve_config(&cli, &path).await.unwrap();
            assert_eq!(config.ssh_url(), "alice@test.example");
            assert_eq!(config.remote_host, "127.0.0.1");
            assert_eq!(config.requested_local_port, 13306);
            assert_eq!(config.local_port_fallback, 13307);
        });
    }

    #[test]
    fn test_profile_with_overrides() {
        smol::block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let path = temp_dir.path().join("tunnels.json");
            let saved = TunnelConfig::new("db.example", "bob", "10.0.0.5", 5432);
            upsert_profile(&path, TunnelProfile::new("prod", saved)).await.unwrap();

            let cli = parse(&["prod", "--local-port", "15432"]);
            let config = resolve_config(&cli, &path).await.unwrap();
            assert_eq!(config.ssh_host, "db.example");
            assert_eq!(config.remote_port, 5432);
            assert_eq!(config.requested_local_port, 15432);

            let missing = parse(&["staging"]);
            assert!(resolve_config(&missing, &path).await.is_err());
        });
    }

    #[test]
    fn test_forget_covers_password_and_key() {
        let plain = TunnelConfig::new("test.example", "alice", "127.0.0.1", 3306);
        assert_eq!(
            stored_secret_keys(&plain),
            vec![CredentialKey::password("alice", "test.example", 22)]
        );

        let keyed = plain.with_identity_file("/home/alice/.ssh/id_ed25519");
        let keys = stored_secret_keys(&keyed);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].to_string(), "key:alice@test.example:22:id_ed25519");

        assert!(Cli::try_parse_from(["sqltunnel", "--forget-secrets", "--no-keychain"]).is_err());
    }

    #[test]
    fn test_missing_host_is_rejected() {
        smol::block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let path = temp_dir.path().join("tunnels.json");
            let cli = parse(&["--login", "alice", "--remote-port", "3306"]);
            let err = resolve_config(&cli, &path).await.unwrap_err();
            assert!(err.to_string().contains("--ssh-host"));
        });
    }
}
