//! ssh argument vector construction.

use super::types::TunnelConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A fully built ssh invocation, independent of how it gets spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, OsString)>,
}

impl SshCommand {
    /// Build the `ssh -N -L ...` command forwarding `local_port` for this config.
    pub fn forward(config: &TunnelConfig, local_port: u16) -> Self {
        let mut args: Vec<String> = Vec::new();
        let opt = |args: &mut Vec<String>, value: String| {
            args.push("-o".to_string());
            args.push(value);
        };

        // Keep connection alive but don't execute a remote command
        args.push("-N".to_string());

        // Prompts must be emitted instead of failing straight away
        opt(&mut args, "BatchMode=no".to_string());
        opt(
            &mut args,
            format!(
                "StrictHostKeyChecking={}",
                config.host_key_policy.as_ssh_value()
            ),
        );

        // Exit immediately if we can't set up the port forwarding
        opt(&mut args, "ExitOnForwardFailure=yes".to_string());
        opt(
            &mut args,
            format!("NumberOfPasswordPrompts={}", config.max_auth_attempts.max(1)),
        );
        opt(
            &mut args,
            format!("ConnectTimeout={}", config.connect_timeout_secs),
        );
        if config.keepalive_interval_secs > 0 {
            opt(
                &mut args,
                format!("ServerAliveInterval={}", config.keepalive_interval_secs),
            );
            opt(&mut args, "ServerAliveCountMax=3".to_string());
        }

        if config.verbose {
            args.push("-v".to_string());
        }
        if config.compression {
            args.push("-C".to_string());
        }
        if let Some(cipher) = &config.cipher {
            args.push("-c".to_string());
            args.push(cipher.clone());
        }
        if let Some(identity) = &config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args.push("-p".to_string());
        args.push(config.ssh_port.to_string());

        args.push("-L".to_string());
        args.push(format!(
            "{}:{}:{}",
            local_port, config.remote_host, config.remote_port
        ));

        args.extend(config.extra_args.iter().cloned());

        // Finally, add the destination
        args.push(config.ssh_url());

        Self {
            program: config.ssh_binary.clone(),
            args,
            env: Vec::new(),
        }
    }

    /// Route password and host key questions through an askpass program.
    pub fn with_askpass(mut self, script: &Path) -> Self {
        self.env
            .push(("SSH_ASKPASS".to_string(), script.as_os_str().to_owned()));
        self.env
            .push(("SSH_ASKPASS_REQUIRE".to_string(), OsString::from("force")));
        // Older clients only consult SSH_ASKPASS when DISPLAY is set
        if std::env::var_os("DISPLAY").is_none() {
            self.env.push(("DISPLAY".to_string(), OsString::from(":0")));
        }
        self
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}
