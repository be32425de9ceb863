//! Local port selection for forwards.

use super::error::TunnelError;
use super::types::LOCAL_BIND_HOST;
use futures::FutureExt;
use smol::net::{TcpListener, TcpStream};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Check whether `port` can currently be bound on loopback.
/// Port 0 asks the OS for an ephemeral port and returns it.
pub async fn probe_port(port: u16) -> Option<u16> {
    let listener = TcpListener::bind((LOCAL_BIND_HOST, port)).await.ok()?;
    let bound = listener.local_addr().ok()?.port();
    drop(listener);
    Some(bound)
}

/// Try `preferred`, then `fallback`; fail if neither can be bound.
pub async fn pick_local_port(preferred: u16, fallback: u16) -> Result<u16, TunnelError> {
    if let Some(port) = probe_port(preferred).await {
        return Ok(port);
    }
    tracing::warn!(
        "Local port {} is unavailable, trying fallback port {}",
        preferred,
        fallback
    );
    if fallback != preferred {
        if let Some(port) = probe_port(fallback).await {
            return Ok(port);
        }
    }
    Err(TunnelError::PortUnavailable {
        preferred,
        fallback,
    })
}

/// Whether something accepts connections on the loopback `port`.
pub async fn is_listening(port: u16) -> bool {
    let connect = TcpStream::connect((LOCAL_BIND_HOST, port)).fuse();
    let timeout = smol::Timer::after(PROBE_TIMEOUT).fuse();
    futures::pin_mut!(connect, timeout);
    futures::select_biased! {
        result = connect => result.is_ok(),
        _ = timeout => false,
    }
}
