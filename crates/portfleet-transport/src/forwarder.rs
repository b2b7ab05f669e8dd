use async_trait::async_trait;
use portfleet_proto::WorkspaceLocalId;
use portfleet_supervisor::{FatalSignal, ProviderError, TunnelProvider, TunnelSession};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const BIND_ATTEMPTS: u32 = 3;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Forwards a local TCP port to a workspace's SSH port
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    bind_ip: IpAddr,
    connect_timeout: Duration,
    bind_retry_delay: Duration,
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpForwarder {
    /// Create a forwarder bound to loopback
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(10),
            bind_retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Wait out the accept backoff; `false` if the session was cancelled meanwhile
    async fn accept_backoff(cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
        }
    }

    pub fn with_bind_retry_delay(mut self, delay: Duration) -> Self {
        self.bind_retry_delay = delay;
        self
    }

    /// Bind the local port, retrying while a previous session releases it
    async fn bind(&self, local_id: &WorkspaceLocalId, port: u16) -> Result<TcpListener, ProviderError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let mut attempt = 1;
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS =>
                {
                    warn!(
                        "[{}] Port {} is in use (attempt {}/{}), retrying in {:?}",
                        local_id, port, attempt, BIND_ATTEMPTS, self.bind_retry_delay
                    );
                    tokio::time::sleep(self.bind_retry_delay).await;
                    attempt += 1;
                }
                Err(source) => return Err(ProviderError::Bind { port, source }),
            }
        }
    }

    /// Relay one accepted connection until either side closes or the session ends
    async fn relay(
        mut client: TcpStream,
        peer: SocketAddr,
        upstream: String,
        connect_timeout: Duration,
        session: TunnelSession,
    ) {
        let local_id = session.local_id();

        let connected = tokio::time::timeout(connect_timeout, TcpStream::connect(&upstream)).await;
        let mut remote = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = ProviderError::Upstream {
                    address: upstream,
                    reason: e.to_string(),
                };
                error!("[{}] {}", local_id, err);
                session
                    .errors
                    .report(FatalSignal::attributed(local_id, err.to_string()));
                return;
            }
            Err(_) => {
                let err = ProviderError::Upstream {
                    address: upstream,
                    reason: format!("connect timed out after {:?}", connect_timeout),
                };
                error!("[{}] {}", local_id, err);
                session
                    .errors
                    .report(FatalSignal::attributed(local_id, err.to_string()));
                return;
            }
        };

        debug!("[{}] Connection from {} relayed to {}", local_id, peer, upstream);

        tokio::select! {
            _ = session.cancel.cancelled() => {
                debug!("[{}] Dropping connection from {}", local_id, peer);
            }
            result = tokio::io::copy_bidirectional(&mut client, &mut remote) => {
                match result {
                    Ok((to_remote, to_client)) => debug!(
                        "[{}] Connection from {} closed ({} bytes out, {} bytes in)",
                        local_id, peer, to_remote, to_client
                    ),
                    Err(e) => debug!("[{}] Connection from {} ended: {}", local_id, peer, e),
                }
            }
        }
    }
}

#[async_trait]
impl TunnelProvider for TcpForwarder {
    async fn open(&self, session: TunnelSession) -> Result<(), ProviderError> {
        let local_id = session.local_id();
        let listener = self.bind(&local_id, session.local_port).await?;
        let upstream = session.target.ssh_address(session.remote_port);

        info!(
            "[{}] Listening on {} for {}",
            local_id,
            listener.local_addr()?,
            upstream
        );

        let connections = TaskTracker::new();
        let cancel: CancellationToken = session.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        connections.spawn(Self::relay(
                            client,
                            peer,
                            upstream.clone(),
                            self.connect_timeout,
                            session.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("[{}] Failed to accept connection: {}", local_id, e);
                        if !Self::accept_backoff(&cancel).await {
                            break;
                        }
                    }
                },
            }
        }

        drop(listener);
        connections.close();
        connections.wait().await;
        debug!("[{}] Listener closed", local_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let forwarder = TcpForwarder::new().with_bind_retry_delay(Duration::from_millis(10));
        let err = forwarder
            .bind(&WorkspaceLocalId::from("web-1001"), port)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Bind { port: p, .. } if p == port));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_waits() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        assert!(TcpForwarder::accept_backoff(&cancel).await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = tokio::time::Instant::now();

        assert!(!TcpForwarder::accept_backoff(&cancel).await);
        assert!(started.elapsed() < ACCEPT_ERROR_BACKOFF);
    }
}
