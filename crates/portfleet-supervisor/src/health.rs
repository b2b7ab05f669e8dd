//! Out-of-band workspace liveness probes
//!
//! A probe dials the workspace's SSH service, authenticates with the
//! resolved private key and disconnects right away. It never touches the
//! tunnel's own stream.
//!
//! Host keys are accepted without verification (trust on first use). The
//! probe only answers "can we get in", it is not a trust decision, but users
//! should know that a probe will happily talk to an impostor.

use async_trait::async_trait;
use portfleet_proto::{CredentialResolver, WorkspaceTarget, DEFAULT_REMOTE_PORT};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ProbeError;

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl ProbeResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<Result<(), ProbeError>> for ProbeResult {
    fn from(result: Result<(), ProbeError>) -> Self {
        match result {
            Ok(()) => ProbeResult::healthy(),
            Err(e) => ProbeResult::unhealthy(e.to_string()),
        }
    }
}

/// Liveness probe for a workspace
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn probe(&self, target: &WorkspaceTarget) -> ProbeResult;
}

/// SSH dial + public key authentication probe
pub struct SshHealthChecker {
    credentials: Arc<dyn CredentialResolver>,
    user: String,
    timeout: Duration,
    remote_port: u16,
}

impl SshHealthChecker {
    pub fn new(credentials: Arc<dyn CredentialResolver>, user: impl Into<String>) -> Self {
        Self {
            credentials,
            user: user.into(),
            timeout: Duration::from_secs(5),
            remote_port: DEFAULT_REMOTE_PORT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    async fn try_probe(&self, target: &WorkspaceTarget) -> Result<(), ProbeError> {
        let address = target.ssh_address(self.remote_port);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.timeout),
            ..Default::default()
        });
        let handler = TrustOnFirstUse {
            address: address.clone(),
        };

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect(config, address.as_str(), handler),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout))??;

        let key_path = self.credentials.private_key_path()?;
        let key = russh::keys::load_secret_key(&key_path, None)
            .map_err(|e| ProbeError::Key(e.to_string()))?;

        let auth = tokio::time::timeout(
            self.timeout,
            handle.authenticate_publickey(
                &self.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            ),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout))?
        .map_err(|e| ProbeError::Auth(e.to_string()))?;

        if !auth.success() {
            return Err(ProbeError::Auth(format!(
                "public key for user '{}' rejected by server",
                self.user
            )));
        }

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "health check", "en")
            .await
        {
            debug!("Probe disconnect from {} failed: {}", address, e);
        }

        Ok(())
    }
}

#[async_trait]
impl HealthChecker for SshHealthChecker {
    async fn probe(&self, target: &WorkspaceTarget) -> ProbeResult {
        let result = self.try_probe(target).await;
        debug!(
            "[{}] Probe result: {}",
            target.local_id(),
            match &result {
                Ok(()) => "healthy".to_string(),
                Err(e) => e.to_string(),
            }
        );
        result.into()
    }
}

/// Accepts any host key presented by the server
struct TrustOnFirstUse {
    address: String,
}

impl client::Handler for TrustOnFirstUse {
    type Error = ProbeError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {} without verification",
            server_public_key.fingerprint(russh::keys::HashAlg::Sha256),
            self.address
        );
        Ok(true)
    }
}
