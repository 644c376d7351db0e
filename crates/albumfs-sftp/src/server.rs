//! SSH server accepting SFTP sessions.
//!
//! One [`ConnectionHandler`] exists per TCP connection. Password auth
//! builds a fresh backend and logs into it, the `sftp` subsystem request
//! hands the channel over to a [`SftpSession`], and dropping the handler
//! at disconnect triggers a best-effort logout.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use albumfs_core::VirtualFileSystem;
use albumfs_core::json_store::JsonFileSystem;
use albumfs_immich::{ImmichBackend, ImmichConfig};
use russh::keys::{PrivateKey, ssh_key};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::session::SftpSession;

/// Which catalog a connection serves.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Remote Immich instance.
    Immich(ImmichConfig),
    /// Local JSON store, for offline runs and tests.
    Json { store_path: PathBuf },
}

impl BackendConfig {
    async fn build(&self) -> anyhow::Result<Arc<dyn VirtualFileSystem>> {
        match self {
            Self::Immich(config) => Ok(Arc::new(ImmichBackend::connect(config)?)),
            Self::Json { store_path } => {
                Ok(Arc::new(JsonFileSystem::open(store_path.clone()).await?))
            }
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub backend: BackendConfig,
}

pub struct AlbumFsServer {
    config: ServerConfig,
    host_key: PrivateKey,
}

impl AlbumFsServer {
    pub fn new(config: ServerConfig, host_key: PrivateKey) -> Self {
        Self { config, host_key }
    }

    /// Binds the listener and serves connections until the task is
    /// cancelled or the socket fails.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let Self { config, host_key } = self;
        let ssh_config = server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };
        let addr = SocketAddr::new(config.bind_address, config.port);
        let socket = TcpListener::bind(addr).await?;
        info!(%addr, "sftp server listening");

        let mut factory = ConnectionFactory {
            backend: Arc::new(config.backend),
        };
        factory
            .run_on_socket(Arc::new(ssh_config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

struct ConnectionFactory {
    backend: Arc<BackendConfig>,
}

impl server::Server for ConnectionFactory {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(?peer_addr, "incoming connection");
        ConnectionHandler {
            backend_config: Arc::clone(&self.backend),
            backend: None,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(error = %error, "connection error");
    }
}

/// State of one SSH connection.
pub struct ConnectionHandler {
    backend_config: Arc<BackendConfig>,
    backend: Option<Arc<dyn VirtualFileSystem>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

/// Reject while advertising that only password auth can succeed.
fn password_only() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
        partial_success: false,
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user, "none auth rejected");
        Ok(password_only())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, "publickey auth rejected");
        Ok(password_only())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // Construction failure is a connection-level fault, not an
        // auth verdict.
        let backend = match self.backend_config.build().await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(user, error = %err, "backend unavailable");
                return Err(std::io::Error::other(err).into());
            }
        };
        match backend.login(user, password).await {
            Ok(()) => {
                info!(user, "login succeeded");
                self.backend = Some(backend);
                Ok(Auth::Accept)
            }
            Err(err) => {
                info!(user, error = %err, "login rejected");
                Ok(password_only())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = %channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            debug!(subsystem = name, "unsupported subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let (Some(backend), Some(channel)) =
            (self.backend.clone(), self.channels.remove(&channel_id))
        else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;
        debug!(channel = %channel_id, "sftp subsystem started");
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(backend)).await;
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        // Drop can run outside a runtime during teardown; skip then.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = backend.logout().await {
                debug!(error = %err, "logout on disconnect failed");
            }
        });
    }
}
