//! WebSocket listener.
//!
//! Accepts connections on a TCP port and gives each one its own shell:
//! one connection, one session. Sessions never share state beyond the
//! registry that counts them.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::provision::Provisioner;
use crate::session::broker::close_reason;
use crate::session::{SessionBroker, SessionInfo, SessionLauncher, SessionRegistry, SessionSlot};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Time a peer gets to complete the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while running the listener.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-session settings shared by every connection.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Directory every shell starts in.
    pub work_dir: PathBuf,
    /// Shell executable.
    pub shell: String,
    /// `TERM` value for the shells.
    pub term: String,
    /// Initial terminal columns.
    pub default_cols: u16,
    /// Initial terminal rows.
    pub default_rows: u16,
    /// Maximum concurrent sessions; 0 means unlimited.
    pub max_sessions: usize,
    /// Time between SIGHUP and SIGKILL on disconnect.
    pub kill_grace: Duration,
}

impl ServerSettings {
    /// Extracts the session settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.daemon.work_dir.clone(),
            shell: config.session.shell.clone(),
            term: config.session.term.clone(),
            default_cols: config.session.default_cols,
            default_rows: config.session.default_rows,
            max_sessions: config.session.max_sessions,
            kill_grace: Duration::from_millis(config.session.kill_grace_ms),
        }
    }
}

/// State shared by all connection tasks.
struct ServerState {
    provisioner: Arc<Provisioner>,
    launcher: SessionLauncher,
    broker: SessionBroker,
    registry: Arc<SessionRegistry>,
    settings: ServerSettings,
}

/// The shell bridge's WebSocket server.
pub struct ShellServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ShellServer {
    /// Binds the listener.
    ///
    /// Sessions are launched against `provisioner`'s environment, which is
    /// ensured again before every launch.
    pub async fn bind(
        addr: SocketAddr,
        settings: ServerSettings,
        provisioner: Arc<Provisioner>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let launcher = SessionLauncher::new(
            provisioner.environment().clone(),
            settings.shell.clone(),
            settings.term.clone(),
        );

        let state = ServerState {
            provisioner,
            launcher,
            broker: SessionBroker::new(settings.kill_grace),
            registry: Arc::new(SessionRegistry::new(settings.max_sessions)),
            settings,
        };

        Ok(Self {
            listener,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns a token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the live session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until the shutdown token is cancelled, then
    /// waits for every session to be torn down.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(
            addr = %self.listener.local_addr()?,
            shell = %self.state.launcher.shell(),
            venv = %self.state.launcher.environment().root.display(),
            "Listening for connections"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Accepted connection");
                        let state = Arc::clone(&self.state);
                        let token = self.shutdown.child_token();
                        self.tracker.spawn(handle_connection(state, stream, peer, token));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.tracker.close();
        tracing::info!(
            sessions = self.state.registry.count(),
            "Listener stopped, waiting for sessions to close"
        );
        self.tracker.wait().await;
        tracing::info!("All sessions closed");

        Ok(())
    }
}

/// Runs one connection from handshake to teardown.
async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let ws = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::debug!(peer = %peer, "Shutdown during WebSocket handshake");
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "WebSocket handshake timed out");
                return;
            }
        },
    };

    let Some(mut slot) = state.registry.try_reserve() else {
        tracing::warn!(
            peer = %peer,
            limit = state.registry.limit(),
            "Session limit reached, refusing connection"
        );
        reject(ws, CloseCode::Again, "session limit reached").await;
        return;
    };

    let session = match launch(&state, peer).await {
        Ok(session) => session,
        Err(reason) => {
            reject(ws, CloseCode::Error, &reason).await;
            return;
        }
    };

    register(&mut slot, &session, peer, &state.settings);

    let outcome = state.broker.run(session, ws, shutdown).await;
    tracing::info!(
        peer = %peer,
        session_id = ?slot.id(),
        status = %outcome.status(),
        "Session ended"
    );
}

/// Ensures the environment and spawns a shell, off the async workers.
///
/// Returns a close reason on failure.
async fn launch(
    state: &Arc<ServerState>,
    peer: SocketAddr,
) -> Result<crate::session::Session, String> {
    let provisioner = Arc::clone(&state.provisioner);
    match tokio::task::spawn_blocking(move || provisioner.ensure_environment()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::error!(peer = %peer, error = %e, "Environment unavailable");
            return Err(format!("environment unavailable: {}", e));
        }
        Err(e) => {
            tracing::error!(peer = %peer, error = %e, "Provisioning task failed");
            return Err("environment unavailable".to_string());
        }
    }

    let launcher = state.launcher.clone();
    let work_dir = state.settings.work_dir.clone();
    let (cols, rows) = (state.settings.default_cols, state.settings.default_rows);

    let launched = tokio::task::spawn_blocking(move || {
        launcher.launch(&work_dir, std::env::vars(), cols, rows)
    })
    .await;

    match launched {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to launch shell");
            Err(format!("failed to launch shell: {}", e))
        }
        Err(e) => {
            tracing::error!(peer = %peer, error = %e, "Launch task failed");
            Err("failed to launch shell".to_string())
        }
    }
}

fn register(
    slot: &mut SessionSlot,
    session: &crate::session::Session,
    peer: SocketAddr,
    settings: &ServerSettings,
) {
    let (cols, rows) = session
        .size()
        .unwrap_or((settings.default_cols, settings.default_rows));
    slot.register(SessionInfo {
        id: session.id().clone(),
        pid: session.pid(),
        peer: Some(peer),
        cols,
        rows,
        started_at: SystemTime::now(),
    });
}

/// Closes a freshly accepted connection that will not get a session.
async fn reject<S>(mut ws: WebSocketStream<S>, code: CloseCode, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: close_reason(reason).to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}
