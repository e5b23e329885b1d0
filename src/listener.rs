//! Client-facing accept loop (spec.md §4.D), grounded on
//! `valence_network::connect::do_accept_loop`'s bind-loop-spawn shape.
//!
//! The listener's only job is accepting sockets, running the seed/login
//! handshake far enough to read the first application packet, and deciding
//! which [`Connection`] should own the result: a brand-new session for an
//! `AccountLogin`, or an existing one (by zombie `auth_id` match) for a
//! `GameLogin` that's reclaiming a Razor-workaround redirect.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net::endpoint::{Handshake, LinkedServer};
use crate::protocol::command::cmd;
use crate::protocol::packet::GameLogin;
use crate::session::{Connection, SessionEvent, SharedIdentity};

/// One live session as seen from the listener: enough to route an attach
/// and nothing more (the actual state lives inside the [`Connection`]).
struct SessionHandle {
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    identity: SharedIdentity,
}

#[derive(Default)]
struct Directory {
    sessions: Vec<SessionHandle>,
}

impl Directory {
    fn prune_dead(&mut self) {
        self.sessions.retain(|s| !s.events_tx.is_closed());
    }

    fn find_zombie(&self, auth_id: u32) -> Option<mpsc::UnboundedSender<SessionEvent>> {
        self.sessions.iter().find_map(|s| {
            let identity = s.identity.lock().unwrap();
            if identity.zombie_auth_ids.contains(&auth_id) {
                Some(s.events_tx.clone())
            } else {
                None
            }
        })
    }
}

type SharedDirectory = Arc<Mutex<Directory>>;

/// Binds `config.bind` and accepts connections until the process receives
/// a shutdown signal (spec.md §5 "Lifecycle").
pub async fn run(config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(bind = %config.bind, "listening");

    let directory: SharedDirectory = Arc::new(Mutex::new(Directory::default()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let config = config.clone();
                let directory = directory.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, config, directory).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn handle_connection(stream: TcpStream, config: Arc<Config>, directory: SharedDirectory) -> Result<()> {
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    let handshake = LinkedServer::accept(stream).await?;

    if let Some(events_tx) = find_attach_target(&handshake, &directory) {
        attach(events_tx, handshake).await;
        return Ok(());
    }

    let (events_tx, identity) = Connection::spawn(handshake, config);
    let mut dir = directory.lock().unwrap();
    dir.prune_dead();
    dir.sessions.push(SessionHandle { events_tx, identity });
    Ok(())
}

/// A `GameLogin` whose `auth_id` matches a lingering zombie slot reattaches
/// to that session instead of starting a new one (spec.md §4.G "Razor
/// workaround" reconnect).
fn find_attach_target(
    handshake: &Handshake,
    directory: &SharedDirectory,
) -> Option<mpsc::UnboundedSender<SessionEvent>> {
    if handshake.first_packet.first() != Some(&cmd::GAME_LOGIN) {
        return None;
    }
    let login = GameLogin::decode(&handshake.first_packet).ok()?;
    let mut dir = directory.lock().unwrap();
    dir.prune_dead();
    dir.find_zombie(login.auth_id)
}

async fn attach(events_tx: mpsc::UnboundedSender<SessionEvent>, handshake: Handshake) {
    let Handshake { endpoint, reader, first_packet } = handshake;
    let _ = events_tx.send(SessionEvent::Attach { endpoint, reader, first_packet });
}
