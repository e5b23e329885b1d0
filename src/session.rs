//! Per-player session actor (spec.md §4.G): owns the upstream connection,
//! the world mirror, the walk reconciler, and every attached client
//! endpoint, and drives all of it from one event loop so every piece of
//! mutable state here is touched by exactly one task — the async analogue
//! of the original's single-threaded cooperative scheduler (spec.md §5).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::console::{self, Command as ConsoleCommand};
use crate::net::endpoint::{EndpointId, Handshake, LinkedServer};
use crate::net::framed::FramedReader;
use crate::net::upstream::UpstreamClient;
use crate::net::{PING_INTERVAL, RECONNECT_DELAY, ZOMBIE_TIMEOUT};
use crate::protocol::command::cmd;
use crate::protocol::packet::{
    AccountLogin, AccountLoginReject, ContainerContent, ContainerOpen, ContainerUpdate,
    Credentials, Delete, Equip, GameLogin, MobileIncoming, MobileStatus, MobileUpdate,
    PlayCharacter, PlayServer, Reader, Relay, ServerInfo, ServerList, Start, Walk, WalkAck,
    WalkCancel, Writer, WorldItem, WorldItem7, ZoneChange,
};
use crate::protocol::translate::{
    container_open_from_v7, container_open_to_v7, drop_from_v6, drop_to_v6,
    supported_features_from_6014, supported_features_to_6014, world_item_from_v7,
    world_item_to_v7, Drop, Drop6, SupportedFeatures, SupportedFeatures6014,
};
use crate::protocol::version::ClientBuild;
use crate::protocol::ProtocolVersion;
use crate::socks4;
use crate::udp_knock;
use crate::walk::{AckOutcome, WalkOutcome, WalkState};
use crate::world::World;

/// Everything that can happen to a [`Connection`]: fed by per-endpoint and
/// per-upstream reader tasks, and by the listener handing over a freshly
/// accepted endpoint that has been routed here (new or attach).
pub enum SessionEvent {
    FromClient { endpoint: EndpointId, packet: BytesMut },
    ClientClosed { endpoint: EndpointId },
    FromUpstream { packet: BytesMut },
    UpstreamClosed,
    Attach { endpoint: LinkedServer, reader: FramedReader, first_packet: BytesMut },
}

/// Per-endpoint progress (spec.md §4.G). Collapsed to one field on
/// [`Connection`] rather than per-`LinkedServer`: before `IN_GAME` there is
/// only ever one live endpoint driving the login sequence, so a session-wide
/// field tracks it faithfully; the one case where a second endpoint's state
/// genuinely matters (a `RELAY_SERVER` zombie awaiting reattachment) is
/// modeled separately via [`ZombieSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Init,
    AccountLogin,
    ServerList,
    PlayServer,
    RelayServer,
    GameLogin,
    CharList,
    PlayChar,
    InGame,
}

/// What a packet handler decided should happen to the packet and, by
/// implication, to the endpoint it arrived on (spec.md §4.G "Handler
/// dispatch").
#[derive(Debug)]
enum Verdict {
    /// Forward the (possibly translated) packet to the peer unchanged.
    Accept,
    /// Consume the packet silently.
    Drop,
    /// Tear down the originating endpoint.
    Disconnect,
}

/// A `RELAY_SERVER` endpoint whose socket has already closed but which is
/// kept alive bookkeeping-only for up to 5 seconds awaiting a reconnecting
/// client's `GameLogin.auth_id` (spec.md §4.G "Razor workaround", GLOSSARY
/// "Zombie").
struct ZombieSlot {
    auth_id: u32,
    deadline: Instant,
}

/// The subset of session state the listener needs to decide whether a
/// freshly accepted endpoint should attach here instead of starting a new
/// session (spec.md §4.H).
#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    pub credentials: Option<Credentials>,
    pub server_index: Option<u16>,
    pub in_game: bool,
    pub zombie_auth_ids: Vec<u32>,
}

pub type SharedIdentity = Arc<Mutex<SessionIdentity>>;

static NEXT_SESSION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Reject reason sent when an item lift can't be honored while a session is
/// mid-reconnect (spec.md §4.G).
const LIFT_REJECT_CANNOT_LIFT: u8 = 0;

pub struct Connection {
    id: u64,
    config: Arc<Config>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    identity: SharedIdentity,

    state: EndpointState,
    endpoints: Vec<LinkedServer>,
    zombies: Vec<ZombieSlot>,

    upstream: Option<UpstreamClient>,
    /// The real login server's address, kept so a bare socket close (not
    /// autoreconnect-eligible, e.g. before `IN_GAME`) can be retried.
    login_addr: Option<SocketAddr>,
    world: World,
    walk: WalkState,

    credentials: Option<Credentials>,
    server_index: Option<u16>,
    character_index: Option<u32>,
    seed: u32,
    build: ClientBuild,
    held_item: Option<u32>,
    cached_char_list: Option<BytesMut>,

    reconnecting: bool,
    reconnect_deadline: Option<Instant>,
    verbosity: u8,
}

impl Connection {
    /// Spawns a brand-new session for a just-handshaken endpoint, returning
    /// the channel the listener uses to feed it further events and the
    /// shared identity snapshot used for attach matching.
    pub fn spawn(handshake: Handshake, config: Arc<Config>) -> (mpsc::UnboundedSender<SessionEvent>, SharedIdentity) {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity: SharedIdentity = Arc::new(Mutex::new(SessionIdentity::default()));
        let id = NEXT_SESSION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        LinkedServer::spawn_reader(
            handshake.reader,
            handshake.endpoint.id,
            handshake.endpoint.protocol,
            tx.clone(),
        );

        let seed = handshake.endpoint.seed;
        let build = handshake.endpoint.build;
        let mut conn = Connection {
            id,
            config,
            events_tx: tx.clone(),
            events_rx: rx,
            identity: identity.clone(),
            state: EndpointState::Init,
            endpoints: vec![handshake.endpoint],
            zombies: Vec::new(),
            upstream: None,
            login_addr: None,
            world: World::new(),
            walk: WalkState::new(),
            credentials: None,
            server_index: None,
            character_index: None,
            seed,
            build,
            held_item: None,
            cached_char_list: None,
            reconnecting: false,
            reconnect_deadline: None,
            verbosity: 1,
        };

        tokio::spawn(async move {
            let first_packet = handshake.first_packet;
            let first_endpoint = conn.endpoints[0].id;
            if let Err(e) = conn.handle_client_packet(first_endpoint, first_packet).await {
                warn!(session = id, error = %e, "session init failed");
                return;
            }
            if let Err(e) = conn.run().await {
                warn!(session = id, error = %e, "session ended with error");
            }
            debug!(session = id, "session closed");
        });

        (tx, identity)
    }

    fn sync_identity(&self) {
        let mut identity = self.identity.lock().unwrap();
        identity.credentials = self.credentials.clone();
        identity.server_index = self.server_index;
        identity.in_game = self.state == EndpointState::InGame;
        identity.zombie_auth_ids = self.zombies.iter().map(|z| z.auth_id).collect();
    }

    async fn run(&mut self) -> Result<()> {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.endpoints.is_empty()
                && self.zombies.is_empty()
                && self.reconnect_deadline.is_none()
                && !(self.config.background && self.state == EndpointState::InGame)
            {
                return Ok(());
            }

            let zombie_deadline = self.zombies.iter().map(|z| z.deadline).min();
            let reconnect_deadline = self.reconnect_deadline;

            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => return Ok(()),
                    }
                }
                _ = ping_timer.tick(), if self.upstream.is_some() => {
                    if let Some(up) = &mut self.upstream {
                        if let Err(e) = up.send_ping().await {
                            warn!(session = self.id, error = %e, "ping failed");
                        }
                    }
                }
                _ = sleep_until_or_pending(zombie_deadline) => {
                    self.reap_zombies().await;
                }
                _ = sleep_until_or_pending(reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    self.attempt_reconnect().await?;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::FromClient { endpoint, packet } => {
                self.handle_client_packet(endpoint, packet).await
            }
            SessionEvent::ClientClosed { endpoint } => self.handle_client_closed(endpoint).await,
            SessionEvent::FromUpstream { packet } => self.handle_upstream_packet(packet).await,
            SessionEvent::UpstreamClosed => self.handle_upstream_closed().await,
            SessionEvent::Attach { endpoint, reader, first_packet } => {
                self.handle_attach(endpoint, reader, first_packet).await
            }
        }
    }

    // ---- endpoint lifecycle ------------------------------------------------

    fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut LinkedServer> {
        self.endpoints.iter_mut().find(|e| e.id == id)
    }

    async fn disconnect_endpoint(&mut self, id: EndpointId) {
        if let Some(pos) = self.endpoints.iter().position(|e| e.id == id) {
            self.endpoints.remove(pos);
        }
    }

    async fn handle_client_closed(&mut self, id: EndpointId) -> Result<()> {
        if let Some(pos) = self.endpoints.iter().position(|e| e.id == id) {
            let endpoint = &self.endpoints[pos];
            if self.state == EndpointState::RelayServer {
                // Linger as a zombie awaiting the Razor client's reconnect
                // (spec.md §4.G "Razor workaround").
                if let Some(auth_id) = endpoint.auth_id {
                    self.zombies.push(ZombieSlot {
                        auth_id,
                        deadline: Instant::now() + ZOMBIE_TIMEOUT,
                    });
                }
            }
            self.endpoints.remove(pos);
        }
        self.sync_identity();
        Ok(())
    }

    async fn handle_attach(
        &mut self,
        mut endpoint: LinkedServer,
        reader: FramedReader,
        first_packet: BytesMut,
    ) -> Result<()> {
        // The zombie slot it's reclaiming, if any, is consumed unconditionally
        // — a fresh GameLogin always supersedes a lingering one.
        self.zombies.clear();

        LinkedServer::spawn_reader(reader, endpoint.id, endpoint.protocol, self.events_tx.clone());

        if self.state == EndpointState::InGame {
            let replay = self.world.replay_for(endpoint.protocol);
            for packet in replay {
                let _ = endpoint.send(&packet).await;
            }
        } else if let Some(char_list) = &self.cached_char_list {
            let _ = endpoint.send(char_list).await;
        }

        self.endpoints.push(endpoint);
        self.sync_identity();

        // The reattaching socket's own first record (typically `GameLogin`)
        // has already served its purpose in matching; nothing further to do
        // with it besides letting the steady-state reader take over.
        let _ = first_packet;
        Ok(())
    }

    // ---- client -> server ---------------------------------------------------

    async fn handle_client_packet(&mut self, endpoint_id: EndpointId, packet: BytesMut) -> Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        let op = packet[0];

        if self.upstream.is_none() && self.state == EndpointState::Init {
            return self.handle_login_record(endpoint_id, &packet).await;
        }

        let verdict = match op {
            cmd::PLAY_SERVER if self.state == EndpointState::ServerList => {
                self.handle_play_server(endpoint_id, &packet).await?
            }
            cmd::PLAY_CHARACTER if self.state == EndpointState::CharList => {
                self.handle_play_character(&packet).await?
            }
            cmd::WALK => self.handle_client_walk(endpoint_id, &packet).await?,
            cmd::RESYNCHRONIZE if self.state == EndpointState::InGame => {
                self.walk.on_client_resynchronize();
                Verdict::Accept
            }
            cmd::TALK_ASCII => self.handle_client_speech(endpoint_id, &packet).await?,
            cmd::LIFT_REQUEST => self.handle_lift_request(endpoint_id, &packet).await?,
            cmd::DROP => self.handle_client_drop(endpoint_id, &packet).await?,
            cmd::CREATE_CHARACTER => self.handle_create_character(&packet).await?,
            cmd::SPY | cmd::HARDWARE if self.config.antispy => Verdict::Drop,
            cmd::PING => {
                if let Some(up) = &mut self.upstream {
                    up.send(&packet).await?;
                }
                Verdict::Drop
            }
            _ => self.forward_upstream_raw(&packet).await?,
        };

        if matches!(verdict, Verdict::Disconnect) {
            self.disconnect_endpoint(endpoint_id).await;
        }
        Ok(())
    }

    async fn forward_upstream_raw(&mut self, packet: &[u8]) -> Result<Verdict> {
        if self.reconnecting {
            return Ok(Verdict::Drop);
        }
        if let Some(up) = &mut self.upstream {
            up.send(packet).await?;
        }
        Ok(Verdict::Accept)
    }

    async fn handle_login_record(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<()> {
        let op = packet[0];
        match op {
            cmd::ACCOUNT_LOGIN => {
                let login = AccountLogin::decode(packet)?;
                self.credentials = Some(login.credentials.clone());
                self.sync_identity();
                self.begin_account_login(endpoint_id, packet).await
            }
            cmd::GAME_LOGIN => {
                let login = GameLogin::decode(packet)?;
                self.credentials = Some(login.credentials.clone());
                self.sync_identity();
                self.connect_game_server_direct(login.auth_id).await
            }
            _ => {
                debug!(op, "unexpected first client packet, disconnecting");
                self.disconnect_endpoint(endpoint_id).await;
                Ok(())
            }
        }
    }

    async fn begin_account_login(&mut self, endpoint_id: EndpointId, raw: &BytesMut) -> Result<()> {
        self.state = EndpointState::AccountLogin;

        if !self.config.server_list.is_empty() && self.config.server.is_none() {
            // Emulate the login server entirely from local configuration
            // (spec.md §6 `server_list` config key): no upstream connection
            // is made until the client picks a server.
            let server_list = ServerList {
                servers: self
                    .config
                    .server_list
                    .iter()
                    .enumerate()
                    .map(|(i, s)| ServerInfo {
                        index: i as u16,
                        name: s.name.clone(),
                        full: 0,
                        timezone: 0,
                        address: ipv4_to_u32(s.addr),
                    })
                    .collect(),
            };
            if let Some(ep) = self.endpoint_mut(endpoint_id) {
                ep.send(&server_list.encode()).await?;
            }
            self.state = EndpointState::ServerList;
            return Ok(());
        }

        let Some(login_addr) = self.config.server else {
            bail!("no upstream login server or server_list configured");
        };
        self.login_addr = Some(login_addr);

        if self.config.socks4.is_none() {
            udp_knock::send(login_addr, raw).await;
        }

        match self.connect_upstream(login_addr, ProtocolVersion::V5).await {
            Ok(()) => {
                if let Some(up) = &mut self.upstream {
                    up.send(raw).await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "login upstream connect failed");
                if let Some(ep) = self.endpoint_mut(endpoint_id) {
                    let reject = AccountLoginReject { reason: AccountLoginReject::BLOCKED };
                    let _ = ep.send(&reject.encode()).await;
                }
                Ok(())
            }
        }
    }

    async fn connect_upstream(&mut self, addr: SocketAddr, protocol: ProtocolVersion) -> Result<()> {
        let up = if let Some(proxy) = self.config.socks4 {
            let SocketAddr::V4(target) = addr else {
                bail!("socks4 only supports IPv4 upstream targets");
            };
            let stream = socks4::connect(proxy, target).await?;
            self.connect_upstream_stream(stream, protocol).await?
        } else {
            UpstreamClient::connect(addr, protocol, self.seed, self.build, self.events_tx.clone())
                .await
                .context("connecting to upstream")?
        };
        self.upstream = Some(up);
        Ok(())
    }

    /// Completes an upstream handshake over an already-connected stream
    /// (the SOCKS4 path). Mirrors [`UpstreamClient::connect`]'s seed
    /// prelude but skips the direct-dial step.
    async fn connect_upstream_stream(&mut self, stream: TcpStream, protocol: ProtocolVersion) -> Result<UpstreamClient> {
        UpstreamClient::connect_with_stream(stream, protocol, self.seed, self.build, self.events_tx.clone()).await
    }

    async fn handle_play_server(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<Verdict> {
        let play = PlayServer::decode(packet)?;
        self.server_index = Some(play.index);
        self.sync_identity();
        self.state = EndpointState::PlayServer;

        if self.login_addr.is_some() {
            // Real login server mode: forward PlayServer upstream and wait
            // for its `Relay`, which is intercepted in
            // `handle_upstream_packet` rather than shown to the client.
            if let Some(up) = &mut self.upstream {
                up.send(packet).await?;
            }
        } else if !self.config.server_list.is_empty() {
            let idx = play.index as usize;
            if idx >= self.config.server_list.len() {
                return Ok(Verdict::Disconnect);
            }
            let addr = self.config.server_list[idx].addr;
            self.connect_upstream(addr, ProtocolVersion::V5).await?;
            let login = GameLogin {
                auth_id: self.seed,
                credentials: self.credentials.clone().unwrap_or(Credentials {
                    username: String::new(),
                    password: String::new(),
                }),
            };
            if let Some(up) = &mut self.upstream {
                up.send(&login.encode()).await?;
            }
            self.state = EndpointState::GameLogin;
        }

        if self.config.razor_workaround {
            self.apply_razor_redirect(endpoint_id).await?;
        }

        Ok(Verdict::Drop)
    }

    /// Spec.md §4.G "Razor workaround": tell the client to reconnect to
    /// ourselves, marking the endpoint a zombie the moment it closes.
    async fn apply_razor_redirect(&mut self, endpoint_id: EndpointId) -> Result<()> {
        let auth_id = self.seed ^ 0x5A5A_5A5A ^ (endpoint_id as u32);
        let local_ip = match self.config.bind {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        let relay = Relay {
            ip: u32::from_be_bytes(local_ip.octets()),
            port: self.config.bind.port(),
            auth_id,
        };
        if let Some(ep) = self.endpoint_mut(endpoint_id) {
            ep.send(&relay.encode()).await?;
            ep.auth_id = Some(auth_id);
        }
        self.state = EndpointState::RelayServer;
        Ok(())
    }

    /// Direct `GameLogin` from a client that connected straight to a game
    /// server without ever doing `AccountLogin` through us (spec.md §4.G,
    /// the non-razor "direct game connect" branch, and the razor zombie
    /// reattach path when `find_zombie` would have applied).
    async fn connect_game_server_direct(&mut self, auth_id: u32) -> Result<()> {
        let Some(addr) = self.config.server else {
            bail!("GameLogin with no configured upstream game server");
        };
        self.connect_upstream(addr, ProtocolVersion::V5).await?;
        let login = GameLogin {
            auth_id,
            credentials: self.credentials.clone().unwrap_or(Credentials {
                username: String::new(),
                password: String::new(),
            }),
        };
        if let Some(up) = &mut self.upstream {
            up.send(&login.encode()).await?;
        }
        self.state = EndpointState::GameLogin;
        Ok(())
    }

    async fn handle_play_character(&mut self, packet: &BytesMut) -> Result<Verdict> {
        let play = PlayCharacter::decode(packet)?;
        self.character_index = Some(play.slot);
        self.state = EndpointState::PlayChar;
        if let Some(up) = &mut self.upstream {
            up.send(packet).await?;
        }
        Ok(Verdict::Drop)
    }

    async fn handle_client_walk(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<Verdict> {
        let walk = Walk::decode(packet)?;
        let anchor = self.world.player_anchor;
        let outcome = self.walk.on_client_walk(
            endpoint_id,
            self.state == EndpointState::InGame,
            self.reconnecting,
            (anchor.x, anchor.y, anchor.z, anchor.direction),
            walk,
        );
        match outcome {
            WalkOutcome::ForwardUpstream(p) => {
                if let Some(up) = &mut self.upstream {
                    up.send(&p.encode()).await?;
                }
            }
            WalkOutcome::ReplyTo(ep, cancel) => {
                if let Some(e) = self.endpoint_mut(ep) {
                    e.send(&cancel.encode()).await?;
                }
            }
            WalkOutcome::EvictThenForward(ep, cancel, walk) => {
                if let Some(e) = self.endpoint_mut(ep) {
                    e.send(&cancel.encode()).await?;
                }
                if let Some(up) = &mut self.upstream {
                    up.send(&walk.encode()).await?;
                }
            }
            WalkOutcome::Disconnect(ep) => {
                self.disconnect_endpoint(ep).await;
            }
            WalkOutcome::Drop => {}
        }
        Ok(Verdict::Drop)
    }

    async fn handle_lift_request(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<Verdict> {
        let mut r = Reader::new(&packet[1..]);
        let serial = r.u32()?;

        if self.reconnecting {
            let mut w = Writer::new();
            w.u8(cmd::LIFT_REJECT).u8(LIFT_REJECT_CANNOT_LIFT);
            if let Some(ep) = self.endpoint_mut(endpoint_id) {
                ep.send(&w.finish()).await?;
            }
            return Ok(Verdict::Drop);
        }

        self.held_item = Some(serial);
        if let Some(up) = &mut self.upstream {
            up.send(packet).await?;
        }
        Ok(Verdict::Drop)
    }

    async fn handle_client_drop(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<Verdict> {
        if self.reconnecting {
            return Ok(Verdict::Drop);
        }
        self.held_item = None;
        let from = self.endpoint_mut(endpoint_id).map(|e| e.protocol).unwrap_or(ProtocolVersion::V5);
        let to = self.upstream.as_ref().map(|u| u.protocol).unwrap_or(from);
        let bytes = translate_for(cmd::DROP, packet, from, to)?;
        if let Some(up) = &mut self.upstream {
            up.send(&bytes).await?;
        }
        Ok(Verdict::Drop)
    }

    async fn handle_create_character(&mut self, packet: &BytesMut) -> Result<Verdict> {
        if !self.config.antispy {
            if let Some(up) = &mut self.upstream {
                up.send(packet).await?;
            }
            return Ok(Verdict::Drop);
        }

        const CLIENT_IP_OFFSET: usize = 96;
        const SPOOFED_IP: u32 = 0xC0A8_0102; // 192.168.1.2
        let mut rewritten = packet.clone();
        if rewritten.len() >= CLIENT_IP_OFFSET + 4 {
            rewritten[CLIENT_IP_OFFSET..CLIENT_IP_OFFSET + 4]
                .copy_from_slice(&SPOOFED_IP.to_be_bytes());
        }
        if let Some(up) = &mut self.upstream {
            up.send(&rewritten).await?;
        }
        Ok(Verdict::Drop)
    }

    async fn handle_client_speech(&mut self, endpoint_id: EndpointId, packet: &BytesMut) -> Result<Verdict> {
        let text = parse_talk_ascii(packet)?;
        if let Some(command) = console::parse(&text) {
            self.handle_console_command(endpoint_id, command).await?;
            return Ok(Verdict::Drop);
        }
        if let Some(up) = &mut self.upstream {
            up.send(packet).await?;
        }
        Ok(Verdict::Drop)
    }

    async fn handle_console_command(&mut self, endpoint_id: EndpointId, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Help => {
                if let Some(ep) = self.endpoint_mut(endpoint_id) {
                    ep.speak_console("commands: reconnect, char, char N, drop, verbose N").await?;
                }
            }
            ConsoleCommand::Reconnect => {
                self.begin_reconnect().await?;
            }
            ConsoleCommand::CharList => {
                if let Some(ep) = self.endpoint_mut(endpoint_id) {
                    ep.speak_console("use %char N to switch characters").await?;
                }
            }
            ConsoleCommand::CharSwitch(slot) => {
                self.character_index = Some(slot);
                self.begin_reconnect().await?;
            }
            ConsoleCommand::Drop => {
                self.synthesize_drop().await?;
            }
            ConsoleCommand::Verbose(level) => {
                self.verbosity = level;
                if let Some(ep) = self.endpoint_mut(endpoint_id) {
                    ep.speak_console(&format!("verbosity set to {level}")).await?;
                }
            }
            ConsoleCommand::Unknown(text) => {
                if let Some(ep) = self.endpoint_mut(endpoint_id) {
                    ep.speak_console(&format!("unknown command: {text}")).await?;
                }
            }
        }
        Ok(())
    }

    async fn synthesize_drop(&mut self) -> Result<()> {
        let Some(serial) = self.held_item.take() else {
            return Ok(());
        };
        let anchor = self.world.player_anchor;
        let drop = Drop {
            serial,
            x: anchor.x,
            y: anchor.y,
            z: anchor.z as i8,
            container_serial: 0,
        };
        let upstream_protocol = self.upstream.as_ref().map(|u| u.protocol).unwrap_or(ProtocolVersion::V5);
        let bytes = if upstream_protocol.is_v6() {
            drop_to_v6(&drop).encode()
        } else {
            drop.encode()
        };
        if let Some(up) = &mut self.upstream {
            up.send(&bytes).await?;
        }
        Ok(())
    }

    // ---- server -> client ---------------------------------------------------

    async fn handle_upstream_packet(&mut self, packet: BytesMut) -> Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        let op = packet[0];
        let protocol = self.upstream.as_ref().map(|u| u.protocol).unwrap_or(ProtocolVersion::V5);

        match op {
            cmd::SERVER_LIST if self.state == EndpointState::AccountLogin => {
                self.state = EndpointState::ServerList;
                self.broadcast_raw(&packet).await;
            }
            cmd::RELAY if self.state == EndpointState::PlayServer => {
                self.handle_upstream_relay(&packet).await?;
            }
            cmd::ACCOUNT_LOGIN_REJECT => {
                self.broadcast_raw(&packet).await;
            }
            cmd::CHAR_LIST => {
                self.state = EndpointState::CharList;
                self.cached_char_list = Some(packet.clone());
                self.broadcast_raw(&packet).await;
            }
            cmd::START => {
                let start = Start::decode(&packet)?;
                self.world.on_start(&start, &packet);
                self.state = EndpointState::InGame;
                self.reconnecting = false;
                self.sync_identity();
                self.broadcast_raw(&packet).await;
                if self.config.light {
                    // handled by dropping the two light opcodes below once
                    // they arrive; nothing to do on Start itself.
                }
            }
            cmd::WORLD_ITEM => {
                let item = WorldItem::decode(&packet)?;
                self.world.on_world_item(world_item_to_v7(&item));
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::WORLD_ITEM_7 => {
                let item = WorldItem7::decode(&packet)?;
                self.world.on_world_item(item);
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::EQUIP => {
                let equip = Equip::decode(&packet)?;
                self.world.on_equip(equip);
                self.broadcast_raw(&packet).await;
            }
            cmd::CONTAINER_OPEN => {
                let open = ContainerOpen::decode(&packet)?;
                self.world.on_container_open(open.serial, open);
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::CONTAINER_UPDATE => {
                let update = ContainerUpdate::decode(&packet, protocol.is_v6())?;
                self.world.on_container_update(update.item);
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::CONTAINER_CONTENT => {
                let content = ContainerContent::decode(&packet, protocol.is_v6())?;
                self.world.on_container_content(&content.items);
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::DELETE => {
                let del = Delete::decode(&packet)?;
                self.world.delete_subtree(del.serial);
                self.broadcast_raw(&packet).await;
            }
            cmd::MOBILE_INCOMING => {
                let incoming = MobileIncoming::decode(&packet)?;
                self.world.on_mobile_incoming(incoming);
                self.broadcast_raw(&packet).await;
            }
            cmd::MOBILE_STATUS => {
                let status = MobileStatus::decode(&packet)?;
                self.world.on_mobile_status(status);
                self.broadcast_raw(&packet).await;
            }
            cmd::MOBILE_UPDATE => {
                let update = MobileUpdate::decode(&packet)?;
                self.world.on_mobile_update(update);
                self.broadcast_raw(&packet).await;
            }
            cmd::ZONE_CHANGE => {
                let zc = ZoneChange::decode(&packet)?;
                self.world.on_zone_change(zc);
                self.broadcast_raw(&packet).await;
            }
            cmd::WALK_ACK => {
                let ack = WalkAck::decode(&packet)?;
                self.handle_upstream_walk_ack(ack).await?;
            }
            cmd::WALK_CANCEL => {
                let cancel = WalkCancel::decode(&packet)?;
                self.handle_upstream_walk_cancel(cancel).await?;
            }
            cmd::SUPPORTED_FEATURES => {
                self.world.ambient.supported_features = Some(packet.clone());
                self.broadcast_translated(op, &packet, protocol).await?;
            }
            cmd::GLOBAL_LIGHT_LEVEL => {
                if !self.config.light {
                    self.world.ambient.global_light_level = Some(packet.clone());
                    self.broadcast_raw(&packet).await;
                }
            }
            cmd::PERSONAL_LIGHT_LEVEL => {
                if !self.config.light {
                    self.world.ambient.personal_light_level = Some(packet.clone());
                    self.broadcast_raw(&packet).await;
                }
            }
            cmd::SEASON => {
                self.world.ambient.season = Some(packet.clone());
                self.broadcast_raw(&packet).await;
            }
            cmd::WAR_MODE => {
                self.world.ambient.war_mode = Some(packet.clone());
                self.broadcast_raw(&packet).await;
            }
            cmd::LOGIN_COMPLETE => {
                self.broadcast_raw(&packet).await;
                if self.config.antispy {
                    if let Some(up) = &mut self.upstream {
                        let _ = up.send(&synth_hardware_packet()).await;
                    }
                }
                for ep in &mut self.endpoints {
                    if !ep.outbound_compression_enabled() {
                        ep.enable_outbound_compression();
                    }
                }
            }
            _ => {
                self.broadcast_raw(&packet).await;
            }
        }
        Ok(())
    }

    async fn handle_upstream_relay(&mut self, packet: &BytesMut) -> Result<()> {
        let relay = Relay::decode(packet)?;
        self.upstream = None;
        let addr = SocketAddr::from((Ipv4Addr::from(relay.ip.to_be_bytes()), relay.port));
        self.connect_upstream(addr, ProtocolVersion::V5).await?;
        let login = GameLogin {
            auth_id: relay.auth_id,
            credentials: self.credentials.clone().unwrap_or(Credentials {
                username: String::new(),
                password: String::new(),
            }),
        };
        if let Some(up) = &mut self.upstream {
            up.send(&login.encode()).await?;
        }
        self.state = EndpointState::GameLogin;
        Ok(())
    }

    async fn handle_upstream_walk_ack(&mut self, ack: WalkAck) -> Result<()> {
        let AckOutcome { reply_to_owner, broadcast_update, resynchronize } =
            self.walk.on_upstream_ack(ack, &mut self.world);

        if resynchronize {
            // Lost sync with upstream (spec.md §4.F WalkAck step 1): the
            // queue has already been cleared, ask upstream to resend our
            // authoritative position.
            if let Some(up) = &mut self.upstream {
                let mut w = Writer::new();
                w.u8(cmd::RESYNCHRONIZE);
                up.send(&w.finish()).await?;
            }
        }

        if let Some((owner, reply)) = reply_to_owner {
            if let Some(ep) = self.endpoint_mut(owner) {
                ep.send(&reply.encode()).await?;
            }
            if broadcast_update {
                let anchor = self.world.player_anchor;
                let serial = anchor.serial;
                if let Some(update) = self
                    .world
                    .mobiles
                    .get(&serial)
                    .and_then(|m| m.update.clone())
                {
                    let bytes = update.encode();
                    for ep in &mut self.endpoints {
                        if ep.id != owner {
                            let _ = ep.send(&bytes).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_upstream_walk_cancel(&mut self, cancel: WalkCancel) -> Result<()> {
        let (reply, _applied) = self.walk.on_upstream_cancel(cancel);
        if let Some((owner, reply)) = reply {
            if let Some(ep) = self.endpoint_mut(owner) {
                ep.send(&reply.encode()).await?;
            }
        }
        self.world.apply_walked(cancel.x, cancel.y, cancel.direction);
        Ok(())
    }

    async fn broadcast_raw(&mut self, packet: &[u8]) {
        for ep in &mut self.endpoints {
            if let Err(e) = ep.send(packet).await {
                debug!(endpoint = ep.id, error = %e, "broadcast send failed");
            }
        }
    }

    /// Re-downgrades/upgrades a packet per attached endpoint's negotiated
    /// protocol before broadcasting (spec.md §4.A round-trip laws).
    async fn broadcast_translated(&mut self, op: u8, packet: &BytesMut, from: ProtocolVersion) -> Result<()> {
        for ep in &mut self.endpoints {
            let bytes = translate_for(op, packet, from, ep.protocol)?;
            let _ = ep.send(&bytes).await;
        }
        Ok(())
    }

    // ---- disconnect / reconnect ---------------------------------------------

    async fn handle_upstream_closed(&mut self) -> Result<()> {
        self.upstream = None;
        if self.state != EndpointState::InGame {
            for ep in &mut self.endpoints {
                let _ = ep.send(&AccountLoginReject { reason: AccountLoginReject::BLOCKED }.encode()).await;
            }
            self.endpoints.clear();
            return Ok(());
        }

        if !self.config.autoreconnect {
            self.broadcast_raw(&crate::protocol::packet::speak_console("uoproxy: upstream connection lost"))
                .await;
            return Ok(());
        }

        self.reconnecting = true;
        self.broadcast_raw(&crate::protocol::packet::speak_console(
            "uoproxy was disconnected, auto-reconnecting...",
        ))
        .await;

        let stale_mobiles: Vec<u32> = self.world.mobiles.keys().copied().collect();
        let stale_items: Vec<u32> = self.world.items.keys().copied().collect();
        for serial in stale_mobiles.into_iter().chain(stale_items) {
            self.world.delete_subtree(serial);
            let delete = Delete { serial }.encode();
            self.broadcast_raw(&delete).await;
        }

        self.reconnect_deadline = Some(Instant::now() + RECONNECT_DELAY);
        Ok(())
    }

    async fn begin_reconnect(&mut self) -> Result<()> {
        self.upstream = None;
        self.reconnecting = true;
        self.reconnect_deadline = Some(Instant::now());
        Ok(())
    }

    async fn attempt_reconnect(&mut self) -> Result<()> {
        let Some(credentials) = self.credentials.clone() else {
            return Ok(());
        };

        let result = if let Some(addr) = self.login_addr {
            self.connect_upstream(addr, ProtocolVersion::V5)
                .await
                .map(|()| AccountLogin { credentials: credentials.clone() }.encode())
        } else if let Some(addr) = self.config.server {
            self.connect_upstream(addr, ProtocolVersion::V5).await.map(|()| {
                GameLogin { auth_id: self.seed, credentials: credentials.clone() }.encode()
            })
        } else {
            Err(anyhow::anyhow!("no upstream configured for reconnect"))
        };

        match result {
            Ok(first) => {
                if let Some(up) = &mut self.upstream {
                    up.send(&first).await?;
                }
                self.state = EndpointState::AccountLogin;
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "reconnect attempt failed, retrying");
                self.reconnect_deadline = Some(Instant::now() + RECONNECT_DELAY);
            }
        }
        Ok(())
    }

    async fn reap_zombies(&mut self) {
        let now = Instant::now();
        self.zombies.retain(|z| z.deadline > now);
        self.sync_identity();
    }
}

fn ipv4_to_u32(addr: SocketAddr) -> u32 {
    match addr {
        SocketAddr::V4(v4) => u32::from_be_bytes(v4.ip().octets()),
        SocketAddr::V6(_) => 0,
    }
}

fn parse_talk_ascii(body: &[u8]) -> Result<String> {
    let mut r = Reader::new(&body[3..]);
    r.skip(1)?; // type
    r.skip(2)?; // hue
    r.skip(2)?; // font
    let text = r.rest();
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(String::from_utf8_lossy(&text[..end]).into_owned())
}

/// Builds a benign synthetic `0xD9 Hardware` packet to overwrite the
/// server's recorded client fingerprint (spec.md §4.G `antispy`), grounded
/// on the original's `send_antispy` fixture values.
fn synth_hardware_packet() -> BytesMut {
    let mut w = Writer::new();
    w.u8(cmd::HARDWARE)
        .u8(2)
        .u32(0xDEAD_BEEF)
        .u32(5)
        .u32(0)
        .u32(0)
        .u8(3)
        .u32(6)
        .u32(8)
        .u32(997)
        .u8(8)
        .u32(256)
        .u32(1600)
        .u32(1200)
        .u32(32)
        .u16(9)
        .u16(0)
        .zero(128)
        .u32(0)
        .u32(0)
        .u32(4)
        .u8(2)
        .u8(1)
        .u8(1)
        .u8(0)
        .zero(8)
        .zero(64);
    w.finish()
}

/// Translates a server-origin packet into the layout `to` expects, given it
/// was decoded under `from` (spec.md §4.A round-trip laws).
fn translate_for(op: u8, packet: &BytesMut, from: ProtocolVersion, to: ProtocolVersion) -> Result<BytesMut> {
    if from == to {
        return Ok(packet.clone());
    }
    match op {
        cmd::WORLD_ITEM => {
            let p7 = world_item_to_v7(&WorldItem::decode(packet)?);
            Ok(if to.is_v7() { p7.encode() } else { world_item_from_v7(&p7).encode() })
        }
        cmd::WORLD_ITEM_7 => {
            let p7 = WorldItem7::decode(packet)?;
            Ok(if to.is_v7() { p7.encode() } else { world_item_from_v7(&p7).encode() })
        }
        cmd::CONTAINER_OPEN => {
            let open = ContainerOpen::decode(packet)?;
            Ok(if to.is_v7() { container_open_to_v7(&open) } else { container_open_from_v7(&open) })
        }
        cmd::CONTAINER_UPDATE => {
            let update = ContainerUpdate::decode(packet, from.is_v6())?;
            Ok(update.encode(to.is_v6()))
        }
        cmd::CONTAINER_CONTENT => {
            let content = ContainerContent::decode(packet, from.is_v6())?;
            Ok(content.encode(to.is_v6()))
        }
        cmd::SUPPORTED_FEATURES => {
            if from >= ProtocolVersion::V6_0_14 && to < ProtocolVersion::V6_0_14 {
                let wide = SupportedFeatures6014::decode(packet)?;
                Ok(supported_features_from_6014(&wide).encode())
            } else if from < ProtocolVersion::V6_0_14 && to >= ProtocolVersion::V6_0_14 {
                let narrow = SupportedFeatures::decode(packet)?;
                Ok(supported_features_to_6014(&narrow).encode())
            } else {
                Ok(packet.clone())
            }
        }
        cmd::DROP => {
            if from.is_v6() && !to.is_v6() {
                Ok(drop_from_v6(&Drop6::decode(packet)?).encode())
            } else if !from.is_v6() && to.is_v6() {
                Ok(drop_to_v6(&Drop::decode(packet)?).encode())
            } else {
                Ok(packet.clone())
            }
        }
        _ => Ok(packet.clone()),
    }
}

/// `sleep_until(deadline)` if one is set, otherwise a future that never
/// resolves — lets `tokio::select!` treat an absent timer as "not ready"
/// without an `Option`-shaped branch per arm.
async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}
