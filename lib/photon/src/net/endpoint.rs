use crate::net::channel::{Channel, ChannelConfig, ChannelSignal, ChannelState, Delivery};
use crate::net::datagram::{Datagram, Kind, MAX_DATAGRAM_SIZE};
use crate::net::support::{ErrorType, NetworkError, NetworkResult, PeerId};
use byteorder::{BigEndian, ReadBytesExt};
use flint::logging;
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Describes a change in the connectivity status of a peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionChange {
    Connected(PeerId),
    Disconnected(PeerId, DisconnectReason),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    Timeout,
    Rejected,
    RemoteClosed,
    LocalClosed,
    ProtocolError,
}

/// Transport level tuning knobs.
#[derive(Clone)]
pub struct EndpointConfig {
    pub channel: ChannelConfig,
    /// Keys accepted from connecting peers; the empty key is always accepted alongside.
    pub handshake_key: String,
    pub housekeeping_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            channel: ChannelConfig::default(),
            handshake_key: flint::HANDSHAKE_KEY.to_string(),
            housekeeping_interval: Duration::from_millis(100),
        }
    }
}

/// Handles all connection management and datagram transmission on a single UDP socket. Peers
/// are identified by slab index; the address map resolves inbound datagrams. All state is
/// owned by the thread pumping `sync`, mirroring the single task runner model of the session
/// layer above.
pub struct Endpoint {
    socket: UdpSocket,
    poll: Poll,
    events: Events,

    config: EndpointConfig,
    listening: bool,

    channels: Vec<Channel>,
    free: Vec<PeerId>,
    live: IndexSet<PeerId>,
    by_addr: HashMap<SocketAddr, PeerId>,

    changes: Vec<ConnectionChange>,
    inbound: Vec<(PeerId, Vec<u8>, Delivery)>,

    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
    housekeeping_time: Instant,

    log: logging::Logger,
}

const SOCKET_TOKEN: Token = Token(0);
const ZERO_TIME: Duration = Duration::from_secs(0);

impl Endpoint {
    /// Binds a listening endpoint that admits inbound handshakes.
    pub fn listen<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        config: EndpointConfig,
        log: L,
    ) -> NetworkResult<Endpoint> {
        Self::bind(address, config, true, log)
    }

    /// Binds an ephemeral endpoint used for outbound connections only.
    pub fn client<'a, L: Into<Option<&'a logging::Logger>>>(
        config: EndpointConfig,
        log: L,
    ) -> NetworkResult<Endpoint> {
        Self::bind("0.0.0.0:0", config, false, log)
    }

    fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        config: EndpointConfig,
        listening: bool,
        log: L,
    ) -> NetworkResult<Endpoint> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(address.parse::<SocketAddr>()?)?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let now = Instant::now();
        let log = logging::child(log);

        logging::debug!(log, "endpoint bound"; "address" => %socket.local_addr()?, "listening" => listening);

        Ok(Endpoint {
            socket,
            poll,
            events: Events::with_capacity(64),
            config,
            listening,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            by_addr: HashMap::new(),
            changes: Vec::new(),
            inbound: Vec::new(),
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
            housekeeping_time: now,
            log,
        })
    }

    /// Local socket address (useful when bound to an ephemeral port).
    #[inline]
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Starts an outbound connection offering the supplied handshake key. The peer id is
    /// allocated immediately; a `Connected` change is emitted once the remote accepts.
    pub fn connect(&mut self, remote: SocketAddr, key: &str, now: Instant) -> PeerId {
        let peer = self.allocate(remote, now);

        self.channels[peer].connect(key, now);
        self.flush_peer(peer);

        peer
    }

    /// Queues a payload to a connected peer.
    pub fn send(&mut self, peer: PeerId, payload: &[u8], delivery: Delivery, now: Instant) -> NetworkResult<()> {
        let channel = &mut self.channels[peer];
        channel.send(payload, delivery, now)
    }

    /// True if the peer finished its handshake and is exchanging traffic.
    #[inline]
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.channels.get(peer).map_or(false, Channel::is_connected)
    }

    #[inline]
    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.channels.get(peer).map(Channel::addr)
    }

    /// Closes the connection to a peer. Idempotent.
    pub fn disconnect(&mut self, peer: PeerId, now: Instant) {
        if self.live.contains(&peer) {
            self.teardown(peer, DisconnectReason::LocalClosed, true, now);
        }
    }

    /// Pumps the socket: receives datagrams, dispatches to channels, drives timers and flushes
    /// queued egress. Call at the owning loop's cadence.
    pub fn sync(&mut self, now: Instant) {
        // Socket readiness; recv below tolerates spurious wakeups either way
        if let Err(err) = self.poll.poll(&mut self.events, Some(ZERO_TIME)) {
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("Socket poll failed: {:?}", err);
            }
        }

        self.receive_all(now);

        if now.duration_since(self.housekeeping_time) >= self.config.housekeeping_interval {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        let live: Vec<PeerId> = self.live.iter().copied().collect();
        for peer in live {
            self.flush_peer(peer);
        }
    }

    /// Drains all connectivity changes accumulated since the last call.
    #[inline]
    pub fn changes(&mut self) -> Vec<ConnectionChange> {
        std::mem::take(&mut self.changes)
    }

    /// Drains all received payloads accumulated since the last call.
    #[inline]
    pub fn received(&mut self) -> Vec<(PeerId, Vec<u8>, Delivery)> {
        std::mem::take(&mut self.inbound)
    }

    fn receive_all(&mut self, now: Instant) {
        loop {
            let (size, addr) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                // Async ICMP errors surface here on some platforms; the affected peer
                // times out on its own
                Err(_) => continue,
            };

            let (kind, sequence, payload) = match Datagram::read(&self.recv_buffer[..size]) {
                Ok(datagram) => (datagram.kind, datagram.sequence, datagram.payload.to_vec()),
                Err(_) => continue,
            };

            let peer = match self.by_addr.get(&addr).copied() {
                Some(peer) => peer,
                None => {
                    if self.listening && kind == Kind::ConnectRequest {
                        self.admit(addr, &payload, now);
                    }
                    continue;
                }
            };

            let mut deliveries = Vec::new();
            let result = self.channels[peer].on_datagram(
                Datagram {
                    kind,
                    sequence,
                    payload: &payload,
                },
                now,
                &mut deliveries,
            );

            for (payload, delivery) in deliveries {
                self.inbound.push((peer, payload, delivery));
            }

            match result {
                Ok(ChannelSignal::None) => (),
                Ok(ChannelSignal::Accepted) => self.changes.push(ConnectionChange::Connected(peer)),
                Ok(ChannelSignal::Denied) => {
                    self.teardown(peer, DisconnectReason::Rejected, false, now)
                }
                Ok(ChannelSignal::RemoteClosed) => {
                    self.teardown(peer, DisconnectReason::RemoteClosed, false, now)
                }
                Err(NetworkError::Wait) => (),
                Err(NetworkError::Fatal(_)) => {
                    self.teardown(peer, DisconnectReason::ProtocolError, false, now)
                }
            }
        }
    }

    /// Validates an inbound handshake and admits the peer.
    fn admit(&mut self, addr: SocketAddr, payload: &[u8], now: Instant) {
        let offered = match Self::parse_handshake_key(payload) {
            Ok(key) => key,
            Err(_) => return,
        };

        // The empty key remains accepted for older clients
        if !offered.is_empty() && offered != self.config.handshake_key {
            logging::debug!(self.log, "handshake rejected"; "peer" => %addr);

            let mut reject = Channel::new(addr, self.config.channel.clone(), now, &self.log);
            reject.deny(now);
            for wire in reject.take_outgoing() {
                let _ = self.socket.send_to(&wire, addr);
            }
            return;
        }

        let peer = self.allocate(addr, now);
        self.channels[peer].accept(now);
        self.changes.push(ConnectionChange::Connected(peer));

        logging::debug!(self.log, "peer admitted"; "peer" => %addr, "peer_id" => peer);
    }

    fn parse_handshake_key(payload: &[u8]) -> NetworkResult<String> {
        let mut cursor = Cursor::new(payload);
        let len = cursor.read_u16::<BigEndian>()? as usize;

        if payload.len() < 2 + len {
            return Err(NetworkError::Fatal(ErrorType::HandshakeRejected));
        }

        String::from_utf8(payload[2..2 + len].to_vec())
            .map_err(|_| NetworkError::Fatal(ErrorType::HandshakeRejected))
    }

    fn allocate(&mut self, addr: SocketAddr, now: Instant) -> PeerId {
        let peer = match self.free.pop() {
            Some(peer) => {
                self.channels[peer] = Channel::new(addr, self.config.channel.clone(), now, &self.log);
                peer
            }
            None => {
                let peer = self.channels.len();
                self.channels
                    .push(Channel::new(addr, self.config.channel.clone(), now, &self.log));
                peer
            }
        };

        self.live.insert(peer);
        self.by_addr.insert(addr, peer);

        peer
    }

    fn teardown(&mut self, peer: PeerId, reason: DisconnectReason, notify: bool, now: Instant) {
        let addr = self.channels[peer].addr();

        self.channels[peer].close(notify, now);
        self.flush_peer(peer);

        // A reconnect may already have claimed this address for a fresh peer
        if self.by_addr.get(&addr) == Some(&peer) {
            self.by_addr.remove(&addr);
        }
        self.live.shift_remove(&peer);
        self.free.push(peer);
        self.changes.push(ConnectionChange::Disconnected(peer, reason));

        logging::debug!(self.log, "peer torn down"; "peer" => %addr, "peer_id" => peer, "reason" => ?reason);
    }

    fn housekeeping(&mut self, now: Instant) {
        let channels = &mut self.channels;
        let stale: Vec<PeerId> = self
            .live
            .iter()
            .copied()
            .filter(|&peer| channels[peer].tick(now).has_failed_fatal())
            .collect();

        for peer in stale {
            self.teardown(peer, DisconnectReason::Timeout, false, now);
        }
    }

    fn flush_peer(&mut self, peer: PeerId) {
        if !self.channels[peer].has_outgoing() {
            return;
        }

        let addr = self.channels[peer].addr();

        for wire in self.channels[peer].take_outgoing() {
            match self.socket.send_to(&wire, addr) {
                Ok(_) => (),
                // Dropped on egress pressure; the reliable lane retransmits
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

trait FatalCheck {
    fn has_failed_fatal(&self) -> bool;
}

impl<T> FatalCheck for NetworkResult<T> {
    fn has_failed_fatal(&self) -> bool {
        matches!(self, Err(NetworkError::Fatal(_)))
    }
}
