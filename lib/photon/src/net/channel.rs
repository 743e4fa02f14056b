use crate::net::datagram::{Datagram, FragmentInfo, Kind, FRAGMENT_CHUNK_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use flint::logging;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Delivery class of a payload. All RPC request/response traffic rides `Reliable`; high rate
/// snapshot streams may ride `Unreliable` and tolerate loss.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Connecting(Instant),
    Connected,
    Disconnected,
}

/// Connection level outcome of processing one datagram.
#[derive(Debug, Eq, PartialEq)]
pub enum ChannelSignal {
    None,
    Accepted,
    Denied,
    RemoteClosed,
}

struct PendingDatagram {
    sequence: u64,
    wire: Vec<u8>,
    next_retry: Instant,
    retries: u32,
}

/// Reliable/unreliable datagram channel with a single remote peer.
///
/// The reliable lane assigns a sequence per datagram, retransmits unacked datagrams with
/// exponential backoff and delivers payloads strictly in order, buffering whatever arrives
/// early. The unreliable lane only drops stale datagrams. All per-channel state is owned by
/// the endpoint pump thread, so no locking is involved.
pub struct Channel {
    addr: SocketAddr,
    state: ChannelState,

    // Reliable send side
    send_sequence: u64,
    send_window: VecDeque<PendingDatagram>,

    // Reliable receive side
    recv_sequence: u64,
    reorder: HashMap<u64, (bool, Vec<u8>)>,

    // Fragment reassembly (sequential: fragments ride the ordered lane)
    assembly: Vec<u8>,
    assembly_next: u16,
    assembly_count: u16,

    // Unreliable lane
    unreliable_send_sequence: u64,
    unreliable_recv_max: Option<u64>,

    last_ingress: Instant,
    last_egress: Instant,
    connect_retry_at: Instant,
    handshake_key: String,

    // Datagrams ready for the socket
    outgoing: Vec<Vec<u8>>,

    config: ChannelConfig,
    log: logging::Logger,
}

#[derive(Clone)]
pub struct ChannelConfig {
    /// Peer declared dead after this much ingress silence.
    pub peer_timeout: Duration,
    /// Handshake must complete within this window.
    pub connect_timeout: Duration,
    /// Idle keepalive cadence.
    pub keepalive_interval: Duration,
    /// Initial retransmission delay, doubled per retry.
    pub retry_initial: Duration,
    /// Retransmission delay ceiling.
    pub retry_max: Duration,
    /// Maximum unacked reliable datagrams in flight.
    pub send_window_limit: usize,
    /// Maximum buffered out-of-order datagrams before new arrivals are shed.
    pub reorder_limit: usize,
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig {
            peer_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_secs(2),
            send_window_limit: 1024,
            reorder_limit: 256,
        }
    }
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: SocketAddr,
        config: ChannelConfig,
        now: Instant,
        log: L,
    ) -> Channel {
        Channel {
            addr,
            state: ChannelState::Disconnected,
            send_sequence: 0,
            send_window: VecDeque::new(),
            recv_sequence: 0,
            reorder: HashMap::new(),
            assembly: Vec::new(),
            assembly_next: 0,
            assembly_count: 0,
            unreliable_send_sequence: 0,
            unreliable_recv_max: None,
            last_ingress: now,
            last_egress: now,
            connect_retry_at: now,
            handshake_key: String::new(),
            outgoing: Vec::new(),
            config,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Starts the client side handshake by offering the supplied key.
    pub fn connect(&mut self, key: &str, now: Instant) {
        self.state = ChannelState::Connecting(now);
        self.connect_retry_at = now + Duration::from_millis(250);
        self.handshake_key = key.to_string();
        self.push_connect_request(now);

        logging::debug!(self.log, "connecting"; "peer" => %self.addr);
    }

    /// Accepts an inbound handshake (listener side).
    pub fn accept(&mut self, now: Instant) {
        self.state = ChannelState::Connected;
        self.last_ingress = now;
        self.push_raw(Datagram::write(Kind::ConnectAccept, 0, &[]), now);

        logging::debug!(self.log, "accepted"; "peer" => %self.addr);
    }

    /// Rejects an inbound handshake without keeping any state.
    pub fn deny(&mut self, now: Instant) {
        self.push_raw(Datagram::write(Kind::ConnectDeny, 0, &[]), now);
        self.state = ChannelState::Disconnected;
    }

    /// Queues a payload for transmission. Reliable payloads above the single datagram limit are
    /// fragmented; unreliable payloads must fit one datagram.
    pub fn send(&mut self, payload: &[u8], delivery: Delivery, now: Instant) -> NetworkResult<()> {
        if self.state == ChannelState::Disconnected {
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        if payload.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        match delivery {
            Delivery::Unreliable => {
                if payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
                }

                let sequence = self.unreliable_send_sequence;
                self.unreliable_send_sequence += 1;
                self.push_raw(Datagram::write(Kind::Unreliable, sequence, payload), now);

                Ok(())
            }
            Delivery::Reliable => {
                if payload.len() > MAX_MESSAGE_SIZE {
                    return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
                }

                if payload.len() <= MAX_PAYLOAD_SIZE {
                    self.push_reliable(Kind::Reliable, payload.to_vec(), now)
                } else {
                    let count = (payload.len() + FRAGMENT_CHUNK_SIZE - 1) / FRAGMENT_CHUNK_SIZE;

                    // Admit all fragments or none, so a partial message never wedges the lane
                    if self.send_window.len() + count > self.config.send_window_limit {
                        return Err(NetworkError::Wait);
                    }

                    for (index, chunk) in payload.chunks(FRAGMENT_CHUNK_SIZE).enumerate() {
                        let wire = FragmentInfo {
                            index: index as u16,
                            count: count as u16,
                        }
                        .write(chunk);

                        self.push_reliable(Kind::ReliableFragment, wire, now)?;
                    }

                    Ok(())
                }
            }
        }
    }

    /// Processes one inbound datagram. In-order reliable payloads (and any buffered successors
    /// they release) are appended to `deliveries`.
    pub fn on_datagram(
        &mut self,
        datagram: Datagram,
        now: Instant,
        deliveries: &mut Vec<(Vec<u8>, Delivery)>,
    ) -> NetworkResult<ChannelSignal> {
        self.last_ingress = now;

        match datagram.kind {
            Kind::ConnectRequest => {
                // Retransmitted handshake from an already admitted peer
                if self.state == ChannelState::Connected {
                    self.push_raw(Datagram::write(Kind::ConnectAccept, 0, &[]), now);
                }
                Ok(ChannelSignal::None)
            }
            Kind::ConnectAccept => {
                if let ChannelState::Connecting(_) = self.state {
                    self.state = ChannelState::Connected;
                    logging::debug!(self.log, "connection accepted"; "peer" => %self.addr);
                    return Ok(ChannelSignal::Accepted);
                }
                Ok(ChannelSignal::None)
            }
            Kind::ConnectDeny => {
                self.state = ChannelState::Disconnected;
                Ok(ChannelSignal::Denied)
            }
            Kind::Disconnect => {
                self.state = ChannelState::Disconnected;
                Ok(ChannelSignal::RemoteClosed)
            }
            Kind::KeepAlive => Ok(ChannelSignal::None),
            Kind::Ack => {
                self.on_ack(datagram.sequence);
                Ok(ChannelSignal::None)
            }
            Kind::Reliable => {
                self.on_reliable(false, datagram.sequence, datagram.payload.to_vec(), now, deliveries)?;
                Ok(ChannelSignal::None)
            }
            Kind::ReliableFragment => {
                self.on_reliable(true, datagram.sequence, datagram.payload.to_vec(), now, deliveries)?;
                Ok(ChannelSignal::None)
            }
            Kind::Unreliable => {
                let stale = match self.unreliable_recv_max {
                    Some(max) => datagram.sequence <= max,
                    None => false,
                };

                if !stale && !datagram.payload.is_empty() {
                    self.unreliable_recv_max = Some(datagram.sequence);
                    deliveries.push((datagram.payload.to_vec(), Delivery::Unreliable));
                }

                Ok(ChannelSignal::None)
            }
        }
    }

    /// Drives retries, keepalives and timeout detection. Returns a fatal error when the peer is
    /// considered gone.
    pub fn tick(&mut self, now: Instant) -> NetworkResult<()> {
        match self.state {
            ChannelState::Disconnected => Ok(()),
            ChannelState::Connecting(started) => {
                if now.duration_since(started) >= self.config.connect_timeout {
                    return Err(NetworkError::Fatal(ErrorType::PeerTimeout));
                }

                if now >= self.connect_retry_at {
                    self.connect_retry_at = now + Duration::from_millis(250);
                    self.push_connect_request(now);
                }

                Ok(())
            }
            ChannelState::Connected => {
                if now.duration_since(self.last_ingress) >= self.config.peer_timeout {
                    return Err(NetworkError::Fatal(ErrorType::PeerTimeout));
                }

                self.retransmit(now);

                if now.duration_since(self.last_egress) >= self.config.keepalive_interval {
                    self.push_raw(Datagram::write(Kind::KeepAlive, 0, &[]), now);
                }

                Ok(())
            }
        }
    }

    /// Closes the channel, optionally notifying the peer, and clears all lanes.
    pub fn close(&mut self, notify: bool, now: Instant) {
        if notify && self.state != ChannelState::Disconnected {
            self.push_raw(Datagram::write(Kind::Disconnect, 0, &[]), now);
        }

        logging::debug!(self.log, "channel closed";
                        "peer" => %self.addr,
                        "send_sequence" => self.send_sequence,
                        "recv_sequence" => self.recv_sequence,
                        "inflight" => self.send_window.len());

        self.state = ChannelState::Disconnected;
        self.send_window.clear();
        self.reorder.clear();
        self.assembly.clear();
        self.assembly_count = 0;
        self.assembly_next = 0;
    }

    /// Hands the queued wire datagrams to the socket pump.
    #[inline]
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.outgoing)
    }

    #[inline]
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn push_connect_request(&mut self, now: Instant) {
        let key = &self.handshake_key;
        let mut payload = Vec::with_capacity(2 + key.len());
        payload.extend_from_slice(&(key.len() as u16).to_be_bytes());
        payload.extend_from_slice(key.as_bytes());

        let wire = Datagram::write(Kind::ConnectRequest, 0, &payload);
        self.push_raw(wire, now);
    }

    fn push_reliable(&mut self, kind: Kind, payload: Vec<u8>, now: Instant) -> NetworkResult<()> {
        if self.send_window.len() >= self.config.send_window_limit {
            return Err(NetworkError::Wait);
        }

        let sequence = self.send_sequence;
        self.send_sequence = self
            .send_sequence
            .checked_add(1)
            .ok_or(NetworkError::Fatal(ErrorType::SequenceOverflow))?;

        let wire = Datagram::write(kind, sequence, &payload);

        self.send_window.push_back(PendingDatagram {
            sequence,
            wire: wire.clone(),
            next_retry: now + self.config.retry_initial,
            retries: 0,
        });
        self.push_raw(wire, now);

        Ok(())
    }

    fn on_ack(&mut self, next_expected: u64) {
        while let Some(front) = self.send_window.front() {
            if front.sequence < next_expected {
                self.send_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn on_reliable(
        &mut self,
        is_fragment: bool,
        sequence: u64,
        payload: Vec<u8>,
        now: Instant,
        deliveries: &mut Vec<(Vec<u8>, Delivery)>,
    ) -> NetworkResult<()> {
        if payload.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        if sequence == self.recv_sequence {
            self.deliver_ordered(is_fragment, payload, deliveries)?;
            self.recv_sequence += 1;

            // Release whatever the gap was holding back
            while let Some((frag, held)) = self.reorder.remove(&self.recv_sequence) {
                self.deliver_ordered(frag, held, deliveries)?;
                self.recv_sequence += 1;
            }
        } else if sequence > self.recv_sequence {
            if self.reorder.len() >= self.config.reorder_limit {
                logging::trace!(self.log, "reorder buffer full, shedding datagram";
                                "peer" => %self.addr,
                                "sequence" => sequence);
            } else {
                self.reorder.insert(sequence, (is_fragment, payload));
            }
        }
        // A sequence below recv_sequence is a retransmitted duplicate, the ack below re-informs
        // the sender either way.

        self.push_raw(Datagram::write(Kind::Ack, self.recv_sequence, &[]), now);

        Ok(())
    }

    fn deliver_ordered(
        &mut self,
        is_fragment: bool,
        payload: Vec<u8>,
        deliveries: &mut Vec<(Vec<u8>, Delivery)>,
    ) -> NetworkResult<()> {
        if !is_fragment {
            if self.assembly_count != 0 {
                return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
            }

            deliveries.push((payload, Delivery::Reliable));
            return Ok(());
        }

        let (info, chunk) = FragmentInfo::read(&payload)?;

        if self.assembly_count == 0 {
            if info.index != 0 {
                return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
            }

            self.assembly_count = info.count;
            self.assembly_next = 0;
            self.assembly.clear();
        }

        if info.index != self.assembly_next || info.count != self.assembly_count {
            return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
        }

        self.assembly.extend_from_slice(chunk);
        self.assembly_next += 1;

        if self.assembly_next == self.assembly_count {
            deliveries.push((mem::take(&mut self.assembly), Delivery::Reliable));
            self.assembly_count = 0;
            self.assembly_next = 0;
        }

        Ok(())
    }

    fn retransmit(&mut self, now: Instant) {
        let retry_initial = self.config.retry_initial;
        let retry_max = self.config.retry_max;
        let mut resends = Vec::new();

        for pending in self.send_window.iter_mut() {
            if now >= pending.next_retry {
                pending.retries += 1;

                let backoff = retry_initial * 2u32.saturating_pow(pending.retries.min(16));
                pending.next_retry = now + backoff.min(retry_max);

                resends.push(pending.wire.clone());
            }
        }

        if !resends.is_empty() {
            logging::trace!(self.log, "retransmitting"; "peer" => %self.addr, "count" => resends.len());

            for wire in resends {
                self.push_raw(wire, now);
            }
        }
    }

    #[inline]
    fn push_raw(&mut self, wire: Vec<u8>, now: Instant) {
        self.outgoing.push(wire);
        self.last_egress = now;
    }
}
