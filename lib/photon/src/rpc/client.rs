use crate::net::channel::Delivery;
use crate::net::endpoint::{ConnectionChange, Endpoint, EndpointConfig};
use crate::net::support::{NetworkResult, PeerId};
use crate::rpc::codec::{decode_args, encode_args, Value};
use crate::rpc::message::{Handshake, Heartbeat, Manifest, ObserverNotify, Request, RpcMessage};
use crate::rpc::{new_uuid, RpcError};
use flint::logging;
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Connection lifecycle. `Ready` is only entered once the server's manifest has arrived, so a
/// ready client can always resolve grains.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Idle,
    Connecting,
    HandshakeSent,
    Ready,
    Draining,
    Closed,
}

#[derive(Clone)]
pub struct RpcClientConfig {
    pub endpoint: EndpointConfig,
    /// Applied when a call does not carry its own deadline.
    pub default_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Queue calls issued before the manifest arrives instead of failing them fast.
    pub queue_before_ready: bool,
    /// Grace window for in-flight calls once draining starts.
    pub drain_grace: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> RpcClientConfig {
        RpcClientConfig {
            endpoint: EndpointConfig::default(),
            default_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            queue_before_ready: true,
            drain_grace: Duration::from_secs(5),
        }
    }
}

struct PendingCall {
    deadline: Instant,
}

struct QueuedCall {
    request: Request,
    deadline: Instant,
}

/// Client half of an RPC connection. The holder of at most one live transport session: all
/// receive processing, deadline expiry and sends run on whichever thread pumps `sync`.
pub struct RpcClient {
    endpoint: Endpoint,
    peer: Option<PeerId>,
    state: ClientState,

    client_id: String,
    features: Vec<String>,

    manifest: Option<Manifest>,

    pending: HashMap<Uuid, PendingCall>,
    queued: Vec<QueuedCall>,
    completions: Vec<(Uuid, Result<Vec<Value>, RpcError>)>,
    notifications: Vec<ObserverNotify>,

    last_send: Instant,
    drain_deadline: Option<Instant>,

    config: RpcClientConfig,
    log: logging::Logger,
}

impl RpcClient {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        client_id: String,
        features: Vec<String>,
        config: RpcClientConfig,
        log: L,
    ) -> NetworkResult<RpcClient> {
        let log = logging::child(log);
        let endpoint = Endpoint::client(config.endpoint.clone(), &log)?;

        Ok(RpcClient {
            endpoint,
            peer: None,
            state: ClientState::Idle,
            client_id,
            features,
            manifest: None,
            pending: HashMap::new(),
            queued: Vec::new(),
            completions: Vec::new(),
            notifications: Vec::new(),
            last_send: Instant::now(),
            drain_deadline: None,
            config,
            log,
        })
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    #[inline]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Replaces the feature strings offered on the next handshake (e.g. a fresh ticket).
    #[inline]
    pub fn set_features(&mut self, features: Vec<String>) {
        self.features = features;
    }

    /// Opens the transport towards a server. Any previous connection is torn down first.
    pub fn connect(&mut self, remote: SocketAddr, now: Instant) {
        if let Some(peer) = self.peer.take() {
            self.endpoint.disconnect(peer, now);
            self.fail_all(RpcError::Disconnected);
        }

        logging::debug!(self.log, "connecting"; "remote" => %remote, "client_id" => &self.client_id);

        self.manifest = None;
        self.state = ClientState::Connecting;
        self.peer = Some(self.endpoint.connect(remote, flint::HANDSHAKE_KEY, now));
    }

    /// Issues a request. Returns the correlation id used to pick up the completion later.
    pub fn call(
        &mut self,
        grain_id: &str,
        interface_id: u32,
        method_id: u32,
        args: &[Value],
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<Uuid, RpcError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let message_id = new_uuid();

        let request = Request {
            message_id,
            grain_id: grain_id.to_string(),
            interface_id,
            method_id,
            timeout_ms: timeout.as_millis() as u32,
            args: encode_args(args),
        };

        match self.state {
            ClientState::Ready => {
                self.transmit_request(&request, now)?;
                self.pending.insert(message_id, PendingCall {
                    deadline: now + timeout,
                });
                Ok(message_id)
            }
            ClientState::Connecting | ClientState::HandshakeSent => {
                if self.config.queue_before_ready {
                    self.queued.push(QueuedCall {
                        request,
                        deadline: now + timeout,
                    });
                    Ok(message_id)
                } else {
                    Err(RpcError::Disconnected)
                }
            }
            _ => Err(RpcError::Disconnected),
        }
    }

    /// Issues a request and pumps the connection until it completes. Convenience for callers
    /// that are themselves the pumping thread.
    pub fn call_blocking(
        &mut self,
        grain_id: &str,
        interface_id: u32,
        method_id: u32,
        args: &[Value],
        timeout: Duration,
    ) -> Result<Vec<Value>, RpcError> {
        let id = self.call(grain_id, interface_id, method_id, args, Some(timeout), Instant::now())?;

        loop {
            self.sync(Instant::now());

            if let Some(result) = self.take_completion(id) {
                return result;
            }

            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Blocks until the manifest arrives, the timeout passes or the transport drops.
    pub fn wait_for_manifest(&mut self, timeout: Duration) -> Result<(), RpcError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.sync(Instant::now());

            match self.state {
                ClientState::Ready => return Ok(()),
                ClientState::Idle | ClientState::Closed => return Err(RpcError::Disconnected),
                _ => (),
            }

            if Instant::now() >= deadline {
                return Err(RpcError::Timeout);
            }

            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Removes and returns the completion for a call id, if it has arrived.
    pub fn take_completion(&mut self, id: Uuid) -> Option<Result<Vec<Value>, RpcError>> {
        let index = self.completions.iter().position(|(that, _)| *that == id)?;
        Some(self.completions.swap_remove(index).1)
    }

    /// Drains every completion, regardless of id. For fire-and-forget callers that would
    /// otherwise let the completion list grow without bound.
    #[inline]
    pub fn take_all_completions(&mut self) -> Vec<(Uuid, Result<Vec<Value>, RpcError>)> {
        std::mem::take(&mut self.completions)
    }

    /// Drains all observer notifications received since the last call.
    #[inline]
    pub fn take_notifications(&mut self) -> Vec<ObserverNotify> {
        std::mem::take(&mut self.notifications)
    }

    /// Stops accepting new calls; in-flight ones may still complete within the grace window.
    pub fn begin_drain(&mut self, now: Instant) {
        if self.state == ClientState::Ready {
            self.state = ClientState::Draining;
            self.drain_deadline = Some(now + self.config.drain_grace);
        }
    }

    /// Tears the connection down immediately. Idempotent.
    pub fn close(&mut self, now: Instant) {
        if let Some(peer) = self.peer.take() {
            self.endpoint.disconnect(peer, now);
        }

        self.fail_all(RpcError::Disconnected);
        self.manifest = None;
        self.state = ClientState::Closed;
        self.endpoint.sync(now);
    }

    /// Pumps the transport and the per-connection state machine.
    pub fn sync(&mut self, now: Instant) {
        self.endpoint.sync(now);

        for change in self.endpoint.changes() {
            match change {
                ConnectionChange::Connected(peer) if Some(peer) == self.peer => {
                    self.send_handshake(now);
                }
                ConnectionChange::Disconnected(peer, reason) if Some(peer) == self.peer => {
                    logging::debug!(self.log, "transport lost"; "reason" => ?reason);

                    self.peer = None;
                    self.manifest = None;
                    self.state = ClientState::Idle;
                    self.fail_all(RpcError::Disconnected);
                }
                _ => (),
            }
        }

        for (peer, payload, _) in self.endpoint.received() {
            if Some(peer) != self.peer {
                continue;
            }

            let messages = match RpcMessage::read_all(&payload) {
                Ok(messages) => messages,
                Err(err) => {
                    logging::warn!(self.log, "malformed rpc payload"; "error" => ?err);
                    continue;
                }
            };

            for message in messages {
                self.on_message(message, now);
            }
        }

        // Expire deadlines; late responses for these ids are dropped silently
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, call)| now >= call.deadline)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.pending.remove(&id);
            self.completions.push((id, Err(RpcError::Timeout)));
        }

        let expired_queued: Vec<usize> = self
            .queued
            .iter()
            .enumerate()
            .filter(|(_, call)| now >= call.deadline)
            .map(|(index, _)| index)
            .collect();

        for index in expired_queued.into_iter().rev() {
            let call = self.queued.swap_remove(index);
            self.completions.push((call.request.message_id, Err(RpcError::Timeout)));
        }

        if self.state == ClientState::Ready
            && now.duration_since(self.last_send) >= self.config.heartbeat_interval
        {
            let heartbeat = RpcMessage::Heartbeat(Heartbeat {
                source_id: self.client_id.clone(),
            });
            self.transmit(&heartbeat, Delivery::Reliable, now);
        }

        if self.state == ClientState::Draining {
            let grace_over = self.drain_deadline.map_or(true, |deadline| now >= deadline);

            if self.pending.is_empty() || grace_over {
                self.close(now);
            }
        }
    }

    fn on_message(&mut self, message: RpcMessage, now: Instant) {
        match message {
            RpcMessage::Manifest(manifest) => {
                logging::debug!(self.log, "manifest received"; "grains" => manifest.grains.len());

                self.manifest = Some(manifest);

                if self.state == ClientState::HandshakeSent || self.state == ClientState::Connecting {
                    self.state = ClientState::Ready;
                    self.flush_queued(now);
                }
            }
            RpcMessage::Response(response) => {
                // Unknown ids are late responses for expired calls; dropped by design of the
                // correlation map
                if self.pending.remove(&response.request_id).is_none() {
                    return;
                }

                let outcome = match response.result {
                    Ok(body) => decode_args(&body).map_err(|_| RpcError::ArgumentDecode),
                    Err((code, text)) => Err(RpcError::from_wire(code, text)),
                };

                self.completions.push((response.request_id, outcome));
            }
            RpcMessage::ObserverNotify(notify) => {
                self.notifications.push(notify);
            }
            RpcMessage::Heartbeat(_) => (),
            // Servers do not originate handshakes or requests towards clients
            RpcMessage::Handshake(_) | RpcMessage::Request(_) => (),
        }
    }

    fn send_handshake(&mut self, now: Instant) {
        let handshake = RpcMessage::Handshake(Handshake {
            client_id: self.client_id.clone(),
            protocol_version: flint::PROTOCOL_VERSION,
            features: self.features.clone(),
        });

        self.transmit(&handshake, Delivery::Reliable, now);
        self.state = ClientState::HandshakeSent;
    }

    fn flush_queued(&mut self, now: Instant) {
        let queued = std::mem::take(&mut self.queued);

        for call in queued {
            let message_id = call.request.message_id;

            match self.transmit_request(&call.request, now) {
                Ok(()) => {
                    self.pending.insert(message_id, PendingCall {
                        deadline: call.deadline,
                    });
                }
                Err(err) => self.completions.push((message_id, Err(err))),
            }
        }
    }

    fn transmit_request(&mut self, request: &Request, now: Instant) -> Result<(), RpcError> {
        let message = RpcMessage::Request(request.clone());

        match self.peer {
            Some(peer) => {
                let mut wire = Vec::new();
                message.write(&mut wire).map_err(|_| RpcError::ArgumentDecode)?;

                self.endpoint
                    .send(peer, &wire, Delivery::Reliable, now)
                    .map_err(|_| RpcError::Disconnected)?;
                self.last_send = now;

                Ok(())
            }
            None => Err(RpcError::Disconnected),
        }
    }

    fn transmit(&mut self, message: &RpcMessage, delivery: Delivery, now: Instant) {
        if let Some(peer) = self.peer {
            let mut wire = Vec::new();

            if message.write(&mut wire).is_ok() {
                let _ = self.endpoint.send(peer, &wire, delivery, now);
                self.last_send = now;
            }
        }
    }

    fn fail_all(&mut self, error: RpcError) {
        for (id, _) in self.pending.drain() {
            self.completions.push((id, Err(error.clone())));
        }

        let queued = std::mem::take(&mut self.queued);
        for call in queued {
            self.completions.push((call.request.message_id, Err(error.clone())));
        }
    }
}
