use crate::net::channel::Delivery;
use crate::net::endpoint::{ConnectionChange, Endpoint, EndpointConfig};
use crate::net::support::{NetworkResult, PeerId};
use crate::rpc::codec::{decode_args, encode_args, Value};
use crate::rpc::message::{GrainEntry, Manifest, ObserverNotify, Request, Response, RpcMessage};
use crate::rpc::{new_uuid, RpcError};
use flint::crypto;
use flint::logging;
use flint::session::{Role, SessionKey, SessionTicket};
use hashbrown::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Authorization policy attached to each RPC method, checked before argument decoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MethodPolicy {
    AllowAnonymous,
    ClientAccessible,
    ServerOnly,
    RequireRole(Role),
}

impl MethodPolicy {
    #[inline]
    pub fn allows(self, role: Role) -> bool {
        match self {
            MethodPolicy::AllowAnonymous => true,
            MethodPolicy::ClientAccessible => role >= Role::User,
            MethodPolicy::ServerOnly => role >= Role::Server,
            MethodPolicy::RequireRole(required) => role >= required,
        }
    }
}

/// Identity and privileges of the connection a call arrived on.
#[derive(Debug, Clone)]
pub struct CallCtx {
    pub peer: PeerId,
    pub client_id: String,
    pub role: Role,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
    pub message_id: Uuid,
    pub grain_id: String,
}

pub type Handler<S> =
    Box<dyn FnMut(&mut S, &CallCtx, Vec<Value>) -> Result<Vec<Value>, RpcError> + Send>;

enum MethodKind<S> {
    Call { handler: Handler<S> },
    /// Subscription factory: replies with a fresh subscription id tagged for the app to feed.
    Stream { tag: &'static str },
    /// Removes the subscription named by the single guid argument.
    Unsubscribe,
}

struct MethodDef<S> {
    name: &'static str,
    policy: MethodPolicy,
    kind: MethodKind<S>,
}

struct GrainDef<S> {
    grain_type: String,
    methods: HashMap<u32, MethodDef<S>>,
}

struct ConnInfo {
    client_id: String,
    role: Role,
    player_id: Option<String>,
    player_name: Option<String>,
    handshaken: bool,
    last_activity: Instant,
    notify_budget: usize,
}

struct Subscription {
    peer: PeerId,
    tag: &'static str,
    args: Vec<Value>,
    created: Instant,
}

/// A subscription as seen by the application when producing stream events.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub peer: PeerId,
    pub args: Vec<Value>,
}

#[derive(Clone)]
pub struct RpcServerConfig {
    pub endpoint: EndpointConfig,
    /// Shared secret admitting server-role peers and sealing session tickets. Absent in tests.
    pub cluster_secret: Option<SessionKey>,
    /// Observers idle beyond this are evicted.
    pub observer_idle_timeout: Duration,
    /// Per-connection notification budget per pump; the excess is shed.
    pub observer_high_water: usize,
}

impl Default for RpcServerConfig {
    fn default() -> RpcServerConfig {
        RpcServerConfig {
            endpoint: EndpointConfig::default(),
            cluster_secret: None,
            observer_idle_timeout: Duration::from_secs(300),
            observer_high_water: 256,
        }
    }
}

/// Server half of the RPC session layer: owns the listening endpoint, the grain/method
/// registry, per-connection identities and the observer registry. Dispatch is synchronous on
/// the pumping thread; requests from one connection are handled in arrival order.
pub struct RpcServer<S> {
    endpoint: Endpoint,
    server_id: String,

    grains: HashMap<u32, GrainDef<S>>,
    conns: HashMap<PeerId, ConnInfo>,

    subscriptions: HashMap<Uuid, Subscription>,

    draining: bool,
    disconnects: Vec<(PeerId, Option<String>)>,

    config: RpcServerConfig,
    log: logging::Logger,
}

impl<S> RpcServer<S> {
    pub fn listen<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        server_id: String,
        config: RpcServerConfig,
        log: L,
    ) -> NetworkResult<RpcServer<S>> {
        let log = logging::child(log);
        let endpoint = Endpoint::listen(address, config.endpoint.clone(), &log)?;

        Ok(RpcServer {
            endpoint,
            server_id,
            grains: HashMap::new(),
            conns: HashMap::new(),
            subscriptions: HashMap::new(),
            draining: false,
            disconnects: Vec::new(),
            config,
            log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> NetworkResult<std::net::SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Declares a grain type with its interface id. Methods are attached separately.
    pub fn register_grain(&mut self, grain_type: &str, interface_id: u32) {
        self.grains.insert(interface_id, GrainDef {
            grain_type: grain_type.to_string(),
            methods: HashMap::new(),
        });
    }

    /// Attaches a request/response method to a registered interface.
    pub fn register_method(
        &mut self,
        interface_id: u32,
        method_id: u32,
        name: &'static str,
        policy: MethodPolicy,
        handler: Handler<S>,
    ) {
        self.attach(interface_id, method_id, MethodDef {
            name,
            policy,
            kind: MethodKind::Call { handler },
        });
    }

    /// Attaches a subscription factory method. A call creates a tagged subscription and
    /// returns its guid; the application feeds it through `subscriptions` + `notify`.
    pub fn register_stream(
        &mut self,
        interface_id: u32,
        method_id: u32,
        name: &'static str,
        policy: MethodPolicy,
        tag: &'static str,
    ) {
        self.attach(interface_id, method_id, MethodDef {
            name,
            policy,
            kind: MethodKind::Stream { tag },
        });
    }

    /// Attaches the unsubscribe counterpart.
    pub fn register_unsubscribe(
        &mut self,
        interface_id: u32,
        method_id: u32,
        name: &'static str,
        policy: MethodPolicy,
    ) {
        self.attach(interface_id, method_id, MethodDef {
            name,
            policy,
            kind: MethodKind::Unsubscribe,
        });
    }

    fn attach(&mut self, interface_id: u32, method_id: u32, def: MethodDef<S>) {
        self.grains
            .get_mut(&interface_id)
            .unwrap_or_else(|| panic!("Interface {} not registered", interface_id))
            .methods
            .insert(method_id, def);
    }

    /// Stops admitting new requests. In-flight work has already been answered synchronously,
    /// so draining only gates the door.
    pub fn begin_drain(&mut self) {
        self.draining = true;
        logging::info!(self.log, "draining"; "server_id" => &self.server_id);
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Connections dropped since the last call, with the player they carried.
    #[inline]
    pub fn take_disconnects(&mut self) -> Vec<(PeerId, Option<String>)> {
        std::mem::take(&mut self.disconnects)
    }

    /// Live subscriptions carrying the supplied tag.
    pub fn subscriptions(&self, tag: &str) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.tag == tag)
            .map(|(id, sub)| SubscriptionInfo {
                id: *id,
                peer: sub.peer,
                args: sub.args.clone(),
            })
            .collect()
    }

    /// Pushes one notification. Returns false when the subscription is gone or the peer's
    /// budget for this pump was exhausted (the frame is shed, not queued).
    pub fn notify(
        &mut self,
        subscription_id: Uuid,
        event_kind: u8,
        payload: Vec<u8>,
        delivery: Delivery,
        now: Instant,
    ) -> bool {
        let peer = match self.subscriptions.get(&subscription_id) {
            Some(sub) => sub.peer,
            None => return false,
        };

        let conn = match self.conns.get_mut(&peer) {
            Some(conn) => conn,
            None => return false,
        };

        if conn.notify_budget == 0 {
            logging::debug!(self.log, "observer backpressure, shedding notification";
                            "peer_id" => peer,
                            "subscription" => %subscription_id);
            return false;
        }
        conn.notify_budget -= 1;

        let message = RpcMessage::ObserverNotify(ObserverNotify {
            subscription_id,
            event_kind,
            payload,
        });

        let mut wire = Vec::new();
        if message.write(&mut wire).is_err() {
            return false;
        }

        // The unreliable lane is single-datagram; oversized notifications ride the reliable
        // lane, which fragments
        let delivery = match delivery {
            Delivery::Unreliable if wire.len() > crate::net::datagram::MAX_PAYLOAD_SIZE => {
                Delivery::Reliable
            }
            other => other,
        };

        self.endpoint.send(peer, &wire, delivery, now).is_ok()
    }

    /// Pumps the transport and dispatches everything that arrived. `state` is the application
    /// state threaded into method handlers.
    pub fn sync(&mut self, state: &mut S, now: Instant) {
        self.endpoint.sync(now);

        for change in self.endpoint.changes() {
            match change {
                ConnectionChange::Connected(peer) => {
                    self.conns.insert(peer, ConnInfo {
                        client_id: String::new(),
                        role: Role::Guest,
                        player_id: None,
                        player_name: None,
                        handshaken: false,
                        last_activity: now,
                        notify_budget: self.config.observer_high_water,
                    });
                }
                ConnectionChange::Disconnected(peer, reason) => {
                    if let Some(conn) = self.conns.remove(&peer) {
                        logging::debug!(self.log, "connection dropped";
                                        "client_id" => &conn.client_id,
                                        "reason" => ?reason);

                        self.disconnects.push((peer, conn.player_id));
                    }

                    self.subscriptions.retain(|_, sub| sub.peer != peer);
                }
            }
        }

        for (peer, payload, _) in self.endpoint.received() {
            let messages = match RpcMessage::read_all(&payload) {
                Ok(messages) => messages,
                Err(err) => {
                    logging::warn!(self.log, "malformed rpc payload"; "peer_id" => peer, "error" => ?err);
                    continue;
                }
            };

            for message in messages {
                self.on_message(state, peer, message, now);
            }
        }

        self.evict_idle_observers(now);

        // Refill notification budgets for the next pump window
        for conn in self.conns.values_mut() {
            conn.notify_budget = self.config.observer_high_water;
        }
    }

    fn on_message(&mut self, state: &mut S, peer: PeerId, message: RpcMessage, now: Instant) {
        if let Some(conn) = self.conns.get_mut(&peer) {
            conn.last_activity = now;
        }

        match message {
            RpcMessage::Handshake(handshake) => self.on_handshake(peer, handshake, now),
            RpcMessage::Request(request) => self.on_request(state, peer, request, now),
            RpcMessage::Heartbeat(_) => (),
            // Clients do not originate these
            RpcMessage::Manifest(_) | RpcMessage::Response(_) | RpcMessage::ObserverNotify(_) => (),
        }
    }

    fn on_handshake(&mut self, peer: PeerId, handshake: crate::rpc::message::Handshake, now: Instant) {
        let (role, player_id, player_name) = self.classify(&handshake.features);

        logging::info!(self.log, "caller admitted";
                       "client_id" => &handshake.client_id,
                       "protocol" => handshake.protocol_version,
                       "role" => ?role,
                       "player_id" => player_id.as_deref().unwrap_or("-"));

        if let Some(conn) = self.conns.get_mut(&peer) {
            conn.client_id = handshake.client_id;
            conn.role = role;
            conn.player_id = player_id;
            conn.player_name = player_name;
            conn.handshaken = true;
        }

        // The manifest must reach the client before any response does
        let manifest = RpcMessage::Manifest(self.build_manifest());
        self.transmit(peer, &manifest, now);
    }

    /// Derives the caller's role from handshake features: the raw cluster secret grants
    /// `Server`, a sealed session ticket carries its own role, everything else is `Guest`.
    fn classify(&self, features: &[String]) -> (Role, Option<String>, Option<String>) {
        let secret = match &self.config.cluster_secret {
            Some(secret) => secret,
            None => return (Role::Guest, None, None),
        };

        for feature in features {
            if let Some(encoded) = feature.strip_prefix("cluster=") {
                match base64::decode(encoded) {
                    Ok(offered) if crypto::constant_time_eq(&offered, &secret[..]) => {
                        return (Role::Server, None, None);
                    }
                    _ => {
                        logging::warn!(self.log, "cluster credential rejected";
                                       "offered_fp" => crypto::fingerprint(encoded.as_bytes()));
                    }
                }
            }

            if let Some(encoded) = feature.strip_prefix("ticket=") {
                let sealed = match base64::decode(encoded) {
                    Ok(sealed) => sealed,
                    Err(_) => continue,
                };

                match SessionTicket::open(&sealed, secret) {
                    Some(ticket) => {
                        logging::debug!(self.log, "ticket admitted";
                                        "player_id" => &ticket.player_id,
                                        "role" => ?ticket.role,
                                        "key_fp" => ticket.key.fingerprint());

                        return (ticket.role, Some(ticket.player_id), Some(ticket.player_name));
                    }
                    None => {
                        logging::warn!(self.log, "ticket rejected";
                                       "ticket_fp" => crypto::fingerprint(&sealed));
                    }
                }
            }
        }

        (Role::Guest, None, None)
    }

    fn on_request(&mut self, state: &mut S, peer: PeerId, request: Request, now: Instant) {
        let (ctx, outcome) = self.dispatch(state, peer, request, now);
        self.respond(peer, ctx, outcome, now);
    }

    fn dispatch(
        &mut self,
        state: &mut S,
        peer: PeerId,
        request: Request,
        now: Instant,
    ) -> (Response, Result<Vec<Value>, RpcError>) {
        let response_shell = Response {
            message_id: new_uuid(),
            request_id: request.message_id,
            result: Ok(Vec::new()),
        };

        let conn = match self.conns.get(&peer) {
            Some(conn) if conn.handshaken => conn,
            _ => return (response_shell, Err(RpcError::NotAuthorized)),
        };

        if self.draining {
            return (response_shell, Err(RpcError::Application("draining".into())));
        }

        let ctx = CallCtx {
            peer,
            client_id: conn.client_id.clone(),
            role: conn.role,
            player_id: conn.player_id.clone(),
            player_name: conn.player_name.clone(),
            message_id: request.message_id,
            grain_id: request.grain_id.clone(),
        };

        let grain = match self.grains.get_mut(&request.interface_id) {
            Some(grain) => grain,
            None => return (response_shell, Err(RpcError::UnknownGrain)),
        };

        let method = match grain.methods.get_mut(&request.method_id) {
            Some(method) => method,
            None => return (response_shell, Err(RpcError::UnknownMethod)),
        };

        // Authorization runs before argument decoding
        if !method.policy.allows(ctx.role) {
            logging::info!(self.log, "method denied";
                           "request_id" => %ctx.message_id,
                           "method" => method.name,
                           "client_id" => &ctx.client_id,
                           "role" => ?ctx.role);

            return (response_shell, Err(RpcError::NotAuthorized));
        }

        let args = match decode_args(&request.args) {
            Ok(args) => args,
            Err(err) => {
                logging::warn!(self.log, "argument decode failed";
                               "request_id" => %ctx.message_id,
                               "method" => method.name,
                               "error" => ?err);

                return (response_shell, Err(RpcError::ArgumentDecode));
            }
        };

        let outcome = match &mut method.kind {
            MethodKind::Call { handler } => handler(state, &ctx, args),
            MethodKind::Stream { tag } => {
                let tag = *tag;
                let id = new_uuid();

                self.subscriptions.insert(id, Subscription {
                    peer,
                    tag,
                    args,
                    created: now,
                });

                logging::debug!(self.log, "observer subscribed";
                                "request_id" => %ctx.message_id,
                                "stream" => tag,
                                "subscription" => %id);

                Ok(vec![Value::Guid(id)])
            }
            MethodKind::Unsubscribe => match args.first() {
                Some(Value::Guid(id)) => {
                    self.subscriptions.remove(id);
                    Ok(Vec::new())
                }
                _ => Err(RpcError::ArgumentDecode),
            },
        };

        (response_shell, outcome)
    }

    fn respond(&mut self, peer: PeerId, shell: Response, outcome: Result<Vec<Value>, RpcError>, now: Instant) {
        let result = match outcome {
            Ok(values) => Ok(encode_args(&values)),
            Err(error) => {
                let text = match &error {
                    RpcError::Application(text) => text.clone(),
                    other => other.to_string(),
                };
                Err((error.code(), text))
            }
        };

        let response = RpcMessage::Response(Response { result, ..shell });
        self.transmit(peer, &response, now);
    }

    fn build_manifest(&self) -> Manifest {
        let mut grains: Vec<GrainEntry> = self
            .grains
            .iter()
            .map(|(interface_id, grain)| {
                let mut method_ids: Vec<u32> = grain.methods.keys().copied().collect();
                method_ids.sort_unstable();

                GrainEntry {
                    grain_type: grain.grain_type.clone(),
                    interface_ids: vec![*interface_id],
                    method_ids,
                }
            })
            .collect();

        grains.sort_by(|a, b| a.grain_type.cmp(&b.grain_type));

        Manifest { grains }
    }

    fn evict_idle_observers(&mut self, now: Instant) {
        let idle_timeout = self.config.observer_idle_timeout;
        let conns = &self.conns;
        let log = &self.log;

        self.subscriptions.retain(|id, sub| {
            let idle = match conns.get(&sub.peer) {
                Some(conn) => now.duration_since(conn.last_activity),
                None => return false,
            };

            let keep = idle < idle_timeout || now.duration_since(sub.created) < idle_timeout;

            if !keep {
                logging::debug!(log, "observer evicted"; "subscription" => %id);
            }

            keep
        });
    }

    fn transmit(&mut self, peer: PeerId, message: &RpcMessage, now: Instant) {
        let mut wire = Vec::new();

        if message.write(&mut wire).is_ok() {
            let _ = self.endpoint.send(peer, &wire, Delivery::Reliable, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::{ClientState, RpcClient, RpcClientConfig};
    use std::thread;

    const ZONE_INTERFACE: u32 = 10;
    const METHOD_ECHO: u32 = 1;
    const METHOD_SECRET: u32 = 2;
    const METHOD_SUBSCRIBE: u32 = 3;
    const METHOD_UNSUBSCRIBE: u32 = 4;

    struct TestState {
        calls: usize,
    }

    fn server(secret: Option<SessionKey>) -> RpcServer<TestState> {
        let config = RpcServerConfig {
            cluster_secret: secret,
            ..RpcServerConfig::default()
        };

        let mut server =
            RpcServer::listen("127.0.0.1:0", "test-server".into(), config, None).unwrap();

        server.register_grain("zone", ZONE_INTERFACE);
        server.register_method(
            ZONE_INTERFACE,
            METHOD_ECHO,
            "Echo",
            MethodPolicy::AllowAnonymous,
            Box::new(|state: &mut TestState, _ctx, args| {
                state.calls += 1;
                Ok(args)
            }),
        );
        server.register_method(
            ZONE_INTERFACE,
            METHOD_SECRET,
            "ServerSecret",
            MethodPolicy::ServerOnly,
            Box::new(|_state, _ctx, _args| Ok(vec![Value::Str("classified".into())])),
        );
        server.register_stream(
            ZONE_INTERFACE,
            METHOD_SUBSCRIBE,
            "Subscribe",
            MethodPolicy::AllowAnonymous,
            "world",
        );
        server.register_unsubscribe(
            ZONE_INTERFACE,
            METHOD_UNSUBSCRIBE,
            "Unsubscribe",
            MethodPolicy::AllowAnonymous,
        );

        server
    }

    fn pump(client: &mut RpcClient, server: &mut RpcServer<TestState>, state: &mut TestState, rounds: usize) {
        for _ in 0..rounds {
            let now = Instant::now();
            client.sync(now);
            server.sync(state, now);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn ready_client(
        server: &mut RpcServer<TestState>,
        state: &mut TestState,
        features: Vec<String>,
    ) -> RpcClient {
        let mut client =
            RpcClient::new("tester".into(), features, RpcClientConfig::default(), None).unwrap();

        client.connect(server.local_addr().unwrap(), Instant::now());
        pump(&mut client, server, state, 20);

        assert_eq!(client.state(), ClientState::Ready);
        client
    }

    fn call(
        client: &mut RpcClient,
        server: &mut RpcServer<TestState>,
        state: &mut TestState,
        method_id: u32,
        args: &[Value],
    ) -> Result<Vec<Value>, RpcError> {
        let id = client
            .call("zone/0,0", ZONE_INTERFACE, method_id, args, Some(Duration::from_secs(2)), Instant::now())
            .unwrap();

        for _ in 0..200 {
            pump(client, server, state, 1);

            if let Some(result) = client.take_completion(id) {
                return result;
            }
        }

        panic!("Call never completed");
    }

    #[test]
    fn test_echo_roundtrip() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        let args = vec![Value::Str("ping".into()), Value::I32(7)];
        let result = call(&mut client, &mut server, &mut state, METHOD_ECHO, &args).unwrap();

        assert_eq!(result, args);
        assert_eq!(state.calls, 1);
    }

    #[test]
    fn test_manifest_arrives_before_ready() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let client = ready_client(&mut server, &mut state, Vec::new());

        let manifest = client.manifest().unwrap();
        assert!(manifest.resolves(ZONE_INTERFACE));
        assert_eq!(manifest.grains[0].grain_type, "zone");
    }

    #[test]
    fn test_guest_denied_on_server_only_method() {
        let mut state = TestState { calls: 0 };
        let secret = SessionKey::generate();
        let mut server = server(Some(secret));
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        let result = call(&mut client, &mut server, &mut state, METHOD_SECRET, &[]);

        assert_eq!(result.unwrap_err(), RpcError::NotAuthorized);
    }

    #[test]
    fn test_cluster_secret_grants_server_role() {
        let mut state = TestState { calls: 0 };
        let secret = SessionKey::generate();
        let mut server = server(Some(secret.clone()));

        let features = vec![format!("cluster={}", base64::encode(&secret[..]))];
        let mut client = ready_client(&mut server, &mut state, features);

        let result = call(&mut client, &mut server, &mut state, METHOD_SECRET, &[]).unwrap();

        assert_eq!(result, vec![Value::Str("classified".into())]);
    }

    #[test]
    fn test_ticket_grants_user_role() {
        let mut state = TestState { calls: 0 };
        let secret = SessionKey::generate();
        let mut server = server(Some(secret.clone()));

        let mut sessions = flint::session::SessionStore::new(3600);
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);
        let sealed = SessionTicket::from_session(&session).seal(&secret);

        let features = vec![format!("ticket={}", base64::encode(&sealed))];
        let mut client = ready_client(&mut server, &mut state, features);

        // User role clears ClientAccessible but not ServerOnly
        let result = call(&mut client, &mut server, &mut state, METHOD_SECRET, &[]);
        assert_eq!(result.unwrap_err(), RpcError::NotAuthorized);
    }

    #[test]
    fn test_unknown_grain_and_method() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        let id = client
            .call("nope", 999, 1, &[], Some(Duration::from_secs(2)), Instant::now())
            .unwrap();
        let mut outcome = None;
        for _ in 0..200 {
            pump(&mut client, &mut server, &mut state, 1);
            if let Some(result) = client.take_completion(id) {
                outcome = Some(result);
                break;
            }
        }
        assert_eq!(outcome.unwrap().unwrap_err(), RpcError::UnknownGrain);

        let result = call(&mut client, &mut server, &mut state, 99, &[]);
        assert_eq!(result.unwrap_err(), RpcError::UnknownMethod);
    }

    #[test]
    fn test_subscribe_notify_unsubscribe() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        let result = call(&mut client, &mut server, &mut state, METHOD_SUBSCRIBE, &[]).unwrap();
        let sub_id = match result[0] {
            Value::Guid(id) => id,
            _ => panic!("Expected subscription id"),
        };

        let subs = server.subscriptions("world");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, sub_id);

        assert!(server.notify(sub_id, 1, vec![9, 9], Delivery::Reliable, Instant::now()));
        pump(&mut client, &mut server, &mut state, 10);

        let notifications = client.take_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].subscription_id, sub_id);
        assert_eq!(notifications[0].payload, vec![9, 9]);

        call(&mut client, &mut server, &mut state, METHOD_UNSUBSCRIBE, &[Value::Guid(sub_id)]).unwrap();
        assert!(server.subscriptions("world").is_empty());
        assert!(!server.notify(sub_id, 1, Vec::new(), Delivery::Reliable, Instant::now()));
    }

    #[test]
    fn test_draining_rejects_new_requests() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        server.begin_drain();

        let result = call(&mut client, &mut server, &mut state, METHOD_ECHO, &[]);
        assert_eq!(result.unwrap_err(), RpcError::Application("draining".into()));
    }

    #[test]
    fn test_disconnect_fails_pending_calls() {
        let mut state = TestState { calls: 0 };
        let mut server = server(None);
        let mut client = ready_client(&mut server, &mut state, Vec::new());

        let id = client
            .call("zone/0,0", ZONE_INTERFACE, METHOD_ECHO, &[], Some(Duration::from_secs(30)), Instant::now())
            .unwrap();

        client.close(Instant::now());

        assert_eq!(client.take_completion(id), Some(Err(RpcError::Disconnected)));
    }
}
