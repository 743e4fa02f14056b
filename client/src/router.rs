use crate::health::HealthMonitor;
use flint::contract::{
    ActionServerInfo, PlayerInfo, TransferInfo, DIRECTORY_GRAIN, DIRECTORY_INTERFACE,
    DIR_CREATE_SESSION, DIR_GET_CLUSTER_INFO, DIR_GET_SERVER_FOR_POSITION, DIR_INITIATE_TRANSFER,
    DIR_REGISTER_PLAYER, ZONE_CONNECT_PLAYER, ZONE_DISCONNECT_PLAYER, ZONE_GET_WORLD_STATE,
    ZONE_INTERFACE, ZONE_UPDATE_INPUT_EX,
};
use flint::logging;
use flint::math::{GridSquare, Vec2};
use flint::session::Role;
use flint::PlayerId;
use photon::rpc::client::{ClientState, RpcClient, RpcClientConfig};
use photon::rpc::codec::Value;
use photon::rpc::RpcError;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use zonecore::entity::WorldState;

#[derive(Clone)]
pub struct RouterConfig {
    pub silo_address: String,
    /// Deadline for gameplay calls; directory calls share it.
    pub call_timeout: Duration,
    pub manifest_timeout: Duration,
    /// Transfer/discovery retry backoff: initial, doubling to the cap.
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// A transition outstanding this long logs `ZONE_MISMATCH_WARNING`.
    pub warn_after: Duration,
    /// A transition outstanding this long is aborted and discovery restarted.
    pub abort_after: Duration,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            silo_address: "127.0.0.1:27500".to_string(),
            call_timeout: Duration::from_secs(2),
            manifest_timeout: Duration::from_secs(2),
            retry_initial: Duration::from_millis(250),
            retry_max: Duration::from_secs(2),
            warn_after: Duration::from_secs(10),
            abort_after: Duration::from_secs(30),
        }
    }
}

struct ActiveServer {
    info: ActionServerInfo,
    client: RpcClient,
}

/// Drives the client's single live session: discovery, connection, mismatch detection and
/// the zone transition protocol. The holder calls `tick` at 10 Hz or better.
pub struct ClientRouter {
    config: RouterConfig,
    zone_side: f32,

    player_id: PlayerId,
    ticket_features: Vec<String>,

    silo: RpcClient,
    active: Option<ActiveServer>,

    position: Vec2,

    transition_started: Option<Instant>,
    next_attempt: Instant,
    backoff: Duration,
    warned: bool,

    warnings: u64,
    aborts: u64,

    health: HealthMonitor,
    log: logging::Logger,
}

impl ClientRouter {
    /// Full login flow: anonymous session issuance at the silo, ticketed reconnect, player
    /// registration. The returned router starts at the directory-assigned position,
    /// disconnected from any action server.
    pub fn login<'a, L: Into<Option<&'a logging::Logger>>>(
        player_name: &str,
        config: RouterConfig,
        log: L,
    ) -> Result<ClientRouter, RpcError> {
        let log = logging::child(log);
        let silo_addr: SocketAddr = config
            .silo_address
            .parse()
            .map_err(|_| RpcError::Application("bad silo address".into()))?;

        // Anonymous hello to mint the session
        let mut anon = Self::fresh_client(&format!("login-{}", player_name), Vec::new(), &config, &log)?;
        anon.connect(silo_addr, Instant::now());
        anon.wait_for_manifest(config.manifest_timeout)?;

        let reply = anon.call_blocking(
            DIRECTORY_GRAIN,
            DIRECTORY_INTERFACE,
            DIR_CREATE_SESSION,
            &[
                Value::Str(player_name.to_string()),
                Value::I32(Role::User as i32),
                Value::I32(-1),
            ],
            config.call_timeout,
        )?;
        anon.close(Instant::now());

        let player_id = match reply.first() {
            Some(Value::Str(id)) => id.clone(),
            _ => return Err(RpcError::ArgumentDecode),
        };
        let ticket = match reply.get(1) {
            Some(Value::Blob(ticket)) => ticket.clone(),
            _ => return Err(RpcError::ArgumentDecode),
        };

        let ticket_features = vec![format!("ticket={}", base64::encode(&ticket))];

        // Ticketed directory connection used for routing from here on
        let mut silo =
            Self::fresh_client(&format!("client-{}", player_id), ticket_features.clone(), &config, &log)?;
        silo.connect(silo_addr, Instant::now());
        silo.wait_for_manifest(config.manifest_timeout)?;

        let cluster = silo.call_blocking(
            DIRECTORY_GRAIN,
            DIRECTORY_INTERFACE,
            DIR_GET_CLUSTER_INFO,
            &[],
            config.call_timeout,
        )?;
        let zone_side = match cluster.first() {
            Some(Value::F64(side)) => *side as f32,
            _ => return Err(RpcError::ArgumentDecode),
        };

        let registered = silo.call_blocking(
            DIRECTORY_GRAIN,
            DIRECTORY_INTERFACE,
            DIR_REGISTER_PLAYER,
            &[Value::Str(player_id.clone()), Value::Str(player_name.to_string())],
            config.call_timeout,
        )?;
        let player: PlayerInfo = decode_blob(&registered)?;

        logging::info!(log, "logged in";
                       "player_id" => &player_id,
                       "start_x" => player.position.x,
                       "start_y" => player.position.y,
                       "zone" => ?player.current_zone);

        Ok(ClientRouter {
            zone_side,
            player_id,
            ticket_features,
            silo,
            active: None,
            position: player.position,
            transition_started: None,
            next_attempt: Instant::now(),
            backoff: config.retry_initial,
            warned: false,
            warnings: 0,
            aborts: 0,
            health: HealthMonitor::new(config.warn_after, &log),
            config,
            log,
        })
    }

    #[inline]
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    #[inline]
    pub fn position(&self) -> Vec2 {
        self.position
    }

    /// The client is authoritative for its own position between server corrections.
    #[inline]
    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
    }

    #[inline]
    pub fn own_zone(&self) -> GridSquare {
        GridSquare::containing(self.position, self.zone_side)
    }

    #[inline]
    pub fn connected_zone(&self) -> Option<GridSquare> {
        self.active.as_ref().map(|active| active.info.assigned_square)
    }

    #[inline]
    pub fn active_server_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.info.server_id.as_str())
    }

    #[inline]
    pub fn is_transitioning(&self) -> bool {
        self.transition_started.is_some()
    }

    #[inline]
    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    #[inline]
    pub fn aborts(&self) -> u64 {
        self.aborts
    }

    /// One router step: pump transports, detect mismatch, drive discovery or transition.
    pub fn tick(&mut self, now: Instant) {
        self.silo.sync(now);

        // A lost transport re-enters discovery on the next step
        let lost = match &mut self.active {
            Some(active) => {
                active.client.sync(now);
                matches!(active.client.state(), ClientState::Idle | ClientState::Closed)
            }
            None => false,
        };

        if lost {
            logging::warn!(self.log, "action server connection lost"; "player_id" => &self.player_id);
            self.active = None;
            self.transition_started = None;
            self.reset_backoff(now);
        }

        let own_zone = self.own_zone();
        self.health.observe(self.connected_zone(), own_zone, now);

        match self.connected_zone() {
            None => {
                if now >= self.next_attempt {
                    self.discover(now);
                }
            }
            Some(connected) if connected != own_zone => {
                if self.transition_started.is_none() {
                    self.transition_started = Some(now);
                    self.warned = false;
                    self.reset_backoff(now);

                    logging::debug!(self.log, "transition started";
                                    "from" => ?connected,
                                    "to" => ?own_zone);
                }

                self.drive_transition(now);
            }
            Some(_) => {
                self.transition_started = None;
            }
        }
    }

    /// Latches input on the active server, fire-and-forget.
    pub fn send_input(&mut self, move_dir: Option<Vec2>, shoot_dir: Option<Vec2>, now: Instant) {
        let player_id = self.player_id.clone();

        if let Some(active) = &mut self.active {
            let grain_id = grain_id(active.info.assigned_square);

            let _ = active.client.call(
                &grain_id,
                ZONE_INTERFACE,
                ZONE_UPDATE_INPUT_EX,
                &[
                    Value::Str(player_id),
                    Value::OptVec2(move_dir),
                    Value::OptVec2(shoot_dir),
                ],
                Some(Duration::from_secs(2)),
                now,
            );

            active.client.take_all_completions();
        }
    }

    /// Fetches the active zone's world state. `None` while disconnected or on call failure.
    pub fn world_state(&mut self) -> Option<WorldState> {
        let grain_id = grain_id(self.active.as_ref()?.info.assigned_square);
        let timeout = self.config.call_timeout;

        let active = self.active.as_mut()?;
        let reply = active
            .client
            .call_blocking(&grain_id, ZONE_INTERFACE, ZONE_GET_WORLD_STATE, &[], timeout)
            .ok()?;

        match reply.first() {
            Some(Value::Blob(blob)) => WorldState::read(blob),
            _ => None,
        }
    }

    fn discover(&mut self, now: Instant) {
        self.bump_backoff(now);

        let reply = self.silo.call_blocking(
            DIRECTORY_GRAIN,
            DIRECTORY_INTERFACE,
            DIR_GET_SERVER_FOR_POSITION,
            &[Value::Vec2(self.position)],
            self.config.call_timeout,
        );

        let target: Option<ActionServerInfo> = match reply.and_then(|values| decode_blob(&values)) {
            Ok(target) => target,
            Err(err) => {
                logging::warn!(self.log, "discovery failed"; "error" => %err);
                return;
            }
        };

        let target = match target {
            Some(target) => target,
            None => {
                logging::debug!(self.log, "no owner for current position"; "zone" => ?self.own_zone());
                return;
            }
        };

        match self.open_session(&target, now) {
            Ok(active) => {
                logging::info!(self.log, "connected";
                               "server_id" => &active.info.server_id,
                               "zone" => ?active.info.assigned_square);

                self.active = Some(active);
                self.reset_backoff(now);
            }
            Err(err) => {
                logging::warn!(self.log, "connect failed"; "server_id" => &target.server_id, "error" => %err);
            }
        }
    }

    fn drive_transition(&mut self, now: Instant) {
        let started = match self.transition_started {
            Some(started) => started,
            None => return,
        };
        let elapsed = now.duration_since(started);

        if elapsed >= self.config.warn_after && !self.warned {
            self.warned = true;
            self.warnings += 1;

            logging::warn!(self.log, "ZONE_MISMATCH_WARNING";
                           "player_id" => &self.player_id,
                           "seconds" => elapsed.as_secs());
        }

        if elapsed >= self.config.abort_after {
            self.aborts += 1;

            logging::error!(self.log, "PROLONGED_MISMATCH_ABORT";
                            "player_id" => &self.player_id,
                            "seconds" => elapsed.as_secs());

            if let Some(mut active) = self.active.take() {
                active.client.close(now);
            }

            self.transition_started = None;
            self.reset_backoff(now);
            return;
        }

        if now < self.next_attempt {
            return;
        }
        self.bump_backoff(now);

        let reply = self.silo.call_blocking(
            DIRECTORY_GRAIN,
            DIRECTORY_INTERFACE,
            DIR_INITIATE_TRANSFER,
            &[Value::Str(self.player_id.clone()), Value::Vec2(self.position)],
            self.config.call_timeout,
        );

        let transfer: Option<TransferInfo> = match reply.and_then(|values| decode_blob(&values)) {
            Ok(transfer) => transfer,
            Err(err) => {
                logging::warn!(self.log, "transfer initiation failed"; "error" => %err);
                return;
            }
        };

        let transfer = match transfer {
            // No nomination: stay on the current server, retry with backoff
            None => return,
            Some(transfer) => transfer,
        };

        match self.open_session(&transfer.target, now) {
            Ok(new_active) => {
                // Swap is atomic from the caller's view: inputs only ever go to `active`
                let old = self.active.replace(new_active);
                self.transition_started = None;
                self.reset_backoff(now);

                logging::info!(self.log, "transition committed";
                               "player_id" => &self.player_id,
                               "server_id" => &transfer.target.server_id,
                               "zone" => ?transfer.target.assigned_square);

                if let Some(mut old) = old {
                    let grain_id = grain_id(old.info.assigned_square);
                    let _ = old.client.call(
                        &grain_id,
                        ZONE_INTERFACE,
                        ZONE_DISCONNECT_PLAYER,
                        &[Value::Str(self.player_id.clone())],
                        Some(Duration::from_millis(500)),
                        now,
                    );
                    old.client.sync(now);
                    old.client.close(now);
                }
            }
            Err(err) => {
                logging::warn!(self.log, "transition connect failed";
                               "server_id" => &transfer.target.server_id,
                               "error" => %err);
            }
        }
    }

    /// Opens a transport to an action server and admits the player on it.
    fn open_session(&mut self, info: &ActionServerInfo, now: Instant) -> Result<ActiveServer, RpcError> {
        let mut client = Self::fresh_client(
            &format!("client-{}", self.player_id),
            self.ticket_features.clone(),
            &self.config,
            &self.log,
        )?;

        let remote: SocketAddr = info
            .rpc_addr()
            .parse()
            .map_err(|_| RpcError::Application("bad server address".into()))?;

        client.connect(remote, now);
        client.wait_for_manifest(self.config.manifest_timeout)?;

        let reply = client.call_blocking(
            &grain_id(info.assigned_square),
            ZONE_INTERFACE,
            ZONE_CONNECT_PLAYER,
            &[Value::Str(self.player_id.clone())],
            self.config.call_timeout,
        )?;

        match reply.first() {
            Some(Value::Str(text)) if text == "SUCCESS" => Ok(ActiveServer {
                info: info.clone(),
                client,
            }),
            Some(Value::Str(text)) => Err(RpcError::Application(text.clone())),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    fn fresh_client(
        client_id: &str,
        features: Vec<String>,
        config: &RouterConfig,
        log: &logging::Logger,
    ) -> Result<RpcClient, RpcError> {
        RpcClient::new(
            client_id.to_string(),
            features,
            RpcClientConfig {
                default_timeout: config.call_timeout,
                ..RpcClientConfig::default()
            },
            log,
        )
        .map_err(|_| RpcError::Disconnected)
    }

    #[inline]
    fn reset_backoff(&mut self, now: Instant) {
        self.backoff = self.config.retry_initial;
        self.next_attempt = now;
    }

    #[inline]
    fn bump_backoff(&mut self, now: Instant) {
        self.next_attempt = now + self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.retry_max);
    }
}

fn grain_id(square: GridSquare) -> String {
    format!("zone/{},{}", square.x, square.y)
}

fn decode_blob<T: serde::de::DeserializeOwned>(values: &[Value]) -> Result<T, RpcError> {
    match values.first() {
        Some(Value::Blob(blob)) => serde_json::from_slice(blob).map_err(|_| RpcError::ArgumentDecode),
        _ => Err(RpcError::ArgumentDecode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::contract::DIR_REGISTER_ACTION_SERVER;
    use flint::session::SessionKey;
    use photon::rpc::server::{RpcServer, RpcServerConfig};
    use silo::config::SiloConfig;
    use silo::grain::register_directory_grain;
    use silo::state::SiloState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use zonecore::config::GameConfig;
    use zonecore::grain::{register_zone_grain, ZoneServerState};
    use zonecore::sim;
    use zonecore::world::ZoneWorld;

    /// Pumps a server on a background thread until the stop flag flips.
    fn pump_forever<S: Send + 'static>(
        mut server: RpcServer<S>,
        mut state: S,
        stop: Arc<AtomicBool>,
    ) {
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                server.sync(&mut state, Instant::now());
                thread::sleep(Duration::from_millis(2));
            }
        });
    }

    struct Cluster {
        secret: SessionKey,
        silo_addr: String,
        stop: Arc<AtomicBool>,
        ops: RpcClient,
    }

    impl Cluster {
        /// Boots an in-process silo and returns an ops client holding the cluster secret.
        fn boot() -> Cluster {
            let secret = SessionKey::generate();
            let stop = Arc::new(AtomicBool::new(false));

            let mut config = SiloConfig::default();
            config.cluster.secret = secret.clone();
            // Keep durable state out of the repo during tests
            config.storage.data_dir = std::env::temp_dir()
                .join(format!("router-test-{}-{:p}", std::process::id(), &stop))
                .to_str()
                .unwrap()
                .to_string();

            let server_config = RpcServerConfig {
                cluster_secret: Some(secret.clone()),
                ..RpcServerConfig::default()
            };

            let mut server: RpcServer<SiloState> =
                RpcServer::listen("127.0.0.1:0", "silo-test".into(), server_config, None).unwrap();
            register_directory_grain(&mut server);

            let silo_addr = server.local_addr().unwrap().to_string();
            let state = SiloState::new(config, None);

            pump_forever(server, state, stop.clone());

            let mut ops = RpcClient::new(
                "ops".into(),
                vec![format!("cluster={}", base64::encode(&secret[..]))],
                RpcClientConfig::default(),
                None,
            )
            .unwrap();
            ops.connect(silo_addr.parse().unwrap(), Instant::now());
            ops.wait_for_manifest(Duration::from_secs(5)).unwrap();

            Cluster {
                secret,
                silo_addr,
                stop,
                ops,
            }
        }

        /// Boots a zone server and registers it with the directory.
        fn spawn_zone(&mut self, server_id: &str, square_hint: &str) -> u16 {
            let config = GameConfig::default();

            let server_config = RpcServerConfig {
                cluster_secret: Some(self.secret.clone()),
                ..RpcServerConfig::default()
            };

            let mut server: RpcServer<ZoneServerState> =
                RpcServer::listen("127.0.0.1:0", server_id.into(), server_config, None).unwrap();
            register_zone_grain(&mut server);

            let port = server.local_addr().unwrap().port();

            let info: flint::contract::ActionServerInfo = {
                let reply = self
                    .ops
                    .call_blocking(
                        DIRECTORY_GRAIN,
                        DIRECTORY_INTERFACE,
                        DIR_REGISTER_ACTION_SERVER,
                        &[
                            Value::Str(server_id.into()),
                            Value::Str("127.0.0.1".into()),
                            Value::I32(port as i32),
                            Value::I32((port + 1) as i32),
                        ],
                        Duration::from_secs(5),
                    )
                    .unwrap();
                decode_blob(&reply).unwrap()
            };

            // Guard against surprises in assignment order
            assert_eq!(
                format!("{},{}", info.assigned_square.x, info.assigned_square.y),
                square_hint
            );

            let world = ZoneWorld::new(info.assigned_square, config.zone.clone(), None);
            let state = ZoneServerState {
                sim: sim::spawn(world, None),
                square: info.assigned_square,
                zone: config.zone,
                draining: false,
                adjacent: zonecore::entity::WorldState::default(),
            };

            pump_forever(server, state, self.stop.clone());

            port
        }

        fn router_config(&self) -> RouterConfig {
            RouterConfig {
                silo_address: self.silo_addr.clone(),
                ..RouterConfig::default()
            }
        }
    }

    impl Drop for Cluster {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn tick_until<F: FnMut(&ClientRouter) -> bool>(
        router: &mut ClientRouter,
        mut done: F,
        limit: Duration,
    ) -> bool {
        let deadline = Instant::now() + limit;

        while Instant::now() < deadline {
            router.tick(Instant::now());

            if done(router) {
                return true;
            }

            thread::sleep(Duration::from_millis(20));
        }

        false
    }

    #[test]
    fn test_login_discovery_and_connect() {
        let mut cluster = Cluster::boot();
        cluster.spawn_zone("A", "0,0");

        let mut router = ClientRouter::login("Alice", cluster.router_config(), None).unwrap();

        // Only zone (0,0) is owned, so the spawn landed there
        router.set_position(Vec2::new(250.0, 250.0));

        let connected = tick_until(
            &mut router,
            |router| router.active_server_id() == Some("A"),
            Duration::from_secs(10),
        );

        assert!(connected);
        assert_eq!(router.connected_zone(), Some(GridSquare::new(0, 0)));

        // The simulation materializes the player entity within a few ticks
        let mut appeared = false;
        for _ in 0..50 {
            thread::sleep(Duration::from_millis(10));

            let player_id = router.player_id().to_string();
            if let Some(state) = router.world_state() {
                if state.entities.iter().any(|entity| entity.entity_id == player_id) {
                    appeared = true;
                    break;
                }
            }
        }

        assert!(appeared);
    }

    #[test]
    fn test_transition_at_zone_boundary() {
        let mut cluster = Cluster::boot();
        cluster.spawn_zone("A", "0,0");

        let mut router = ClientRouter::login("Bob", cluster.router_config(), None).unwrap();
        router.set_position(Vec2::new(499.0, 250.0));

        assert!(tick_until(
            &mut router,
            |router| router.active_server_id() == Some("A"),
            Duration::from_secs(10),
        ));

        // A second server comes up and takes (1,0); the player walks across
        cluster.spawn_zone("B", "1,0");
        router.set_position(Vec2::new(501.0, 250.0));

        let swapped = tick_until(
            &mut router,
            |router| router.active_server_id() == Some("B"),
            Duration::from_secs(15),
        );

        assert!(swapped);
        assert_eq!(router.connected_zone(), Some(GridSquare::new(1, 0)));
        assert!(!router.is_transitioning());

        // The new owner simulates the player now
        thread::sleep(Duration::from_millis(100));
        let state = router.world_state().unwrap();
        assert!(state
            .entities
            .iter()
            .any(|entity| entity.entity_id == router.player_id()));
    }

    #[test]
    fn test_unowned_target_zone_warns_then_aborts() {
        let mut cluster = Cluster::boot();
        cluster.spawn_zone("A", "0,0");

        let mut config = cluster.router_config();
        config.warn_after = Duration::from_millis(300);
        config.abort_after = Duration::from_millis(900);

        let mut router = ClientRouter::login("Carol", config, None).unwrap();
        router.set_position(Vec2::new(499.0, 250.0));

        assert!(tick_until(
            &mut router,
            |router| router.active_server_id() == Some("A"),
            Duration::from_secs(10),
        ));

        // Nobody owns (1,0): the transition cannot complete
        router.set_position(Vec2::new(501.0, 250.0));

        let aborted = tick_until(
            &mut router,
            |router| router.aborts() > 0,
            Duration::from_secs(10),
        );

        assert!(aborted);
        assert!(router.warnings() > 0);
        // Post-abort the router is rediscovering, not wedged on the old server
        assert!(router.active_server_id().is_none() || router.is_transitioning());
    }
}
