//! Cross-zone fabric: server-to-server RPC links to the owners of the eight adjacent squares.
//! Ships bullet trajectory handoffs, entity forwards, destruction notices and scout alerts,
//! and aggregates neighbor world state for the renderer's adjacent query.

use crate::entity::WorldState;
use crate::world::OutEvent;
use flint::contract::{self, ActionServerInfo};
use flint::logging;
use flint::math::GridSquare;
use flint::session::SessionKey;
use flint::ServerId;
use hashbrown::HashMap;
use photon::rpc::client::{RpcClient, RpcClientConfig};
use photon::rpc::codec::Value;
use photon::rpc::RpcError;
use std::time::{Duration, Instant};
use uuid::Uuid;

const ADJACENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ADJACENT_QUERY_TIMEOUT: Duration = Duration::from_millis(200);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

struct AdjacentQuery {
    square: GridSquare,
    server_id: ServerId,
    call: Uuid,
}

pub struct Fabric {
    own_square: GridSquare,
    cluster_feature: String,

    neighbors: HashMap<GridSquare, ActionServerInfo>,
    links: HashMap<ServerId, RpcClient>,

    pending: Vec<AdjacentQuery>,
    adjacent: HashMap<GridSquare, WorldState>,
    poll_at: Instant,

    log: logging::Logger,
}

impl Fabric {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        own_square: GridSquare,
        secret: &SessionKey,
        log: L,
    ) -> Fabric {
        Fabric {
            own_square,
            cluster_feature: format!("cluster={}", base64::encode(&secret[..])),
            neighbors: HashMap::new(),
            links: HashMap::new(),
            pending: Vec::new(),
            adjacent: HashMap::new(),
            poll_at: Instant::now(),
            log: logging::child(log),
        }
    }

    /// Adopts a fresh fleet view from the directory: keeps links to live adjacent owners,
    /// drops everything else.
    pub fn update_topology(&mut self, servers: &[ActionServerInfo], now: Instant) {
        self.neighbors.clear();

        for server in servers {
            if self.own_square.is_adjacent(server.assigned_square) {
                self.neighbors.insert(server.assigned_square, server.clone());
            }
        }

        let keep: Vec<ServerId> = self.neighbors.values().map(|info| info.server_id.clone()).collect();

        let gone: Vec<ServerId> = self
            .links
            .keys()
            .filter(|server_id| !keep.contains(server_id))
            .cloned()
            .collect();

        for server_id in gone {
            if let Some(mut link) = self.links.remove(&server_id) {
                link.close(now);
            }
        }

        // Failures yield empty lists for missing neighbors, never a hard error
        let neighbors = &self.neighbors;
        self.adjacent.retain(|square, _| neighbors.contains_key(square));
    }

    /// Ships cross-zone effects to the relevant neighbors, best-effort. Position reports are
    /// not fabric traffic; they are handed back for the directory feed.
    pub fn dispatch(&mut self, events: Vec<OutEvent>, now: Instant) -> Vec<OutEvent> {
        let mut reports = Vec::new();

        for event in events {
            match event {
                OutEvent::PositionReport { .. } => reports.push(event),
                OutEvent::ForwardEntity { to, entity } => {
                    self.fire(
                        to,
                        contract::ZONE_TRANSFER_ENTITY_IN,
                        vec![
                            Value::Str(entity.entity_id),
                            Value::I32(entity.kind as i32),
                            Value::I32(entity.sub_type as i32),
                            Value::Vec2(entity.position),
                            Value::Vec2(entity.velocity),
                            Value::F64(entity.health as f64),
                        ],
                        now,
                    );
                }
                OutEvent::ForwardBullet {
                    to,
                    bullet_id,
                    sub_type,
                    params,
                    owner,
                    team,
                } => {
                    self.fire(
                        to,
                        contract::ZONE_TRANSFER_BULLET,
                        vec![
                            Value::Str(bullet_id),
                            Value::I32(sub_type as i32),
                            Value::Vec2(params.origin),
                            Value::Vec2(params.velocity),
                            Value::F64(params.spawn_time),
                            Value::F64(params.lifespan as f64),
                            Value::Str(owner.unwrap_or_default()),
                            Value::I32(team as i32),
                        ],
                        now,
                    );
                }
                OutEvent::BulletDestroyed { to, bullet_id } => {
                    self.fire(
                        to,
                        contract::ZONE_NOTIFY_BULLET_DESTROYED,
                        vec![Value::Str(bullet_id)],
                        now,
                    );
                }
                OutEvent::ScoutAlert { to, zone, position } => {
                    self.fire(
                        to,
                        contract::ZONE_RECEIVE_SCOUT_ALERT,
                        vec![Value::I32(zone.x), Value::I32(zone.y), Value::Vec2(position)],
                        now,
                    );
                }
            }
        }

        reports
    }

    /// Pumps every link, harvests adjacent query replies and starts the next poll round.
    pub fn sync(&mut self, now: Instant) {
        for link in self.links.values_mut() {
            link.sync(now);
            link.take_notifications();
        }

        let mut still_pending = Vec::new();
        for query in self.pending.drain(..) {
            let link = match self.links.get_mut(&query.server_id) {
                Some(link) => link,
                None => continue,
            };

            match link.take_completion(query.call) {
                Some(Ok(values)) => {
                    let state = match values.first() {
                        Some(Value::Blob(blob)) => WorldState::read(blob),
                        _ => None,
                    };

                    match state {
                        Some(state) => {
                            self.adjacent.insert(query.square, state);
                        }
                        None => {
                            self.adjacent.remove(&query.square);
                        }
                    }
                }
                Some(Err(_)) => {
                    // Missing neighbor data renders as an empty zone
                    self.adjacent.remove(&query.square);
                }
                None => still_pending.push(query),
            }
        }
        self.pending = still_pending;

        // Drop leftover fire-and-forget completions
        for link in self.links.values_mut() {
            link.take_all_completions();
        }

        if now >= self.poll_at {
            self.poll_at = now + ADJACENT_POLL_INTERVAL;
            self.poll_adjacent(now);
        }
    }

    /// Merged view of every cached neighbor zone.
    pub fn adjacent_entities(&self) -> WorldState {
        let mut merged = WorldState::default();

        for state in self.adjacent.values() {
            merged.timestamp_ms = merged.timestamp_ms.max(state.timestamp_ms);
            merged.entities.extend(state.entities.iter().cloned());
        }

        merged
    }

    #[inline]
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    fn poll_adjacent(&mut self, now: Instant) {
        // One outstanding query per neighbor
        let busy: Vec<GridSquare> = self.pending.iter().map(|query| query.square).collect();

        let targets: Vec<(GridSquare, ServerId)> = self
            .neighbors
            .values()
            .filter(|info| !busy.contains(&info.assigned_square))
            .map(|info| (info.assigned_square, info.server_id.clone()))
            .collect();

        for (square, server_id) in targets {
            let grain_id = Self::grain_id(square);

            let call = match self.link_for(square, now) {
                Some(link) => link.call(
                    &grain_id,
                    contract::ZONE_INTERFACE,
                    contract::ZONE_GET_LOCAL_WORLD_STATE,
                    &[],
                    Some(ADJACENT_QUERY_TIMEOUT),
                    now,
                ),
                None => continue,
            };

            match call {
                Ok(call) => self.pending.push(AdjacentQuery {
                    square,
                    server_id: server_id.clone(),
                    call,
                }),
                Err(RpcError::Disconnected) => {
                    self.adjacent.remove(&square);
                }
                Err(_) => (),
            }
        }
    }

    /// Fires a method at a neighbor's zone grain without waiting for the completion.
    fn fire(&mut self, to: GridSquare, method_id: u32, args: Vec<Value>, now: Instant) {
        let grain_id = Self::grain_id(to);

        match self.link_for(to, now) {
            Some(link) => {
                if let Err(err) = link.call(
                    &grain_id,
                    contract::ZONE_INTERFACE,
                    method_id,
                    &args,
                    Some(FORWARD_TIMEOUT),
                    now,
                ) {
                    logging::debug!(self.log, "cross-zone send failed";
                                    "to" => ?to,
                                    "method" => method_id,
                                    "error" => %err);
                }
            }
            None => {
                logging::trace!(self.log, "no owner for cross-zone event"; "to" => ?to);
            }
        }
    }

    /// Resolves (and lazily connects) the link for a neighbor square.
    fn link_for(&mut self, square: GridSquare, now: Instant) -> Option<&mut RpcClient> {
        let info = self.neighbors.get(&square)?.clone();

        if !self.links.contains_key(&info.server_id) {
            let config = RpcClientConfig {
                default_timeout: FORWARD_TIMEOUT,
                ..RpcClientConfig::default()
            };

            let client = RpcClient::new(
                format!("fabric-{},{}", self.own_square.x, self.own_square.y),
                vec![self.cluster_feature.clone()],
                config,
                &self.log,
            );

            match client {
                Ok(mut client) => {
                    if let Ok(remote) = info.rpc_addr().parse() {
                        client.connect(remote, now);
                    }
                    self.links.insert(info.server_id.clone(), client);
                }
                Err(_) => return None,
            }
        }

        let link = self.links.get_mut(&info.server_id)?;

        // Reconnect links that lost their transport
        match link.state() {
            photon::rpc::client::ClientState::Idle | photon::rpc::client::ClientState::Closed => {
                if let Ok(remote) = info.rpc_addr().parse() {
                    link.connect(remote, now);
                }
            }
            _ => (),
        }

        Some(link)
    }

    fn grain_id(square: GridSquare) -> String {
        format!("zone/{},{}", square.x, square.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flint::contract::ServerStatus;

    fn server_info(server_id: &str, square: GridSquare) -> ActionServerInfo {
        ActionServerInfo {
            server_id: server_id.into(),
            address: "127.0.0.1".into(),
            rpc_port: 29000,
            http_port: 29080,
            assigned_square: square,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: ServerStatus::Ready,
        }
    }

    #[test]
    fn test_topology_keeps_only_adjacent_owners() {
        let secret = SessionKey::generate();
        let mut fabric = Fabric::new(GridSquare::new(1, 1), &secret, None);

        let servers = vec![
            server_info("self", GridSquare::new(1, 1)),
            server_info("west", GridSquare::new(0, 1)),
            server_info("far", GridSquare::new(5, 5)),
        ];

        fabric.update_topology(&servers, Instant::now());

        assert_eq!(fabric.neighbor_count(), 1);
    }

    #[test]
    fn test_dispatch_returns_position_reports() {
        let secret = SessionKey::generate();
        let mut fabric = Fabric::new(GridSquare::new(0, 0), &secret, None);

        let events = vec![
            OutEvent::PositionReport {
                player_id: "p1".into(),
                position: flint::math::Vec2::new(1.0, 2.0),
                velocity: flint::math::Vec2::ZERO,
            },
            OutEvent::ScoutAlert {
                to: GridSquare::new(1, 0),
                zone: GridSquare::new(0, 0),
                position: flint::math::Vec2::ZERO,
            },
        ];

        // No neighbors: the scout alert is dropped silently, the report comes back
        let reports = fabric.dispatch(events, Instant::now());

        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], OutEvent::PositionReport { .. }));
    }

    #[test]
    fn test_adjacent_entities_merge() {
        let secret = SessionKey::generate();
        let mut fabric = Fabric::new(GridSquare::new(0, 0), &secret, None);

        fabric.adjacent.insert(GridSquare::new(1, 0), WorldState {
            timestamp_ms: 10,
            entities: Vec::new(),
        });
        fabric.adjacent.insert(GridSquare::new(0, 1), WorldState {
            timestamp_ms: 20,
            entities: Vec::new(),
        });

        assert_eq!(fabric.adjacent_entities().timestamp_ms, 20);
    }
}
