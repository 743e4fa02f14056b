use chrono::{Duration, Utc};
use flint::contract::{ActionServerInfo, PlayerInfo, ServerStatus, TransferInfo, ZoneStats};
use flint::logging;
use flint::math::{GridSquare, Vec2};
use flint::{crypto, PlayerId, ServerId};
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    servers: HashMap<ServerId, ActionServerInfo>,
    players: HashMap<PlayerId, PlayerInfo>,
}

/// The zone directory: single logical writer for the grid-to-server map and the player
/// registry. The owning service loop is the only mutator; RPC readers receive clones.
pub struct Directory {
    servers: HashMap<ServerId, ActionServerInfo>,
    players: HashMap<PlayerId, PlayerInfo>,

    zone_side: f32,
    evict_after: Duration,

    dirty: bool,
    log: logging::Logger,
}

impl Directory {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        zone_side: f32,
        evict_after_secs: u64,
        log: L,
    ) -> Directory {
        Directory {
            servers: HashMap::new(),
            players: HashMap::new(),
            zone_side,
            evict_after: Duration::seconds(evict_after_secs as i64),
            dirty: false,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn zone_side(&self) -> f32 {
        self.zone_side
    }

    /// Registers an action server, assigning the next free square in row-major `(y, x)` order
    /// over the smallest grid that fits the fleet. Idempotent: a live server re-registering
    /// keeps its assignment.
    pub fn register_action_server(
        &mut self,
        server_id: &str,
        address: &str,
        rpc_port: u16,
        http_port: u16,
    ) -> ActionServerInfo {
        let now = Utc::now();

        if let Some(existing) = self.servers.get_mut(server_id) {
            if existing.status.owns_zone() {
                existing.last_heartbeat = now;
                existing.address = address.to_string();
                existing.rpc_port = rpc_port;
                existing.http_port = http_port;

                logging::debug!(self.log, "re-registration";
                                "server_id" => server_id,
                                "square" => ?existing.assigned_square);

                return existing.clone();
            }
        }

        let assigned_square = self.next_square();

        let info = ActionServerInfo {
            server_id: server_id.to_string(),
            address: address.to_string(),
            rpc_port,
            http_port,
            assigned_square,
            registered_at: now,
            last_heartbeat: now,
            status: ServerStatus::Ready,
        };

        logging::info!(self.log, "action server registered";
                       "server_id" => server_id,
                       "address" => address,
                       "rpc_port" => rpc_port,
                       "square" => ?assigned_square);

        self.servers.insert(server_id.to_string(), info.clone());
        self.dirty = true;

        info
    }

    /// Smallest unoccupied `(y, x)` square within a grid of side ⌈√N⌉, N counting the fleet
    /// including the server being placed.
    fn next_square(&self) -> GridSquare {
        let occupied: Vec<GridSquare> = self
            .servers
            .values()
            .filter(|server| server.status.owns_zone())
            .map(|server| server.assigned_square)
            .collect();

        let fleet = occupied.len() + 1;
        let side = (fleet as f64).sqrt().ceil() as i32;

        for y in 0..side {
            for x in 0..side {
                let candidate = GridSquare::new(x, y);

                if !occupied.contains(&candidate) {
                    return candidate;
                }
            }
        }

        // side*side >= fleet, so the scan always finds a hole
        unreachable!("Grid scan exhausted without a free square")
    }

    pub fn unregister_action_server(&mut self, server_id: &str) -> bool {
        let removed = self.servers.remove(server_id).is_some();

        if removed {
            logging::info!(self.log, "action server unregistered"; "server_id" => server_id);
            self.dirty = true;
        }

        removed
    }

    /// All live (non-Dead) action servers.
    pub fn all_servers(&self) -> Vec<ActionServerInfo> {
        let mut servers: Vec<ActionServerInfo> = self
            .servers
            .values()
            .filter(|server| server.status.owns_zone())
            .cloned()
            .collect();

        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        servers
    }

    pub fn server_for_square(&self, square: GridSquare) -> Option<ActionServerInfo> {
        self.servers
            .values()
            .find(|server| server.status.owns_zone() && server.assigned_square == square)
            .cloned()
    }

    pub fn server_for_position(&self, position: Vec2) -> Option<ActionServerInfo> {
        self.server_for_square(GridSquare::containing(position, self.zone_side))
    }

    /// Creates or refreshes a player record. New players spawn at a position drawn from a PRNG
    /// seeded by the player id, inside a currently owned zone, so re-registration lands in the
    /// same spot while that zone stays owned.
    pub fn register_player(&mut self, player_id: &str, name: &str) -> Option<PlayerInfo> {
        let now = Utc::now();

        if let Some(existing) = self.players.get_mut(player_id) {
            existing.name = name.to_string();
            existing.last_seen = now;
            return Some(existing.clone());
        }

        let mut owned: Vec<GridSquare> = self
            .servers
            .values()
            .filter(|server| server.status == ServerStatus::Ready)
            .map(|server| server.assigned_square)
            .collect();

        if owned.is_empty() {
            logging::warn!(self.log, "player registration with no owned zones"; "player_id" => player_id);
            return None;
        }

        owned.sort();

        let mut rng = StdRng::seed_from_u64(crypto::seed64(player_id.as_bytes()));
        let square = owned[rng.gen_range(0..owned.len())];

        // Keep spawns away from the boundary so a fresh player does not transition immediately
        let min = square.min_corner(self.zone_side);
        let inset = self.zone_side * 0.1;
        let position = Vec2::new(
            min.x + inset + rng.gen::<f32>() * (self.zone_side - 2.0 * inset),
            min.y + inset + rng.gen::<f32>() * (self.zone_side - 2.0 * inset),
        );

        let info = PlayerInfo {
            player_id: player_id.to_string(),
            name: name.to_string(),
            position,
            velocity: Vec2::ZERO,
            health: 100.0,
            current_zone: square,
            home_server: self.server_for_square(square).map(|server| server.server_id),
            last_seen: now,
        };

        logging::info!(self.log, "player registered";
                       "player_id" => player_id,
                       "name" => name,
                       "zone" => ?square);

        self.players.insert(player_id.to_string(), info.clone());
        self.dirty = true;

        Some(info)
    }

    #[inline]
    pub fn player(&self, player_id: &str) -> Option<&PlayerInfo> {
        self.players.get(player_id)
    }

    /// Nominates source and target servers for a player whose position crossed a zone
    /// boundary. Returns `None` when the player is already where it should be, or when the
    /// target zone has no owner yet (the caller waits and retries). Commits the directory's
    /// view of the player's zone on nomination.
    pub fn initiate_transfer(&mut self, player_id: &str, current_position: Vec2) -> Option<TransferInfo> {
        let target_square = GridSquare::containing(current_position, self.zone_side);

        let (source_square, home_server) = match self.players.get(player_id) {
            Some(player) => (player.current_zone, player.home_server.clone()),
            None => return None,
        };

        if source_square == target_square {
            return None;
        }

        let target = self.server_for_square(target_square)?;
        let source = home_server
            .as_deref()
            .and_then(|server_id| self.servers.get(server_id))
            .filter(|server| server.status.owns_zone())
            .cloned()
            .or_else(|| self.server_for_square(source_square));

        if let Some(player) = self.players.get_mut(player_id) {
            player.position = current_position;
            player.current_zone = target_square;
            player.home_server = Some(target.server_id.clone());
            player.last_seen = Utc::now();
        }
        self.dirty = true;

        logging::info!(self.log, "transfer nominated";
                       "player_id" => player_id,
                       "from" => ?source_square,
                       "to" => ?target_square,
                       "target_server" => &target.server_id);

        Some(TransferInfo {
            player_id: player_id.to_string(),
            source,
            target,
        })
    }

    /// Server-side position feed. The recorded zone is left alone: only transfer nomination
    /// moves it, which is what lets the old server spot stale input.
    pub fn update_player(&mut self, player_id: &str, position: Vec2, velocity: Vec2) -> bool {
        match self.players.get_mut(player_id) {
            Some(player) => {
                player.position = position;
                player.velocity = velocity;
                player.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn heartbeat(&mut self, server_id: &str) -> bool {
        match self.servers.get_mut(server_id) {
            Some(server) if server.status.owns_zone() => {
                server.last_heartbeat = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn set_server_status(&mut self, server_id: &str, status: ServerStatus) -> bool {
        match self.servers.get_mut(server_id) {
            Some(server) => {
                server.status = status;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Marks servers with stale heartbeats `Dead`, freeing their squares for the next
    /// registration. Returns the evicted ids.
    pub fn evict_stale(&mut self) -> Vec<ServerId> {
        let now = Utc::now();
        let evict_after = self.evict_after;

        let stale: Vec<ServerId> = self
            .servers
            .values()
            .filter(|server| server.status.owns_zone() && now - server.last_heartbeat > evict_after)
            .map(|server| server.server_id.clone())
            .collect();

        for server_id in &stale {
            logging::warn!(self.log, "evicting stale action server"; "server_id" => server_id.as_str());

            if let Some(server) = self.servers.get_mut(server_id) {
                server.status = ServerStatus::Dead;
            }
        }

        if !stale.is_empty() {
            self.dirty = true;
        }

        stale
    }

    /// Aggregated per-zone statistics for the stats stream.
    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        let mut stats: Vec<ZoneStats> = self
            .servers
            .values()
            .filter(|server| server.status.owns_zone())
            .map(|server| ZoneStats {
                square: server.assigned_square,
                server_id: server.server_id.clone(),
                status: server.status,
                player_count: self
                    .players
                    .values()
                    .filter(|player| player.current_zone == server.assigned_square)
                    .count(),
            })
            .collect();

        stats.sort_by(|a, b| a.square.cmp(&b.square));
        stats
    }

    // --- durable state ---

    fn state_path(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("directory.json")
    }

    /// Loads the durable server/player collections. Corrupt state is fatal: a directory with
    /// a wrong view of zone ownership must not start.
    pub fn load(&mut self, data_dir: &str) {
        let path = Self::state_path(data_dir);

        if !path.exists() {
            return;
        }

        let raw = fs::read_to_string(&path).expect("Error reading directory state");
        let state: PersistedState =
            serde_json::from_str(&raw).expect("Corrupt directory state, refusing to start");

        logging::info!(self.log, "directory state loaded";
                       "servers" => state.servers.len(),
                       "players" => state.players.len());

        self.servers = state.servers;
        self.players = state.players;
    }

    /// Writes the durable collections when anything changed since the last save.
    pub fn save_if_dirty(&mut self, data_dir: &str) {
        if !self.dirty {
            return;
        }

        let state = PersistedState {
            servers: self.servers.clone(),
            players: self.players.clone(),
        };

        let path = Self::state_path(data_dir);

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        match serde_json::to_string_pretty(&state) {
            Ok(json) => {
                if let Err(err) = fs::write(&path, json) {
                    logging::error!(self.log, "directory state save failed"; "error" => %err);
                } else {
                    self.dirty = false;
                }
            }
            Err(err) => logging::error!(self.log, "directory state encode failed"; "error" => %err),
        }
    }
}
