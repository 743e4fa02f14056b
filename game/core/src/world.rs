use crate::config::Zone;
use crate::entity::{BulletParams, Entity, EntityKind, EntitySnapshot, EntityState, WorldState};
use flint::logging;
use flint::math::{GridSquare, Vec2};
use flint::{crypto, PlayerId};
use hashbrown::{HashMap, HashSet};
use serde_derive::{Deserialize, Serialize};
use std::time::Instant;

const SCOUT_EMIT_INTERVAL: f64 = 1.0;
const SCOUT_EDGE_RANGE: f32 = 100.0;
const POSITION_REPORT_TICKS: u64 = 30;
const SEEN_BULLET_CAP: usize = 8192;

/// Intents delivered to the simulation thread. Producers never block: the queue is unbounded
/// and the simulation drains it at the top of every tick.
#[derive(Debug, Clone)]
pub enum SimCommand {
    ConnectPlayer {
        player_id: PlayerId,
    },
    DisconnectPlayer {
        player_id: PlayerId,
    },
    Input {
        player_id: PlayerId,
        move_dir: Option<Vec2>,
        shoot_dir: Option<Vec2>,
        is_shooting: bool,
    },
    TransferEntityIn {
        entity_id: String,
        kind: EntityKind,
        sub_type: i8,
        position: Vec2,
        velocity: Vec2,
        health: f32,
    },
    BulletTrajectory {
        bullet_id: String,
        sub_type: i8,
        params: BulletParams,
        owner: Option<PlayerId>,
        team: u8,
    },
    BulletDestroyed {
        bullet_id: String,
    },
    ScoutAlert {
        zone: GridSquare,
        position: Vec2,
    },
    SpawnFactory {
        position: Vec2,
    },
}

/// Cross-zone effects produced by a tick; the fabric drains and ships them.
#[derive(Debug, Clone)]
pub enum OutEvent {
    ForwardEntity {
        to: GridSquare,
        entity: EntitySnapshot,
    },
    ForwardBullet {
        to: GridSquare,
        bullet_id: String,
        sub_type: i8,
        params: BulletParams,
        owner: Option<PlayerId>,
        team: u8,
    },
    BulletDestroyed {
        to: GridSquare,
        bullet_id: String,
    },
    ScoutAlert {
        to: GridSquare,
        zone: GridSquare,
        position: Vec2,
    },
    PositionReport {
        player_id: PlayerId,
        position: Vec2,
        velocity: Vec2,
    },
}

#[derive(Debug, Clone, Default)]
struct LatchedInput {
    move_dir: Option<Vec2>,
    shoot_dir: Option<Vec2>,
    is_shooting: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SimStats {
    pub tick: u64,
    pub measured_fps: f32,
    pub entity_count: usize,
    pub player_count: usize,
    pub enemy_count: usize,
    pub bullet_count: usize,
}

/// Authoritative simulation for one owned square, advanced at a fixed cadence by a dedicated
/// thread. Everything network-facing goes through `SimCommand` in and `OutEvent`/snapshots
/// out; nothing here ever suspends on RPC.
pub struct ZoneWorld {
    square: GridSquare,
    config: Zone,

    entities: HashMap<String, Entity>,
    inputs: HashMap<PlayerId, LatchedInput>,
    fire_ready_at: HashMap<PlayerId, f64>,

    /// Handoff idempotency: bullet ids this zone has already materialized.
    seen_bullets: HashSet<String>,
    /// Bullets already shipped to a neighbor; destruction notices only concern these.
    forwarded_bullets: HashSet<String>,
    factory_ready_at: HashMap<String, f64>,

    scout_bias: Option<(Vec2, f64)>,
    scout_emit_at: f64,

    spawn_counter: u64,
    tick_count: u64,
    last_tick: Option<Instant>,

    fps_window: Option<Instant>,
    fps_ticks: u64,
    measured_fps: f32,

    out: Vec<OutEvent>,
    log: logging::Logger,
}

impl ZoneWorld {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        square: GridSquare,
        config: Zone,
        log: L,
    ) -> ZoneWorld {
        ZoneWorld {
            square,
            config,
            entities: HashMap::new(),
            inputs: HashMap::new(),
            fire_ready_at: HashMap::new(),
            seen_bullets: HashSet::new(),
            forwarded_bullets: HashSet::new(),
            factory_ready_at: HashMap::new(),
            scout_bias: None,
            scout_emit_at: 0.0,
            spawn_counter: 0,
            tick_count: 0,
            last_tick: None,
            fps_window: None,
            fps_ticks: 0,
            measured_fps: 0.0,
            out: Vec::new(),
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn square(&self) -> GridSquare {
        self.square
    }

    /// Nominal simulation rate in ticks per second.
    #[inline]
    pub fn tick_rate(&self) -> u64 {
        self.config.fps
    }

    /// Applies one queued intent. `wall` is the shared monotonic clock in seconds.
    pub fn apply(&mut self, command: SimCommand, wall: f64) {
        match command {
            SimCommand::ConnectPlayer { player_id } => self.connect_player(player_id),
            SimCommand::DisconnectPlayer { player_id } => {
                self.entities.remove(&player_id);
                self.inputs.remove(&player_id);
                self.fire_ready_at.remove(&player_id);
            }
            SimCommand::Input {
                player_id,
                move_dir,
                shoot_dir,
                is_shooting,
            } => {
                // Inputs for players this zone no longer simulates are dropped
                let in_zone = self
                    .entities
                    .get(&player_id)
                    .map_or(false, |entity| {
                        self.square.contains_with_margin(
                            entity.position,
                            self.config.zone_side,
                            self.config.transfer_margin,
                        )
                    });

                if in_zone {
                    // Last received wins within a tick
                    self.inputs.insert(player_id, LatchedInput {
                        move_dir,
                        shoot_dir,
                        is_shooting,
                    });
                }
            }
            SimCommand::TransferEntityIn {
                entity_id,
                kind,
                sub_type,
                position,
                velocity,
                health,
            } => {
                if self.entities.contains_key(&entity_id) {
                    return;
                }

                let team = match kind {
                    EntityKind::Player => 1,
                    EntityKind::Enemy | EntityKind::Factory => 2,
                    _ => 0,
                };

                logging::debug!(self.log, "entity transferred in";
                                "entity_id" => &entity_id,
                                "kind" => ?kind);

                self.entities.insert(entity_id.clone(), Entity {
                    entity_id,
                    kind,
                    sub_type,
                    position,
                    velocity,
                    health,
                    team,
                    state: EntityState::Active,
                    owner: None,
                    bullet: None,
                });
            }
            SimCommand::BulletTrajectory {
                bullet_id,
                sub_type,
                params,
                owner,
                team,
            } => {
                // The globally unique bullet id doubles as the idempotency key
                if self.seen_bullets.contains(&bullet_id) || self.entities.contains_key(&bullet_id) {
                    return;
                }

                self.note_bullet(bullet_id.clone());

                self.entities.insert(bullet_id.clone(), Entity {
                    entity_id: bullet_id,
                    kind: EntityKind::Bullet,
                    sub_type,
                    position: params.position_at(wall),
                    velocity: params.velocity,
                    health: 1.0,
                    team,
                    state: EntityState::Active,
                    owner,
                    bullet: Some(params),
                });
            }
            SimCommand::BulletDestroyed { bullet_id } => {
                self.entities.remove(&bullet_id);
            }
            SimCommand::ScoutAlert { zone, position } => {
                logging::trace!(self.log, "scout alert"; "zone" => ?zone);
                self.scout_bias = Some((position, wall + self.config.scout_alert_decay as f64));
            }
            SimCommand::SpawnFactory { position } => {
                let factory_id = format!("fac-{}-{}", self.square.x, self.square.y);

                if !self.entities.contains_key(&factory_id) {
                    self.factory_ready_at
                        .insert(factory_id.clone(), wall + self.config.factory_spawn_secs as f64);

                    self.entities.insert(factory_id.clone(), Entity {
                        entity_id: factory_id,
                        kind: EntityKind::Factory,
                        sub_type: 0,
                        position,
                        velocity: Vec2::ZERO,
                        health: 500.0,
                        team: 2,
                        state: EntityState::Active,
                        owner: None,
                        bullet: None,
                    });
                }
            }
        }
    }

    /// Spawns (or re-admits) a player. Reconnects of a live player are a no-op, so connect is
    /// idempotent from the caller's perspective.
    fn connect_player(&mut self, player_id: PlayerId) {
        if self.entities.contains_key(&player_id) {
            return;
        }

        // Deterministic in-zone spawn so reconnects land where the directory predicted
        let seed = crypto::seed64(player_id.as_bytes());
        let side = self.config.zone_side;
        let inset = side * 0.1;
        let usable = side - 2.0 * inset;
        let min = self.square.min_corner(side);

        let position = Vec2::new(
            min.x + inset + ((seed % 10_000) as f32 / 10_000.0) * usable,
            min.y + inset + (((seed >> 16) % 10_000) as f32 / 10_000.0) * usable,
        );

        logging::info!(self.log, "player spawned";
                       "player_id" => &player_id,
                       "x" => position.x,
                       "y" => position.y);

        self.entities.insert(player_id.clone(), Entity {
            entity_id: player_id,
            kind: EntityKind::Player,
            sub_type: 0,
            position,
            velocity: Vec2::ZERO,
            health: 100.0,
            team: 1,
            state: EntityState::Active,
            owner: None,
            bullet: None,
        });
    }

    /// Advances the world one step. The integration step is the wall time since the previous
    /// tick, capped: an overrunning tick slows the simulation down instead of stepping far
    /// enough to tunnel through geometry.
    pub fn tick(&mut self, now: Instant, wall: f64) {
        let nominal = 1.0 / self.config.fps as f32;
        let dt = match self.last_tick {
            Some(previous) => now.duration_since(previous).as_secs_f32().min(self.config.max_dt),
            None => nominal,
        };
        self.last_tick = Some(now);
        self.tick_count += 1;

        self.apply_inputs(wall);
        self.integrate(dt, wall);
        self.collide();
        self.forward_out(wall);
        self.emit_scout_alerts(wall);
        self.report_positions();
        self.reap();
        self.measure_fps(now);
    }

    fn apply_inputs(&mut self, wall: f64) {
        let player_speed = self.config.player_speed;
        let bullet_speed = self.config.bullet_speed;
        let bullet_lifespan = self.config.bullet_lifespan;
        let fire_cooldown = self.config.fire_cooldown as f64;

        let mut spawned = Vec::new();

        for (player_id, input) in self.inputs.iter() {
            let entity = match self.entities.get_mut(player_id) {
                Some(entity) if entity.state == EntityState::Active => entity,
                _ => continue,
            };

            entity.velocity = input
                .move_dir
                .map(|dir| dir.normalized() * player_speed)
                .unwrap_or(Vec2::ZERO);

            let wants_fire = input.is_shooting || input.shoot_dir.is_some();
            if !wants_fire {
                continue;
            }

            let ready_at = self.fire_ready_at.get(player_id).copied().unwrap_or(0.0);
            if wall < ready_at {
                continue;
            }

            let direction = input
                .shoot_dir
                .or(input.move_dir)
                .map(Vec2::normalized)
                .filter(|dir| dir.length() > 0.5)
                .unwrap_or_else(|| Vec2::new(1.0, 0.0));

            spawned.push((player_id.clone(), entity.position, direction * bullet_speed, entity.team));
            self.fire_ready_at.insert(player_id.clone(), wall + fire_cooldown);
        }

        for (player_id, origin, velocity, team) in spawned {
            let bullet_id = format!("{}-b{}", player_id, self.spawn_counter);
            self.spawn_counter += 1;
            self.note_bullet(bullet_id.clone());

            let params = BulletParams {
                origin,
                velocity,
                spawn_time: wall,
                lifespan: bullet_lifespan,
            };

            self.entities.insert(bullet_id.clone(), Entity {
                entity_id: bullet_id,
                kind: EntityKind::Bullet,
                sub_type: 0,
                position: origin,
                velocity,
                health: 1.0,
                team,
                state: EntityState::Active,
                owner: Some(player_id),
                bullet: Some(params),
            });
        }
    }

    fn integrate(&mut self, dt: f32, wall: f64) {
        let enemy_speed = self.config.enemy_speed;

        let player_positions: Vec<Vec2> = self
            .entities
            .values()
            .filter(|entity| entity.kind == EntityKind::Player && entity.state == EntityState::Active)
            .map(|entity| entity.position)
            .collect();

        let scout_bias = match self.scout_bias {
            Some((position, expiry)) if wall < expiry => Some(position),
            _ => {
                self.scout_bias = None;
                None
            }
        };

        let mut enemy_spawns = Vec::new();

        for entity in self.entities.values_mut() {
            if entity.state != EntityState::Active {
                continue;
            }

            match entity.kind {
                EntityKind::Player | EntityKind::Asteroid => {
                    entity.position += entity.velocity * dt;
                }
                EntityKind::Enemy => {
                    let target = player_positions
                        .iter()
                        .min_by(|a, b| {
                            a.distance(entity.position)
                                .partial_cmp(&b.distance(entity.position))
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .copied()
                        .or(scout_bias);

                    if let Some(target) = target {
                        entity.velocity = (target - entity.position).normalized() * enemy_speed;
                    }

                    entity.position += entity.velocity * dt;
                }
                EntityKind::Bullet => {
                    // Pure trajectory: identical on every host that holds the parameters
                    if let Some(params) = entity.bullet {
                        if params.expired(wall) {
                            entity.state = EntityState::Dead;
                        } else {
                            entity.position = params.position_at(wall);
                        }
                    }
                }
                EntityKind::Factory => {
                    let ready_at = self
                        .factory_ready_at
                        .entry(entity.entity_id.clone())
                        .or_insert(wall + self.config.factory_spawn_secs as f64);

                    if wall >= *ready_at {
                        *ready_at = wall + self.config.factory_spawn_secs as f64;
                        enemy_spawns.push(entity.position);
                    }
                }
            }
        }

        for position in enemy_spawns {
            let enemy_id = format!("enemy-{}", self.spawn_counter);
            self.spawn_counter += 1;

            self.entities.insert(enemy_id.clone(), Entity {
                entity_id: enemy_id,
                kind: EntityKind::Enemy,
                sub_type: 0,
                position: position + Vec2::new(10.0, 10.0),
                velocity: Vec2::ZERO,
                health: 50.0,
                team: 2,
                state: EntityState::Active,
                owner: None,
                bullet: None,
            });
        }
    }

    fn collide(&mut self) {
        let hit_radius = self.config.hit_radius;
        let damage = self.config.bullet_damage;

        let bullets: Vec<(String, Vec2, u8)> = self
            .entities
            .values()
            .filter(|entity| entity.kind == EntityKind::Bullet && entity.state == EntityState::Active)
            .map(|entity| (entity.entity_id.clone(), entity.position, entity.team))
            .collect();

        let mut destroyed = Vec::new();

        for (bullet_id, position, team) in bullets {
            let victim_id = self
                .entities
                .values()
                .find(|victim| {
                    victim.state == EntityState::Active
                        && victim.team != team
                        && victim.kind != EntityKind::Bullet
                        && victim.position.distance(position) <= hit_radius
                })
                .map(|victim| victim.entity_id.clone());

            if let Some(victim_id) = victim_id {
                if let Some(victim) = self.entities.get_mut(&victim_id) {
                    victim.health -= damage;
                    if victim.health <= 0.0 {
                        victim.state = EntityState::Dying;
                    }
                }

                destroyed.push(bullet_id);
            }
        }

        for bullet_id in destroyed {
            // Only neighbors that may hold a forwarded copy need the destroy notice
            if self.forwarded_bullets.remove(&bullet_id) {
                for neighbor in self.square.neighbors().iter() {
                    self.out.push(OutEvent::BulletDestroyed {
                        to: *neighbor,
                        bullet_id: bullet_id.clone(),
                    });
                }
            }

            self.entities.remove(&bullet_id);
        }
    }

    fn forward_out(&mut self, wall: f64) {
        let side = self.config.zone_side;
        let hysteresis = self.config.forward_hysteresis;
        let margin = self.config.transfer_margin;
        let square = self.square;

        let mut removals = Vec::new();

        for entity in self.entities.values() {
            if entity.state != EntityState::Active {
                continue;
            }

            let inside = square.contains_with_margin(entity.position, side, 0.0);
            let destination = GridSquare::containing(entity.position, side);

            match entity.kind {
                EntityKind::Bullet => {
                    if !inside
                        && square.is_adjacent(destination)
                        && !self.forwarded_bullets.contains(&entity.entity_id)
                    {
                        if let Some(params) = entity.bullet {
                            self.forwarded_bullets.insert(entity.entity_id.clone());
                            // Canonical spawn parameters, never the current position: the
                            // receiver integrates its own clock forward from the origin
                            self.out.push(OutEvent::ForwardBullet {
                                to: destination,
                                bullet_id: entity.entity_id.clone(),
                                sub_type: entity.sub_type,
                                params,
                                owner: entity.owner.clone(),
                                team: entity.team,
                            });
                        }
                    }

                    if !square.contains_with_margin(entity.position, side, margin + hysteresis) {
                        removals.push(entity.entity_id.clone());
                    }
                }
                EntityKind::Player | EntityKind::Enemy | EntityKind::Asteroid => {
                    if !square.contains_with_margin(entity.position, side, hysteresis)
                        && square.is_adjacent(destination)
                    {
                        self.out.push(OutEvent::ForwardEntity {
                            to: destination,
                            entity: entity.snapshot(),
                        });
                        removals.push(entity.entity_id.clone());
                    }
                }
                EntityKind::Factory => (),
            }
        }

        for entity_id in removals {
            logging::debug!(self.log, "entity left zone"; "entity_id" => &entity_id, "wall" => wall);
            self.entities.remove(&entity_id);
            self.inputs.remove(&entity_id);
        }
    }

    fn emit_scout_alerts(&mut self, wall: f64) {
        if wall < self.scout_emit_at {
            return;
        }
        self.scout_emit_at = wall + SCOUT_EMIT_INTERVAL;

        let side = self.config.zone_side;
        let min = self.square.min_corner(side);
        let square = self.square;

        let alerts: Vec<(GridSquare, Vec2)> = self
            .entities
            .values()
            .filter(|entity| entity.kind == EntityKind::Player && entity.state == EntityState::Active)
            .flat_map(|entity| {
                let position = entity.position;
                let mut targets = Vec::new();

                if position.x - min.x < SCOUT_EDGE_RANGE {
                    targets.push(GridSquare::new(square.x - 1, square.y));
                }
                if min.x + side - position.x < SCOUT_EDGE_RANGE {
                    targets.push(GridSquare::new(square.x + 1, square.y));
                }
                if position.y - min.y < SCOUT_EDGE_RANGE {
                    targets.push(GridSquare::new(square.x, square.y - 1));
                }
                if min.y + side - position.y < SCOUT_EDGE_RANGE {
                    targets.push(GridSquare::new(square.x, square.y + 1));
                }

                targets.into_iter().map(move |to| (to, position))
            })
            .collect();

        for (to, position) in alerts {
            self.out.push(OutEvent::ScoutAlert {
                to,
                zone: square,
                position,
            });
        }
    }

    fn report_positions(&mut self) {
        if self.tick_count % POSITION_REPORT_TICKS != 0 {
            return;
        }

        let reports: Vec<OutEvent> = self
            .entities
            .values()
            .filter(|entity| entity.kind == EntityKind::Player && entity.state == EntityState::Active)
            .map(|entity| OutEvent::PositionReport {
                player_id: entity.entity_id.clone(),
                position: entity.position,
                velocity: entity.velocity,
            })
            .collect();

        self.out.extend(reports);
    }

    fn reap(&mut self) {
        let mut removals = Vec::new();

        for entity in self.entities.values_mut() {
            match entity.state {
                EntityState::Dying => entity.state = EntityState::Dead,
                EntityState::Dead => removals.push(entity.entity_id.clone()),
                EntityState::Active => (),
            }
        }

        for entity_id in removals {
            self.entities.remove(&entity_id);
            self.inputs.remove(&entity_id);
        }
    }

    fn measure_fps(&mut self, now: Instant) {
        self.fps_ticks += 1;

        match self.fps_window {
            None => self.fps_window = Some(now),
            Some(start) => {
                let elapsed = now.duration_since(start).as_secs_f32();

                if elapsed >= 1.0 {
                    self.measured_fps = self.fps_ticks as f32 / elapsed;
                    self.fps_window = Some(now);
                    self.fps_ticks = 0;
                }
            }
        }
    }

    fn note_bullet(&mut self, bullet_id: String) {
        // Ids are time scoped; wholesale reset is acceptable once the window is exceeded
        if self.seen_bullets.len() >= SEEN_BULLET_CAP {
            self.seen_bullets.clear();
        }

        self.seen_bullets.insert(bullet_id);
    }

    /// Copies the current entity set for observers. Bounded by configuration; the overflow is
    /// dropped deterministically from the end.
    pub fn snapshot(&self, timestamp_ms: u64) -> WorldState {
        let mut entities: Vec<EntitySnapshot> =
            self.entities.values().map(Entity::snapshot).collect();

        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entities.truncate(self.config.snapshot_max_entities);

        WorldState {
            timestamp_ms,
            entities,
        }
    }

    pub fn stats(&self) -> SimStats {
        let mut stats = SimStats {
            tick: self.tick_count,
            measured_fps: self.measured_fps,
            entity_count: self.entities.len(),
            ..SimStats::default()
        };

        for entity in self.entities.values() {
            match entity.kind {
                EntityKind::Player => stats.player_count += 1,
                EntityKind::Enemy => stats.enemy_count += 1,
                EntityKind::Bullet => stats.bullet_count += 1,
                _ => (),
            }
        }

        stats
    }

    /// Drains the cross-zone effects accumulated since the last call.
    #[inline]
    pub fn take_out(&mut self) -> Vec<OutEvent> {
        std::mem::take(&mut self.out)
    }
}
