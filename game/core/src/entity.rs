use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flint::math::Vec2;
use flint::PlayerId;
use std::io::{Cursor, Read};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntityKind {
    Player = 0,
    Enemy = 1,
    Bullet = 2,
    Factory = 3,
    Asteroid = 4,
}

impl EntityKind {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<EntityKind> {
        match raw {
            0 => Some(EntityKind::Player),
            1 => Some(EntityKind::Enemy),
            2 => Some(EntityKind::Bullet),
            3 => Some(EntityKind::Factory),
            4 => Some(EntityKind::Asteroid),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntityState {
    Active = 0,
    Dying = 1,
    Dead = 2,
}

impl EntityState {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<EntityState> {
        match raw {
            0 => Some(EntityState::Active),
            1 => Some(EntityState::Dying),
            2 => Some(EntityState::Dead),
            _ => None,
        }
    }
}

/// Deterministic trajectory parameters. A bullet's position is a pure function of these and
/// the clock, which is what makes cross-zone handoff seamless: the destination re-integrates
/// from the same origin instead of the position at handoff time.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BulletParams {
    pub origin: Vec2,
    pub velocity: Vec2,
    /// Spawn instant on the shared monotonic clock, seconds.
    pub spawn_time: f64,
    pub lifespan: f32,
}

impl BulletParams {
    #[inline]
    pub fn position_at(&self, now: f64) -> Vec2 {
        self.origin + self.velocity * (now - self.spawn_time) as f32
    }

    #[inline]
    pub fn expired(&self, now: f64) -> bool {
        now - self.spawn_time > self.lifespan as f64
    }
}

/// A simulated entity. Only the owning zone's simulation thread mutates these.
#[derive(Debug, Clone)]
pub struct Entity {
    pub entity_id: String,
    pub kind: EntityKind,
    pub sub_type: i8,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub team: u8,
    pub state: EntityState,
    pub owner: Option<PlayerId>,
    /// Present on bullets only.
    pub bullet: Option<BulletParams>,
}

/// Flat copy of an entity handed to observers and remote readers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub kind: EntityKind,
    pub sub_type: i8,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub team: u8,
    pub state: EntityState,
    pub owner: Option<PlayerId>,
}

impl Entity {
    #[inline]
    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: self.entity_id.clone(),
            kind: self.kind,
            sub_type: self.sub_type,
            position: self.position,
            velocity: self.velocity,
            health: self.health,
            team: self.team,
            state: self.state,
            owner: self.owner.clone(),
        }
    }
}

/// Point-in-time view of a zone's entities. At most one tick stale when served.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorldState {
    pub timestamp_ms: u64,
    pub entities: Vec<EntitySnapshot>,
}

impl WorldState {
    /// Serializes the snapshot into the blob format carried by RPC replies and observer
    /// notifications.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.entities.len() * 64);

        out.write_u64::<LittleEndian>(self.timestamp_ms)
            .expect("Error writing snapshot");
        out.write_u16::<LittleEndian>(self.entities.len() as u16)
            .expect("Error writing snapshot");

        for entity in &self.entities {
            write_string(&mut out, &entity.entity_id);
            out.push(entity.kind as u8);
            out.push(entity.sub_type as u8);
            write_vec2(&mut out, entity.position);
            write_vec2(&mut out, entity.velocity);
            out.write_f32::<LittleEndian>(entity.health)
                .expect("Error writing snapshot");
            out.push(entity.team);
            out.push(entity.state as u8);
            write_string(&mut out, entity.owner.as_deref().unwrap_or(""));
        }

        out
    }

    /// Parses a snapshot blob. `None` for malformed payloads.
    pub fn read(blob: &[u8]) -> Option<WorldState> {
        let mut cursor = Cursor::new(blob);

        let timestamp_ms = cursor.read_u64::<LittleEndian>().ok()?;
        let count = cursor.read_u16::<LittleEndian>().ok()? as usize;

        let mut entities = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let entity_id = read_string(&mut cursor)?;
            let kind = EntityKind::from_u8(cursor.read_u8().ok()?)?;
            let sub_type = cursor.read_u8().ok()? as i8;
            let position = read_vec2(&mut cursor)?;
            let velocity = read_vec2(&mut cursor)?;
            let health = cursor.read_f32::<LittleEndian>().ok()?;
            let team = cursor.read_u8().ok()?;
            let state = EntityState::from_u8(cursor.read_u8().ok()?)?;
            let owner = read_string(&mut cursor)?;

            entities.push(EntitySnapshot {
                entity_id,
                kind,
                sub_type,
                position,
                velocity,
                health,
                team,
                state,
                owner: match owner.is_empty() {
                    true => None,
                    _ => Some(owner),
                },
            });
        }

        Some(WorldState { timestamp_ms, entities })
    }
}

fn write_string(out: &mut Vec<u8>, text: &str) {
    out.write_u16::<LittleEndian>(text.len() as u16)
        .expect("Error writing snapshot");
    out.extend_from_slice(text.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Option<String> {
    let len = cursor.read_u16::<LittleEndian>().ok()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).ok()?;

    String::from_utf8(bytes).ok()
}

fn write_vec2(out: &mut Vec<u8>, vec: Vec2) {
    out.write_f32::<LittleEndian>(vec.x).expect("Error writing snapshot");
    out.write_f32::<LittleEndian>(vec.y).expect("Error writing snapshot");
}

fn read_vec2(cursor: &mut Cursor<&[u8]>) -> Option<Vec2> {
    let x = cursor.read_f32::<LittleEndian>().ok()?;
    let y = cursor.read_f32::<LittleEndian>().ok()?;

    Some(Vec2::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bullet_position_is_pure() {
        let params = BulletParams {
            origin: Vec2::new(480.0, 250.0),
            velocity: Vec2::new(200.0, 0.0),
            spawn_time: 1000.0,
            lifespan: 5.0,
        };

        assert_eq!(params.position_at(1000.0), Vec2::new(480.0, 250.0));
        assert_eq!(params.position_at(1000.2), Vec2::new(520.0, 250.0));

        // Same parameters on another host give the same trajectory
        let copy = params;
        assert_eq!(copy.position_at(1000.12), params.position_at(1000.12));
    }

    #[test]
    fn test_bullet_expiry() {
        let params = BulletParams {
            origin: Vec2::ZERO,
            velocity: Vec2::new(1.0, 0.0),
            spawn_time: 1000.0,
            lifespan: 5.0,
        };

        assert!(!params.expired(1004.9));
        assert!(params.expired(1005.1));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let state = WorldState {
            timestamp_ms: 123_456,
            entities: vec![
                EntitySnapshot {
                    entity_id: "p1".into(),
                    kind: EntityKind::Player,
                    sub_type: 0,
                    position: Vec2::new(501.0, 250.0),
                    velocity: Vec2::new(1.0, 0.0),
                    health: 87.5,
                    team: 1,
                    state: EntityState::Active,
                    owner: None,
                },
                EntitySnapshot {
                    entity_id: "p1-b0".into(),
                    kind: EntityKind::Bullet,
                    sub_type: 2,
                    position: Vec2::new(520.0, 250.0),
                    velocity: Vec2::new(200.0, 0.0),
                    health: 1.0,
                    team: 1,
                    state: EntityState::Active,
                    owner: Some("p1".into()),
                },
            ],
        };

        assert_eq!(WorldState::read(&state.write()).unwrap(), state);
    }

    #[test]
    fn test_snapshot_rejects_truncation() {
        let state = WorldState {
            timestamp_ms: 1,
            entities: vec![EntitySnapshot {
                entity_id: "e".into(),
                kind: EntityKind::Enemy,
                sub_type: 1,
                position: Vec2::ZERO,
                velocity: Vec2::ZERO,
                health: 50.0,
                team: 2,
                state: EntityState::Dying,
                owner: None,
            }],
        };

        let mut blob = state.write();
        blob.truncate(blob.len() - 3);

        assert!(WorldState::read(&blob).is_none());
    }

    #[test]
    fn test_kind_and_state_codes() {
        for raw in 0..5u8 {
            assert_eq!(EntityKind::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(EntityKind::from_u8(5).is_none());

        for raw in 0..3u8 {
            assert_eq!(EntityState::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(EntityState::from_u8(3).is_none());
    }
}
