use flint::session::SessionKey;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_RPC_PORT: u16 = 28008;

#[derive(Serialize, Deserialize, Clone)]
pub struct Server {
    pub rpc_address: String,
    pub http_port: u16,
    pub silo_address: String,
    /// Cluster secret shared with the silo; grants server role and opens tickets.
    pub secret: SessionKey,
}

/// Simulation tuning. All distances in world units, all times in seconds.
#[derive(Serialize, Deserialize, Clone)]
pub struct Zone {
    pub fps: u64,
    pub zone_side: f32,
    /// Entities transferred in are accepted up to this far outside the owned square.
    pub transfer_margin: f32,
    /// Entities are forwarded out once they are this far past the edge.
    pub forward_hysteresis: f32,
    /// Upper bound on the integration step when a tick overruns.
    pub max_dt: f32,
    pub player_speed: f32,
    pub enemy_speed: f32,
    pub bullet_speed: f32,
    pub bullet_lifespan: f32,
    pub bullet_damage: f32,
    pub hit_radius: f32,
    pub fire_cooldown: f32,
    pub factory_spawn_secs: f32,
    pub scout_alert_decay: f32,
    pub snapshot_max_entities: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct GameConfig {
    pub server: Server,
    pub zone: Zone,
}

impl Default for GameConfig {
    fn default() -> GameConfig {
        GameConfig {
            server: Server {
                rpc_address: format!("0.0.0.0:{}", DEFAULT_RPC_PORT),
                http_port: 28088,
                silo_address: "127.0.0.1:27500".to_string(),
                secret: SessionKey::new([0; SessionKey::SIZE]),
            },
            zone: Zone {
                fps: 60,
                zone_side: 500.0,
                transfer_margin: 8.0,
                forward_hysteresis: 2.0,
                max_dt: 0.05,
                player_speed: 120.0,
                enemy_speed: 60.0,
                bullet_speed: 200.0,
                bullet_lifespan: 5.0,
                bullet_damage: 25.0,
                hit_radius: 6.0,
                fire_cooldown: 0.25,
                factory_spawn_secs: 10.0,
                scout_alert_decay: 5.0,
                snapshot_max_entities: 512,
            },
        }
    }
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GameConfig {
        serdeconv::from_toml_file(path).expect("Error loading game configuration file")
    }
}
