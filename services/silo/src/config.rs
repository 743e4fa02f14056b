use flint::session::SessionKey;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_RPC_PORT: u16 = 27500;

#[derive(Serialize, Deserialize, Clone)]
pub struct Server {
    pub rpc_address: String,
    pub http_port: u16,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Cluster {
    /// Shared secret admitting server-role peers and sealing session tickets.
    pub secret: SessionKey,
    /// Zone side length in world units.
    pub zone_side: f32,
    /// Action servers are evicted after this much heartbeat silence.
    pub server_evict_secs: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Session {
    pub duration_secs: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Presence {
    pub heartbeat_secs: u64,
    pub evict_secs: u64,
    /// RPC addresses of peer coordinators to fan events out to.
    pub peers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Storage {
    pub data_dir: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct SiloConfig {
    pub server: Server,
    pub cluster: Cluster,
    pub session: Session,
    pub presence: Presence,
    pub storage: Storage,
}

impl Default for SiloConfig {
    fn default() -> SiloConfig {
        SiloConfig {
            server: Server {
                rpc_address: format!("0.0.0.0:{}", DEFAULT_RPC_PORT),
                http_port: 27580,
            },
            cluster: Cluster {
                secret: SessionKey::new([0; SessionKey::SIZE]),
                zone_side: 500.0,
                server_evict_secs: 15,
            },
            session: Session {
                duration_secs: flint::SESSION_EXPIRY_SECS,
            },
            presence: Presence {
                heartbeat_secs: 2,
                evict_secs: 10,
                peers: Vec::new(),
            },
            storage: Storage {
                data_dir: "data".into(),
            },
        }
    }
}

impl SiloConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> SiloConfig {
        serdeconv::from_toml_file(path).expect("Error loading silo configuration file")
    }
}
