//! Cross-service contract: the records and RPC surface identifiers every process in the
//! cluster agrees on. Services depend on this module instead of on each other.

use crate::math::{GridSquare, Vec2};
use crate::{PlayerId, ServerId};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerStatus {
    Starting,
    Ready,
    Draining,
    Dead,
}

impl ServerStatus {
    /// Dead servers no longer own their square.
    #[inline]
    pub fn owns_zone(self) -> bool {
        self != ServerStatus::Dead
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionServerInfo {
    pub server_id: ServerId,
    pub address: String,
    pub rpc_port: u16,
    pub http_port: u16,
    pub assigned_square: GridSquare,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ServerStatus,
}

impl ActionServerInfo {
    /// Socket address of the server's RPC endpoint.
    #[inline]
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.address, self.rpc_port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub name: String,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub current_zone: GridSquare,
    pub home_server: Option<ServerId>,
    pub last_seen: DateTime<Utc>,
}

/// Source and target nomination for a player's zone transition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferInfo {
    pub player_id: PlayerId,
    pub source: Option<ActionServerInfo>,
    pub target: ActionServerInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ZoneStats {
    pub square: GridSquare,
    pub server_id: ServerId,
    pub status: ServerStatus,
    pub player_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoordinatorInfo {
    pub coordinator_id: String,
    pub http_endpoint: String,
    /// RPC address peer coordinators use to deliver fanned-out events.
    pub event_bus_url: String,
    pub last_heartbeat: DateTime<Utc>,
    pub is_primary: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

// --- directory grain surface ---

pub const DIRECTORY_GRAIN: &str = "directory";
pub const DIRECTORY_INTERFACE: u32 = 1;

pub const DIR_REGISTER_ACTION_SERVER: u32 = 1;
pub const DIR_UNREGISTER_ACTION_SERVER: u32 = 2;
pub const DIR_GET_ALL_ACTION_SERVERS: u32 = 3;
pub const DIR_GET_SERVER_FOR_POSITION: u32 = 4;
pub const DIR_REGISTER_PLAYER: u32 = 5;
pub const DIR_INITIATE_TRANSFER: u32 = 6;
pub const DIR_UPDATE_PLAYER: u32 = 7;
pub const DIR_BROADCAST_CHAT: u32 = 8;
pub const DIR_SERVER_HEARTBEAT: u32 = 9;
pub const DIR_GET_RECENT_CHAT: u32 = 10;
pub const DIR_STREAM_ZONE_STATS: u32 = 11;
pub const DIR_CREATE_SESSION: u32 = 12;
pub const DIR_TOUCH_SESSION: u32 = 13;
pub const DIR_REVOKE_SESSION: u32 = 14;
pub const DIR_REGISTER_COORDINATOR: u32 = 15;
pub const DIR_COORDINATOR_HEARTBEAT: u32 = 16;
pub const DIR_GET_COORDINATORS: u32 = 17;
pub const DIR_DELIVER_CHAT: u32 = 18;
pub const DIR_VALIDATE_SESSION_KEY: u32 = 19;
pub const DIR_GET_CLUSTER_INFO: u32 = 20;

// --- zone grain surface ---

pub const ZONE_GRAIN: &str = "zone";
pub const ZONE_INTERFACE: u32 = 2;

pub const ZONE_CONNECT_PLAYER: u32 = 1;
pub const ZONE_DISCONNECT_PLAYER: u32 = 2;
pub const ZONE_UPDATE_INPUT: u32 = 3;
pub const ZONE_UPDATE_INPUT_EX: u32 = 4;
pub const ZONE_GET_WORLD_STATE: u32 = 5;
pub const ZONE_TRANSFER_ENTITY_IN: u32 = 6;
pub const ZONE_TRANSFER_BULLET: u32 = 7;
pub const ZONE_NOTIFY_BULLET_DESTROYED: u32 = 8;
pub const ZONE_RECEIVE_SCOUT_ALERT: u32 = 9;
pub const ZONE_GET_LOCAL_WORLD_STATE: u32 = 10;
pub const ZONE_GET_ADJACENT_ENTITIES: u32 = 11;
pub const ZONE_GET_STATS: u32 = 12;
pub const ZONE_GET_FPS: u32 = 13;
pub const ZONE_SUBSCRIBE: u32 = 14;
pub const ZONE_UNSUBSCRIBE: u32 = 15;
pub const ZONE_STREAM_WORLD: u32 = 16;
pub const ZONE_STREAM_STATS: u32 = 17;
pub const ZONE_STREAM_ADJACENT: u32 = 18;
