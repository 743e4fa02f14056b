//! The directory grain: every RPC method the silo exposes, with its authorization policy.

use crate::state::SiloState;
use flint::contract::ChatMessage;
use chrono::{DateTime, Utc};
use flint::crypto;
use flint::session::{Role, SessionTicket};
use photon::rpc::codec::Value;
use photon::rpc::server::{CallCtx, MethodPolicy, RpcServer};
use photon::rpc::RpcError;
use serde::Serialize;

pub use flint::contract::{
    DIRECTORY_GRAIN, DIRECTORY_INTERFACE, DIR_BROADCAST_CHAT, DIR_COORDINATOR_HEARTBEAT,
    DIR_CREATE_SESSION, DIR_DELIVER_CHAT, DIR_GET_ALL_ACTION_SERVERS, DIR_GET_CLUSTER_INFO,
    DIR_GET_COORDINATORS, DIR_GET_RECENT_CHAT, DIR_GET_SERVER_FOR_POSITION,
    DIR_INITIATE_TRANSFER, DIR_REGISTER_ACTION_SERVER, DIR_REGISTER_COORDINATOR,
    DIR_REGISTER_PLAYER, DIR_REVOKE_SESSION, DIR_SERVER_HEARTBEAT, DIR_STREAM_ZONE_STATS,
    DIR_TOUCH_SESSION, DIR_UNREGISTER_ACTION_SERVER, DIR_UPDATE_PLAYER,
    DIR_VALIDATE_SESSION_KEY,
};

pub const STREAM_ZONE_STATS: &str = "zone-stats";

use photon::rpc::codec::args::{want_blob, want_i32, want_str, want_vec2};

fn want_datetime(args: &[Value], index: usize) -> Result<DateTime<Utc>, RpcError> {
    match args.get(index) {
        Some(Value::DateTime(millis)) => {
            DateTime::<Utc>::from_timestamp_millis(*millis).ok_or(RpcError::ArgumentDecode)
        }
        _ => Err(RpcError::ArgumentDecode),
    }
}

/// Serializes a structured reply into a blob value.
pub fn json_blob<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_vec(value)
        .map(Value::Blob)
        .map_err(|err| RpcError::Application(format!("encode: {}", err)))
}

fn require_self_or_admin(ctx: &CallCtx, player_id: &str) -> Result<(), RpcError> {
    let is_self = ctx.player_id.as_deref() == Some(player_id);

    if is_self || ctx.role >= Role::Admin {
        Ok(())
    } else {
        Err(RpcError::NotAuthorized)
    }
}

/// Registers the directory grain and all of its methods on an RPC server.
pub fn register_directory_grain(server: &mut RpcServer<SiloState>) {
    server.register_grain(DIRECTORY_GRAIN, DIRECTORY_INTERFACE);

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_REGISTER_ACTION_SERVER,
        "RegisterActionServer",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let server_id = want_str(&args, 0)?;
            let address = want_str(&args, 1)?;
            let rpc_port = want_i32(&args, 2)? as u16;
            let http_port = want_i32(&args, 3)? as u16;

            let info = state
                .directory
                .register_action_server(&server_id, &address, rpc_port, http_port);

            Ok(vec![json_blob(&info)?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_UNREGISTER_ACTION_SERVER,
        "UnregisterActionServer",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let server_id = want_str(&args, 0)?;
            state.directory.unregister_action_server(&server_id);
            Ok(Vec::new())
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_GET_ALL_ACTION_SERVERS,
        "GetAllActionServers",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, _ctx, _args| {
            Ok(vec![json_blob(&state.directory.all_servers())?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_GET_SERVER_FOR_POSITION,
        "GetActionServerForPosition",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let position = want_vec2(&args, 0)?;
            Ok(vec![json_blob(&state.directory.server_for_position(position))?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_REGISTER_PLAYER,
        "RegisterPlayer",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, ctx, args| {
            let player_id = want_str(&args, 0)?;
            let name = want_str(&args, 1)?;

            // Clients may only register the player their session names
            if ctx.role < Role::Server {
                require_self_or_admin(ctx, &player_id)?;
            }

            match state.directory.register_player(&player_id, &name) {
                Some(info) => Ok(vec![json_blob(&info)?]),
                None => Err(RpcError::Application("no owned zones".into())),
            }
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_INITIATE_TRANSFER,
        "InitiatePlayerTransfer",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, ctx, args| {
            let player_id = want_str(&args, 0)?;
            let position = want_vec2(&args, 1)?;

            if ctx.role < Role::Server {
                require_self_or_admin(ctx, &player_id)?;
            }

            Ok(vec![json_blob(&state.directory.initiate_transfer(&player_id, position))?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_UPDATE_PLAYER,
        "UpdatePlayerPositionAndVelocity",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let player_id = want_str(&args, 0)?;
            let position = want_vec2(&args, 1)?;
            let velocity = want_vec2(&args, 2)?;

            state.directory.update_player(&player_id, position, velocity);
            Ok(Vec::new())
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_BROADCAST_CHAT,
        "BroadcastChatMessage",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, ctx, args| {
            let text = want_str(&args, 0)?;
            let sender = ctx
                .player_name
                .clone()
                .unwrap_or_else(|| ctx.client_id.clone());

            state.add_chat(
                ChatMessage {
                    sender,
                    text,
                    at: Utc::now(),
                },
                true,
            );

            Ok(Vec::new())
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_SERVER_HEARTBEAT,
        "UpdateActionServerHeartbeat",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let server_id = want_str(&args, 0)?;

            match state.directory.heartbeat(&server_id) {
                true => Ok(Vec::new()),
                false => Err(RpcError::Application("unknown server".into())),
            }
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_GET_RECENT_CHAT,
        "GetRecentChatMessages",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let since = want_datetime(&args, 0)?;
            Ok(vec![json_blob(&state.recent_chat(since))?])
        }),
    );

    server.register_stream(
        DIRECTORY_INTERFACE,
        DIR_STREAM_ZONE_STATS,
        "StreamZoneStatistics",
        MethodPolicy::ClientAccessible,
        STREAM_ZONE_STATS,
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_CREATE_SESSION,
        "CreateSession",
        MethodPolicy::AllowAnonymous,
        Box::new(|state: &mut SiloState, ctx, args| {
            let name = want_str(&args, 0)?;
            let requested = Role::from_u8(want_i32(&args, 1)? as u8).ok_or(RpcError::ArgumentDecode)?;
            let duration = want_i32(&args, 2)?;

            // Elevated roles are only minted for callers already trusted as servers
            let granted = match ctx.role >= Role::Server {
                true => requested,
                _ => requested.min(Role::User),
            };

            let player_id = match &ctx.player_id {
                Some(id) => id.clone(),
                None => {
                    let mut raw = [0u8; 8];
                    crypto::random_bytes(&mut raw);
                    raw.iter().map(|byte| format!("{:02x}", byte)).collect()
                }
            };

            let duration_override = match duration >= 0 {
                true => Some(duration as u64),
                _ => None,
            };

            let session = state
                .sessions
                .create(player_id.clone(), name, granted, duration_override);

            let sealed = SessionTicket::from_session(&session).seal(&state.config.cluster.secret);

            Ok(vec![Value::Str(player_id), Value::Blob(sealed)])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_TOUCH_SESSION,
        "TouchSession",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, ctx, _args| {
            let player_id = ctx.player_id.as_deref().ok_or(RpcError::NotAuthorized)?;

            match state.sessions.touch(player_id) {
                true => Ok(Vec::new()),
                false => Err(RpcError::Application("unknown session".into())),
            }
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_REVOKE_SESSION,
        "RevokeSession",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, ctx, args| {
            let player_id = want_str(&args, 0)?;
            require_self_or_admin(ctx, &player_id)?;

            state.sessions.revoke(&player_id);
            Ok(Vec::new())
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_REGISTER_COORDINATOR,
        "RegisterCoordinator",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let coordinator_id = want_str(&args, 0)?;
            let http_endpoint = want_str(&args, 1)?;
            let event_bus_url = want_str(&args, 2)?;

            let info = state
                .presence
                .register(&coordinator_id, &http_endpoint, &event_bus_url);

            Ok(vec![json_blob(&info)?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_COORDINATOR_HEARTBEAT,
        "CoordinatorHeartbeat",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let coordinator_id = want_str(&args, 0)?;

            match state.presence.heartbeat(&coordinator_id) {
                true => Ok(Vec::new()),
                false => Err(RpcError::Application("unknown coordinator".into())),
            }
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_GET_COORDINATORS,
        "GetCoordinators",
        MethodPolicy::ClientAccessible,
        Box::new(|state: &mut SiloState, _ctx, _args| {
            Ok(vec![json_blob(&state.presence.live())?])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_DELIVER_CHAT,
        "DeliverChatMessage",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let sender = want_str(&args, 0)?;
            let text = want_str(&args, 1)?;
            let at = want_datetime(&args, 2)?;

            // Peer delivery never fans out again
            state.add_chat(ChatMessage { sender, text, at }, false);
            Ok(Vec::new())
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_VALIDATE_SESSION_KEY,
        "ValidateSessionKey",
        MethodPolicy::ServerOnly,
        Box::new(|state: &mut SiloState, _ctx, args| {
            let player_id = want_str(&args, 0)?;
            let offered = want_blob(&args, 1)?;

            Ok(vec![Value::Bool(state.sessions.validate_key(&player_id, &offered))])
        }),
    );

    server.register_method(
        DIRECTORY_INTERFACE,
        DIR_GET_CLUSTER_INFO,
        "GetClusterInfo",
        MethodPolicy::AllowAnonymous,
        Box::new(|state: &mut SiloState, _ctx, _args| {
            Ok(vec![Value::F64(state.directory.zone_side() as f64)])
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiloConfig;
    use flint::math::Vec2;
    use flint::contract::{ActionServerInfo, PlayerInfo, TransferInfo};
    use flint::math::GridSquare;
    use flint::session::SessionKey;
    use photon::rpc::client::{RpcClient, RpcClientConfig};
    use photon::rpc::server::RpcServerConfig;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Harness {
        server: RpcServer<SiloState>,
        state: SiloState,
        secret: SessionKey,
    }

    impl Harness {
        fn new() -> Harness {
            let secret = SessionKey::generate();

            let mut config = SiloConfig::default();
            config.cluster.secret = secret.clone();

            let server_config = RpcServerConfig {
                cluster_secret: Some(secret.clone()),
                ..RpcServerConfig::default()
            };

            let mut server =
                RpcServer::listen("127.0.0.1:0", "silo-test".into(), server_config, None).unwrap();
            register_directory_grain(&mut server);

            Harness {
                server,
                state: SiloState::new(config, None),
                secret,
            }
        }

        fn server_client(&mut self) -> RpcClient {
            let features = vec![format!("cluster={}", base64::encode(&self.secret[..]))];
            self.connect(features)
        }

        fn connect(&mut self, features: Vec<String>) -> RpcClient {
            let mut client =
                RpcClient::new("harness".into(), features, RpcClientConfig::default(), None).unwrap();
            client.connect(self.server.local_addr().unwrap(), Instant::now());

            for _ in 0..50 {
                let now = Instant::now();
                client.sync(now);
                self.server.sync(&mut self.state, now);

                if client.is_ready() {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }

            assert!(client.is_ready());
            client
        }

        fn call(
            &mut self,
            client: &mut RpcClient,
            method_id: u32,
            args: &[Value],
        ) -> Result<Vec<Value>, RpcError> {
            let id = client
                .call(
                    DIRECTORY_GRAIN,
                    DIRECTORY_INTERFACE,
                    method_id,
                    args,
                    Some(Duration::from_secs(2)),
                    Instant::now(),
                )
                .unwrap();

            for _ in 0..500 {
                let now = Instant::now();
                client.sync(now);
                self.server.sync(&mut self.state, now);

                if let Some(result) = client.take_completion(id) {
                    return result;
                }
                thread::sleep(Duration::from_millis(2));
            }

            panic!("Call never completed");
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(values: &[Value]) -> T {
        match values.first() {
            Some(Value::Blob(bytes)) => serde_json::from_slice(bytes).unwrap(),
            other => panic!("Expected blob reply, got {:?}", other),
        }
    }

    fn register_args(server_id: &str, rpc_port: i32) -> Vec<Value> {
        vec![
            Value::Str(server_id.into()),
            Value::Str("127.0.0.1".into()),
            Value::I32(rpc_port),
            Value::I32(rpc_port + 80),
        ]
    }

    #[test]
    fn test_zone_assignment_across_three_servers() {
        let mut harness = Harness::new();
        let mut client = harness.server_client();

        let a: ActionServerInfo =
            decode(&harness.call(&mut client, DIR_REGISTER_ACTION_SERVER, &register_args("A", 12000)).unwrap());
        let b: ActionServerInfo =
            decode(&harness.call(&mut client, DIR_REGISTER_ACTION_SERVER, &register_args("B", 12001)).unwrap());
        let c: ActionServerInfo =
            decode(&harness.call(&mut client, DIR_REGISTER_ACTION_SERVER, &register_args("C", 12002)).unwrap());

        assert_eq!(a.assigned_square, GridSquare::new(0, 0));
        assert_eq!(b.assigned_square, GridSquare::new(1, 0));
        assert_eq!(c.assigned_square, GridSquare::new(0, 1));

        // Idempotent re-register leaves the fleet unchanged
        let b_again: ActionServerInfo =
            decode(&harness.call(&mut client, DIR_REGISTER_ACTION_SERVER, &register_args("B", 12001)).unwrap());
        assert_eq!(b_again.assigned_square, GridSquare::new(1, 0));

        let all: Vec<ActionServerInfo> =
            decode(&harness.call(&mut client, DIR_GET_ALL_ACTION_SERVERS, &[]).unwrap());
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_guest_cannot_register_action_server() {
        let mut harness = Harness::new();
        let mut client = harness.connect(Vec::new());

        let result = harness.call(&mut client, DIR_REGISTER_ACTION_SERVER, &register_args("A", 12000));

        assert_eq!(result.unwrap_err(), RpcError::NotAuthorized);
    }

    #[test]
    fn test_session_then_player_registration_flow() {
        let mut harness = Harness::new();

        // Seed the grid so players have somewhere to spawn
        let mut ops = harness.server_client();
        harness.call(&mut ops, DIR_REGISTER_ACTION_SERVER, &register_args("A", 12000)).unwrap();
        harness.call(&mut ops, DIR_REGISTER_ACTION_SERVER, &register_args("B", 12001)).unwrap();
        harness.call(&mut ops, DIR_REGISTER_ACTION_SERVER, &register_args("C", 12002)).unwrap();

        // Anonymous caller creates a session...
        let mut guest = harness.connect(Vec::new());
        let reply = harness
            .call(
                &mut guest,
                DIR_CREATE_SESSION,
                &[Value::Str("Alice".into()), Value::I32(Role::User as i32), Value::I32(-1)],
            )
            .unwrap();

        let player_id = match &reply[0] {
            Value::Str(id) => id.clone(),
            other => panic!("Expected player id, got {:?}", other),
        };
        let ticket = match &reply[1] {
            Value::Blob(bytes) => bytes.clone(),
            other => panic!("Expected ticket, got {:?}", other),
        };

        // ...reconnects with the ticket and registers its player
        let mut user = harness.connect(vec![format!("ticket={}", base64::encode(&ticket))]);
        let info: PlayerInfo = decode(
            &harness
                .call(
                    &mut user,
                    DIR_REGISTER_PLAYER,
                    &[Value::Str(player_id.clone()), Value::Str("Alice".into())],
                )
                .unwrap(),
        );

        assert_eq!(info.player_id, player_id);

        let squares = [GridSquare::new(0, 0), GridSquare::new(1, 0), GridSquare::new(0, 1)];
        assert!(squares.contains(&GridSquare::containing(info.position, 500.0)));
    }

    #[test]
    fn test_guest_cannot_register_player() {
        let mut harness = Harness::new();
        let mut guest = harness.connect(Vec::new());

        let result = harness.call(
            &mut guest,
            DIR_REGISTER_PLAYER,
            &[Value::Str("p1".into()), Value::Str("Alice".into())],
        );

        assert_eq!(result.unwrap_err(), RpcError::NotAuthorized);
    }

    #[test]
    fn test_transfer_nomination_over_rpc() {
        let mut harness = Harness::new();
        let mut ops = harness.server_client();

        harness.call(&mut ops, DIR_REGISTER_ACTION_SERVER, &register_args("A", 12000)).unwrap();
        harness.call(&mut ops, DIR_REGISTER_ACTION_SERVER, &register_args("B", 12001)).unwrap();

        harness.call(
            &mut ops,
            DIR_REGISTER_PLAYER,
            &[Value::Str("p1".into()), Value::Str("Alice".into())],
        )
        .unwrap();

        // Drive the player onto the A/B boundary from the server side
        harness
            .call(
                &mut ops,
                DIR_UPDATE_PLAYER,
                &[
                    Value::Str("p1".into()),
                    Value::Vec2(Vec2::new(499.0, 250.0)),
                    Value::Vec2(Vec2::ZERO),
                ],
            )
            .unwrap();
        harness.state.directory.initiate_transfer("p1", Vec2::new(10.0, 10.0));

        let transfer: Option<TransferInfo> = decode(
            &harness
                .call(
                    &mut ops,
                    DIR_INITIATE_TRANSFER,
                    &[Value::Str("p1".into()), Value::Vec2(Vec2::new(501.0, 250.0))],
                )
                .unwrap(),
        );

        assert_eq!(transfer.unwrap().target.server_id, "B");
    }

    #[test]
    fn test_chat_broadcast_and_poll() {
        let mut harness = Harness::new();
        let mut ops = harness.server_client();

        harness
            .call(&mut ops, DIR_BROADCAST_CHAT, &[Value::Str("hello zones".into())])
            .unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let messages: Vec<ChatMessage> = decode(
            &harness
                .call(&mut ops, DIR_GET_RECENT_CHAT, &[Value::DateTime(since.timestamp_millis())])
                .unwrap(),
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello zones");
        assert_eq!(harness.state.fanout.len(), 1);
    }

    #[test]
    fn test_cluster_info() {
        let mut harness = Harness::new();
        let mut guest = harness.connect(Vec::new());

        let reply = harness.call(&mut guest, DIR_GET_CLUSTER_INFO, &[]).unwrap();

        assert_eq!(reply, vec![Value::F64(500.0)]);
    }
}
