use clap::{App, Arg};
use flint::contract::{self, ActionServerInfo};
use flint::logging;
use photon::net::channel::Delivery;
use photon::rpc::client::{RpcClient, RpcClientConfig};
use photon::rpc::codec::Value;
use photon::rpc::server::{RpcServer, RpcServerConfig};
use std::env;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;
use zonecore::config::GameConfig;
use zonecore::entity::WorldState;
use zonecore::fabric::Fabric;
use zonecore::grain::{self, ZoneServerState};
use zonecore::sim;
use zonecore::world::{SimCommand, ZoneWorld};

const LOOP_SLEEP: Duration = Duration::from_millis(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const TOPOLOGY_INTERVAL: Duration = Duration::from_secs(5);
const STATS_STREAM_INTERVAL: Duration = Duration::from_secs(1);
const ADJACENT_STREAM_INTERVAL: Duration = Duration::from_millis(100);
const REGISTER_ATTEMPTS: u32 = 30;
const HEARTBEAT_FAILURE_LIMIT: u32 = 5;

fn main() {
    let matches = App::new("Zone Runner")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs one zone's action server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::with_name("transport")
                .long("transport")
                .takes_value(true)
                .help("Transport selection (only `udp` is available)"),
        )
        .arg(
            Arg::with_name("rpc-port")
                .long("rpc-port")
                .takes_value(true)
                .help("Overrides the configured RPC port"),
        )
        .arg(
            Arg::with_name("http-port")
                .long("http-port")
                .takes_value(true)
                .help("Overrides the configured HTTP port"),
        )
        .arg(
            Arg::with_name("silo-addr")
                .long("silo-addr")
                .takes_value(true)
                .help("Overrides the configured silo address"),
        )
        .get_matches();

    if let Some(transport) = matches.value_of("transport") {
        if transport != "udp" {
            panic!("Unsupported transport `{}`", transport);
        }
    }

    let logger = logging::init();

    let server_id = env::var("INSTANCE_ID").unwrap_or_else(|_| "zone-0".to_string());
    let cluster_id = env::var("CLUSTER_ID").unwrap_or_else(|_| "dev".to_string());
    let service_id = env::var("SERVICE_ID").unwrap_or_else(|_| "shooter".to_string());

    let mut config = GameConfig::load(matches.value_of("CONFIG_FILE").unwrap());

    if let Some(port) = matches.value_of("rpc-port") {
        let port: u16 = port.parse().expect("rpc-port must be a valid port");
        let host = host_of(&config.server.rpc_address);
        config.server.rpc_address = format!("{}:{}", host, port);
    }
    if let Some(port) = matches.value_of("http-port") {
        config.server.http_port = port.parse().expect("http-port must be a valid port");
    }
    if let Some(addr) = matches.value_of("silo-addr") {
        config.server.silo_address = addr.to_string();
    }

    logging::info!(logger, "starting action server";
                   "server_id" => &server_id,
                   "cluster_id" => &cluster_id,
                   "service_id" => &service_id,
                   "rpc_address" => &config.server.rpc_address,
                   "silo" => &config.server.silo_address,
                   "secret_fp" => config.server.secret.fingerprint());

    let cluster_feature = format!("cluster={}", base64::encode(&config.server.secret[..]));

    let mut silo = RpcClient::new(
        server_id.clone(),
        vec![cluster_feature],
        RpcClientConfig {
            default_timeout: Duration::from_secs(5),
            ..RpcClientConfig::default()
        },
        &logger,
    )
    .unwrap_or_else(|err| panic!("Error creating directory client: {:?}", err));

    let info = register_with_directory(&mut silo, &server_id, &config, &logger);
    let square = info.assigned_square;

    logging::info!(logger, "zone assigned"; "square" => ?square);

    let zone_config = config.zone.clone();

    let world = ZoneWorld::new(square, zone_config.clone(), &logger);
    let sim = sim::spawn(world, &logger);

    // Seed the zone's enemy factory at its center
    sim.send(SimCommand::SpawnFactory {
        position: square.center(zone_config.zone_side),
    });

    let server_config = RpcServerConfig {
        cluster_secret: Some(config.server.secret.clone()),
        ..RpcServerConfig::default()
    };

    let mut server: RpcServer<ZoneServerState> = RpcServer::listen(
        &config.server.rpc_address,
        server_id.clone(),
        server_config,
        &logger,
    )
    .unwrap_or_else(|err| panic!("Unrecoverable bind failure: {:?}", err));

    grain::register_zone_grain(&mut server);

    let mut state = ZoneServerState {
        sim,
        square,
        zone: zone_config.clone(),
        draining: false,
        adjacent: WorldState::default(),
    };

    let mut fabric = Fabric::new(square, &config.server.secret, &logger);

    let mut heartbeat_at = Instant::now();
    let mut topology_at = Instant::now();
    let mut stats_stream_at = Instant::now();
    let mut adjacent_stream_at = Instant::now();
    let mut last_snapshot_ms = 0u64;
    let mut heartbeat_failures = 0u32;
    let mut pending_heartbeats: Vec<Uuid> = Vec::new();
    let mut pending_topology: Option<Uuid> = None;

    loop {
        let now = Instant::now();

        server.sync(&mut state, now);
        silo.sync(now);
        fabric.sync(now);

        // Ship cross-zone effects; position reports go to the directory instead
        let events = state.sim.drain_out();
        let reports = fabric.dispatch(events, now);

        for report in reports {
            if let zonecore::world::OutEvent::PositionReport {
                player_id,
                position,
                velocity,
            } = report
            {
                let _ = silo.call(
                    contract::DIRECTORY_GRAIN,
                    contract::DIRECTORY_INTERFACE,
                    contract::DIR_UPDATE_PLAYER,
                    &[
                        Value::Str(player_id),
                        Value::Vec2(position),
                        Value::Vec2(velocity),
                    ],
                    Some(Duration::from_secs(2)),
                    now,
                );
            }
        }

        state.adjacent = fabric.adjacent_entities();

        publish_streams(
            &mut server,
            &state,
            &mut last_snapshot_ms,
            &mut stats_stream_at,
            &mut adjacent_stream_at,
            now,
        );

        if now.duration_since(heartbeat_at) >= HEARTBEAT_INTERVAL {
            heartbeat_at = now;

            match silo.call(
                contract::DIRECTORY_GRAIN,
                contract::DIRECTORY_INTERFACE,
                contract::DIR_SERVER_HEARTBEAT,
                &[Value::Str(server_id.clone())],
                Some(Duration::from_secs(2)),
                now,
            ) {
                Ok(id) => pending_heartbeats.push(id),
                Err(_) => heartbeat_failures += 1,
            }
        }

        // Settle heartbeat outcomes; a run of failures drains the server
        let mut unsettled = Vec::new();
        for id in pending_heartbeats.drain(..) {
            match silo.take_completion(id) {
                Some(Ok(_)) => heartbeat_failures = 0,
                Some(Err(err)) => {
                    logging::warn!(logger, "directory heartbeat failed"; "error" => %err);
                    heartbeat_failures += 1;
                }
                None => unsettled.push(id),
            }
        }
        pending_heartbeats = unsettled;

        if heartbeat_failures >= HEARTBEAT_FAILURE_LIMIT && !state.draining {
            logging::error!(logger, "directory unreachable, draining"; "server_id" => &server_id);
            state.draining = true;
        }

        if now.duration_since(topology_at) >= TOPOLOGY_INTERVAL && pending_topology.is_none() {
            topology_at = now;

            if let Ok(id) = silo.call(
                contract::DIRECTORY_GRAIN,
                contract::DIRECTORY_INTERFACE,
                contract::DIR_GET_ALL_ACTION_SERVERS,
                &[],
                Some(Duration::from_secs(2)),
                now,
            ) {
                pending_topology = Some(id);
            }
        }

        if let Some(id) = pending_topology {
            if let Some(result) = silo.take_completion(id) {
                pending_topology = None;

                if let Ok(values) = result {
                    if let Some(Value::Blob(blob)) = values.first() {
                        if let Ok(servers) = serde_json::from_slice::<Vec<ActionServerInfo>>(blob) {
                            fabric.update_topology(&servers, now);
                        }
                    }
                }
            }
        }

        silo.take_all_completions();
        silo.take_notifications();

        thread::sleep(LOOP_SLEEP);
    }
}

/// Pushes the observer streams: world snapshots on every fresh tick (unreliable, loss is
/// masked by the next tick), zone stats at 1 Hz, the adjacent aggregate at 10 Hz.
fn publish_streams(
    server: &mut RpcServer<ZoneServerState>,
    state: &ZoneServerState,
    last_snapshot_ms: &mut u64,
    stats_stream_at: &mut Instant,
    adjacent_stream_at: &mut Instant,
    now: Instant,
) {
    let snapshot = state.sim.snapshot();

    if snapshot.timestamp_ms != *last_snapshot_ms {
        *last_snapshot_ms = snapshot.timestamp_ms;
        let blob = snapshot.write();

        for tag in [grain::STREAM_WORLD, grain::STREAM_WORLD_UPDATES].iter() {
            for subscription in server.subscriptions(tag) {
                server.notify(subscription.id, 0, blob.clone(), Delivery::Unreliable, now);
            }
        }
    }

    if now.duration_since(*stats_stream_at) >= STATS_STREAM_INTERVAL {
        *stats_stream_at = now;

        if let Ok(blob) = serde_json::to_vec(&state.sim.stats()) {
            for subscription in server.subscriptions(grain::STREAM_ZONE_STATS) {
                server.notify(subscription.id, 0, blob.clone(), Delivery::Reliable, now);
            }
        }
    }

    if now.duration_since(*adjacent_stream_at) >= ADJACENT_STREAM_INTERVAL {
        *adjacent_stream_at = now;
        let blob = state.adjacent.write();

        for subscription in server.subscriptions(grain::STREAM_ADJACENT) {
            server.notify(subscription.id, 0, blob.clone(), Delivery::Unreliable, now);
        }
    }
}

/// Registers with the directory, retrying until the silo answers. The assignment is
/// idempotent, so crash-restart with the same instance id lands on the same square.
fn register_with_directory(
    silo: &mut RpcClient,
    server_id: &str,
    config: &GameConfig,
    logger: &logging::Logger,
) -> ActionServerInfo {
    let silo_addr = config
        .server
        .silo_address
        .parse()
        .expect("Invalid silo address");

    let (host, rpc_port) = split_addr(&config.server.rpc_address);
    let advertised = match host.as_str() {
        "0.0.0.0" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };

    for attempt in 1..=REGISTER_ATTEMPTS {
        silo.connect(silo_addr, Instant::now());

        if silo.wait_for_manifest(Duration::from_secs(2)).is_err() {
            logging::warn!(logger, "directory not reachable"; "attempt" => attempt);
            thread::sleep(Duration::from_secs(1));
            continue;
        }

        let result = silo.call_blocking(
            contract::DIRECTORY_GRAIN,
            contract::DIRECTORY_INTERFACE,
            contract::DIR_REGISTER_ACTION_SERVER,
            &[
                Value::Str(server_id.to_string()),
                Value::Str(advertised.clone()),
                Value::I32(rpc_port as i32),
                Value::I32(config.server.http_port as i32),
            ],
            Duration::from_secs(5),
        );

        match result {
            Ok(values) => {
                if let Some(Value::Blob(blob)) = values.first() {
                    if let Ok(info) = serde_json::from_slice::<ActionServerInfo>(blob) {
                        return info;
                    }
                }
                panic!("Malformed registration reply");
            }
            Err(err) => {
                logging::warn!(logger, "registration failed"; "attempt" => attempt, "error" => %err);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    panic!("Could not register with the directory at {}", config.server.silo_address);
}

fn host_of(addr: &str) -> String {
    split_addr(addr).0
}

fn split_addr(addr: &str) -> (String, u16) {
    let mut parts = addr.rsplitn(2, ':');
    let port = parts
        .next()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(zonecore::config::DEFAULT_RPC_PORT);
    let host = parts.next().unwrap_or("0.0.0.0").to_string();

    (host, port)
}
