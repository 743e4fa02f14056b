use clap::{App, Arg};
use flint::logging;
use hashbrown::HashMap;
use photon::rpc::client::{RpcClient, RpcClientConfig};
use photon::rpc::codec::Value;
use photon::rpc::server::{RpcServer, RpcServerConfig};
use silo::config::SiloConfig;
use silo::grain;
use silo::state::SiloState;
use std::env;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use photon::net::channel::Delivery;

const LOOP_SLEEP: Duration = Duration::from_millis(2);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    let matches = App::new("Silo Coordinator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the zone directory coordinator.")
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
        .get_matches();

    if let Some(transport) = matches.value_of("transport") {
        if transport != "udp" {
            panic!("Unsupported transport `{}`", transport);
        }
    }

    let logger = logging::init();

    let instance_id = env::var("INSTANCE_ID").unwrap_or_else(|_| "silo-0".to_string());
    let cluster_id = env::var("CLUSTER_ID").unwrap_or_else(|_| "dev".to_string());
    let service_id = env::var("SERVICE_ID").unwrap_or_else(|_| "shooter".to_string());

    let mut config = SiloConfig::load(matches.value_of("CONFIG_FILE").unwrap());

    if let Some(port) = matches.value_of("rpc-port") {
        let port: u16 = port.parse().expect("rpc-port must be a valid port");
        let host = config
            .server
            .rpc_address
            .rsplitn(2, ':')
            .last()
            .unwrap_or("0.0.0.0")
            .to_string();
        config.server.rpc_address = format!("{}:{}", host, port);
    }

    if let Some(port) = matches.value_of("http-port") {
        config.server.http_port = port.parse().expect("http-port must be a valid port");
    }

    logging::info!(logger, "starting coordinator";
                   "instance_id" => &instance_id,
                   "cluster_id" => &cluster_id,
                   "service_id" => &service_id,
                   "rpc_address" => &config.server.rpc_address,
                   "secret_fp" => config.cluster.secret.fingerprint());

    let server_config = RpcServerConfig {
        cluster_secret: Some(config.cluster.secret.clone()),
        ..RpcServerConfig::default()
    };

    let mut server: RpcServer<SiloState> = RpcServer::listen(
        &config.server.rpc_address,
        instance_id.clone(),
        server_config,
        &logger,
    )
    .unwrap_or_else(|err| panic!("Unrecoverable bind failure: {:?}", err));

    grain::register_directory_grain(&mut server);

    let mut state = SiloState::new(config.clone(), &logger);

    // Self-registration so peers (and clients) can discover this coordinator
    let rpc_address = config.server.rpc_address.clone();
    state.presence.register(
        &instance_id,
        &format!("http://127.0.0.1:{}", config.server.http_port),
        &rpc_address,
    );

    let cluster_feature = format!("cluster={}", base64::encode(&config.cluster.secret[..]));
    let mut peer_links: HashMap<String, RpcClient> = HashMap::new();

    let mut housekeeping_at = Instant::now();
    let mut presence_beat_at = Instant::now();
    let presence_beat = Duration::from_secs(config.presence.heartbeat_secs.max(1));
    let http_endpoint = format!("http://127.0.0.1:{}", config.server.http_port);

    loop {
        let now = Instant::now();

        server.sync(&mut state, now);

        if now.duration_since(housekeeping_at) >= HOUSEKEEPING_INTERVAL {
            housekeeping_at = now;
            housekeeping(&mut server, &mut state, &instance_id, now, &logger);
        }

        // Announce this coordinator to its peers; registration doubles as the heartbeat
        // since it refreshes the remote record either way
        if now.duration_since(presence_beat_at) >= presence_beat {
            presence_beat_at = now;

            ensure_peer_links(&mut state, &mut peer_links, &cluster_feature, &logger);

            for link in peer_links.values_mut() {
                if link.is_ready() {
                    let _ = link.call(
                        grain::DIRECTORY_GRAIN,
                        grain::DIRECTORY_INTERFACE,
                        grain::DIR_REGISTER_COORDINATOR,
                        &[
                            Value::Str(instance_id.clone()),
                            Value::Str(http_endpoint.clone()),
                            Value::Str(rpc_address.clone()),
                        ],
                        Some(Duration::from_secs(2)),
                        now,
                    );
                }
            }
        }

        fan_out(&mut state, &mut peer_links, &cluster_feature, &logger);

        for link in peer_links.values_mut() {
            link.sync(now);
            link.take_all_completions();
            link.take_notifications();
        }

        thread::sleep(LOOP_SLEEP);
    }
}

/// Lazily opens (or reopens) a link to every configured peer coordinator.
fn ensure_peer_links(
    state: &mut SiloState,
    peer_links: &mut HashMap<String, RpcClient>,
    cluster_feature: &str,
    logger: &logging::Logger,
) {
    use photon::rpc::client::ClientState;

    let peers = state.config.presence.peers.clone();

    for peer_addr in peers {
        let remote: SocketAddr = match peer_addr.parse() {
            Ok(remote) => remote,
            Err(_) => continue,
        };

        let link = peer_links.entry(peer_addr.clone()).or_insert_with(|| {
            RpcClient::new(
                format!("silo-link-{}", peer_addr),
                vec![cluster_feature.to_string()],
                RpcClientConfig::default(),
                logger,
            )
            .expect("Error creating peer link")
        });

        if matches!(link.state(), ClientState::Idle | ClientState::Closed) {
            link.connect(remote, Instant::now());
        }
    }
}

/// Periodic upkeep: heartbeat self-presence, evict stale entries, sweep sessions, publish the
/// stats stream and persist dirty directory state.
fn housekeeping(
    server: &mut RpcServer<SiloState>,
    state: &mut SiloState,
    instance_id: &str,
    now: Instant,
    logger: &logging::Logger,
) {
    state.presence.heartbeat(instance_id);
    state.presence.evict_stale();

    let evicted = state.directory.evict_stale();
    if !evicted.is_empty() {
        logging::warn!(logger, "evicted action servers"; "count" => evicted.len());
    }

    state.sessions.sweep();

    let subscriptions = server.subscriptions(grain::STREAM_ZONE_STATS);
    if !subscriptions.is_empty() {
        if let Ok(stats) = serde_json::to_vec(&state.directory.zone_stats()) {
            for subscription in subscriptions {
                server.notify(subscription.id, 0, stats.clone(), Delivery::Reliable, now);
            }
        }
    }

    let data_dir = state.config.storage.data_dir.clone();
    state.directory.save_if_dirty(&data_dir);
}

/// Best-effort chat delivery to every live peer coordinator. Loss is masked by the polling
/// endpoint on the receiving side.
fn fan_out(
    state: &mut SiloState,
    peer_links: &mut HashMap<String, RpcClient>,
    cluster_feature: &str,
    logger: &logging::Logger,
) {
    if state.fanout.is_empty() {
        return;
    }

    ensure_peer_links(state, peer_links, cluster_feature, logger);

    let messages = std::mem::take(&mut state.fanout);

    for link in peer_links.values_mut() {
        if !link.is_ready() {
            continue;
        }

        for message in &messages {
            let _ = link.call(
                grain::DIRECTORY_GRAIN,
                grain::DIRECTORY_INTERFACE,
                grain::DIR_DELIVER_CHAT,
                &[
                    Value::Str(message.sender.clone()),
                    Value::Str(message.text.clone()),
                    Value::DateTime(message.at.timestamp_millis()),
                ],
                Some(Duration::from_millis(500)),
                Instant::now(),
            );
        }
    }
}
