use clap::{App, Arg};
use flint::choose;
use flint::session::SessionKey;
use silo::config::SiloConfig;
use std::fs;
use std::path::PathBuf;
use std::process::{exit, Child, Command};
use zonecore::config::GameConfig;

const BASE_SILO_RPC_PORT: u16 = 27500;
const BASE_ZONE_RPC_PORT: u16 = 28008;

/// Orchestrator: generates per-process configs around a shared secret, then spawns N silo
/// coordinators and M action servers and waits on them. Exit code 0 only when every child
/// shut down cleanly.
fn main() {
    let matches = App::new("Cluster Launcher")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Spawns a local cluster of coordinators and action servers.")
        .arg(
            Arg::with_name("coordinators")
                .long("coordinators")
                .takes_value(true)
                .help("Number of silo coordinators (default 1)"),
        )
        .arg(
            Arg::with_name("servers")
                .long("servers")
                .takes_value(true)
                .help("Number of action servers (default 3)"),
        )
        .arg(
            Arg::with_name("transport")
                .long("transport")
                .takes_value(true)
                .help("Transport selection forwarded to every process (default udp)"),
        )
        .arg(
            Arg::with_name("run-dir")
                .long("run-dir")
                .takes_value(true)
                .help("Directory for generated configs and state (default ./cluster-run)"),
        )
        .get_matches();

    let coordinators: u16 = matches
        .value_of("coordinators")
        .unwrap_or("1")
        .parse()
        .expect("coordinators must be a number");
    let servers: u16 = matches
        .value_of("servers")
        .unwrap_or("3")
        .parse()
        .expect("servers must be a number");
    let transport = matches.value_of("transport").unwrap_or("udp").to_string();
    let run_dir = PathBuf::from(matches.value_of("run-dir").unwrap_or("cluster-run"));

    fs::create_dir_all(&run_dir).expect("Error creating run directory");

    let secret = SessionKey::generate();
    println!(
        "Cluster secret fingerprint: {} ({} coordinators, {} servers)",
        secret.fingerprint(),
        coordinators,
        servers
    );

    let mut children: Vec<(String, Child)> = Vec::new();

    // Coordinators first so the servers have somewhere to register
    let peer_addrs: Vec<String> = (0..coordinators)
        .map(|index| format!("127.0.0.1:{}", BASE_SILO_RPC_PORT + index))
        .collect();

    for index in 0..coordinators {
        let instance_id = format!("silo-{}", index);

        let mut config = SiloConfig::default();
        config.cluster.secret = secret.clone();
        config.server.rpc_address = format!("0.0.0.0:{}", BASE_SILO_RPC_PORT + index);
        config.server.http_port = BASE_SILO_RPC_PORT + 1000 + index;
        config.storage.data_dir = run_dir.join(&instance_id).to_str().unwrap().to_string();
        config.presence.peers = peer_addrs
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != index as usize)
            .map(|(_, addr)| addr.clone())
            .collect();

        let config_path = run_dir.join(format!("{}.toml", instance_id));
        write_toml(&config_path, &config);

        children.push((
            instance_id.clone(),
            spawn(sibling("silo"), &config_path, &instance_id, &transport),
        ));
    }

    for index in 0..servers {
        let instance_id = format!("zone-{}", index);

        let mut config = GameConfig::default();
        config.server.secret = secret.clone();
        config.server.rpc_address = format!("0.0.0.0:{}", BASE_ZONE_RPC_PORT + index);
        config.server.http_port = BASE_ZONE_RPC_PORT + 1000 + index;
        config.server.silo_address = format!("127.0.0.1:{}", BASE_SILO_RPC_PORT);

        let config_path = run_dir.join(format!("{}.toml", instance_id));
        write_toml(&config_path, &config);

        children.push((
            instance_id.clone(),
            spawn(sibling("zonerunner"), &config_path, &instance_id, &transport),
        ));
    }

    let mut failed = false;
    for (instance_id, mut child) in children {
        match child.wait() {
            Ok(status) if status.success() => {
                println!("{} exited cleanly", instance_id);
            }
            Ok(status) => {
                println!("{} crashed: {}", instance_id, status);
                failed = true;
            }
            Err(err) => {
                println!("{} unreachable: {}", instance_id, err);
                failed = true;
            }
        }
    }

    exit(choose!(failed => 1, 0));
}

fn write_toml<T: serde::Serialize>(path: &PathBuf, config: &T) {
    let toml = serdeconv::to_toml_string(config).expect("Error encoding config");
    fs::write(path, toml).expect("Error writing config file");
}

/// Resolves a sibling binary next to the launcher.
fn sibling(name: &str) -> PathBuf {
    let mut path = std::env::current_exe().expect("Error resolving launcher path");
    path.pop();
    path.push(name);
    path
}

fn spawn(binary: PathBuf, config_path: &PathBuf, instance_id: &str, transport: &str) -> Child {
    Command::new(&binary)
        .arg(config_path)
        .arg(format!("--transport={}", transport))
        .env("INSTANCE_ID", instance_id)
        .env("CLUSTER_ID", "local")
        .env("SERVICE_ID", "shooter")
        .spawn()
        .unwrap_or_else(|err| panic!("Error spawning {:?}: {}", binary, err))
}
