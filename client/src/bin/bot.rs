use clap::{App, Arg};
use client::router::{ClientRouter, RouterConfig};
use flint::logging;
use flint::math::Vec2;
use rand::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(50);
const HEADING_CHANGE: Duration = Duration::from_secs(2);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const WALK_SPEED: f32 = 120.0;

/// Headless soak client: logs in, wanders the world at walking speed and shoots at whatever
/// direction it is facing, exercising discovery, input, snapshots and zone transitions.
fn main() {
    let matches = App::new("Bot Client")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs a headless wandering client.")
        .arg(
            Arg::with_name("silo")
                .long("silo")
                .takes_value(true)
                .help("Silo RPC address (default 127.0.0.1:27500)"),
        )
        .arg(
            Arg::with_name("name")
                .long("name")
                .takes_value(true)
                .help("Player name (default: randomized)"),
        )
        .arg(
            Arg::with_name("duration")
                .long("duration")
                .takes_value(true)
                .help("Seconds to run before a clean exit (default: forever)"),
        )
        .get_matches();

    let logger = logging::init();
    let mut rng = thread_rng();

    let name = matches
        .value_of("name")
        .map(str::to_string)
        .unwrap_or_else(|| format!("bot-{:04x}", rng.gen::<u16>()));

    let config = RouterConfig {
        silo_address: matches
            .value_of("silo")
            .unwrap_or("127.0.0.1:27500")
            .to_string(),
        ..RouterConfig::default()
    };

    let deadline = matches
        .value_of("duration")
        .map(|raw| raw.parse::<u64>().expect("duration must be seconds"))
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    logging::info!(logger, "bot starting"; "name" => &name, "silo" => &config.silo_address);

    let mut router = loop {
        match ClientRouter::login(&name, config.clone(), &logger) {
            Ok(router) => break router,
            Err(err) => {
                logging::warn!(logger, "login failed, retrying"; "error" => %err);
                thread::sleep(Duration::from_secs(1));
            }
        }
    };

    let mut heading = random_heading(&mut rng);
    let mut heading_at = Instant::now();
    let mut report_at = Instant::now();
    let mut last = Instant::now();

    loop {
        let now = Instant::now();

        if let Some(deadline) = deadline {
            if now >= deadline {
                logging::info!(logger, "bot finished"; "name" => &name);
                return;
            }
        }

        if now.duration_since(heading_at) >= HEADING_CHANGE {
            heading_at = now;
            heading = random_heading(&mut rng);
        }

        // The client is authoritative for its position between server corrections
        let dt = now.duration_since(last).as_secs_f32();
        last = now;
        router.set_position(router.position() + heading * (WALK_SPEED * dt));

        router.tick(now);

        let shoot = match rng.gen_bool(0.3) {
            true => Some(heading),
            _ => None,
        };
        router.send_input(Some(heading), shoot, now);

        if now.duration_since(report_at) >= REPORT_INTERVAL {
            report_at = now;

            let entities = router.world_state().map_or(0, |state| state.entities.len());
            logging::info!(logger, "bot status";
                           "name" => &name,
                           "x" => router.position().x,
                           "y" => router.position().y,
                           "zone" => ?router.own_zone(),
                           "server" => router.active_server_id().unwrap_or("-"),
                           "entities" => entities,
                           "warnings" => router.warnings(),
                           "aborts" => router.aborts());
        }

        thread::sleep(TICK);
    }
}

fn random_heading(rng: &mut ThreadRng) -> Vec2 {
    let angle = rng.gen::<f32>() * std::f32::consts::TAU;
    Vec2::new(angle.cos(), angle.sin())
}
