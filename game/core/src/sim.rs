//! The simulation thread harness. One dedicated thread advances the world at a fixed cadence;
//! the network side talks to it exclusively through the command queue and the published
//! snapshot/outbox cells, so producers never block and the simulation never suspends on RPC.

use crate::entity::WorldState;
use crate::world::{OutEvent, SimCommand, SimStats, ZoneWorld};
use flint::logging;
use flint::math::GridSquare;
use flint::time::timestamp_millis;
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Network-side handle to the simulation thread. Cloneable: every clone feeds the same queue.
#[derive(Clone)]
pub struct SimHandle {
    square: GridSquare,
    commands: Sender<SimCommand>,
    snapshot: Arc<Mutex<Arc<WorldState>>>,
    outbox: Arc<Mutex<Vec<OutEvent>>>,
    stats: Arc<Mutex<SimStats>>,
}

impl SimHandle {
    #[inline]
    pub fn square(&self) -> GridSquare {
        self.square
    }

    /// Enqueues an intent for the next tick. Never blocks; a dead simulation drops intents.
    #[inline]
    pub fn send(&self, command: SimCommand) {
        let _ = self.commands.send(command);
    }

    /// Latest published snapshot, at most one tick stale.
    #[inline]
    pub fn snapshot(&self) -> Arc<WorldState> {
        self.snapshot.lock().expect("Snapshot cell poisoned").clone()
    }

    /// Drains the cross-zone effects the simulation produced since the last call.
    #[inline]
    pub fn drain_out(&self) -> Vec<OutEvent> {
        std::mem::take(&mut *self.outbox.lock().expect("Outbox poisoned"))
    }

    #[inline]
    pub fn stats(&self) -> SimStats {
        self.stats.lock().expect("Stats cell poisoned").clone()
    }
}

/// Spawns the simulation thread and returns the handle. The thread exits when every handle
/// clone has been dropped.
pub fn spawn<'a, L: Into<Option<&'a logging::Logger>>>(mut world: ZoneWorld, log: L) -> SimHandle {
    let square = world.square();
    let log = logging::child(log);

    let (commands, inbox) = channel::<SimCommand>();
    let snapshot = Arc::new(Mutex::new(Arc::new(WorldState::default())));
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let stats = Arc::new(Mutex::new(SimStats::default()));

    let handle = SimHandle {
        square,
        commands,
        snapshot: snapshot.clone(),
        outbox: outbox.clone(),
        stats: stats.clone(),
    };

    thread::Builder::new()
        .name(format!("sim-{}-{}", square.x, square.y))
        .spawn(move || {
            let tick_duration = Duration::from_micros(1_000_000 / world.tick_rate());

            logging::info!(log, "simulation thread started"; "square" => ?square);

            loop {
                let started = Instant::now();
                let wall = timestamp_millis() as f64 / 1000.0;

                loop {
                    match inbox.try_recv() {
                        Ok(command) => world.apply(command, wall),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            logging::info!(log, "simulation thread stopping"; "square" => ?square);
                            return;
                        }
                    }
                }

                world.tick(started, wall);

                *snapshot.lock().expect("Snapshot cell poisoned") =
                    Arc::new(world.snapshot(timestamp_millis()));
                *stats.lock().expect("Stats cell poisoned") = world.stats();

                let events = world.take_out();
                if !events.is_empty() {
                    outbox.lock().expect("Outbox poisoned").extend(events);
                }

                let elapsed = started.elapsed();
                if elapsed < tick_duration {
                    thread::sleep(tick_duration - elapsed);
                }
            }
        })
        .expect("Error spawning simulation thread");

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use flint::math::Vec2;

    #[test]
    fn test_commands_reach_simulation_and_snapshots_flow_back() {
        let world = ZoneWorld::new(GridSquare::new(0, 0), GameConfig::default().zone, None);
        let handle = spawn(world, None);

        handle.send(SimCommand::ConnectPlayer { player_id: "p1".into() });

        let mut found = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));

            let snapshot = handle.snapshot();
            if snapshot.entities.iter().any(|entity| entity.entity_id == "p1") {
                found = true;
                break;
            }
        }

        assert!(found);
        assert_eq!(handle.stats().player_count, 1);
    }

    #[test]
    fn test_outbox_carries_cross_zone_events() {
        let world = ZoneWorld::new(GridSquare::new(0, 0), GameConfig::default().zone, None);
        let handle = spawn(world, None);

        handle.send(SimCommand::TransferEntityIn {
            entity_id: "runaway".into(),
            kind: crate::entity::EntityKind::Enemy,
            sub_type: 0,
            position: Vec2::new(499.0, 250.0),
            velocity: Vec2::new(500.0, 0.0),
            health: 50.0,
        });

        let mut forwarded = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));

            if handle
                .drain_out()
                .iter()
                .any(|event| matches!(event, OutEvent::ForwardEntity { .. }))
            {
                forwarded = true;
                break;
            }
        }

        assert!(forwarded);
    }
}
