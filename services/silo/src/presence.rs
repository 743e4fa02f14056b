use chrono::{Duration, Utc};
use flint::contract::CoordinatorInfo;
use flint::logging;
use hashbrown::HashMap;

/// Registry of peer coordinators. Primary election is deterministic: the lowest live
/// coordinator id wins.
pub struct PresenceRegistry {
    coordinators: HashMap<String, CoordinatorInfo>,
    evict_after: Duration,
    log: logging::Logger,
}

impl PresenceRegistry {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(evict_after_secs: u64, log: L) -> PresenceRegistry {
        PresenceRegistry {
            coordinators: HashMap::new(),
            evict_after: Duration::seconds(evict_after_secs as i64),
            log: logging::child(log),
        }
    }

    pub fn register(
        &mut self,
        coordinator_id: &str,
        http_endpoint: &str,
        event_bus_url: &str,
    ) -> CoordinatorInfo {
        let info = CoordinatorInfo {
            coordinator_id: coordinator_id.to_string(),
            http_endpoint: http_endpoint.to_string(),
            event_bus_url: event_bus_url.to_string(),
            last_heartbeat: Utc::now(),
            is_primary: false,
        };

        logging::info!(self.log, "coordinator registered";
                       "coordinator_id" => coordinator_id,
                       "event_bus" => event_bus_url);

        self.coordinators.insert(coordinator_id.to_string(), info);
        self.elect();

        self.coordinators[coordinator_id].clone()
    }

    pub fn heartbeat(&mut self, coordinator_id: &str) -> bool {
        match self.coordinators.get_mut(coordinator_id) {
            Some(info) => {
                info.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Drops coordinators with stale heartbeats and re-runs the election.
    pub fn evict_stale(&mut self) -> Vec<String> {
        let now = Utc::now();
        let evict_after = self.evict_after;

        let stale: Vec<String> = self
            .coordinators
            .values()
            .filter(|info| now - info.last_heartbeat > evict_after)
            .map(|info| info.coordinator_id.clone())
            .collect();

        for coordinator_id in &stale {
            logging::warn!(self.log, "evicting stale coordinator"; "coordinator_id" => coordinator_id.as_str());
            self.coordinators.remove(coordinator_id);
        }

        if !stale.is_empty() {
            self.elect();
        }

        stale
    }

    pub fn live(&self) -> Vec<CoordinatorInfo> {
        let mut live: Vec<CoordinatorInfo> = self.coordinators.values().cloned().collect();
        live.sort_by(|a, b| a.coordinator_id.cmp(&b.coordinator_id));
        live
    }

    pub fn primary(&self) -> Option<CoordinatorInfo> {
        self.coordinators.values().find(|info| info.is_primary).cloned()
    }

    fn elect(&mut self) {
        let primary_id = self.coordinators.keys().min().cloned();

        for (id, info) in self.coordinators.iter_mut() {
            info.is_primary = Some(id) == primary_id.as_ref();
        }
    }
}
