use crate::config::SiloConfig;
use crate::core::Directory;
use crate::presence::PresenceRegistry;
use chrono::{DateTime, Utc};
use flint::contract::ChatMessage;
use flint::logging;
use flint::session::SessionStore;
use std::collections::VecDeque;

const CHAT_RING_CAPACITY: usize = 256;

/// Everything the silo's RPC handlers mutate. Owned by the service loop; the loop is the
/// single writer for all of it.
pub struct SiloState {
    pub directory: Directory,
    pub presence: PresenceRegistry,
    pub sessions: SessionStore,
    pub config: SiloConfig,

    chat: VecDeque<ChatMessage>,
    /// Messages awaiting best-effort delivery to peer coordinators.
    pub fanout: Vec<ChatMessage>,

    log: logging::Logger,
}

impl SiloState {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: SiloConfig, log: L) -> SiloState {
        let log = logging::child(log);

        let mut directory = Directory::new(
            config.cluster.zone_side,
            config.cluster.server_evict_secs,
            &log,
        );
        directory.load(&config.storage.data_dir);

        SiloState {
            directory,
            presence: PresenceRegistry::new(config.presence.evict_secs, &log),
            sessions: SessionStore::new(config.session.duration_secs),
            config,
            chat: VecDeque::with_capacity(CHAT_RING_CAPACITY),
            fanout: Vec::new(),
            log,
        }
    }

    /// Appends a chat message to the local ring; optionally queues it for peer fan-out.
    pub fn add_chat(&mut self, message: ChatMessage, fan_out: bool) {
        if self.chat.len() == CHAT_RING_CAPACITY {
            self.chat.pop_front();
        }

        logging::debug!(self.log, "chat message";
                        "sender" => &message.sender,
                        "fan_out" => fan_out);

        if fan_out {
            self.fanout.push(message.clone());
        }

        self.chat.push_back(message);
    }

    /// Loss-masking poll endpoint backing the notification stream.
    pub fn recent_chat(&self, since: DateTime<Utc>) -> Vec<ChatMessage> {
        self.chat
            .iter()
            .filter(|message| message.at > since)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state() -> SiloState {
        SiloState::new(SiloConfig::default(), None)
    }

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            sender: "Alice".into(),
            text: text.into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_chat_ring_is_bounded() {
        let mut state = state();

        for index in 0..CHAT_RING_CAPACITY + 10 {
            state.add_chat(message(&format!("m{}", index)), false);
        }

        let all = state.recent_chat(Utc::now() - Duration::hours(1));
        assert_eq!(all.len(), CHAT_RING_CAPACITY);
        assert_eq!(all.first().unwrap().text, "m10");
    }

    #[test]
    fn test_recent_chat_filters_by_time() {
        let mut state = state();

        let mut old = message("old");
        old.at = Utc::now() - Duration::minutes(10);
        state.add_chat(old, false);
        state.add_chat(message("new"), false);

        let recent = state.recent_chat(Utc::now() - Duration::minutes(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "new");
    }

    #[test]
    fn test_fan_out_queueing() {
        let mut state = state();

        state.add_chat(message("local"), false);
        state.add_chat(message("global"), true);

        assert_eq!(state.fanout.len(), 1);
        assert_eq!(state.fanout[0].text, "global");
    }
}
