use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A committed event rendered for subscribers: channel name + JSON payload.
#[derive(Debug, Clone)]
pub struct Notice {
    pub channel: String,
    pub payload: String,
}

/// Broadcast hub for LISTEN/NOTIFY. Listings get `listing_<id>` channels,
/// profiles `profile_<id>`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

fn channel_name(entity_id: Ulid, event: &Event) -> String {
    match event {
        Event::ProfileCreated { .. } | Event::ProfileUpdated { .. } | Event::ProfileDeleted { .. } => {
            format!("profile_{entity_id}")
        }
        _ => format!("listing_{entity_id}"),
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a listing or profile. Creates the channel if needed.
    pub fn subscribe(&self, entity_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, entity_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&entity_id) {
            let payload = match serde_json::to_string(event) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!("notify: unserializable event: {e}");
                    return;
                }
            };
            let _ = sender.send(Notice {
                channel: channel_name(entity_id, event),
                payload,
            });
        }
    }

    /// Remove a channel (e.g. when the listing is deleted).
    pub fn remove(&self, entity_id: &Ulid) {
        self.channels.remove(entity_id);
    }
}
