use dashmap::DashMap;
use serenity::model::id::{GuildId, MessageId};
use tracing::debug;

/// Mensajes "Now Playing" que aceptan la reacción de stop.
///
/// Una sesión registra su mensaje al entrar en `Playing` y lo libera en
/// cuanto sale de ese estado, así que una reacción sobre un mensaje viejo
/// nunca detiene otra reproducción.
#[derive(Debug, Default)]
pub struct StopListeners {
    bindings: DashMap<MessageId, GuildId>,
}

impl StopListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, message_id: MessageId, guild_id: GuildId) {
        debug!("[{}] 🎯 Reacción de stop activa en mensaje {}", guild_id, message_id);
        self.bindings.insert(message_id, guild_id);
    }

    pub fn release(&self, message_id: MessageId) -> bool {
        let released = self.bindings.remove(&message_id).is_some();
        if released {
            debug!("🎯 Reacción de stop liberada en mensaje {}", message_id);
        }
        released
    }

    /// Guild cuya sesión controla el mensaje, si sigue vigente.
    pub fn target(&self, message_id: MessageId) -> Option<GuildId> {
        self.bindings.get(&message_id).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
