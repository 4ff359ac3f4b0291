use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    builder::{CreateMessage, EditMessage},
    http::Http,
    model::{
        channel::ReactionType,
        id::{ChannelId, MessageId},
    },
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{embeds, NowPlayingView};

/// Feedback hacia el canal de texto de una sesión.
///
/// Todo es best-effort: quien llama registra el error y sigue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publica un "Now Playing" nuevo y devuelve su id (para la reacción de stop).
    async fn post_now_playing(&self, channel_id: ChannelId, view: &NowPlayingView)
        -> Result<MessageId>;

    async fn update_now_playing(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &NowPlayingView,
    ) -> Result<()>;

    async fn clear_now_playing(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    async fn notice(&self, channel_id: ChannelId, text: &str) -> Result<()>;
}

/// Notifier que escribe en Discord por HTTP.
pub struct DiscordNotifier {
    http: Arc<Http>,
    stop_reaction: String,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>, stop_reaction: impl Into<String>) -> Self {
        Self {
            http,
            stop_reaction: stop_reaction.into(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn post_now_playing(
        &self,
        channel_id: ChannelId,
        view: &NowPlayingView,
    ) -> Result<MessageId> {
        let message = channel_id
            .send_message(
                &self.http,
                CreateMessage::new().embed(embeds::create_now_playing_embed(view)),
            )
            .await?;

        if let Err(e) = message
            .react(&self.http, ReactionType::Unicode(self.stop_reaction.clone()))
            .await
        {
            warn!("No se pudo agregar la reacción de stop en {}: {}", channel_id, e);
        }

        debug!("📨 Now Playing {} enviado a {}", message.id, channel_id);
        Ok(message.id)
    }

    async fn update_now_playing(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &NowPlayingView,
    ) -> Result<()> {
        channel_id
            .edit_message(
                &self.http,
                message_id,
                EditMessage::new().embed(embeds::create_now_playing_embed(view)),
            )
            .await?;
        Ok(())
    }

    async fn clear_now_playing(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        channel_id.delete_message(&self.http, message_id).await?;
        debug!("🗑️ Now Playing {} eliminado de {}", message_id, channel_id);
        Ok(())
    }

    async fn notice(&self, channel_id: ChannelId, text: &str) -> Result<()> {
        channel_id.say(&self.http, text).await?;
        Ok(())
    }
}
