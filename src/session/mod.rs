//! # Session Module
//!
//! One state machine per guild, owned by its own task.
//!
//! ```text
//!            play                connected
//!   Idle ───────────▶ Connecting ───────────▶ Playing
//!    ▲                   │ connect failed        │ unexpected disconnect
//!    │◀──────────────────┘                       ▼
//!    │◀──── exhausted / cancelled ─────── Reconnecting ──── succeeded ──▶ Playing
//!    │
//!    └──── Stopping ◀──── stop (any state) / play over a live session
//! ```
//!
//! Commands reach a session through [`SessionRegistry`]; the session task is
//! the only code that mutates its [`GuildSession`]. Everyone else reads
//! snapshots.

mod actor;
pub mod listeners;
pub mod reconnect;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::audio::StreamSink;
use crate::sources::ResolvedStream;
use crate::storage::{PersistedIntent, StateStore};
use crate::ui::{Notifier, NowPlayingView};

pub use listeners::StopListeners;
pub use reconnect::{ReconnectCoordinator, ReconnectOutcome, ReconnectPolicy, ResumeReason};
pub use registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Playing,
    Reconnecting,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "inactiva",
            Self::Connecting => "conectando",
            Self::Playing => "reproduciendo",
            Self::Reconnecting => "reconectando",
            Self::Stopping => "deteniendo",
        };
        f.write_str(label)
    }
}

/// Estado en memoria de la sesión de un servidor.
#[derive(Debug, Clone)]
pub struct GuildSession {
    pub guild_id: GuildId,
    pub state: SessionState,
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub stream: Option<ResolvedStream>,
    pub requester_id: Option<UserId>,
    /// Solo para mostrar; nunca se persiste.
    pub last_known_title: Option<String>,
    pub retry_count: u32,
    /// Momento en que dispara el próximo intento de reconexión.
    pub retry_deadline: Option<Instant>,
    pub now_playing_message: Option<MessageId>,
    pub playing_since: Option<DateTime<Utc>>,
}

impl GuildSession {
    pub fn idle(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            state: SessionState::Idle,
            voice_channel_id: None,
            text_channel_id: None,
            stream: None,
            requester_id: None,
            last_known_title: None,
            retry_count: 0,
            retry_deadline: None,
            now_playing_message: None,
            playing_since: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state == SessionState::Playing
    }

    /// La intención que corresponde persistir para esta sesión.
    pub fn intent(&self) -> Option<PersistedIntent> {
        let stream = self.stream.as_ref()?;
        let voice_channel_id = self.voice_channel_id?;
        Some(PersistedIntent::new(
            stream,
            voice_channel_id,
            self.text_channel_id,
            self.requester_id,
        ))
    }

    pub fn now_playing_view(&self) -> Option<NowPlayingView> {
        Some(NowPlayingView {
            stream: self.stream.clone()?,
            title: self.last_known_title.clone(),
            requester: self.requester_id,
            since: self.playing_since.unwrap_or_else(Utc::now),
        })
    }
}

/// Pedido de reproducción ya parseado por el front end.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub guild_id: GuildId,
    /// Nombre del catálogo o URL tal como la escribió el usuario.
    pub target: String,
    pub voice_channel_id: ChannelId,
    pub text_channel_id: Option<ChannelId>,
    pub requester_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyIdle,
}

/// Colaboradores compartidos por todas las sesiones.
pub(crate) struct SessionDeps {
    pub sink: Arc<dyn StreamSink>,
    pub store: Arc<StateStore>,
    pub coordinator: Arc<ReconnectCoordinator>,
    pub notifier: Arc<dyn Notifier>,
    pub listeners: Arc<StopListeners>,
}
