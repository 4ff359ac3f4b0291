//! Discord-facing feedback: embeds and the notifier used by sessions.

pub mod embeds;
pub mod notifier;

use chrono::{DateTime, Utc};
use serenity::model::id::UserId;

use crate::sources::ResolvedStream;

pub use notifier::{DiscordNotifier, Notifier};

/// Datos que muestra el mensaje "Now Playing".
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingView {
    pub stream: ResolvedStream,
    pub title: Option<String>,
    pub requester: Option<UserId>,
    pub since: DateTime<Utc>,
}
