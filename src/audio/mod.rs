//! # Audio Module
//!
//! Voice transport for Open Radio.
//!
//! The session core never talks to songbird directly. It drives a
//! [`StreamSink`] (connect, play, stop, disconnect) and reacts to the
//! [`SinkEvent`]s the sink pushes back asynchronously.
//!
//! ## Event contract
//!
//! | Event                    | Meaning                                          |
//! |--------------------------|--------------------------------------------------|
//! | `Connected`              | voice connection established                     |
//! | `ConnectFailed`          | join attempt failed                              |
//! | `DisconnectedExpected`   | we asked to leave and the driver confirmed it    |
//! | `DisconnectedUnexpected` | connection lost (network, kicked, channel gone)  |
//! | `PlaybackEnded`          | the current stream finished on its own           |
//! | `PlaybackErrored`        | the decoder/HTTP input failed                    |
//!
//! `Connected` and `ConnectFailed` are never pushed on the channel: they are
//! the outcome of [`StreamSink::connect`], and the session feeds that outcome
//! into its own event handler so every transition goes through one place.

pub mod songbird_sink;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc;

use crate::error::SinkError;

pub use songbird_sink::SongbirdSink;

/// Lifecycle events emitted by a stream sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Connected,
    ConnectFailed { reason: String },
    DisconnectedExpected,
    DisconnectedUnexpected { reason: String },
    PlaybackEnded,
    PlaybackErrored { reason: String },
}

pub type SinkEventSender = mpsc::UnboundedSender<(GuildId, SinkEvent)>;
pub type SinkEventReceiver = mpsc::UnboundedReceiver<(GuildId, SinkEvent)>;

/// Transporte de voz visto desde el núcleo de sesiones.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Conecta (o mueve) la conexión de voz del servidor al canal indicado.
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), SinkError>;

    /// Comienza a reproducir la URL, reemplazando lo que estuviera sonando.
    async fn play(&self, guild_id: GuildId, url: &str) -> Result<(), SinkError>;

    /// Detiene la reproducción sin desconectar.
    async fn stop(&self, guild_id: GuildId) -> Result<(), SinkError>;

    /// Sale del canal de voz. La desconexión resultante es "esperada".
    async fn disconnect(&self, guild_id: GuildId) -> Result<(), SinkError>;

    /// Hay una conexión de voz viva para el servidor.
    async fn is_connected(&self, guild_id: GuildId) -> bool;

    /// El stream del servidor sigue sonando.
    async fn is_playing(&self, guild_id: GuildId) -> bool;
}
