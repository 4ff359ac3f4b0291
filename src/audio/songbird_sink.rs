use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    events::{CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent},
    input::HttpRequest,
    tracks::{PlayMode, TrackHandle},
    Songbird,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{SinkEvent, SinkEventSender, StreamSink};
use crate::error::SinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Join en curso o conexión ya reportada como perdida.
    Inactive,
    Live,
    /// Pedimos salir: la próxima desconexión es esperada.
    Leaving,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSlot {
    generation: u64,
    state: SlotState,
}

/// Estado compartido con los handlers de eventos de songbird.
struct SinkShared {
    events: SinkEventSender,
    slots: DashMap<GuildId, ConnectionSlot>,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SinkShared {
    fn emit(&self, guild_id: GuildId, event: SinkEvent) {
        if self.events.send((guild_id, event)).is_err() {
            debug!("[{}] Canal de eventos cerrado, evento descartado", guild_id);
        }
    }

    /// Reporta la pérdida de la conexión una sola vez por generación.
    fn connection_lost(&self, guild_id: GuildId, generation: Option<u64>, reason: String) {
        let event = {
            let Some(mut slot) = self.slots.get_mut(&guild_id) else {
                return;
            };
            if generation.is_some_and(|g| g != slot.generation) {
                return;
            }
            let event = match slot.state {
                SlotState::Live => Some(SinkEvent::DisconnectedUnexpected { reason }),
                SlotState::Leaving => Some(SinkEvent::DisconnectedExpected),
                SlotState::Inactive => None,
            };
            slot.state = SlotState::Inactive;
            event
        };

        if let Some(event) = event {
            self.tracks.remove(&guild_id);
            self.emit(guild_id, event);
        }
    }

    /// Solo el track vigente puede reportar fin o error.
    fn track_finished(&self, guild_id: GuildId, handle: &TrackHandle, error: Option<String>) {
        let current = self
            .tracks
            .remove_if(&guild_id, |_, current| current.uuid() == handle.uuid())
            .is_some();

        if !current {
            debug!("[{}] Fin de track reemplazado, ignorado", guild_id);
            return;
        }

        let event = match error {
            Some(reason) => SinkEvent::PlaybackErrored { reason },
            None => SinkEvent::PlaybackEnded,
        };
        self.emit(guild_id, event);
    }
}

/// Stream sink sobre songbird: una conexión de voz y un track por servidor.
pub struct SongbirdSink {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    shared: Arc<SinkShared>,
    next_generation: AtomicU64,
}

impl SongbirdSink {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client, events: SinkEventSender) -> Self {
        Self {
            manager,
            http,
            shared: Arc::new(SinkShared {
                events,
                slots: DashMap::new(),
                tracks: DashMap::new(),
            }),
            next_generation: AtomicU64::new(0),
        }
    }

    /// El gateway informó que el bot ya no está en ningún canal de voz.
    ///
    /// Si no lo pedimos nosotros (kick, canal borrado) es una desconexión
    /// inesperada.
    pub fn observe_voice_left(&self, guild_id: GuildId) {
        self.shared.connection_lost(
            guild_id,
            None,
            "el bot fue removido del canal de voz".to_string(),
        );
    }
}

#[async_trait]
impl StreamSink for SongbirdSink {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), SinkError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.slots.insert(
            guild_id,
            ConnectionSlot {
                generation,
                state: SlotState::Inactive,
            },
        );

        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);

        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| {
                warn!("[{}] Error al unirse al canal {}: {:?}", guild_id, channel_id, e);
                SinkError::Join(e.to_string())
            })?;

        {
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectWatcher {
                    guild_id,
                    generation,
                    shared: self.shared.clone(),
                },
            );
        }

        if let Some(mut slot) = self.shared.slots.get_mut(&guild_id) {
            if slot.generation == generation {
                slot.state = SlotState::Live;
            }
        }

        info!("🔊 Conectado al canal de voz en guild {}", guild_id);
        Ok(())
    }

    async fn play(&self, guild_id: GuildId, url: &str) -> Result<(), SinkError> {
        let call = self.manager.get(guild_id).ok_or(SinkError::NotConnected)?;
        let input = HttpRequest::new(self.http.clone(), url.to_string());

        // El track anterior deja de ser el vigente antes de detenerlo
        self.shared.tracks.remove(&guild_id);

        let handle = {
            let mut handler = call.lock().await;
            handler.stop();
            handler.play_input(input.into())
        };

        self.shared.tracks.insert(guild_id, handle.clone());

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackWatcher {
                        guild_id,
                        handle: handle.clone(),
                        shared: self.shared.clone(),
                    },
                )
                .map_err(|e| SinkError::Playback(e.to_string()))?;
        }

        // Espera a que el input HTTP sea decodificable: un stream caído
        // falla aquí y no como un evento tardío
        if let Err(e) = handle.make_playable_async().await {
            self.shared.tracks.remove(&guild_id);
            let _ = handle.stop();
            return Err(SinkError::Playback(e.to_string()));
        }

        info!("🎵 Reproduciendo stream en guild {}: {}", guild_id, url);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), SinkError> {
        self.shared.tracks.remove(&guild_id);
        if let Some(call) = self.manager.get(guild_id) {
            call.lock().await.stop();
            debug!("⏹️ Reproducción detenida en guild {}", guild_id);
        }
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), SinkError> {
        if let Some(mut slot) = self.shared.slots.get_mut(&guild_id) {
            if slot.state == SlotState::Live {
                slot.state = SlotState::Leaving;
            }
        }
        self.shared.tracks.remove(&guild_id);

        match self.manager.remove(guild_id).await {
            Ok(()) => info!("👋 Desconectado del canal de voz en guild {}", guild_id),
            Err(songbird::error::JoinError::NoCall) => {
                debug!("[{}] Sin llamada activa al desconectar", guild_id)
            }
            Err(e) => {
                error!("[{}] Error al desconectar: {:?}", guild_id, e);
                return Err(SinkError::Join(e.to_string()));
            }
        }

        // Si el driver no lo reportó todavía, la desconexión queda confirmada aquí
        self.shared
            .connection_lost(guild_id, None, "desconexión solicitada".to_string());
        Ok(())
    }

    async fn is_connected(&self, guild_id: GuildId) -> bool {
        match self.manager.get(guild_id) {
            Some(call) => call.lock().await.current_connection().is_some(),
            None => false,
        }
    }

    async fn is_playing(&self, guild_id: GuildId) -> bool {
        let Some(handle) = self.shared.tracks.get(&guild_id).map(|t| t.clone()) else {
            return false;
        };
        match handle.get_info().await {
            Ok(info) => matches!(info.playing, PlayMode::Play),
            Err(_) => false,
        }
    }
}

/// Handler de desconexión del driver, atado a una generación de conexión.
struct DisconnectWatcher {
    guild_id: GuildId,
    generation: u64,
    shared: Arc<SinkShared>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            let reason = data
                .reason
                .as_ref()
                .map(|r| format!("{:?}", r))
                .unwrap_or_else(|| "desconexión del driver".to_string());
            warn!(
                "🔌 Driver de voz desconectado en guild {} ({:?}): {}",
                self.guild_id, data.kind, reason
            );
            self.shared
                .connection_lost(self.guild_id, Some(self.generation), reason);
        }

        None
    }
}

/// Handler de fin/error de un track concreto.
struct TrackWatcher {
    guild_id: GuildId,
    handle: TrackHandle,
    shared: Arc<SinkShared>,
}

#[async_trait]
impl VoiceEventHandler for TrackWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(track_list) = ctx {
            let error = track_list.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{:?}", e)),
                _ => None,
            });

            if let Some(reason) = &error {
                error!("❌ Error en stream para guild {}: {}", self.guild_id, reason);
            }

            self.shared.track_finished(self.guild_id, &self.handle, error);
        }

        None
    }
}
