use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::{self, ReconnectOutcome, ResumeReason};
use super::{GuildSession, SessionDeps, SessionState};
use crate::audio::SinkEvent;
use crate::error::{SessionError, SessionResult};
use crate::sources::ResolvedStream;
use crate::storage::PersistedIntent;

pub(super) type SessionMap = Arc<DashMap<GuildId, SessionHandle>>;

/// Comandos que procesa la tarea de un servidor, estrictamente en orden.
#[derive(Debug)]
pub(super) enum SessionCommand {
    Play {
        stream: ResolvedStream,
        voice_channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
        requester_id: Option<UserId>,
        cancel: CancellationToken,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    /// Responde si había algo que detener.
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        intent: PersistedIntent,
    },
    Sink(SinkEvent),
    Title(Option<String>),
}

/// Lo que el registry guarda de cada sesión viva.
#[derive(Clone)]
pub(super) struct SessionHandle {
    pub id: u64,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub snapshot: Arc<RwLock<GuildSession>>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl SessionHandle {
    /// Cancela lo que esté en vuelo y entrega un token nuevo.
    pub fn preempt(&self) -> CancellationToken {
        let mut current = self.cancel.lock();
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    pub fn snapshot(&self) -> GuildSession {
        self.snapshot.read().clone()
    }
}

/// Crea la tarea de un servidor y devuelve su handle.
pub(super) fn spawn(
    guild_id: GuildId,
    id: u64,
    deps: Arc<SessionDeps>,
    sessions: SessionMap,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id,
        commands: tx,
        snapshot: Arc::new(RwLock::new(GuildSession::idle(guild_id))),
        cancel: Arc::new(Mutex::new(CancellationToken::new())),
    };

    let actor = SessionActor {
        guild_id,
        id,
        snapshot: handle.snapshot.clone(),
        cancel: handle.cancel.clone(),
        deps,
        sessions,
        reconnect: None,
    };

    debug!("[{}] Nueva sesión #{}", guild_id, id);
    tokio::spawn(actor.run(rx));
    handle
}

struct ReconnectTask {
    handle: JoinHandle<ReconnectOutcome>,
    cancel: CancellationToken,
}

enum Wake {
    Command(SessionCommand),
    Reconnect(Result<ReconnectOutcome, JoinError>),
    Closed,
}

struct SessionActor {
    guild_id: GuildId,
    id: u64,
    snapshot: Arc<RwLock<GuildSession>>,
    cancel: Arc<Mutex<CancellationToken>>,
    deps: Arc<SessionDeps>,
    sessions: SessionMap,
    reconnect: Option<ReconnectTask>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            let wake = match self.reconnect.as_mut() {
                Some(task) => tokio::select! {
                    biased;
                    command = rx.recv() => command.map_or(Wake::Closed, Wake::Command),
                    outcome = &mut task.handle => Wake::Reconnect(outcome),
                },
                None => rx.recv().await.map_or(Wake::Closed, Wake::Command),
            };

            match wake {
                Wake::Command(command) => self.handle(command).await,
                Wake::Reconnect(outcome) => {
                    self.reconnect = None;
                    self.finish_reconnect(outcome).await;
                }
                Wake::Closed => break,
            }

            if self.state() == SessionState::Idle && self.reconnect.is_none() && self.retire(&rx) {
                break;
            }
        }

        if let Some(task) = self.reconnect.take() {
            task.cancel.cancel();
        }
        debug!("[{}] Sesión #{} finalizada", self.guild_id, self.id);
    }

    /// Sale del registry si nadie encoló nada mientras tanto.
    ///
    /// Los envíos se hacen con el shard del mapa tomado, así que ningún
    /// comando puede colarse entre el chequeo y el borrado.
    fn retire(&self, rx: &mpsc::UnboundedReceiver<SessionCommand>) -> bool {
        self.sessions
            .remove_if(&self.guild_id, |_, handle| handle.id == self.id && rx.is_empty())
            .is_some()
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Play {
                stream,
                voice_channel_id,
                text_channel_id,
                requester_id,
                cancel,
                reply,
            } => {
                let result = self
                    .play(stream, voice_channel_id, text_channel_id, requester_id, cancel)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::Stop { reply } => {
                let active = self.state() != SessionState::Idle;
                if active {
                    info!("[{}] ⏹️ Deteniendo sesión", self.guild_id);
                    self.settle_stop().await;
                }
                let _ = reply.send(active);
            }
            SessionCommand::Resume { intent } => self.resume(intent),
            SessionCommand::Sink(event) => self.on_sink_event(event).await,
            SessionCommand::Title(title) => self.on_title(title).await,
        }
    }

    async fn play(
        &mut self,
        stream: ResolvedStream,
        voice_channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
        requester_id: Option<UserId>,
        cancel: CancellationToken,
    ) -> SessionResult<()> {
        if cancel.is_cancelled() {
            debug!("[{}] Play de {} reemplazado antes de empezar", self.guild_id, stream);
            return Err(SessionError::Superseded);
        }

        // Nunca dos sinks para el mismo servidor: lo anterior se detiene por completo
        if self.state() != SessionState::Idle {
            info!(
                "[{}] 🔁 Cambiando de stream ({}), deteniendo el actual",
                self.guild_id,
                self.state()
            );
            self.settle_stop().await;
        }

        self.update(|s| {
            s.state = SessionState::Connecting;
            s.voice_channel_id = Some(voice_channel_id);
            s.text_channel_id = text_channel_id;
            s.stream = Some(stream.clone());
            s.requester_id = requester_id;
            s.last_known_title = None;
            s.retry_count = 0;
            s.retry_deadline = None;
        });

        info!(
            "[{}] 🔗 Conectando a {} para reproducir {}",
            self.guild_id, voice_channel_id, stream
        );

        let sink = self.deps.sink.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = reconnect::connect_and_play(sink.as_ref(), self.guild_id, voice_channel_id, &stream.url) => Some(result),
        };

        let Some(result) = result else {
            info!("[{}] Conexión a {} reemplazada antes de terminar", self.guild_id, stream);
            self.abandon_connect().await;
            return Err(SessionError::Superseded);
        };

        // El resultado del connect entra por el mismo camino que los eventos del sink
        let (event, outcome) = match result {
            Ok(()) => (SinkEvent::Connected, Ok(())),
            Err(e) => (
                SinkEvent::ConnectFailed {
                    reason: e.to_string(),
                },
                Err(SessionError::ConnectFailure(e.to_string())),
            ),
        };
        self.on_sink_event(event).await;
        outcome
    }

    /// Connecting → Idle sin reintentos: nada quedó persistido ni conectado.
    async fn abandon_connect(&mut self) {
        self.release_sink().await;
        self.clear_intent().await;
        self.reset_idle();
    }

    fn resume(&mut self, intent: PersistedIntent) {
        if self.state() != SessionState::Idle {
            debug!("[{}] Sesión ya activa, se ignora la intención guardada", self.guild_id);
            return;
        }

        info!(
            "[{}] ♻️ Reanudando {} en el canal {}",
            self.guild_id, intent.stream_name, intent.voice_channel_id
        );

        self.update(|s| {
            s.voice_channel_id = Some(intent.voice_channel());
            s.text_channel_id = intent.text_channel();
            s.stream = Some(intent.stream());
            s.requester_id = intent.requester();
        });
        self.begin_reconnect(ResumeReason::Startup);
    }

    async fn on_sink_event(&mut self, event: SinkEvent) {
        let state = self.state();
        match (state, event) {
            (SessionState::Connecting, SinkEvent::Connected) => {
                self.enter_playing().await;
            }
            (SessionState::Connecting, SinkEvent::ConnectFailed { reason }) => {
                let stream = self.snapshot().stream.map(|s| s.name).unwrap_or_default();
                warn!("[{}] ❌ No se pudo iniciar {}: {}", self.guild_id, stream, reason);
                self.abandon_connect().await;
            }
            (SessionState::Playing, SinkEvent::DisconnectedUnexpected { reason })
            | (SessionState::Playing, SinkEvent::PlaybackErrored { reason }) => {
                warn!("[{}] 🔌 Conexión perdida: {}", self.guild_id, reason);
                self.teardown_now_playing().await;
                self.begin_reconnect(ResumeReason::Disconnected);
            }
            (SessionState::Playing, SinkEvent::PlaybackEnded) => {
                info!("[{}] 🏁 El stream terminó", self.guild_id);
                let session = self.snapshot();
                if let (Some(channel), Some(stream)) = (session.text_channel_id, session.stream) {
                    self.notify(channel, &format!("🏁 El stream `{}` terminó.", stream.name))
                        .await;
                }
                self.settle_stop().await;
            }
            (state, event) => {
                debug!("[{}] Evento {:?} ignorado en estado {}", self.guild_id, event, state);
            }
        }
    }

    async fn on_title(&mut self, title: Option<String>) {
        let session = self.snapshot();
        if !session.is_playing() || session.last_known_title == title {
            return;
        }

        debug!("[{}] 🎶 Título: {:?}", self.guild_id, title);
        self.update(|s| s.last_known_title = title);
        self.refresh_now_playing().await;
    }

    /// Lanza el coordinador en segundo plano; la sesión sigue atendiendo comandos.
    fn begin_reconnect(&mut self, reason: ResumeReason) {
        let session = self.snapshot();
        let (Some(stream), Some(voice_channel_id)) = (session.stream, session.voice_channel_id)
        else {
            error!("[{}] Reconexión sin stream o canal de voz", self.guild_id);
            self.reset_idle();
            return;
        };

        self.update(|s| {
            s.state = SessionState::Reconnecting;
            s.retry_count = 0;
            s.retry_deadline = None;
            s.last_known_title = None;
            s.playing_since = None;
        });

        // Hijo del token de la sesión: un stop/play del registry lo cancela,
        // y cancelarlo desde aquí no afecta comandos ya encolados
        let cancel = self.cancel.lock().child_token();
        let snapshot = self.snapshot.clone();

        let handle = self.deps.coordinator.spawn(
            self.guild_id,
            stream,
            voice_channel_id,
            reason,
            cancel.clone(),
            move |attempt, at| {
                let mut session = snapshot.write();
                session.retry_count = attempt;
                session.retry_deadline = Some(at);
            },
        );

        self.reconnect = Some(ReconnectTask { handle, cancel });
    }

    async fn finish_reconnect(&mut self, outcome: Result<ReconnectOutcome, JoinError>) {
        let outcome = outcome.unwrap_or_else(|e| {
            error!("[{}] La tarea de reconexión falló: {}", self.guild_id, e);
            ReconnectOutcome::Exhausted {
                attempts: 0,
                last_error: e.to_string(),
            }
        });

        match outcome {
            ReconnectOutcome::Succeeded { attempts } => {
                if !self.deps.sink.is_connected(self.guild_id).await {
                    warn!(
                        "[{}] La conexión se perdió justo después de reconectar",
                        self.guild_id
                    );
                    self.begin_reconnect(ResumeReason::Disconnected);
                    return;
                }
                info!("[{}] ✅ Sesión recuperada tras {} intento(s)", self.guild_id, attempts);
                self.enter_playing().await;
            }
            ReconnectOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(
                    "[{}] ❌ Reconexión agotada tras {} intento(s): {}",
                    self.guild_id, attempts, last_error
                );
                let session = self.snapshot();
                self.set_state(SessionState::Stopping);
                self.clear_intent().await;
                self.teardown_now_playing().await;
                self.release_sink().await;

                if let (Some(channel), Some(stream)) = (session.text_channel_id, session.stream) {
                    let text = format!(
                        "❌ No pude reconectar `{}` después de {} intento(s). Usa `/play` para volver a intentarlo.",
                        stream.name, attempts
                    );
                    self.notify(channel, &text).await;
                }
                self.reset_idle();
            }
            ReconnectOutcome::Cancelled => {
                self.settle_stop().await;
            }
        }
    }

    async fn enter_playing(&mut self) {
        // Se persiste antes de publicar Playing: quien vea Playing ya tiene la intención guardada
        self.persist_intent().await;

        self.update(|s| {
            s.state = SessionState::Playing;
            s.retry_count = 0;
            s.retry_deadline = None;
            s.playing_since = Some(Utc::now());
        });

        info!("[{}] ▶️ Reproduciendo", self.guild_id);
        self.post_now_playing().await;
    }

    /// Camino completo de stop: cancela, olvida la intención, sale del canal.
    ///
    /// La intención se borra antes de responder, así que un crash justo
    /// después nunca reanuda algo que el usuario detuvo.
    async fn settle_stop(&mut self) {
        self.set_state(SessionState::Stopping);

        if let Some(task) = self.reconnect.take() {
            task.cancel.cancel();
            match task.handle.await {
                Ok(outcome) => debug!("[{}] Reconexión terminada: {:?}", self.guild_id, outcome),
                Err(e) => warn!("[{}] Error esperando la reconexión: {}", self.guild_id, e),
            }
        }

        self.clear_intent().await;
        self.teardown_now_playing().await;
        self.release_sink().await;
        self.reset_idle();
    }

    async fn release_sink(&self) {
        if let Err(e) = self.deps.sink.stop(self.guild_id).await {
            debug!("[{}] Error deteniendo el sink: {}", self.guild_id, e);
        }
        if let Err(e) = self.deps.sink.disconnect(self.guild_id).await {
            warn!("[{}] Error desconectando: {}", self.guild_id, e);
        }
    }

    async fn persist_intent(&self) {
        let Some(intent) = self.snapshot().intent() else {
            return;
        };
        if let Err(e) = self.deps.store.save(self.guild_id, Some(&intent)).await {
            error!("[{}] 💾 Error guardando estado: {}", self.guild_id, e);
        }
    }

    async fn clear_intent(&self) {
        if let Err(e) = self.deps.store.save(self.guild_id, None).await {
            error!("[{}] 💾 Error borrando estado: {}", self.guild_id, e);
        }
    }

    async fn post_now_playing(&mut self) {
        let session = self.snapshot();
        let (Some(channel), Some(view)) = (session.text_channel_id, session.now_playing_view())
        else {
            return;
        };

        match self.deps.notifier.post_now_playing(channel, &view).await {
            Ok(message_id) => {
                self.deps.listeners.bind(message_id, self.guild_id);
                self.update(|s| s.now_playing_message = Some(message_id));
            }
            Err(e) => warn!("[{}] No se pudo enviar Now Playing: {}", self.guild_id, e),
        }
    }

    async fn refresh_now_playing(&mut self) {
        let session = self.snapshot();
        let (Some(channel), Some(message_id), Some(view)) = (
            session.text_channel_id,
            session.now_playing_message,
            session.now_playing_view(),
        ) else {
            return;
        };

        if let Err(e) = self
            .deps
            .notifier
            .update_now_playing(channel, message_id, &view)
            .await
        {
            debug!(
                "[{}] No se pudo editar Now Playing ({}), enviando uno nuevo",
                self.guild_id, e
            );
            self.deps.listeners.release(message_id);
            self.update(|s| s.now_playing_message = None);
            self.post_now_playing().await;
        }
    }

    async fn teardown_now_playing(&mut self) {
        let session = self.snapshot();
        let Some(message_id) = session.now_playing_message else {
            return;
        };

        self.deps.listeners.release(message_id);
        self.update(|s| s.now_playing_message = None);

        if let Some(channel) = session.text_channel_id {
            if let Err(e) = self.deps.notifier.clear_now_playing(channel, message_id).await {
                debug!("[{}] No se pudo borrar Now Playing: {}", self.guild_id, e);
            }
        }
    }

    async fn notify(&self, channel_id: ChannelId, text: &str) {
        if let Err(e) = self.deps.notifier.notice(channel_id, text).await {
            warn!("[{}] No se pudo avisar en {}: {}", self.guild_id, channel_id, e);
        }
    }

    fn reset_idle(&self) {
        *self.snapshot.write() = GuildSession::idle(self.guild_id);
    }

    fn set_state(&self, state: SessionState) {
        self.snapshot.write().state = state;
    }

    fn update(&self, f: impl FnOnce(&mut GuildSession)) {
        f(&mut self.snapshot.write());
    }

    fn state(&self) -> SessionState {
        self.snapshot.read().state
    }

    fn snapshot(&self) -> GuildSession {
        self.snapshot.read().clone()
    }
}
