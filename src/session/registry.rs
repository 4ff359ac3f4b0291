use dashmap::DashMap;
use serenity::model::id::{GuildId, MessageId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actor::{self, SessionCommand, SessionHandle, SessionMap};
use super::{
    GuildSession, PlayRequest, ReconnectCoordinator, ReconnectPolicy, SessionDeps, SessionState,
    StopListeners, StopOutcome,
};
use crate::audio::{SinkEvent, SinkEventReceiver, StreamSink};
use crate::error::{SessionError, SessionResult};
use crate::sources::StreamCatalog;
use crate::storage::{PersistedIntent, StateStore};
use crate::ui::Notifier;

/// Registro global de sesiones: a lo sumo una por servidor.
///
/// Crea sesiones a demanda y las sesiones se retiran solas al quedar
/// inactivas sin comandos pendientes.
pub struct SessionRegistry {
    sessions: SessionMap,
    catalog: StreamCatalog,
    deps: Arc<SessionDeps>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        catalog: StreamCatalog,
        sink: Arc<dyn StreamSink>,
        store: Arc<StateStore>,
        notifier: Arc<dyn Notifier>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let coordinator = Arc::new(ReconnectCoordinator::new(sink.clone(), policy));
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            catalog,
            deps: Arc::new(SessionDeps {
                sink,
                store,
                coordinator,
                notifier,
                listeners: Arc::new(StopListeners::new()),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    pub fn listeners(&self) -> &StopListeners {
        &self.deps.listeners
    }

    pub fn coordinator(&self) -> &ReconnectCoordinator {
        &self.deps.coordinator
    }

    /// Reproduce un stream, reemplazando lo que estuviera sonando.
    ///
    /// Un objetivo inválido se rechaza sin tocar la sesión. Cualquier
    /// intento de conexión en vuelo queda cancelado antes de encolar este.
    pub async fn play(&self, request: PlayRequest) -> SessionResult<()> {
        let stream = self.catalog.resolve(&request.target)?;
        let guild_id = request.guild_id;

        info!(
            "[{}] ▶️ Play {} en canal {} (pedido por {:?})",
            guild_id, stream, request.voice_channel_id, request.requester_id
        );

        let (reply, response) = oneshot::channel();
        self.enqueue(guild_id, true, |cancel| SessionCommand::Play {
            stream,
            voice_channel_id: request.voice_channel_id,
            text_channel_id: request.text_channel_id,
            requester_id: request.requester_id,
            cancel,
            reply,
        });

        response.await.unwrap_or(Err(SessionError::SessionClosed))
    }

    /// Detiene la sesión y borra su intención. Idempotente.
    ///
    /// Devuelve recién cuando la intención ya no está en el almacén.
    pub async fn stop(&self, guild_id: GuildId) -> StopOutcome {
        let (reply, response) = oneshot::channel();

        let sent = self.sessions.get(&guild_id).map(|handle| {
            let was_active = handle.snapshot.read().state != SessionState::Idle;
            handle.preempt();
            if handle.commands.send(SessionCommand::Stop { reply }).is_err() {
                debug!("[{}] La sesión ya había terminado", guild_id);
            }
            was_active
        });

        let Some(was_active) = sent else {
            return self.stop_without_session(guild_id).await;
        };

        let Ok(stopped) = response.await else {
            return self.stop_without_session(guild_id).await;
        };

        // Un Resume encolado todavía se ve Idle al enviar; la sesión sabe si detuvo algo
        if was_active || stopped {
            StopOutcome::Stopped
        } else {
            StopOutcome::AlreadyIdle
        }
    }

    async fn stop_without_session(&self, guild_id: GuildId) -> StopOutcome {
        // Sin sesión en memoria no debería haber intención; si quedó una, se limpia
        if let Err(e) = self.deps.store.save(guild_id, None).await {
            error!("[{}] 💾 Error borrando estado: {}", guild_id, e);
        }
        StopOutcome::AlreadyIdle
    }

    /// Foto del estado actual (Idle si el servidor no tiene sesión).
    pub fn now(&self, guild_id: GuildId) -> GuildSession {
        self.sessions
            .get(&guild_id)
            .map(|handle| handle.snapshot())
            .unwrap_or_else(|| GuildSession::idle(guild_id))
    }

    /// Reanuda cada intención cargada en su propia tarea, en paralelo.
    pub fn resume_all(&self, intents: HashMap<GuildId, PersistedIntent>) -> usize {
        if intents.is_empty() {
            info!("📂 No hay sesiones para reanudar");
            return 0;
        }

        let count = intents.len();
        for (guild_id, intent) in intents {
            self.enqueue(guild_id, false, |_| SessionCommand::Resume { intent });
        }

        info!("♻️ Reanudando {} sesión(es)", count);
        count
    }

    /// Entrega un evento del sink a la sesión del servidor, si existe.
    pub fn dispatch_sink_event(&self, guild_id: GuildId, event: SinkEvent) {
        let Some(handle) = self.sessions.get(&guild_id) else {
            debug!("[{}] Evento {:?} sin sesión, descartado", guild_id, event);
            return;
        };

        if handle.commands.send(SessionCommand::Sink(event)).is_err() {
            debug!("[{}] Evento del sink para sesión finalizada", guild_id);
        }
    }

    /// Bombea los eventos del sink hacia las sesiones hasta que el canal se cierre.
    pub async fn route_sink_events(self: Arc<Self>, mut events: SinkEventReceiver) {
        while let Some((guild_id, event)) = events.recv().await {
            self.dispatch_sink_event(guild_id, event);
        }
        debug!("Canal de eventos del sink cerrado");
    }

    /// Reenvía un título solo si la sesión está reproduciendo.
    pub fn relay_title(&self, guild_id: GuildId, title: Option<String>) -> bool {
        let Some(handle) = self.sessions.get(&guild_id) else {
            return false;
        };

        if !handle.snapshot.read().is_playing() {
            return false;
        }

        handle.commands.send(SessionCommand::Title(title)).is_ok()
    }

    /// Servidores reproduciendo y la URL de su stream.
    pub fn playing_streams(&self) -> Vec<(GuildId, String)> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().snapshot.read();
                match (&session.state, &session.stream) {
                    (SessionState::Playing, Some(stream)) => {
                        Some((*entry.key(), stream.url.clone()))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Tras un corte del gateway: las sesiones que dicen estar reproduciendo
    /// pero cuyo sink perdió la conexión, o sigue conectado sin sonar, pasan
    /// a reconectar.
    pub async fn verify_connections(&self) -> usize {
        let mut lost = 0;

        for (guild_id, _) in self.playing_streams() {
            let event = if !self.deps.sink.is_connected(guild_id).await {
                warn!("[{}] 🔍 Conexión de voz perdida durante el corte", guild_id);
                SinkEvent::DisconnectedUnexpected {
                    reason: "conexión perdida durante la reconexión del gateway".to_string(),
                }
            } else if !self.deps.sink.is_playing(guild_id).await {
                warn!("[{}] 🔍 Conectado pero sin sonar tras el corte", guild_id);
                SinkEvent::PlaybackErrored {
                    reason: "el stream se detuvo durante la reconexión del gateway".to_string(),
                }
            } else {
                continue;
            };

            self.dispatch_sink_event(guild_id, event);
            lost += 1;
        }

        if lost > 0 {
            info!("🔍 {} sesión(es) marcadas para reconectar", lost);
        }
        lost
    }

    /// Servidor controlado por un mensaje "Now Playing" vigente.
    pub fn stop_target(&self, message_id: MessageId) -> Option<GuildId> {
        self.deps.listeners.target(message_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Encola un comando, creando la sesión si hace falta.
    ///
    /// El envío ocurre con el shard del mapa tomado: una sesión que se
    /// retira no puede perder este comando. Con `preempt` se cancela lo que
    /// esté en vuelo y el comando recibe el token nuevo.
    fn enqueue(
        &self,
        guild_id: GuildId,
        preempt: bool,
        build: impl FnOnce(CancellationToken) -> SessionCommand,
    ) {
        let mut entry = self
            .sessions
            .entry(guild_id)
            .or_insert_with(|| self.spawn_session(guild_id));

        let cancel = if preempt {
            entry.preempt()
        } else {
            CancellationToken::new()
        };

        let command = build(cancel);
        if let Err(failed) = entry.commands.send(command) {
            error!("[{}] La sesión terminó inesperadamente, recreando", guild_id);
            *entry = self.spawn_session(guild_id);
            if entry.commands.send(failed.0).is_err() {
                error!("[{}] No se pudo entregar el comando", guild_id);
            }
        }
    }

    fn spawn_session(&self, guild_id: GuildId) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        actor::spawn(guild_id, id, self.deps.clone(), self.sessions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{
        ConnectScript, FakeSink, NoticeCall, RecordingNotifier, SinkCall,
    };
    use crate::sources::StationEntry;
    use crate::ui::notifier::MockNotifier;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, UserId};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const GUILD: GuildId = GuildId::new(1);
    const VOICE: ChannelId = ChannelId::new(10);
    const TEXT: ChannelId = ChannelId::new(20);

    fn catalog() -> StreamCatalog {
        let mut stations = BTreeMap::new();
        for name in ["jazz", "rock"] {
            stations.insert(
                name.to_string(),
                StationEntry {
                    url: format!("https://radio.example.com/{}", name),
                    desc: String::new(),
                },
            );
        }
        StreamCatalog::new(stations)
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_elapsed: Duration::from_secs(5),
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        sink: Arc<FakeSink>,
        store: Arc<StateStore>,
        notifier: Arc<RecordingNotifier>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::build(fast_policy(), |dir| dir.join("state.json"))
        }

        fn build(policy: ReconnectPolicy, state_path: impl Fn(&Path) -> std::path::PathBuf) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let sink = Arc::new(FakeSink::new());
            let store = Arc::new(StateStore::open(state_path(dir.path())));
            let notifier = Arc::new(RecordingNotifier::new());
            let registry = SessionRegistry::new(
                catalog(),
                sink.clone(),
                store.clone(),
                notifier.clone(),
                policy,
            );

            Self {
                registry,
                sink,
                store,
                notifier,
                _dir: dir,
            }
        }

        async fn play(&self, target: &str) -> SessionResult<()> {
            self.registry.play(request(target)).await
        }

        async fn wait_for(&self, what: &str, check: impl Fn(&GuildSession) -> bool) -> GuildSession {
            wait_until(&self.registry, GUILD, what, check).await
        }

        async fn wait_connects(&self, expected: usize) {
            wait_connects(&self.sink, expected).await
        }
    }

    fn request(target: &str) -> PlayRequest {
        PlayRequest {
            guild_id: GUILD,
            target: target.to_string(),
            voice_channel_id: VOICE,
            text_channel_id: Some(TEXT),
            requester_id: Some(UserId::new(99)),
        }
    }

    async fn wait_until(
        registry: &SessionRegistry,
        guild_id: GuildId,
        what: &str,
        check: impl Fn(&GuildSession) -> bool,
    ) -> GuildSession {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let session = registry.now(guild_id);
            if check(&session) {
                return session;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timeout esperando {}: {:?}", what, session);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_connects(sink: &FakeSink, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while sink.connects(GUILD) < expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timeout esperando {} conexiones, hubo {}",
                expected,
                sink.connects(GUILD)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn unexpected() -> SinkEvent {
        SinkEvent::DisconnectedUnexpected {
            reason: "red caída".to_string(),
        }
    }

    #[tokio::test]
    async fn play_persists_intent_and_reaches_playing() {
        let h = Harness::new();

        h.play("Jazz").await.unwrap();

        let session = h.registry.now(GUILD);
        assert_eq!(session.state, SessionState::Playing);
        assert_eq!(session.voice_channel_id, Some(VOICE));

        let intent = h.store.get(GUILD).await.unwrap();
        assert_eq!(intent.stream_name, "jazz");
        assert_eq!(intent.stream_url, "https://radio.example.com/jazz");
        assert_eq!(intent.voice_channel(), VOICE);
        assert_eq!(intent.text_channel(), Some(TEXT));

        let message = h.notifier.last_posted().unwrap();
        assert_eq!(h.registry.stop_target(message), Some(GUILD));
    }

    #[tokio::test]
    async fn invalid_target_changes_nothing() {
        let h = Harness::new();

        let err = h.play("not a stream").await.unwrap_err();

        assert_eq!(err, SessionError::InvalidTarget("not a stream".to_string()));
        assert_eq!(h.registry.active_sessions(), 0);
        assert!(h.sink.calls().is_empty());
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn connect_failure_is_reported_without_retry() {
        let h = Harness::new();
        h.sink.script([ConnectScript::Fail]);

        let err = h.play("jazz").await.unwrap_err();

        assert!(matches!(err, SessionError::ConnectFailure(_)));
        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.sink.connects(GUILD), 1);
        assert_eq!(h.store.get(GUILD).await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = Harness::new();

        assert_eq!(h.registry.stop(GUILD).await, StopOutcome::AlreadyIdle);

        h.play("jazz").await.unwrap();
        assert_eq!(h.registry.stop(GUILD).await, StopOutcome::Stopped);
        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.store.get(GUILD).await, None);
        assert!(h.sink.calls().contains(&SinkCall::Disconnect(GUILD)));

        assert_eq!(h.registry.stop(GUILD).await, StopOutcome::AlreadyIdle);
        assert_eq!(h.store.get(GUILD).await, None);
    }

    #[tokio::test]
    async fn idle_sessions_leave_the_registry() {
        let h = Harness::new();

        h.play("jazz").await.unwrap();
        assert_eq!(h.registry.active_sessions(), 1);

        h.registry.stop(GUILD).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while h.registry.active_sessions() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "la sesión no se retiró");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_plays_share_one_session() {
        let h = Harness::new();

        let plays = (0..5).map(|i| {
            let registry = h.registry.clone();
            let target = if i % 2 == 0 { "jazz" } else { "rock" };
            tokio::spawn(async move { registry.play(request(target)).await })
        });
        let results = futures::future::join_all(plays).await;

        assert!(results.iter().any(|r| matches!(r, Ok(Ok(())))));
        assert_eq!(h.registry.active_sessions(), 1);

        // Entre dos conexiones siempre hubo una desconexión
        let mut connected = false;
        for call in h.sink.calls() {
            match call {
                SinkCall::Connect(..) => {
                    assert!(!connected, "dos conexiones simultáneas");
                    connected = true;
                }
                SinkCall::Disconnect(_) => connected = false,
                _ => {}
            }
        }

        let session = h.registry.now(GUILD);
        assert_eq!(session.state, SessionState::Playing);
        let intent = h.store.get(GUILD).await.unwrap();
        assert_eq!(Some(intent.stream()), session.stream);
    }

    #[tokio::test]
    async fn playing_always_has_a_persisted_intent() {
        let h = Harness::new();

        h.play("jazz").await.unwrap();
        h.play("rock").await.unwrap();

        let session = h.registry.now(GUILD);
        let intent = h.store.get(GUILD).await.unwrap();
        assert_eq!(session.intent(), Some(intent));

        h.registry.stop(GUILD).await;
        assert_eq!(h.store.get(GUILD).await, None);
    }

    #[tokio::test]
    async fn unexpected_disconnect_recovers_after_two_failures() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();
        let before = h.store.get(GUILD).await.unwrap();

        h.sink
            .script([ConnectScript::Fail, ConnectScript::Fail, ConnectScript::Ok]);
        h.registry.dispatch_sink_event(GUILD, unexpected());

        h.wait_connects(4).await;
        let session = h
            .wait_for("Playing de nuevo", |s| s.state == SessionState::Playing)
            .await;

        assert_eq!(h.sink.connects(GUILD), 4);
        assert_eq!(session.retry_count, 0);
        assert_eq!(session.retry_deadline, None);
        assert_eq!(h.store.get(GUILD).await, Some(before));
    }

    #[tokio::test]
    async fn stop_during_backoff_cancels_the_attempt() {
        let h = Harness::build(
            ReconnectPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(60),
                max_elapsed: Duration::from_secs(600),
                ..fast_policy()
            },
            |dir| dir.join("state.json"),
        );
        h.play("jazz").await.unwrap();

        h.registry.dispatch_sink_event(GUILD, unexpected());
        let session = h
            .wait_for("backoff", |s| s.retry_deadline.is_some())
            .await;
        assert_eq!(session.state, SessionState::Reconnecting);
        assert!(h.store.get(GUILD).await.is_some());

        let stopped = tokio::time::timeout(Duration::from_secs(1), h.registry.stop(GUILD))
            .await
            .unwrap();

        assert_eq!(stopped, StopOutcome::Stopped);
        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.store.get(GUILD).await, None);
        assert_eq!(h.sink.connects(GUILD), 1);
        assert_eq!(h.registry.coordinator().active_attempts(), 0);
    }

    #[tokio::test]
    async fn exhausted_reconnect_clears_intent_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FakeSink::new());
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_post_now_playing()
            .times(1)
            .returning(|_, _| Ok(MessageId::new(500)));
        notifier
            .expect_clear_now_playing()
            .times(1)
            .returning(|_, _| Ok(()));
        notifier
            .expect_notice()
            .withf(|channel, text| *channel == TEXT && text.contains("jazz"))
            .times(1)
            .returning(|_, _| Ok(()));

        let registry = SessionRegistry::new(
            catalog(),
            sink.clone(),
            store.clone(),
            Arc::new(notifier),
            fast_policy(),
        );

        registry.play(request("jazz")).await.unwrap();
        sink.script([ConnectScript::Fail, ConnectScript::Fail, ConnectScript::Fail]);
        registry.dispatch_sink_event(GUILD, unexpected());

        wait_connects(&sink, 4).await;
        wait_until(&registry, GUILD, "Idle", |s| s.state == SessionState::Idle).await;

        assert_eq!(sink.connects(GUILD), 4);
        assert_eq!(store.get(GUILD).await, None);
        assert_eq!(registry.stop_target(MessageId::new(500)), None);
    }

    #[tokio::test]
    async fn empty_store_resumes_nothing() {
        let h = Harness::new();
        tokio::fs::write(h.store.path(), "").await.unwrap();

        let intents = h.store.load().await;
        assert!(intents.is_empty());

        assert_eq!(h.registry.resume_all(intents), 0);
        assert_eq!(h.registry.active_sessions(), 0);
        assert_eq!(h.registry.coordinator().active_attempts(), 0);
        assert!(h.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_all_restores_every_guild_in_parallel() {
        let h = Harness::new();
        let other = GuildId::new(2);
        let jazz = crate::sources::ResolvedStream::new("jazz", "https://radio.example.com/jazz");

        let mut intents = HashMap::new();
        intents.insert(GUILD, PersistedIntent::new(&jazz, VOICE, Some(TEXT), None));
        intents.insert(other, PersistedIntent::new(&jazz, ChannelId::new(11), None, None));

        // El primer servidor se cuelga: el segundo no debe esperarlo
        h.sink.hang_on(GUILD);
        assert_eq!(h.registry.resume_all(intents), 2);

        wait_until(&h.registry, other, "resume del segundo servidor", |s| {
            s.is_playing()
        })
        .await;
        assert!(h.store.get(other).await.is_some());

        h.registry.stop(GUILD).await;
        h.registry.stop(other).await;
    }

    #[tokio::test]
    async fn back_to_back_plays_settle_the_first_before_connecting() {
        let h = Harness::new();
        h.sink.script([ConnectScript::Hang]);

        let first = {
            let registry = h.registry.clone();
            tokio::spawn(async move { registry.play(request("jazz")).await })
        };
        h.wait_for("Connecting", |s| s.state == SessionState::Connecting)
            .await;

        h.play("rock").await.unwrap();

        assert_eq!(first.await.unwrap(), Err(SessionError::Superseded));

        let calls = h.sink.calls();
        let connects: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, SinkCall::Connect(..)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(connects.len(), 2);
        assert!(calls[connects[0]..connects[1]].contains(&SinkCall::Disconnect(GUILD)));

        let intent = h.store.get(GUILD).await.unwrap();
        assert_eq!(intent.stream_name, "rock");
        assert_eq!(h.registry.now(GUILD).state, SessionState::Playing);
    }

    #[tokio::test]
    async fn play_while_reconnecting_replaces_the_stream() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        h.sink.script([ConnectScript::Hang]);
        h.registry.dispatch_sink_event(GUILD, unexpected());
        h.wait_for("reconexión", |s| s.state == SessionState::Reconnecting)
            .await;

        h.play("rock").await.unwrap();

        let session = h.registry.now(GUILD);
        assert_eq!(session.state, SessionState::Playing);
        assert_eq!(session.stream.map(|s| s.name), Some("rock".to_string()));
        assert_eq!(h.store.get(GUILD).await.unwrap().stream_name, "rock");
    }

    #[tokio::test]
    async fn titles_only_reach_playing_sessions() {
        let h = Harness::new();

        assert!(!h.registry.relay_title(GUILD, Some("Song A".to_string())));
        assert_eq!(h.registry.active_sessions(), 0);

        h.play("jazz").await.unwrap();
        assert!(h.registry.relay_title(GUILD, Some("Song A".to_string())));
        h.wait_for("título", |s| s.last_known_title.as_deref() == Some("Song A"))
            .await;

        let message = h.notifier.last_posted().unwrap();
        assert!(h
            .notifier
            .calls()
            .contains(&NoticeCall::Updated(message, Some("Song A".to_string()))));

        h.sink.script([ConnectScript::Hang]);
        h.registry.dispatch_sink_event(GUILD, unexpected());
        h.wait_for("reconexión", |s| s.state == SessionState::Reconnecting)
            .await;

        assert!(!h.registry.relay_title(GUILD, Some("Song B".to_string())));
        assert_eq!(h.registry.now(GUILD).last_known_title, None);

        h.registry.stop(GUILD).await;
    }

    #[tokio::test]
    async fn failed_edit_reposts_now_playing() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();
        let first = h.notifier.last_posted().unwrap();

        h.notifier.fail_updates();
        h.registry.relay_title(GUILD, Some("Song A".to_string()));
        let session = h
            .wait_for("nuevo mensaje", |s| {
                s.now_playing_message.is_some() && s.now_playing_message != Some(first)
            })
            .await;

        let second = session.now_playing_message.unwrap();
        assert_eq!(h.registry.stop_target(first), None);
        assert_eq!(h.registry.stop_target(second), Some(GUILD));
    }

    #[tokio::test]
    async fn stop_listener_is_released_when_leaving_playing() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();
        let message = h.notifier.last_posted().unwrap();
        assert_eq!(h.registry.stop_target(message), Some(GUILD));

        h.sink.script([ConnectScript::Hang]);
        h.registry.dispatch_sink_event(GUILD, unexpected());
        h.wait_for("reconexión", |s| s.state == SessionState::Reconnecting)
            .await;

        assert_eq!(h.registry.stop_target(message), None);
        assert!(h.notifier.calls().contains(&NoticeCall::Cleared(message)));

        h.registry.stop(GUILD).await;
        assert!(h.registry.listeners().is_empty());
    }

    #[tokio::test]
    async fn store_write_failure_keeps_playing() {
        let h = Harness::build(fast_policy(), |dir| dir.join("missing").join("state.json"));

        h.play("jazz").await.unwrap();

        assert_eq!(h.registry.now(GUILD).state, SessionState::Playing);
        assert!(!h.store.path().exists());
    }

    #[tokio::test]
    async fn playback_end_counts_as_stop() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        h.registry.dispatch_sink_event(GUILD, SinkEvent::PlaybackEnded);
        h.wait_for("Idle", |s| s.state == SessionState::Idle).await;

        assert_eq!(h.store.get(GUILD).await, None);
        assert!(h
            .notifier
            .calls()
            .iter()
            .any(|c| matches!(c, NoticeCall::Notice(channel, _) if *channel == TEXT)));
    }

    #[tokio::test]
    async fn playback_error_triggers_reconnect() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        h.registry.dispatch_sink_event(
            GUILD,
            SinkEvent::PlaybackErrored {
                reason: "decoder".to_string(),
            },
        );

        h.wait_connects(2).await;
        h.wait_for("Playing", |s| s.is_playing()).await;
        assert_eq!(h.sink.connects(GUILD), 2);
    }

    #[tokio::test]
    async fn verify_connections_reconnects_dead_sessions() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        assert_eq!(h.registry.verify_connections().await, 0);

        h.sink.drop_connection(GUILD);
        assert_eq!(h.registry.verify_connections().await, 1);

        h.wait_connects(2).await;
        h.wait_for("Playing", |s| s.is_playing()).await;
        assert_eq!(h.sink.connects(GUILD), 2);
    }

    #[tokio::test]
    async fn verify_connections_restarts_silent_streams() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        h.sink.drop_stream(GUILD);
        assert_eq!(h.registry.verify_connections().await, 1);

        h.wait_connects(2).await;
        h.wait_for("Playing", |s| s.is_playing()).await;
        assert_eq!(h.registry.verify_connections().await, 0);
        assert!(h.store.get(GUILD).await.is_some());
    }

    #[tokio::test]
    async fn stop_preempts_a_hanging_connect() {
        let h = Harness::new();
        h.sink.script([ConnectScript::Hang]);

        let pending = {
            let registry = h.registry.clone();
            tokio::spawn(async move { registry.play(request("jazz")).await })
        };
        h.wait_for("Connecting", |s| s.state == SessionState::Connecting)
            .await;

        assert_eq!(h.registry.stop(GUILD).await, StopOutcome::Stopped);
        assert!(matches!(
            pending.await.unwrap(),
            Err(SessionError::Superseded)
        ));

        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.store.get(GUILD).await, None);
        assert!(h.sink.calls().contains(&SinkCall::Disconnect(GUILD)));
    }

    #[tokio::test]
    async fn stop_reports_a_queued_resume_as_stopped() {
        let h = Harness::new();
        let jazz = crate::sources::ResolvedStream::new("jazz", "https://radio.example.com/jazz");
        h.sink.hang_on(GUILD);

        let mut intents = HashMap::new();
        intents.insert(GUILD, PersistedIntent::new(&jazz, VOICE, Some(TEXT), None));
        h.registry.resume_all(intents);

        // El Resume sigue en la cola: la foto todavía dice Idle
        assert_eq!(h.registry.stop(GUILD).await, StopOutcome::Stopped);
        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.registry.coordinator().active_attempts(), 0);
    }

    #[tokio::test]
    async fn failed_connect_goes_through_the_event_path() {
        let h = Harness::new();
        h.sink.script([ConnectScript::Fail]);

        let err = h.play("jazz").await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailure(_)));

        // Un ConnectFailed tardío ya no encuentra la sesión en Connecting
        h.registry.dispatch_sink_event(
            GUILD,
            SinkEvent::ConnectFailed {
                reason: "tarde".to_string(),
            },
        );
        h.registry.dispatch_sink_event(GUILD, SinkEvent::Connected);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.registry.now(GUILD).state, SessionState::Idle);
        assert_eq!(h.sink.connects(GUILD), 1);
        assert!(h.notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn expected_disconnect_does_not_reconnect() {
        let h = Harness::new();
        h.play("jazz").await.unwrap();

        h.registry
            .dispatch_sink_event(GUILD, SinkEvent::DisconnectedExpected);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.registry.now(GUILD).state, SessionState::Playing);
        assert_eq!(h.sink.connects(GUILD), 1);
    }
}
