use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::StreamSink;
use crate::error::SinkError;
use crate::sources::ResolvedStream;

/// Política de reintentos para recuperar una sesión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Techo de tiempo total para un ciclo de reconexión.
    pub max_elapsed: Duration,
}

impl ReconnectPolicy {
    /// `base * 2^(n-1)`, limitado a `max_delay`. Sin jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Espera antes del intento `attempt` (1-based).
    ///
    /// Al arrancar el primer intento es inmediato; tras una desconexión
    /// siempre se espera al menos una vez el delay base.
    pub fn delay_before(&self, attempt: u32, reason: ResumeReason) -> Duration {
        let base = match reason {
            ResumeReason::Startup if attempt <= 1 => return Duration::ZERO,
            ResumeReason::Startup => self.backoff(attempt - 1),
            ResumeReason::Disconnected => self.backoff(attempt),
        };
        with_jitter(base)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

/// Hasta un 10% extra para que varios servidores no reintenten a la vez.
fn with_jitter(delay: Duration) -> Duration {
    delay + delay.mul_f64(fastrand::f64() * 0.1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    /// Intención cargada del almacén al iniciar el proceso.
    Startup,
    /// La conexión o el stream se cayeron mientras sonaba.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    Cancelled,
}

/// Coordinador de reconexiones: a lo sumo un intento activo por servidor,
/// independiente entre servidores.
pub struct ReconnectCoordinator {
    sink: Arc<dyn StreamSink>,
    policy: ReconnectPolicy,
    active: Arc<DashMap<GuildId, (u64, CancellationToken)>>,
    next_claim: AtomicU64,
}

impl ReconnectCoordinator {
    pub fn new(sink: Arc<dyn StreamSink>, policy: ReconnectPolicy) -> Self {
        Self {
            sink,
            policy,
            active: Arc::new(DashMap::new()),
            next_claim: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Intenta recuperar la sesión hasta agotar la política.
    ///
    /// `progress(n, at)` se llama antes de esperar el intento `n`, con el
    /// instante en que va a dispararse. Un intento previo para el mismo
    /// servidor queda cancelado.
    pub async fn attempt<F>(
        &self,
        guild_id: GuildId,
        stream: ResolvedStream,
        voice_channel_id: ChannelId,
        reason: ResumeReason,
        cancel: CancellationToken,
        progress: F,
    ) -> ReconnectOutcome
    where
        F: FnMut(u32, Instant) + Send,
    {
        let _claim = self.claim(guild_id, &cancel);
        run_attempts(
            self.sink.clone(),
            self.policy.clone(),
            guild_id,
            stream,
            voice_channel_id,
            reason,
            cancel,
            progress,
        )
        .await
    }

    /// Igual que [`attempt`](Self::attempt) pero en su propia tarea, para
    /// que una reconexión lenta no frene a nadie más.
    pub fn spawn<F>(
        &self,
        guild_id: GuildId,
        stream: ResolvedStream,
        voice_channel_id: ChannelId,
        reason: ResumeReason,
        cancel: CancellationToken,
        progress: F,
    ) -> JoinHandle<ReconnectOutcome>
    where
        F: FnMut(u32, Instant) + Send + 'static,
    {
        let claim = self.claim(guild_id, &cancel);
        let sink = self.sink.clone();
        let policy = self.policy.clone();

        tokio::spawn(async move {
            let _claim = claim;
            run_attempts(
                sink,
                policy,
                guild_id,
                stream,
                voice_channel_id,
                reason,
                cancel,
                progress,
            )
            .await
        })
    }

    pub fn is_active(&self, guild_id: GuildId) -> bool {
        self.active.contains_key(&guild_id)
    }

    pub fn active_attempts(&self) -> usize {
        self.active.len()
    }

    fn claim(&self, guild_id: GuildId, cancel: &CancellationToken) -> Claim {
        let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.active.insert(guild_id, (id, cancel.clone())) {
            debug!("[{}] Reemplazando intento de reconexión anterior", guild_id);
            previous.cancel();
        }
        Claim {
            active: self.active.clone(),
            guild_id,
            id,
        }
    }
}

/// Libera el registro del intento al terminar, si sigue siendo el vigente.
struct Claim {
    active: Arc<DashMap<GuildId, (u64, CancellationToken)>>,
    guild_id: GuildId,
    id: u64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.guild_id, |_, (id, _)| *id == self.id);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_attempts<F>(
    sink: Arc<dyn StreamSink>,
    policy: ReconnectPolicy,
    guild_id: GuildId,
    stream: ResolvedStream,
    voice_channel_id: ChannelId,
    reason: ResumeReason,
    cancel: CancellationToken,
    mut progress: F,
) -> ReconnectOutcome
where
    F: FnMut(u32, Instant) + Send,
{
    let started = Instant::now();
    let mut last_error = String::from("sin intentos");

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_before(attempt, reason);

        if started.elapsed() + delay > policy.max_elapsed {
            warn!(
                "[{}] ⏱️ Tiempo máximo de reconexión agotado tras {} intento(s)",
                guild_id,
                attempt - 1
            );
            return ReconnectOutcome::Exhausted {
                attempts: attempt - 1,
                last_error,
            };
        }

        progress(attempt, Instant::now() + delay);

        if !delay.is_zero() {
            debug!(
                "[{}] Esperando {:?} antes del intento {}",
                guild_id, delay, attempt
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(guild_id),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            "🔄 [{}] Intento de reconexión {}/{} → {}",
            guild_id, attempt, policy.max_attempts, stream
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(guild_id),
            result = connect_and_play(sink.as_ref(), guild_id, voice_channel_id, &stream.url) => result,
        };

        match result {
            Ok(()) => {
                info!("✅ [{}] Reconectado en el intento {}", guild_id, attempt);
                return ReconnectOutcome::Succeeded { attempts: attempt };
            }
            Err(e) => {
                warn!("[{}] Intento {} falló: {}", guild_id, attempt, e);
                last_error = e.to_string();
            }
        }
    }

    ReconnectOutcome::Exhausted {
        attempts: policy.max_attempts,
        last_error,
    }
}

fn cancelled(guild_id: GuildId) -> ReconnectOutcome {
    info!("[{}] 🚫 Reconexión cancelada", guild_id);
    ReconnectOutcome::Cancelled
}

/// Detiene lo que haya quedado sonando, conecta y reproduce.
///
/// Si la conexión se logra pero el stream no arranca, sale del canal antes
/// de devolver el error.
pub async fn connect_and_play(
    sink: &dyn StreamSink,
    guild_id: GuildId,
    voice_channel_id: ChannelId,
    url: &str,
) -> Result<(), SinkError> {
    if let Err(e) = sink.stop(guild_id).await {
        debug!("[{}] Error deteniendo track previo: {}", guild_id, e);
    }

    sink.connect(guild_id, voice_channel_id).await?;

    if let Err(e) = sink.play(guild_id, url).await {
        if let Err(disconnect_err) = sink.disconnect(guild_id).await {
            debug!(
                "[{}] Error desconectando tras fallo de reproducción: {}",
                guild_id, disconnect_err
            );
        }
        return Err(e);
    }

    Ok(())
}
