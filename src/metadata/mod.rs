//! "Now playing" titles for live sessions.
//!
//! The relay only forwards; it never changes session state and never
//! persists anything.

pub mod icy;

use futures::StreamExt;
use serenity::model::id::GuildId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::session::SessionRegistry;

pub use icy::IcyFetcher;

/// Consultas de metadata simultáneas por ronda.
const MAX_CONCURRENT_FETCHES: usize = 8;

pub struct MetadataRelay {
    registry: Arc<SessionRegistry>,
    fetcher: IcyFetcher,
    interval: Duration,
}

impl MetadataRelay {
    pub fn new(registry: Arc<SessionRegistry>, fetcher: IcyFetcher, interval: Duration) -> Self {
        Self {
            registry,
            fetcher,
            interval,
        }
    }

    /// Entrega un título a la sesión; se descarta si no está reproduciendo.
    pub fn push(&self, guild_id: GuildId, title: Option<String>) -> bool {
        let delivered = self.registry.relay_title(guild_id, title);
        if !delivered {
            trace!("[{}] Título descartado: la sesión no está reproduciendo", guild_id);
        }
        delivered
    }

    /// Una ronda: consulta cada stream en reproducción y reenvía lo que obtenga.
    pub async fn poll_once(&self) -> usize {
        let streams = self.registry.playing_streams();
        if streams.is_empty() {
            return 0;
        }

        let titles: Vec<(GuildId, String)> = futures::stream::iter(streams)
            .map(|(guild_id, url)| async move {
                match self.fetcher.fetch_title(&url).await {
                    Ok(title) => title.map(|title| (guild_id, title)),
                    Err(e) => {
                        debug!("[{}] No se pudo leer metadata: {:#}", guild_id, e);
                        None
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        titles
            .into_iter()
            .filter(|(guild_id, title)| self.push(*guild_id, Some(title.clone())))
            .count()
    }

    /// Consulta periódica hasta que termine el proceso.
    pub async fn run(self) {
        info!(
            "🎶 Relay de metadata activo (cada {})",
            humantime::format_duration(self.interval)
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let delivered = self.poll_once().await;
            if delivered > 0 {
                debug!("🎶 {} título(s) actualizados", delivered);
            }
        }
    }
}
