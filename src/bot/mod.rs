//! # Bot Module
//!
//! Discord front end for Open Radio.
//!
//! [`RadioBot`] implements Serenity's [`EventHandler`] and is deliberately
//! thin: it parses slash commands and reactions and forwards them to the
//! [`SessionRegistry`], which owns every playback decision.
//!
//! ## Startup
//!
//! `main` reads the state file before the client starts, so no command can
//! reach the store ahead of it. The first `ready` registers the slash
//! commands and resumes every persisted session in parallel. Later `ready`
//! events (gateway reconnects) only check that sessions which believe they
//! are playing still have a live voice connection and a running stream.

use anyhow::Result;
use parking_lot::Mutex;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Reaction, Ready, VoiceState},
    async_trait,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::SongbirdSink,
    config::Config,
    metadata::MetadataRelay,
    session::{SessionRegistry, StopOutcome},
    storage::PersistedIntent,
};

/// Lo que el primer `ready` pone en marcha.
pub struct Startup {
    pub intents: HashMap<GuildId, PersistedIntent>,
    pub metadata: MetadataRelay,
}

pub struct RadioBot {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    sink: Arc<SongbirdSink>,
    /// Se consume en el primer `ready`.
    startup: Mutex<Option<Startup>>,
    commands_registered: AtomicBool,
}

impl RadioBot {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        sink: Arc<SongbirdSink>,
        startup: Startup,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            startup: Mutex::new(Some(startup)),
            commands_registered: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers slash commands with Discord.
    ///
    /// Guild commands (when `GUILD_ID` is set) propagate almost instantly;
    /// global ones can take up to an hour.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for RadioBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("📻 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if !self.commands_registered.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.register_commands(&ctx).await {
                error!("Error al registrar comandos: {:?}", e);
                self.commands_registered.store(false, Ordering::SeqCst);
            }
        }

        let startup = self.startup.lock().take();
        match startup {
            Some(Startup { intents, metadata }) => {
                self.registry.resume_all(intents);
                tokio::spawn(metadata.run());
            }
            // Reconexión del gateway: solo revisar que lo que suena siga sonando
            None => {
                let lost = self.registry.verify_connections().await;
                info!("🔍 Conexiones verificadas tras reconectar ({} recuperando)", lost);
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Reacción de stop sobre el mensaje "Now Playing" vigente.
    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let bot_id = ctx.cache.current_user().id;
        if reaction.user_id == Some(bot_id) {
            return;
        }

        if !reaction.emoji.unicode_eq(&self.config.stop_reaction) {
            return;
        }

        let Some(guild_id) = self.registry.stop_target(reaction.message_id) else {
            return;
        };
        if reaction.guild_id != Some(guild_id) {
            return;
        }

        info!(
            "[{}] ⏹️ Stop por reacción de {:?}",
            guild_id, reaction.user_id
        );

        let outcome = self.registry.stop(guild_id).await;

        if let Err(e) = reaction.delete(&ctx.http).await {
            debug!("[{}] No se pudo quitar la reacción: {}", guild_id, e);
        }

        if let (StopOutcome::Stopped, Some(user_id)) = (outcome, reaction.user_id) {
            let text = format!("⏹️ Radio detenida por <@{}>", user_id);
            if let Err(e) = reaction.channel_id.say(&ctx.http, text).await {
                debug!("[{}] No se pudo avisar el stop: {}", guild_id, e);
            }
        }
    }

    /// El gateway confirma en qué canal de voz está el bot; si quedó fuera
    /// sin que lo pidiéramos, el sink lo reporta como desconexión inesperada.
    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot fuera del canal de voz en guild {}", guild_id);
            self.sink.observe_voice_left(guild_id);
        }
    }
}
