use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Instant;
use tracing::{info, warn};

use crate::{
    bot::RadioBot,
    error::SessionError,
    session::{PlayRequest, SessionState, StopOutcome},
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &RadioBot) -> Result<()> {
    info!(
        "📝 Comando /{} usado por {} en guild {:?}",
        command.data.name, command.user.name, command.guild_id
    );

    // /list, /ping y /help funcionan en cualquier lado
    match command.data.name.as_str() {
        "list" => return handle_list(ctx, &command, bot).await,
        "ping" => return handle_ping(ctx, &command).await,
        "help" => return handle_help(ctx, &command).await,
        _ => {}
    }

    let Some(guild_id) = command.guild_id else {
        let embed = embeds::create_error_embed(
            "Solo en servidores",
            "Este comando solo funciona dentro de un servidor.",
        );
        return respond(ctx, &command, embed, true).await;
    };

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "stop" | "leave" => handle_stop(ctx, &command, bot, guild_id).await?,
        "now" => handle_now(ctx, &command, bot, guild_id).await?,
        _ => {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content("❌ Comando no reconocido")
                            .ephemeral(true),
                    ),
                )
                .await?;
        }
    }

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let target = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "stream")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Stream no proporcionado"))?
        .to_string();

    // Verificar que el usuario esté en un canal de voz
    let voice_channel_id = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel_id) => channel_id,
        Err(e) => {
            let embed = embeds::create_error_embed("Sin canal de voz", &e.to_string());
            return respond(ctx, command, embed, true).await;
        }
    };

    // Defer la respuesta ya que conectar puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let result = bot
        .registry()
        .play(PlayRequest {
            guild_id,
            target: target.clone(),
            voice_channel_id,
            text_channel_id: Some(command.channel_id),
            requester_id: Some(command.user.id),
        })
        .await;

    let embed = match result {
        Ok(()) => {
            let name = bot
                .registry()
                .now(guild_id)
                .stream
                .map(|stream| stream.name)
                .unwrap_or(target);
            embeds::create_success_embed(
                "Radio en vivo",
                &format!("Sintonizando `{}` en <#{}>", name, voice_channel_id),
            )
        }
        Err(SessionError::InvalidTarget(input)) => embeds::create_error_embed(
            "Radio no encontrada",
            &format!(
                "`{}` no es una radio predefinida ni una URL http(s). Usa `/list` para ver las radios.",
                input
            ),
        ),
        Err(SessionError::Superseded) => embeds::create_info_embed(
            "Pedido reemplazado",
            "Otro `/play` o `/stop` llegó antes de que terminara de conectar.",
        ),
        Err(e) => {
            warn!("[{}] /play falló: {}", guild_id, e);
            embeds::create_error_embed("No se pudo reproducir", &e.to_string())
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;

    Ok(())
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let embed = match bot.registry().stop(guild_id).await {
        StopOutcome::Stopped => {
            embeds::create_success_embed("Radio detenida", "Salí del canal de voz. ¡Hasta luego!")
        }
        StopOutcome::AlreadyIdle => {
            embeds::create_info_embed("Nada que detener", "No estaba reproduciendo nada.")
        }
    };

    respond(ctx, command, embed, false).await
}

async fn handle_now(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let session = bot.registry().now(guild_id);

    let embed = match (session.state, session.now_playing_view()) {
        (SessionState::Playing, Some(view)) => embeds::create_now_playing_embed(&view),
        _ => embeds::create_session_status_embed(&session),
    };

    respond(ctx, command, embed, false).await
}

async fn handle_list(ctx: &Context, command: &CommandInteraction, bot: &RadioBot) -> Result<()> {
    let embed = embeds::create_stream_list_embed(bot.registry().catalog());
    respond(ctx, command, embed, false).await
}

/// Latencia medida como ida y vuelta a la API de Discord.
async fn handle_ping(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let started = Instant::now();
    ctx.http.get_current_user().await?;
    let latency = started.elapsed();

    let embed = embeds::create_info_embed(
        "Pong!",
        &format!("🏓 Latencia: {:.2} ms", latency.as_secs_f64() * 1000.0),
    );
    respond(ctx, command, embed, true).await
}

async fn handle_help(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    respond(ctx, command, embeds::create_help_embed(), true).await
}

// Funciones auxiliares

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;

    Ok(())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}
