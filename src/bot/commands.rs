use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        stop_command(),
        leave_command(),
        now_command(),
        list_command(),
        ping_command(),
        help_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una radio predefinida o un stream directo")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "stream",
                "Nombre de la radio (ver /list) o URL http(s) del stream",
            )
            .required(true),
        )
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop")
        .description("Detiene la radio y sale del canal de voz")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave")
        .description("Sale del canal de voz y olvida la radio")
}

// Comandos de información

fn now_command() -> CreateCommand {
    CreateCommand::new("now")
        .description("Muestra lo que está sonando")
}

fn list_command() -> CreateCommand {
    CreateCommand::new("list").description("Lista las radios predefinidas")
}

fn ping_command() -> CreateCommand {
    CreateCommand::new("ping").description("Muestra la latencia del bot")
}

fn help_command() -> CreateCommand {
    CreateCommand::new("help").description("Muestra la ayuda del bot")
}
