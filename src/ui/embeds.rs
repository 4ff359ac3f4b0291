use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};

use super::NowPlayingView;
use crate::session::{GuildSession, SessionState};
use crate::sources::StreamCatalog;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "📻 Open Radio";

/// Crea el embed de "Now Playing" para un stream en vivo
pub fn create_now_playing_embed(view: &NowPlayingView) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("▶️ Reproduciendo Ahora")
        .color(colors::SUCCESS_GREEN)
        .field("📻 Radio", format!("`{}`", view.stream.name), false);

    if let Some(title) = &view.title {
        embed = embed.field("🎶 Sonando", format!("```{}```", title), false);
    }

    let requester = view
        .requester
        .map(|id| format!("<@{}>", id))
        .unwrap_or_else(|| "Desconocido".to_string());

    embed = embed
        .field("👤 Solicitado por", requester, true)
        .field("⏱️ Posición", "🔵 **EN VIVO**", true)
        .field(
            "🕐 Desde",
            format!("<t:{}:R>", view.since.timestamp()),
            true,
        );

    if !view.stream.is_direct() {
        embed = embed.url(&view.stream.url);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea el embed de estado para `/now` cuando no hay nada sonando en vivo
pub fn create_session_status_embed(session: &GuildSession) -> CreateEmbed {
    match session.state {
        SessionState::Reconnecting => {
            let stream = session
                .stream
                .as_ref()
                .map(|s| s.name.as_str())
                .unwrap_or("desconocida");
            create_warning_embed(
                "Reconectando",
                &format!(
                    "Intentando recuperar `{}` (intento {}).",
                    stream, session.retry_count
                ),
            )
        }
        SessionState::Connecting => {
            create_info_embed("Conectando", "Uniéndome al canal de voz...")
        }
        _ => create_info_embed("Nada sonando", "No estoy reproduciendo nada. Usa `/play`."),
    }
}

/// Crea el embed con las radios predefinidas
pub fn create_stream_list_embed(catalog: &StreamCatalog) -> CreateEmbed {
    let description = if catalog.is_empty() {
        "No hay radios predefinidas. Usa `/play <url>` con un stream directo.".to_string()
    } else {
        catalog
            .stations()
            .map(|(name, entry)| {
                if entry.desc.is_empty() {
                    format!("• `{}`", name)
                } else {
                    format!("• `{}` - {}", name, entry.desc)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    CreateEmbed::default()
        .title("📻 Radios Disponibles")
        .description(description)
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new("Usa /play <nombre> para escuchar"))
        .timestamp(Timestamp::now())
}

/// Crea un embed de ayuda general
pub fn create_help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("📻 Open Radio - Ayuda")
        .color(colors::INFO_BLUE)
        .description("Radio 24/7 que se reconecta sola y sobrevive reinicios")
        .field(
            "🎵 Reproducción",
            "• `/play <radio|url>` - Reproduce una radio predefinida o un stream\n\
            • `/stop` - Detiene la radio y sale del canal\n\
            • `/leave` - Igual que `/stop`",
            false,
        )
        .field(
            "ℹ️ Información",
            "• `/now` - Muestra lo que está sonando\n\
            • `/list` - Lista las radios predefinidas\n\
            • `/ping` - Latencia del bot",
            false,
        )
        .field(
            "⏹️ Reacción",
            "Reacciona con ⏹️ al mensaje de \"Reproduciendo Ahora\" para detener",
            false,
        )
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de éxito
pub fn create_success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de advertencia
pub fn create_warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de información
pub fn create_info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {}", title))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}
