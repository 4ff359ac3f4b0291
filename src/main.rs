use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod metadata;
mod session;
mod sources;
mod storage;
mod ui;

use crate::audio::SongbirdSink;
use crate::bot::{RadioBot, Startup};
use crate::config::Config;
use crate::metadata::{IcyFetcher, MetadataRelay};
use crate::session::SessionRegistry;
use crate::sources::StreamCatalog;
use crate::storage::StateStore;
use crate::ui::DiscordNotifier;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_radio=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("📻 Iniciando Open Radio v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config);
    }

    let catalog = StreamCatalog::load(&config.streams_file)?;
    let store = Arc::new(StateStore::open(&config.state_file));
    // Antes de arrancar el cliente: ningún comando puede escribir sin que el archivo esté leído
    let saved_intents = store.load().await;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("open-radio/", env!("CARGO_PKG_VERSION")))
        .build()?;

    // Transporte de voz: eventos del sink → sesiones
    let songbird = Songbird::serenity();
    let (sink_events, sink_events_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(SongbirdSink::new(
        songbird.clone(),
        http_client.clone(),
        sink_events,
    ));

    let http = Arc::new(Http::new(&config.discord_token));
    let notifier = Arc::new(DiscordNotifier::new(http, config.stop_reaction.clone()));

    let registry = SessionRegistry::new(
        catalog,
        sink.clone(),
        store,
        notifier,
        config.reconnect_policy(),
    );
    tokio::spawn(registry.clone().route_sink_events(sink_events_rx));

    let metadata = MetadataRelay::new(
        registry.clone(),
        IcyFetcher::new(http_client, config.metadata_timeout)?,
        config.metadata_fetch_interval,
    );

    // Intents mínimos: voz, guilds (caché de canales) y reacciones de stop
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS;

    let config = Arc::new(config);
    let handler = RadioBot::new(
        config.clone(),
        registry,
        sink,
        Startup {
            intents: saved_intents,
            metadata,
        },
    );

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Verifica que la configuración y el catálogo carguen.
fn health_check(config: &Config) -> Result<()> {
    let catalog = StreamCatalog::load(&config.streams_file)?;
    info!("✅ Health check: {} radio(s) en catálogo", catalog.len());
    println!("OK");
    Ok(())
}
