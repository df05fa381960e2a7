use anyhow::Result;
use serenity::{all::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use akio::audio::{
    equalizer::EqPreset, lavalink_client::LavalinkPool, voice::SongbirdGateway,
    EngineSettings, PlaybackCoordinator, PlaybackEngine,
};
use akio::bot::{events, AkioBot};
use akio::config::Config;
use akio::nodes::{NodeManager, NodeSettings};
use akio::storage::QueueStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("akio=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Akio v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config);
    }

    // Cola persistente
    let store = Arc::new(QueueStore::new(&config.queue_file, config.default_volume)?);
    info!("💾 {}", store.stats());

    let default_preset = EqPreset::from_name(&config.default_eq_preset).unwrap_or_else(|| {
        warn!(
            "⚠️ Preset de ecualizador desconocido: {}, usando flat",
            config.default_eq_preset
        );
        EqPreset::Flat
    });
    let coordinator = Arc::new(PlaybackCoordinator::new(default_preset));

    // El id del bot hace falta antes de abrir los websockets de Lavalink
    let http = Arc::new(Http::new(&config.discord_token));
    let user_id = http.get_current_user().await?.id;

    // Nodos de audio
    info!("🎼 Inicializando nodos Lavalink...");
    let shutdown = CancellationToken::new();
    let (node_events_tx, node_events_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(LavalinkPool::new(
        user_id.get(),
        config.resolve_timeout(),
        node_events_tx,
    )?);
    let nodes = Arc::new(NodeManager::new(NodeSettings::from_config(&config), pool)?);
    let connected = nodes.bootstrap().await;
    if connected == 0 {
        warn!("⚠️ Ningún nodo disponible al iniciar, se reintentará en segundo plano");
    } else {
        info!("✅ {} nodos conectados", connected);
    }
    nodes.spawn_background(shutdown.clone());

    // Motor de reproducción
    let songbird = Songbird::serenity();
    let engine = PlaybackEngine::new(
        store,
        coordinator,
        nodes.clone(),
        Arc::new(SongbirdGateway::new(songbird.clone())),
        Arc::new(events::DiscordNotifier::new(http)),
        EngineSettings::from_config(&config),
    );
    tokio::spawn(events::pump_node_events(
        engine.clone(),
        node_events_rx,
        shutdown.clone(),
    ));

    // Solo hacen falta guilds y estados de voz: todo pasa por comandos slash
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = AkioBot::new(config.clone(), engine, nodes, songbird.clone());
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
        shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Health check del contenedor: el archivo de cola debe poder leerse
fn health_check(config: &Config) -> Result<()> {
    let store = QueueStore::new(&config.queue_file, config.default_volume)?;
    println!("OK ({})", store.stats());
    Ok(())
}
