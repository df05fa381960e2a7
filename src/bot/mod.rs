//! # Bot Module
//!
//! Discord side of Akio.
//!
//! This module contains:
//! - Slash command registration ([`commands`])
//! - Command and button handling ([`handlers`])
//! - Now-playing messages and the node event pump ([`events`])
//!
//! ## Architecture
//!
//! [`AkioBot`] implements Serenity's [`EventHandler`]. It owns no playback
//! state itself: every command ends up in the [`PlaybackEngine`], which
//! persists queues and talks to the Lavalink nodes picked by the
//! [`NodeManager`]. Songbird is only used to join voice channels and hand
//! the voice credentials over to the engine.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use songbird::Songbird;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{
    audio::{coordinator::PlayerStatus, voice::VoiceConnection, PlaybackEngine},
    config::Config,
    nodes::NodeManager,
};

/// Intervalo del ciclo de mantenimiento
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Handler principal del bot de Discord
pub struct AkioBot {
    config: Arc<Config>,
    pub engine: PlaybackEngine,
    pub nodes: Arc<NodeManager>,
    songbird: Arc<Songbird>,
    maintenance_started: AtomicBool,
}

impl AkioBot {
    pub fn new(
        config: Arc<Config>,
        engine: PlaybackEngine,
        nodes: Arc<NodeManager>,
        songbird: Arc<Songbird>,
    ) -> Self {
        Self {
            config,
            engine,
            nodes,
            songbird,
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// Registra los comandos slash en Discord.
    ///
    /// Van a `GUILD_ID` si está definido (se propagan en un segundo, útil en
    /// desarrollo) y globalmente si no (hasta una hora).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
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
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Se une a `channel_id` por el gateway y pasa las credenciales de voz al motor
    pub async fn join_voice_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        let (info, _call) = self
            .songbird
            .join_gateway(guild_id, channel_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al conectar al canal de voz: {e}"))?;

        self.engine
            .attach_voice(guild_id.get(), VoiceConnection::from(info))
            .await;
        info!("🔊 Conectado a {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    /// Canal de voz donde está el bot
    pub async fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let call = self.songbird.get(guild_id)?;
        let channel = call.lock().await.current_channel()?;
        Some(ChannelId::from(channel.0))
    }
}

#[async_trait]
impl EventHandler for AkioBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        // ready se repite en cada reconexión del gateway
        if !self.maintenance_started.swap(true, Ordering::SeqCst) {
            let engine = self.engine.clone();
            let nodes = self.nodes.clone();
            tokio::spawn(async move {
                maintenance_tasks(engine, nodes).await;
            });
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command) => {
                if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                    error!("Error manejando comando: {:?}", e);
                }
            }
            Interaction::Component(component) => {
                if let Err(e) = handlers::handle_component(&ctx, component, self).await {
                    error!("Error manejando componente: {:?}", e);
                }
            }
            _ => {}
        }
    }

    /// Alguien sacó al bot de voz: se descarta el player y la cola
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        if self.engine.status(guild_id.get()) != PlayerStatus::Idle {
            info!("🔌 Bot desconectado del canal de voz en guild {}", guild_id);
            self.engine.disconnect(guild_id.get()).await;
        }
    }
}

/// Mantenimiento cada hora: entradas expiradas del caché y una línea de estado en los logs
async fn maintenance_tasks(engine: PlaybackEngine, nodes: Arc<NodeManager>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        interval.tick().await;

        engine.cache().cleanup_old_entries();
        info!(
            "🧹 Mantenimiento: {} • {} • {} guilds activos",
            nodes.summary(),
            engine.store().stats(),
            engine.coordinator().active_guilds()
        );
    }
}
