use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Http, MessageId},
    async_trait,
    builder::CreateMessage,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::audio::{
    engine::{Notice, NowPlaying, PlaybackNotifier},
    node::NodeEvent,
    PlaybackEngine,
};
use crate::ui::{buttons, embeds};

/// Publica los avisos del motor en el canal de texto de la guild.
///
/// Queda un solo mensaje de "reproduciendo ahora" por guild: el anterior se
/// borra al empezar un track, al terminar la cola o al salir el bot.
pub struct DiscordNotifier {
    http: Arc<Http>,
    now_playing: DashMap<u64, (ChannelId, MessageId)>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            now_playing: DashMap::new(),
        }
    }

    async fn delete_previous(&self, guild_id: u64) {
        if let Some((_, (channel, message))) = self.now_playing.remove(&guild_id) {
            if let Err(e) = channel.delete_message(&self.http, message).await {
                debug!("No se pudo borrar el mensaje anterior: {:?}", e);
            }
        }
    }

    async fn send_now_playing(&self, guild_id: u64, channel: ChannelId, now: &NowPlaying) -> Result<()> {
        let message = channel
            .send_message(
                &self.http,
                CreateMessage::new()
                    .embed(embeds::create_now_playing_embed(now))
                    .components(buttons::create_player_buttons(now)),
            )
            .await?;
        self.now_playing.insert(guild_id, (channel, message.id));
        Ok(())
    }

    async fn send_embed(&self, channel: ChannelId, embed: serenity::builder::CreateEmbed) -> Result<()> {
        channel
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PlaybackNotifier for DiscordNotifier {
    async fn notify(&self, guild_id: u64, channel_id: Option<u64>, notice: Notice) {
        let Some(channel) = channel_id.map(ChannelId::new) else {
            return;
        };

        let sent = match notice {
            Notice::TrackStarted(now) => {
                self.delete_previous(guild_id).await;
                self.send_now_playing(guild_id, channel, &now).await
            }
            Notice::TrackSkipped { track, reason } => {
                let embed = embeds::create_error_embed(
                    "No se pudo reproducir",
                    &format!("**{}** fue saltada: {}", track.title, reason),
                );
                self.send_embed(channel, embed).await
            }
            Notice::QueueFinished => {
                self.delete_previous(guild_id).await;
                let embed = embeds::create_info_embed(
                    "🏁 Cola terminada",
                    "Usa `/play` para seguir escuchando. Me desconectaré si no hay actividad.",
                );
                self.send_embed(channel, embed).await
            }
            Notice::Disconnected { idle } => {
                self.delete_previous(guild_id).await;
                if idle {
                    let embed = embeds::create_info_embed(
                        "💤 Desconectado",
                        "Me fui del canal de voz por inactividad.",
                    );
                    self.send_embed(channel, embed).await
                } else {
                    Ok(())
                }
            }
        };

        if let Err(e) = sent {
            error!("Error enviando aviso a guild {}: {:?}", guild_id, e);
        }
    }
}

/// Pasa los eventos de los nodos al motor hasta `shutdown` o hasta que no
/// queden emisores. Cada evento corre en su propia tarea; el motor serializa
/// por guild.
pub async fn pump_node_events(
    engine: PlaybackEngine,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.handle_node_event(event).await;
                });
            }
        }
    }
    info!("📭 Bomba de eventos de nodos detenida");
}
