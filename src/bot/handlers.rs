use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseFollowup,
        CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::{CommandInteraction, ComponentInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{debug, info};

use crate::{
    audio::{
        coordinator::PlayerStatus, equalizer::EqPreset, PlaybackEvent, Transition,
    },
    bot::AkioBot,
    ui::{
        buttons::{self, ControlAction, VOLUME_STEP},
        embeds,
    },
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &AkioBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );
    bot.engine
        .coordinator()
        .set_text_channel(guild_id.get(), command.channel_id.get());

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await?,
        "nodes" => handle_nodes(ctx, &command, bot).await?,
        "help" => respond_embed(ctx, &command, embeds::create_help_embed(), true).await?,
        "volume" if option_i64(&command, "level").is_none() => {
            let volume = bot.engine.queue_state(guild_id.get()).volume;
            respond_embed(ctx, &command, embeds::create_volume_embed(volume), false).await?
        }
        "pause" | "resume" | "skip" | "back" | "stop" | "seek" | "loop" | "shuffle" | "remove"
        | "clearqueue" | "volume" | "equalizer" => {
            handle_control(ctx, &command, bot, guild_id).await?
        }
        _ => respond(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

/// Maneja los botones del reproductor
pub async fn handle_component(
    ctx: &Context,
    component: ComponentInteraction,
    bot: &AkioBot,
) -> Result<()> {
    let guild_id = component
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Componente usado fuera de un servidor"))?;

    info!(
        "🔘 Botón {} presionado por {} en guild {}",
        component.data.custom_id, component.user.name, guild_id
    );

    let Some((action, play_id)) = ControlAction::parse(&component.data.custom_id) else {
        return reply_component(ctx, &component, "❌ Acción no reconocida").await;
    };

    if action == ControlAction::Queue {
        let engine = &bot.engine;
        let state = engine.queue_state(guild_id.get());
        let page = engine.queue_page(guild_id.get(), None);
        component
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .embed(embeds::create_queue_embed(&state, &page))
                        .ephemeral(true),
                ),
            )
            .await?;
        return Ok(());
    }

    if let Err(message) = check_same_channel(ctx, bot, guild_id, component.user.id).await {
        return reply_component(ctx, &component, message).await;
    }

    component.defer(&ctx.http).await?;

    let guild = guild_id.get();
    let engine = &bot.engine;
    let transition = match action {
        ControlAction::TogglePause => engine.toggle_pause(guild).await,
        ControlAction::Skip => {
            engine
                .dispatch(guild, PlaybackEvent::SkipRequested { play_id })
                .await
        }
        ControlAction::Back => engine.dispatch(guild, PlaybackEvent::PreviousRequested).await,
        ControlAction::VolumeDown => engine.adjust_volume(guild, -VOLUME_STEP).await,
        ControlAction::VolumeUp => engine.adjust_volume(guild, VOLUME_STEP).await,
        ControlAction::Stop => engine.disconnect(guild).await,
        ControlAction::Loop => engine.dispatch(guild, PlaybackEvent::LoopToggled).await,
        ControlAction::Restart => engine.restart(guild).await,
        ControlAction::Shuffle => engine.shuffle(guild).await,
        ControlAction::Queue => Transition::Ignored,
    };

    // refrescar el mensaje del reproductor cuando cambia su estado
    if matches!(
        transition,
        Transition::Paused
            | Transition::Resumed
            | Transition::VolumeChanged(_)
            | Transition::LoopChanged(_)
            | Transition::Shuffled { .. }
    ) {
        if let Some(now) = engine.now_playing(guild) {
            let edit = EditInteractionResponse::new()
                .embed(embeds::create_now_playing_embed(&now))
                .components(buttons::create_player_buttons(&now));
            if let Err(e) = component.edit_response(&ctx.http, edit).await {
                debug!("No se pudo refrescar el reproductor: {:?}", e);
            }
        }
    }

    component
        .create_followup(
            &ctx.http,
            CreateInteractionResponseFollowup::new()
                .content(transition_message(&transition))
                .ephemeral(true),
        )
        .await?;

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &AkioBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = option_str(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();

    let Ok(user_channel) = get_user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "❌ Debes estar en un canal de voz", true).await;
    };

    let bot_channel = bot.voice_channel(guild_id).await;
    if let Some(current) = bot_channel {
        if current != user_channel && bot.engine.status(guild_id.get()) != PlayerStatus::Idle {
            let message = format!("❌ Ya estoy reproduciendo en <#{}>", current);
            return respond(ctx, command, &message, true).await;
        }
    }

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let has_voice = bot
        .engine
        .coordinator()
        .session(guild_id.get())
        .voice
        .is_some();
    if bot_channel != Some(user_channel) || !has_voice {
        if let Err(e) = bot.join_voice_channel(guild_id, user_channel).await {
            let edit = EditInteractionResponse::new().content(format!("❌ {}", e));
            command.edit_response(&ctx.http, edit).await?;
            return Ok(());
        }
    }

    let event = PlaybackEvent::PlayRequested {
        query,
        requester: command.user.id.get(),
    };
    let edit = match bot.engine.dispatch(guild_id.get(), event).await {
        Transition::Enqueued {
            first,
            added,
            position,
            playlist,
            started,
        } => EditInteractionResponse::new().embed(embeds::create_enqueued_embed(
            &first,
            added,
            position,
            playlist.as_deref(),
            started,
        )),
        other => EditInteractionResponse::new().content(transition_message(&other)),
    };
    command.edit_response(&ctx.http, edit).await?;

    Ok(())
}

/// Comandos que cambian la reproducción: mismo canal de voz, luego el motor
async fn handle_control(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &AkioBot,
    guild_id: GuildId,
) -> Result<()> {
    if let Err(message) = check_same_channel(ctx, bot, guild_id, command.user.id).await {
        return respond(ctx, command, message, true).await;
    }

    let preset = match command.data.name.as_str() {
        "equalizer" => {
            let name = option_str(command, "preset").unwrap_or_default();
            match EqPreset::from_name(name) {
                Some(preset) => Some(preset),
                None => {
                    let message = format!("❌ Preset desconocido: {}", name);
                    return respond(ctx, command, &message, true).await;
                }
            }
        }
        _ => None,
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let guild = guild_id.get();
    let engine = &bot.engine;
    let transition = match command.data.name.as_str() {
        "pause" => engine.pause(guild).await,
        "resume" => engine.resume(guild).await,
        "skip" => {
            let play_id = engine.current_play_id(guild);
            engine
                .dispatch(guild, PlaybackEvent::SkipRequested { play_id })
                .await
        }
        "back" => engine.dispatch(guild, PlaybackEvent::PreviousRequested).await,
        "stop" => engine.disconnect(guild).await,
        "seek" => {
            let seconds = option_i64(command, "seconds").unwrap_or(0).max(0) as u64;
            engine.seek(guild, seconds.saturating_mul(1000)).await
        }
        "loop" => engine.dispatch(guild, PlaybackEvent::LoopToggled).await,
        "shuffle" => engine.shuffle(guild).await,
        "remove" => match option_i64(command, "position") {
            Some(position) if position >= 1 => engine.remove(guild, position as usize - 1).await,
            _ => Transition::InvalidPosition,
        },
        "clearqueue" => engine.clear_queue(guild).await,
        "volume" => {
            let level = option_i64(command, "level").unwrap_or(0).clamp(0, i64::from(u16::MAX));
            engine.set_volume(guild, level as u16).await
        }
        "equalizer" => match preset {
            Some(preset) => engine.set_equalizer(guild, preset).await,
            None => Transition::Ignored,
        },
        _ => Transition::Ignored,
    };

    let edit = match &transition {
        Transition::EqualizerChanged(preset) => {
            EditInteractionResponse::new().embed(embeds::create_equalizer_embed(*preset))
        }
        Transition::VolumeChanged(volume) => {
            EditInteractionResponse::new().embed(embeds::create_volume_embed(*volume))
        }
        other => EditInteractionResponse::new().content(transition_message(other)),
    };
    command.edit_response(&ctx.http, edit).await?;

    Ok(())
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &AkioBot,
    guild_id: GuildId,
) -> Result<()> {
    let page = option_i64(command, "page").map(|p| p.max(1) as usize);
    let state = bot.engine.queue_state(guild_id.get());
    let page = bot.engine.queue_page(guild_id.get(), page);

    respond_embed(ctx, command, embeds::create_queue_embed(&state, &page), false).await
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &AkioBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(now) = bot.engine.now_playing(guild_id.get()) else {
        return respond(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await;
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embeds::create_now_playing_embed(&now))
                    .components(buttons::create_player_buttons(&now)),
            ),
        )
        .await?;

    Ok(())
}

async fn handle_nodes(ctx: &Context, command: &CommandInteraction, bot: &AkioBot) -> Result<()> {
    let engine = &bot.engine;
    let embed = embeds::create_nodes_embed(
        &bot.nodes.summary(),
        &bot.nodes.nodes(),
        engine.coordinator().active_guilds(),
        &engine.store().stats(),
        &engine.cache().metrics(),
    );
    respond_embed(ctx, command, embed, false).await
}

/// Texto para el usuario según el resultado del motor
pub fn transition_message(transition: &Transition) -> String {
    match transition {
        Transition::Enqueued { first, added, .. } if *added > 1 => {
            format!("✅ {} canciones agregadas, empezando por **{}**", added, first.title)
        }
        Transition::Enqueued { first, .. } => format!("✅ **{}** agregada a la cola", first.title),
        Transition::Playing { track, .. } => format!("▶️ Reproduciendo **{}**", track.title),
        Transition::Exhausted => "🏁 No hay más canciones en la cola".to_string(),
        Transition::LoopChanged(mode) => format!("{} Repetición: {}", mode.emoji(), mode),
        Transition::Paused => "⏸️ Reproducción pausada".to_string(),
        Transition::Resumed => "▶️ Reproducción reanudada".to_string(),
        Transition::VolumeChanged(volume) => format!("🔊 Volumen ajustado a {}%", volume),
        Transition::Seeked(ms) => format!(
            "⏩ Posición: {}",
            embeds::format_duration(std::time::Duration::from_millis(*ms))
        ),
        Transition::Shuffled { tracks } => format!("🔀 Cola mezclada ({} canciones)", tracks),
        Transition::Removed(track) => format!("➖ **{}** eliminada de la cola", track.title),
        Transition::Cleared(count) => format!("🗑️ Cola vaciada ({} canciones)", count),
        Transition::EqualizerChanged(preset) => format!("🎚️ Ecualizador: {}", preset),
        Transition::Disconnected => "👋 Reproducción detenida y cola limpiada".to_string(),
        Transition::Ignored => "⏭️ Esa acción ya no aplica a la canción actual".to_string(),
        Transition::NothingToSkip => "❌ No hay siguiente canción".to_string(),
        Transition::NoPrevious => "❌ No hay canción anterior".to_string(),
        Transition::NothingPlaying => "❌ No hay nada reproduciéndose actualmente".to_string(),
        Transition::NotEnoughTracks => "❌ Se necesitan al menos 2 canciones".to_string(),
        Transition::InvalidPosition => "❌ Posición inválida".to_string(),
        Transition::NoResults => "❌ No se encontraron resultados".to_string(),
        Transition::QueueFull => "❌ La cola está llena".to_string(),
        Transition::Unavailable => {
            "❌ No hay nodos de audio disponibles, intenta de nuevo en unos segundos".to_string()
        }
        Transition::PlaybackFailed => {
            "❌ No se pudo continuar la reproducción".to_string()
        }
    }
}

// Funciones auxiliares

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_i64(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(
    ctx: &Context,
    command: &CommandInteraction,
    embed: serenity::builder::CreateEmbed,
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

async fn reply_component(ctx: &Context, component: &ComponentInteraction, content: &str) -> Result<()> {
    component
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
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

/// Los controles solo funcionan para quien escucha con el bot
async fn check_same_channel(
    ctx: &Context,
    bot: &AkioBot,
    guild_id: GuildId,
    user_id: UserId,
) -> std::result::Result<(), &'static str> {
    let Some(bot_channel) = bot.voice_channel(guild_id).await else {
        return Err("❌ No estoy en ningún canal de voz");
    };
    match get_user_voice_channel(ctx, guild_id, user_id) {
        Ok(channel) if channel == bot_channel => Ok(()),
        Ok(_) => Err("❌ Debes estar en mi mismo canal de voz"),
        Err(_) => Err("❌ Debes estar en un canal de voz"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::{LoopMode, Track};
    use pretty_assertions::assert_eq;

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            ..Track::default()
        }
    }

    #[test]
    fn describes_enqueued_tracks() {
        let single = Transition::Enqueued {
            first: track("Song"),
            added: 1,
            position: 3,
            playlist: None,
            started: false,
        };
        assert_eq!(transition_message(&single), "✅ **Song** agregada a la cola");

        let many = Transition::Enqueued {
            first: track("Opener"),
            added: 12,
            position: 0,
            playlist: Some("Mix".to_string()),
            started: true,
        };
        assert_eq!(
            transition_message(&many),
            "✅ 12 canciones agregadas, empezando por **Opener**"
        );
    }

    #[test]
    fn describes_controls() {
        assert_eq!(
            transition_message(&Transition::Seeked(95_000)),
            "⏩ Posición: 1:35"
        );
        assert!(transition_message(&Transition::LoopChanged(LoopMode::Queue)).contains("Repetición"));
        assert_eq!(
            transition_message(&Transition::NothingToSkip),
            "❌ No hay siguiente canción"
        );
    }
}
