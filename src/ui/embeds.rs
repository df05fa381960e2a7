use num_format::{Locale, ToFormattedString};
use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::{
        engine::NowPlaying,
        equalizer::EqPreset,
        queue::{GuildQueueState, LoopMode, QueuePage, Track},
    },
    cache::lru_cache::CacheMetrics,
    nodes::{NodeInfo, NodeStats},
    storage::StorageStats,
};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Akio";

/// Volumen que llena la barra
const VOLUME_BAR_FULL: u16 = 200;

fn loop_label(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "Desactivado",
        LoopMode::Track => "Canción",
        LoopMode::Queue => "Cola",
    }
}

fn track_duration(track: &Track) -> String {
    if track.duration == 0 {
        "🔴 En vivo".to_string()
    } else {
        format_duration(track.duration())
    }
}

fn track_link(track: &Track) -> String {
    if track.uri.is_empty() {
        format!("**{}**", track.title)
    } else {
        format!("**[{}]({})**", track.title, track.uri)
    }
}

/// Crea el embed de "reproduciendo ahora"
pub fn create_now_playing_embed(now: &NowPlaying) -> CreateEmbed {
    let track = &now.track;
    let title = if now.paused {
        "⏸️ En Pausa"
    } else {
        "🎵 Reproduciendo Ahora"
    };

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(track_link(track))
        .color(if now.paused {
            colors::WARNING_ORANGE
        } else {
            colors::MUSIC_PURPLE
        })
        .field("🎤 Artista", &track.author, true)
        .field("⏱️ Duración", track_duration(track), true)
        .field("👤 Solicitado por", format!("<@{}>", track.requester), true)
        .field(
            "📜 Posición",
            format!("{} de {}", now.index + 1, now.queue_len),
            true,
        )
        .field(
            format!("{} Repetición", now.loop_mode.emoji()),
            loop_label(now.loop_mode),
            true,
        )
        .field("🔊 Volumen", format!("{}%", now.volume), true);

    if let Some(next) = &now.next {
        embed = embed.field("⏭️ Siguiente", format!("{} - {}", next.title, next.author), false);
    }

    embed
        .footer(CreateEmbedFooter::new(format!(
            "{} • EQ: {}",
            STANDARD_FOOTER, now.eq_preset
        )))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar lo que se agregó a la cola
pub fn create_enqueued_embed(
    first: &Track,
    added: usize,
    position: usize,
    playlist: Option<&str>,
    started: bool,
) -> CreateEmbed {
    let (title, description) = match playlist {
        Some(name) => (
            "📋 Playlist Agregada",
            format!("**{}**: {} canciones agregadas a la cola", name, added),
        ),
        None => ("✅ Canción Agregada", track_link(first)),
    };

    let footer = if started {
        "▶️ Reproduciendo ahora"
    } else {
        "🎵 Se reproducirá automáticamente cuando llegue su turno"
    };

    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Artista", &first.author, true)
        .field("⏱️ Duración", track_duration(first), true)
        .field("📍 Posición", format!("#{}", position + 1), true)
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(state: &GuildQueueState, page: &QueuePage) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if page.total_items == 0 {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = state.current() {
        embed = embed.field(
            format!("{} Reproduciendo", state.loop_mode.emoji()),
            format!("**{}** - {}", current.title, current.author),
            false,
        );
    } else if state.is_exhausted() {
        embed = embed.field("🏁 Estado", "La cola terminó", false);
    }

    let current = state.position();
    let lines: Vec<String> = page
        .items
        .iter()
        .map(|(position, track)| {
            let marker = if Some(*position) == current { "▶️ " } else { "" };
            format!(
                "{}**{}**. {} - {} `[{}]`",
                marker,
                position + 1,
                track.title,
                track.author,
                track_duration(track)
            )
        })
        .collect();
    embed = embed.field("Canciones", lines.join("\n"), false);

    let mut info = format!("**Total:** {} canciones", page.total_items);
    let total = state.total_duration();
    if total > Duration::ZERO {
        info.push_str(&format!(" • **Duración:** {}", format_duration(total)));
    }
    if state.shuffle {
        info.push_str(" • 🔀 **Aleatorio**");
    }
    embed = embed.field("Información", info, false);

    let footer = if page.total_pages > 1 {
        format!(
            "Página {} de {} • {}",
            page.current_page, page.total_pages, STANDARD_FOOTER
        )
    } else {
        STANDARD_FOOTER.to_string()
    };
    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

/// Estado del pool de nodos para `/nodes`
pub fn create_nodes_embed(
    stats: &NodeStats,
    nodes: &[NodeInfo],
    active_guilds: usize,
    storage: &StorageStats,
    cache: &CacheMetrics,
) -> CreateEmbed {
    let color = if stats.healthy == 0 {
        colors::ERROR_RED
    } else if stats.healthy < stats.total {
        colors::WARNING_ORANGE
    } else {
        colors::SUCCESS_GREEN
    };

    let mut embed = CreateEmbed::default()
        .title("🌐 Nodos de Audio")
        .color(color)
        .field(
            "🩺 Salud",
            format!("{}/{} sanos", stats.healthy, stats.total),
            true,
        )
        .field(
            "🎧 Players",
            stats.players.to_formatted_string(&Locale::en),
            true,
        )
        .field(
            "📈 Carga media",
            format!("{:.1}%", stats.average_load * 100.0),
            true,
        )
        .field(
            "⏱️ Latencia media",
            format!("{:.0} ms", stats.average_latency_ms),
            true,
        )
        .field("🎵 Guilds activos", active_guilds.to_string(), true)
        .field(
            "💾 Cola persistida",
            format!(
                "{} guilds • {} pistas",
                storage.guilds.to_formatted_string(&Locale::en),
                storage.tracks.to_formatted_string(&Locale::en)
            ),
            true,
        )
        .field(
            "⚡ Caché",
            format!("{:.0}% aciertos", cache.hit_rate() * 100.0),
            true,
        );

    let lines: Vec<String> = nodes
        .iter()
        .take(10)
        .map(|node| {
            let status = if node.is_healthy { "🟢" } else { "🔴" };
            format!(
                "{} `{}` • {} players • {:.0} ms • score {:.0}",
                status,
                node.identifier,
                node.players.to_formatted_string(&Locale::en),
                node.latency_ms,
                node.score()
            )
        })
        .collect();
    if !lines.is_empty() {
        embed = embed.field("Nodos", lines.join("\n"), false);
    }

    embed
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de ayuda general
pub fn create_help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Akio - Comandos")
        .color(colors::INFO_BLUE)
        .description("Música en tu canal de voz. La cola se guarda aunque el bot se reinicie.")
        .field(
            "🎵 Reproducción",
            "• `/play <canción o URL>` - Agrega a la cola\n\
            • `/pause` / `/resume` - Pausa o reanuda\n\
            • `/skip` - Siguiente canción\n\
            • `/back` - Canción anterior\n\
            • `/seek <segundos>` - Salta a una posición\n\
            • `/stop` - Desconecta y borra la cola",
            false,
        )
        .field(
            "📜 Cola",
            "• `/queue [página]` - Muestra la cola\n\
            • `/nowplaying` - Canción actual\n\
            • `/loop` - Off → Canción → Cola\n\
            • `/shuffle` - Mezcla la cola\n\
            • `/remove <posición>` - Quita una canción\n\
            • `/clearqueue` - Vacía la cola",
            false,
        )
        .field(
            "🎛️ Audio",
            "• `/volume [0-1000]` - Ajusta el volumen\n\
            • `/equalizer <preset>` - Aplica ecualizador",
            false,
        )
        .field("🌐 Estado", "• `/nodes` - Nodos de audio", false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de volumen con indicador visual
pub fn create_volume_embed(volume: u16) -> CreateEmbed {
    let status_emoji = match volume {
        0 => "🔇",
        1..=50 => "🔉",
        _ => "🔊",
    };

    CreateEmbed::default()
        .title(format!("{} Volumen", status_emoji))
        .description(format!("**{}%**", volume))
        .field("📊 Nivel", create_volume_bar(volume), false)
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new("💡 Usa los botones o /volume <nivel> para ajustar"))
        .timestamp(Timestamp::now())
}

pub fn create_equalizer_embed(preset: EqPreset) -> CreateEmbed {
    let bars: String = preset
        .gains()
        .iter()
        .map(|gain| match gain {
            g if *g >= 0.2 => '█',
            g if *g >= 0.1 => '▆',
            g if *g > 0.0 => '▄',
            g if *g == 0.0 => '▂',
            _ => '▁',
        })
        .collect();

    CreateEmbed::default()
        .title("🎚️ Ecualizador")
        .description(format!("Preset: **{}**\n`{}`", preset, bars))
        .color(colors::MUSIC_PURPLE)
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

/// Crea un embed de información
pub fn create_info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea una barra visual de volumen
fn create_volume_bar(volume: u16) -> String {
    let segments = 20usize;
    let filled = usize::from(volume.min(VOLUME_BAR_FULL)) * segments / usize::from(VOLUME_BAR_FULL);
    let bar = "█".repeat(filled) + &"▒".repeat(segments - filled);
    format!("`[{}]`", bar)
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(185)), "3:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
    }

    #[test]
    fn live_tracks_have_no_duration() {
        let live = Track {
            duration: 0,
            ..Track::default()
        };
        assert_eq!(track_duration(&live), "🔴 En vivo");
    }

    #[test]
    fn volume_bar_saturates() {
        assert_eq!(create_volume_bar(0), format!("`[{}]`", "▒".repeat(20)));
        assert_eq!(create_volume_bar(100), format!("`[{}{}]`", "█".repeat(10), "▒".repeat(10)));
        assert_eq!(create_volume_bar(1000), format!("`[{}]`", "█".repeat(20)));
    }
}
