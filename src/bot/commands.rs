use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::equalizer::EqPreset;
use crate::config::MAX_VOLUME;

/// Todos los comandos slash del bot
pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        back_command(),
        stop_command(),
        seek_command(),
        queue_command(),
        nowplaying_command(),
        loop_command(),
        shuffle_command(),
        remove_command(),
        clearqueue_command(),
        volume_command(),
        equalizer_command(),
        nodes_command(),
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
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción")
}

fn back_command() -> CreateCommand {
    CreateCommand::new("back").description("Vuelve a la canción anterior")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción, borra la cola y desconecta")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Salta a una posición de la canción actual")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "seconds", "Segundos desde el inicio")
                .min_int_value(0)
                .required(true),
        )
}

// Comandos de cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola de reproducción")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página")
                .min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra la canción actual")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop").description("Cambia la repetición: desactivada → canción → cola")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola manteniendo la canción actual")
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita una canción de la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "position",
                "Posición en la cola (1 = primera)",
            )
            .min_int_value(1)
            .required(true),
        )
}

fn clearqueue_command() -> CreateCommand {
    CreateCommand::new("clearqueue").description("Vacía la cola sin desconectar")
}

// Comandos de audio

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta o muestra el volumen")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Nivel de volumen")
                .min_int_value(0)
                .max_int_value(u64::from(MAX_VOLUME)),
        )
}

fn equalizer_command() -> CreateCommand {
    let mut preset = CreateCommandOption::new(
        CommandOptionType::String,
        "preset",
        "Preset de ecualizador",
    )
    .required(true);
    for eq in EqPreset::ALL {
        preset = preset.add_string_choice(eq.name(), eq.name());
    }

    CreateCommand::new("equalizer")
        .description("Aplica un preset de ecualizador")
        .add_option(preset)
}

// Comandos de información

fn nodes_command() -> CreateCommand {
    CreateCommand::new("nodes").description("Estado de los nodos de audio")
}

fn help_command() -> CreateCommand {
    CreateCommand::new("help").description("Muestra los comandos disponibles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_command() {
        assert_eq!(all_commands().len(), 17);
    }
}
