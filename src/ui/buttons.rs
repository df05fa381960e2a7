use serenity::{
    all::ButtonStyle,
    builder::{CreateActionRow, CreateButton},
};

use crate::audio::engine::NowPlaying;
use crate::audio::queue::LoopMode;

/// Cambio de volumen de los botones Vol-/Vol+
pub const VOLUME_STEP: i32 = 10;

/// IDs personalizados para los botones
pub mod button_ids {
    pub const PLAY_PAUSE: &str = "akio_play_pause";
    pub const SKIP: &str = "akio_skip";
    pub const BACK: &str = "akio_back";
    pub const VOLUME_DOWN: &str = "akio_volume_down";
    pub const VOLUME_UP: &str = "akio_volume_up";
    pub const STOP: &str = "akio_stop";
    pub const LOOP: &str = "akio_loop";
    pub const RESTART: &str = "akio_restart";
    pub const SHUFFLE: &str = "akio_shuffle";
    pub const QUEUE: &str = "akio_queue";
}

/// Botón de control del reproductor.
///
/// Los custom ids llevan el play id del mensaje al que pertenecen
/// (`akio_skip:42`), así un botón de un mensaje viejo no salta el track que
/// lo reemplazó.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    TogglePause,
    Skip,
    Back,
    VolumeDown,
    VolumeUp,
    Stop,
    Loop,
    Restart,
    Shuffle,
    Queue,
}

impl ControlAction {
    pub const ALL: [ControlAction; 10] = [
        ControlAction::TogglePause,
        ControlAction::Skip,
        ControlAction::Back,
        ControlAction::VolumeDown,
        ControlAction::VolumeUp,
        ControlAction::Stop,
        ControlAction::Loop,
        ControlAction::Restart,
        ControlAction::Shuffle,
        ControlAction::Queue,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::TogglePause => button_ids::PLAY_PAUSE,
            Self::Skip => button_ids::SKIP,
            Self::Back => button_ids::BACK,
            Self::VolumeDown => button_ids::VOLUME_DOWN,
            Self::VolumeUp => button_ids::VOLUME_UP,
            Self::Stop => button_ids::STOP,
            Self::Loop => button_ids::LOOP,
            Self::Restart => button_ids::RESTART,
            Self::Shuffle => button_ids::SHUFFLE,
            Self::Queue => button_ids::QUEUE,
        }
    }

    pub fn custom_id(self, play_id: Option<u64>) -> String {
        match play_id {
            Some(id) => format!("{}:{}", self.id(), id),
            None => self.id().to_string(),
        }
    }

    pub fn parse(custom_id: &str) -> Option<(Self, Option<u64>)> {
        let (name, play_id) = match custom_id.split_once(':') {
            Some((name, id)) => (name, Some(id.parse().ok()?)),
            None => (custom_id, None),
        };
        Self::ALL
            .into_iter()
            .find(|action| action.id() == name)
            .map(|action| (action, play_id))
    }
}

fn button(action: ControlAction, play_id: Option<u64>, emoji: char) -> CreateButton {
    CreateButton::new(action.custom_id(play_id))
        .emoji(emoji)
        .style(ButtonStyle::Secondary)
}

/// Crea los controles del mensaje "reproduciendo ahora"
pub fn create_player_buttons(now: &NowPlaying) -> Vec<CreateActionRow> {
    let id = now.play_id;

    let (pause_emoji, pause_style) = if now.paused {
        ('▶', ButtonStyle::Success)
    } else {
        ('⏸', ButtonStyle::Primary)
    };
    let (loop_emoji, loop_style) = match now.loop_mode {
        LoopMode::Off => ('🔁', ButtonStyle::Secondary),
        LoopMode::Track => ('🔂', ButtonStyle::Success),
        LoopMode::Queue => ('🔁', ButtonStyle::Success),
    };
    let shuffle_style = if now.shuffle {
        ButtonStyle::Success
    } else {
        ButtonStyle::Secondary
    };

    let controls = CreateActionRow::Buttons(vec![
        button(ControlAction::Back, id, '⏮'),
        button(ControlAction::TogglePause, id, pause_emoji).style(pause_style),
        button(ControlAction::Skip, id, '⏭'),
        button(ControlAction::Stop, id, '⏹').style(ButtonStyle::Danger),
        button(ControlAction::Loop, id, loop_emoji).style(loop_style),
    ]);

    let extras = CreateActionRow::Buttons(vec![
        button(ControlAction::VolumeDown, id, '🔉'),
        button(ControlAction::VolumeUp, id, '🔊'),
        button(ControlAction::Restart, id, '⏪'),
        button(ControlAction::Shuffle, id, '🔀').style(shuffle_style),
        button(ControlAction::Queue, id, '📜'),
    ]);

    vec![controls, extras]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::equalizer::EqPreset;
    use crate::audio::queue::Track;
    use pretty_assertions::assert_eq;

    #[test]
    fn custom_ids_carry_the_play_id() {
        assert_eq!(ControlAction::Skip.custom_id(Some(42)), "akio_skip:42");
        assert_eq!(
            ControlAction::parse("akio_skip:42"),
            Some((ControlAction::Skip, Some(42)))
        );
        assert_eq!(
            ControlAction::parse("akio_queue"),
            Some((ControlAction::Queue, None))
        );
    }

    #[test]
    fn rejects_foreign_ids() {
        assert_eq!(ControlAction::parse("music_skip"), None);
        assert_eq!(ControlAction::parse("akio_skip:abc"), None);
        assert_eq!(ControlAction::parse(""), None);
    }

    #[test]
    fn every_action_parses_back() {
        for action in ControlAction::ALL {
            assert_eq!(
                ControlAction::parse(&action.custom_id(Some(7))),
                Some((action, Some(7)))
            );
        }
    }

    #[test]
    fn player_has_two_rows() {
        let now = NowPlaying {
            track: Track::default(),
            index: 0,
            queue_len: 1,
            next: None,
            loop_mode: LoopMode::Track,
            shuffle: false,
            volume: 70,
            paused: true,
            eq_preset: EqPreset::Flat,
            play_id: Some(3),
        };
        assert_eq!(create_player_buttons(&now).len(), 2);
    }
}
