use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::audio::equalizer::EqPreset;
use crate::audio::voice::VoiceConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerStatus {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Preferencias por guild que no forman parte de la cola persistida
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    pub eq_preset: EqPreset,
}

/// Estado de reproducción en memoria de una guild
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuildSession {
    pub status: PlayerStatus,
    /// Nodo que tiene el player de esta guild
    pub node_id: Option<String>,
    pub voice: Option<VoiceConnection>,
    pub text_channel: Option<u64>,
    /// Play id del último track enviado al nodo
    pub now_playing: Option<u64>,
    /// Sube con cada cambio de estado; un temporizador de inactividad solo
    /// actúa si todavía ve el valor con el que empezó
    pub generation: u64,
}

/// Dueño de todos los mapas por guild que necesita el motor.
///
/// Hay una sola instancia por proceso, compartida por el motor y los handlers.
pub struct PlaybackCoordinator {
    locks: DashMap<u64, Arc<Mutex<()>>>,
    preferences: DashMap<u64, Preferences>,
    sessions: DashMap<u64, GuildSession>,
    default_preset: EqPreset,
    play_ids: AtomicU64,
}

impl PlaybackCoordinator {
    pub fn new(default_preset: EqPreset) -> Self {
        Self {
            locks: DashMap::new(),
            preferences: DashMap::new(),
            sessions: DashMap::new(),
            default_preset,
            play_ids: AtomicU64::new(1),
        }
    }

    /// Serializa "decidir → resolver → reproducir" en una guild
    pub async fn lock(&self, guild_id: u64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn next_play_id(&self) -> u64 {
        self.play_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn preferences(&self, guild_id: u64) -> Preferences {
        self.preferences
            .get(&guild_id)
            .map(|p| *p)
            .unwrap_or(Preferences {
                eq_preset: self.default_preset,
            })
    }

    pub fn set_eq_preset(&self, guild_id: u64, preset: EqPreset) {
        self.preferences
            .entry(guild_id)
            .or_insert(Preferences {
                eq_preset: self.default_preset,
            })
            .eq_preset = preset;
    }

    pub fn session(&self, guild_id: u64) -> GuildSession {
        self.sessions
            .get(&guild_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Modifica la sesión de la guild y sube su generación
    pub fn update_session<R>(&self, guild_id: u64, f: impl FnOnce(&mut GuildSession) -> R) -> R {
        let mut session = self.sessions.entry(guild_id).or_default();
        session.generation += 1;
        f(&mut session)
    }

    pub fn set_text_channel(&self, guild_id: u64, channel_id: u64) {
        self.sessions.entry(guild_id).or_default().text_channel = Some(channel_id);
    }

    pub fn status(&self, guild_id: u64) -> PlayerStatus {
        self.sessions
            .get(&guild_id)
            .map_or(PlayerStatus::Idle, |s| s.status)
    }

    /// Guilds activas cuyo player está en `node_id`
    pub fn active_guilds_on(&self, node_id: &str) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|s| s.status != PlayerStatus::Idle && s.node_id.as_deref() == Some(node_id))
            .map(|s| *s.key())
            .collect()
    }

    pub fn active_guilds(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.status != PlayerStatus::Idle)
            .count()
    }

    /// Olvida todo de la guild salvo su lock y su generación
    pub fn reset(&self, guild_id: u64) {
        if let Some(mut session) = self.sessions.get_mut(&guild_id) {
            let generation = session.generation + 1;
            *session = GuildSession {
                generation,
                ..GuildSession::default()
            };
        }
        self.preferences.remove(&guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preferences_default_and_reset() {
        let coordinator = PlaybackCoordinator::new(EqPreset::BassBoost);
        assert_eq!(coordinator.preferences(1).eq_preset, EqPreset::BassBoost);

        coordinator.set_eq_preset(1, EqPreset::VocalBoost);
        assert_eq!(coordinator.preferences(1).eq_preset, EqPreset::VocalBoost);
        assert_eq!(coordinator.preferences(2).eq_preset, EqPreset::BassBoost);

        coordinator.reset(1);
        assert_eq!(coordinator.preferences(1).eq_preset, EqPreset::BassBoost);
    }

    #[test]
    fn reset_keeps_generation_moving() {
        let coordinator = PlaybackCoordinator::new(EqPreset::Flat);
        coordinator.update_session(1, |s| {
            s.status = PlayerStatus::Playing;
            s.text_channel = Some(5);
        });
        coordinator.reset(1);

        let session = coordinator.session(1);
        assert_eq!(session.status, PlayerStatus::Idle);
        assert_eq!(session.text_channel, None);
        assert_eq!(session.generation, 2);
    }

    #[test]
    fn session_updates_bump_generation() {
        let coordinator = PlaybackCoordinator::new(EqPreset::Flat);
        coordinator.update_session(1, |s| s.status = PlayerStatus::Playing);
        coordinator.update_session(1, |s| s.node_id = Some("a".into()));

        let session = coordinator.session(1);
        assert_eq!(session.generation, 2);
        assert_eq!(coordinator.active_guilds_on("a"), vec![1]);
        assert!(coordinator.active_guilds_on("b").is_empty());
    }

    #[tokio::test]
    async fn guild_lock_serializes_callers() {
        let coordinator = Arc::new(PlaybackCoordinator::new(EqPreset::Flat));
        let guard = coordinator.lock(7).await;

        let other = coordinator.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock(7).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // otro guild no espera
        let _unrelated = coordinator.lock(8).await;

        drop(guard);
        waiter.await.unwrap();
    }
}
