//! Playback continuation engine.
//!
//! Every decision about "what plays next" for a guild goes through
//! [`PlaybackEngine`]. Track ends, skips, "back", new requests and control
//! buttons all take the guild's lock from the [`PlaybackCoordinator`], read
//! the persisted queue, apply the queue rules and tell an audio node what to
//! play. Two triggers racing for the same guild therefore advance the queue
//! once.
//!
//! Each play carries a play id that the node echoes back in its events; an
//! end or skip that names an older play id is dropped.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::coordinator::{GuildSession, PlaybackCoordinator, PlayerStatus};
use crate::audio::equalizer::EqPreset;
use crate::audio::node::{
    AudioNode, LoadResult, LoadedTrack, NodeError, NodeEvent, PlayRequest, PlayerEvent,
    TrackEndReason,
};
use crate::audio::queue::{self, GuildQueueState, LoopMode, QueuePage, Track, EXHAUSTED};
use crate::audio::search::SearchResolver;
use crate::audio::voice::{VoiceConnection, VoiceGateway};
use crate::cache::TrackCache;
use crate::config::{Config, MAX_VOLUME};
use crate::nodes::NodeSelector;
use crate::retry::RetryPolicy;
use crate::storage::{GuildProp, QueueStore};

/// Eventos que mueven la cola de una guild
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    PlayRequested { query: String, requester: u64 },
    TrackEnded {
        reason: TrackEndReason,
        play_id: Option<u64>,
    },
    /// `play_id` es la reproducción que vio el usuario; `None` salta lo que esté sonando
    SkipRequested { play_id: Option<u64> },
    PreviousRequested,
    LoopToggled,
}

/// Lo que hizo el motor ante un evento o control
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Enqueued {
        first: Track,
        added: usize,
        /// Posición en la cola del primer track agregado
        position: usize,
        playlist: Option<String>,
        /// La reproducción empezó porque la guild estaba inactiva
        started: bool,
    },
    Playing { index: usize, track: Track },
    Exhausted,
    LoopChanged(LoopMode),
    Paused,
    Resumed,
    VolumeChanged(u16),
    Seeked(u64),
    Shuffled { tracks: usize },
    Removed(Track),
    Cleared(usize),
    EqualizerChanged(EqPreset),
    Disconnected,
    /// Evento obsoleto o propio; no cambió nada
    Ignored,
    NothingToSkip,
    NoPrevious,
    NothingPlaying,
    NotEnoughTracks,
    InvalidPosition,
    NoResults,
    QueueFull,
    /// Ningún nodo pudo atender la petición
    Unavailable,
    /// Fallaron demasiados tracks o no hay con qué seguir; la guild queda inactiva
    PlaybackFailed,
}

/// Foto de lo que suena en una guild, para los embeds
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: Track,
    pub index: usize,
    pub queue_len: usize,
    pub next: Option<Track>,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u16,
    pub paused: bool,
    pub eq_preset: EqPreset,
    pub play_id: Option<u64>,
}

/// Avisos del motor para los usuarios
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    TrackStarted(NowPlaying),
    TrackSkipped { track: Track, reason: String },
    QueueFinished,
    Disconnected { idle: bool },
}

#[async_trait]
pub trait PlaybackNotifier: Send + Sync {
    async fn notify(&self, guild_id: u64, channel_id: Option<u64>, notice: Notice);
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub search_prefixes: Vec<String>,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    /// Tracks fallidos seguidos que se saltan antes de rendirse
    pub max_auto_advance: u32,
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search_prefixes: config.search_prefixes.clone(),
            max_queue_size: config.max_queue_size,
            max_playlist_size: config.max_playlist_size,
            max_auto_advance: config.max_auto_advance,
            idle_timeout: config.idle_timeout(),
            retry: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
            cache_size: config.cache_size,
            cache_ttl: Duration::from_secs(config.cache_ttl),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Clone)]
pub struct PlaybackEngine {
    store: Arc<QueueStore>,
    coordinator: Arc<PlaybackCoordinator>,
    nodes: Arc<dyn NodeSelector>,
    gateway: Arc<dyn VoiceGateway>,
    notifier: Arc<dyn PlaybackNotifier>,
    resolver: SearchResolver,
    cache: TrackCache,
    settings: EngineSettings,
}

impl PlaybackEngine {
    pub fn new(
        store: Arc<QueueStore>,
        coordinator: Arc<PlaybackCoordinator>,
        nodes: Arc<dyn NodeSelector>,
        gateway: Arc<dyn VoiceGateway>,
        notifier: Arc<dyn PlaybackNotifier>,
        settings: EngineSettings,
    ) -> Self {
        let resolver = SearchResolver::new(settings.search_prefixes.clone(), settings.retry.clone());
        let cache = TrackCache::for_tracks(settings.cache_size, settings.cache_ttl);
        Self {
            store,
            coordinator,
            nodes,
            gateway,
            notifier,
            resolver,
            cache,
            settings,
        }
    }

    pub fn coordinator(&self) -> &Arc<PlaybackCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn cache(&self) -> &TrackCache {
        &self.cache
    }

    /// Aplica un evento bajo el lock de la guild
    pub async fn dispatch(&self, guild_id: u64, event: PlaybackEvent) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        debug!("🎛️ [{}] {:?}", guild_id, event);

        match event {
            PlaybackEvent::PlayRequested { query, requester } => {
                self.play_requested(guild_id, &query, requester).await
            }
            PlaybackEvent::TrackEnded { reason, play_id } => {
                self.track_ended(guild_id, reason, play_id).await
            }
            PlaybackEvent::SkipRequested { play_id } => self.skip_requested(guild_id, play_id).await,
            PlaybackEvent::PreviousRequested => self.previous_requested(guild_id).await,
            PlaybackEvent::LoopToggled => {
                let mode = self.store.get_guild(guild_id).loop_mode.next();
                self.store.set_guild_prop(guild_id, GuildProp::Loop(mode));
                info!("🔁 [{}] Loop: {}", guild_id, mode);
                Transition::LoopChanged(mode)
            }
        }
    }

    /// Encamina un evento que llega de un nodo
    pub async fn handle_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Player {
                node,
                guild_id,
                event,
            } => match event {
                PlayerEvent::TrackStart { play_id } => {
                    self.on_track_started(guild_id, play_id).await;
                }
                PlayerEvent::TrackEnd { play_id, reason } => {
                    self.dispatch(guild_id, PlaybackEvent::TrackEnded { reason, play_id })
                        .await;
                }
                PlayerEvent::TrackException { play_id, message } => {
                    warn!(
                        "⚠️ [{}] Excepción en {} (play {:?}): {}",
                        guild_id, node, play_id, message
                    );
                }
                PlayerEvent::TrackStuck {
                    play_id,
                    threshold_ms,
                } => {
                    warn!(
                        "🧊 [{}] Pista atascada {}ms en {}, avanzando",
                        guild_id, threshold_ms, node
                    );
                    let event = PlaybackEvent::TrackEnded {
                        reason: TrackEndReason::LoadFailed,
                        play_id,
                    };
                    self.dispatch(guild_id, event).await;
                }
                PlayerEvent::VoiceClosed { code, reason } => {
                    warn!(
                        "🔇 [{}] Voz cerrada en {} ({}): {}",
                        guild_id, node, code, reason
                    );
                }
            },
            NodeEvent::Ready { node, resumed } => {
                debug!("🔌 Nodo {} listo (resumed: {})", node, resumed);
            }
            NodeEvent::Disconnected { node } => {
                self.nodes.report_failure(&node);
                let moved = self.migrate_from(&node).await;
                if moved > 0 {
                    info!("🚚 {} guild(s) movidos fuera de {}", moved, node);
                }
            }
        }
    }

    /// Vuelve a lanzar en otro nodo el track actual de cada guild que sonaba
    /// en `node_id`. Retorna cuántas guilds se recuperaron.
    pub async fn migrate_from(&self, node_id: &str) -> usize {
        let mut moved = 0;
        for guild_id in self.coordinator.active_guilds_on(node_id) {
            let _guard = self.coordinator.lock(guild_id).await;
            let session = self.coordinator.session(guild_id);
            if session.status == PlayerStatus::Idle || session.node_id.as_deref() != Some(node_id) {
                continue;
            }
            let Some(index) = self.store.get_guild(guild_id).position() else {
                continue;
            };

            let replacement = self
                .nodes
                .select(None)
                .filter(|node| node.identifier() != node_id);
            if replacement.is_none() {
                warn!("❌ [{}] Sin nodo de reemplazo para {}", guild_id, node_id);
                self.go_idle(guild_id, false).await;
                continue;
            }

            if let Transition::Playing { .. } = self.start_at(guild_id, index, replacement).await {
                moved += 1;
            }
        }
        moved
    }

    pub async fn attach_voice(&self, guild_id: u64, voice: VoiceConnection) {
        let _guard = self.coordinator.lock(guild_id).await;
        self.coordinator
            .update_session(guild_id, |session| session.voice = Some(voice));
    }

    pub async fn pause(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        self.set_paused(guild_id, true).await
    }

    pub async fn resume(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        self.set_paused(guild_id, false).await
    }

    pub async fn toggle_pause(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let paused = self.coordinator.status(guild_id) == PlayerStatus::Paused;
        self.set_paused(guild_id, !paused).await
    }

    async fn set_paused(&self, guild_id: u64, paused: bool) -> Transition {
        let session = self.coordinator.session(guild_id);
        let wanted = if paused {
            PlayerStatus::Paused
        } else {
            PlayerStatus::Playing
        };
        let done = if paused {
            Transition::Paused
        } else {
            Transition::Resumed
        };

        match session.status {
            PlayerStatus::Idle => return Transition::NothingPlaying,
            status if status == wanted => return done,
            _ => {}
        }

        let Some(node) = self.current_node(&session) else {
            return Transition::Unavailable;
        };
        if let Err(e) = node.set_pause(guild_id, paused).await {
            warn!("⚠️ [{}] No se pudo cambiar pausa: {}", guild_id, e);
            return Transition::Unavailable;
        }
        self.coordinator
            .update_session(guild_id, |session| session.status = wanted);
        done
    }

    /// Guarda el volumen (acotado a 0..=1000) y lo aplica en vivo
    pub async fn set_volume(&self, guild_id: u64, volume: u16) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        self.apply_volume(guild_id, volume.min(MAX_VOLUME)).await
    }

    pub async fn adjust_volume(&self, guild_id: u64, delta: i32) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let current = i32::from(self.store.get_guild(guild_id).volume);
        let volume = (current + delta).clamp(0, i32::from(MAX_VOLUME));
        self.apply_volume(guild_id, volume as u16).await
    }

    async fn apply_volume(&self, guild_id: u64, volume: u16) -> Transition {
        self.store.set_guild_prop(guild_id, GuildProp::Volume(volume));

        let session = self.coordinator.session(guild_id);
        if session.status != PlayerStatus::Idle {
            if let Some(node) = self.current_node(&session) {
                if let Err(e) = node.set_volume(guild_id, volume).await {
                    warn!("⚠️ [{}] Volumen guardado pero no aplicado: {}", guild_id, e);
                }
            }
        }
        info!("🔊 [{}] Volumen: {}%", guild_id, volume);
        Transition::VolumeChanged(volume)
    }

    pub async fn seek(&self, guild_id: u64, position_ms: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let session = self.coordinator.session(guild_id);
        if session.status == PlayerStatus::Idle {
            return Transition::NothingPlaying;
        }
        let Some(track) = self.store.current_track(guild_id) else {
            return Transition::NothingPlaying;
        };
        if track.duration > 0 && position_ms >= track.duration {
            return Transition::InvalidPosition;
        }

        let Some(node) = self.current_node(&session) else {
            return Transition::Unavailable;
        };
        match node.seek(guild_id, position_ms).await {
            Ok(()) => Transition::Seeked(position_ms),
            Err(e) => {
                warn!("⚠️ [{}] Seek falló: {}", guild_id, e);
                Transition::Unavailable
            }
        }
    }

    pub async fn restart(&self, guild_id: u64) -> Transition {
        self.seek(guild_id, 0).await
    }

    /// Mezcla la cola con el track actual primero y activa el flag de shuffle,
    /// así las playlists que lleguen después también se mezclan
    pub async fn shuffle(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let state = self.store.get_guild(guild_id);
        if state.queue.len() < 2 {
            return Transition::NotEnoughTracks;
        }

        let (tracks, index) = queue::shuffle_keeping_current(&state, &mut rand::thread_rng());
        let count = tracks.len();
        self.store.update(guild_id, |state| {
            state.queue = tracks;
            state.index = index;
            state.shuffle = true;
        });
        info!("🔀 [{}] Cola mezclada ({} pistas)", guild_id, count);
        Transition::Shuffled { tracks: count }
    }

    /// Elimina el track en `position` (desde 0).
    ///
    /// Si era el que sonaba, reproduce el que ocupó su lugar. Si era el
    /// último, el loop de cola vuelve al inicio y en otro caso queda inactivo
    /// sin marcar la cola como terminada.
    pub async fn remove(&self, guild_id: u64, position: usize) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let before = self.store.get_guild(guild_id);
        let playing = self.coordinator.status(guild_id) != PlayerStatus::Idle
            && before.position() == Some(position);

        let Some(removed) = self.store.remove_at(guild_id, position) else {
            return Transition::InvalidPosition;
        };
        info!("➖ [{}] Eliminada '{}'", guild_id, removed.title);

        if playing {
            let remaining = before.queue.len() - 1;
            if position < remaining {
                self.start_at(guild_id, position, None).await;
            } else if before.loop_mode == LoopMode::Queue && remaining > 0 {
                self.start_at(guild_id, 0, None).await;
            } else {
                self.go_idle(guild_id, false).await;
            }
        }
        Transition::Removed(removed)
    }

    /// Vacía la cola pero conserva el loop y el volumen
    pub async fn clear_queue(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let removed = self.store.update(guild_id, |state| {
            let removed = state.queue.len();
            state.queue.clear();
            state.index = 0;
            state.shuffle = false;
            removed
        });
        if self.coordinator.status(guild_id) != PlayerStatus::Idle {
            self.go_idle(guild_id, false).await;
        }
        info!("🗑️ [{}] Cola vaciada ({} pistas)", guild_id, removed);
        Transition::Cleared(removed)
    }

    /// Destruye el player, sale de voz y olvida la cola de la guild
    pub async fn disconnect(&self, guild_id: u64) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        self.teardown(guild_id, false).await;
        Transition::Disconnected
    }

    pub async fn set_equalizer(&self, guild_id: u64, preset: EqPreset) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        self.coordinator.set_eq_preset(guild_id, preset);

        let session = self.coordinator.session(guild_id);
        if session.status != PlayerStatus::Idle {
            if let Some(node) = self.current_node(&session) {
                if let Err(e) = node.set_equalizer(guild_id, preset.bands()).await {
                    warn!("⚠️ [{}] Ecualizador no aplicado: {}", guild_id, e);
                }
            }
        }
        info!("🎚️ [{}] Ecualizador: {}", guild_id, preset);
        Transition::EqualizerChanged(preset)
    }

    /// El nodo confirmó el inicio: se anuncia y se precarga el siguiente
    pub async fn on_track_started(&self, guild_id: u64, play_id: Option<u64>) -> Transition {
        let _guard = self.coordinator.lock(guild_id).await;
        let session = self.coordinator.session(guild_id);
        if session.status == PlayerStatus::Idle
            || (play_id.is_some() && play_id != session.now_playing)
        {
            debug!("🗑️ [{}] TrackStart obsoleto ({:?})", guild_id, play_id);
            return Transition::Ignored;
        }

        let state = self.store.get_guild(guild_id);
        let Some(now) = self.snapshot(guild_id, &state, &session) else {
            return Transition::Ignored;
        };
        self.notifier
            .notify(guild_id, session.text_channel, Notice::TrackStarted(now.clone()))
            .await;
        self.preload_next(guild_id, &state, &session);
        Transition::Playing {
            index: now.index,
            track: now.track,
        }
    }

    pub fn now_playing(&self, guild_id: u64) -> Option<NowPlaying> {
        let session = self.coordinator.session(guild_id);
        if session.status == PlayerStatus::Idle {
            return None;
        }
        let state = self.store.get_guild(guild_id);
        self.snapshot(guild_id, &state, &session)
    }

    pub fn queue_state(&self, guild_id: u64) -> GuildQueueState {
        self.store.get_guild(guild_id)
    }

    /// Página desde 1; `None` muestra la del track actual
    pub fn queue_page(&self, guild_id: u64, page: Option<usize>) -> QueuePage {
        let state = self.store.get_guild(guild_id);
        let page = page.unwrap_or_else(|| state.current_page());
        state.page(page)
    }

    pub fn current_play_id(&self, guild_id: u64) -> Option<u64> {
        self.coordinator.session(guild_id).now_playing
    }

    pub fn status(&self, guild_id: u64) -> PlayerStatus {
        self.coordinator.status(guild_id)
    }

    async fn play_requested(&self, guild_id: u64, query: &str, requester: u64) -> Transition {
        let state = self.store.get_guild(guild_id);
        let room = self
            .settings
            .max_queue_size
            .saturating_sub(state.queue.len());
        if room == 0 {
            return Transition::QueueFull;
        }

        let Some((node, result)) = self.search(guild_id, query).await else {
            return Transition::Unavailable;
        };

        let (loaded, playlist) = match result {
            LoadResult::Track(track) => (vec![track], None),
            LoadResult::Search(tracks) => (tracks.into_iter().take(1).collect(), None),
            LoadResult::Playlist { name, tracks } => (tracks, Some(name)),
            LoadResult::Empty | LoadResult::Error(_) => (Vec::new(), None),
        };

        let limit = room.min(self.settings.max_playlist_size);
        let mut tracks: Vec<Track> = Vec::with_capacity(loaded.len().min(limit));
        for item in loaded.into_iter().take(limit) {
            let track = item.to_track(requester);
            self.cache.insert(track.lookup_key().to_string(), item);
            tracks.push(track);
        }
        if playlist.is_some() && state.shuffle {
            tracks.shuffle(&mut rand::thread_rng());
        }

        let Some(first) = tracks.first().cloned() else {
            info!("🔍 [{}] Sin resultados para '{}'", guild_id, query);
            return Transition::NoResults;
        };
        let added = tracks.len();
        let position = self.store.extend_tracks(guild_id, tracks);
        info!(
            "➕ [{}] {} pista(s) añadidas desde la posición {}",
            guild_id, added, position
        );

        let started = self.coordinator.status(guild_id) == PlayerStatus::Idle
            && matches!(
                self.start_at(guild_id, position, Some(node)).await,
                Transition::Playing { .. }
            );

        Transition::Enqueued {
            first,
            added,
            position,
            playlist,
            started,
        }
    }

    /// Resuelve `query`, cambiando de nodo si uno no responde
    async fn search(
        &self,
        guild_id: u64,
        query: &str,
    ) -> Option<(Arc<dyn AudioNode>, LoadResult)> {
        let session = self.coordinator.session(guild_id);
        let mut node = self.nodes.select(session.node_id.as_deref())?;

        for _ in 0..=self.settings.max_auto_advance {
            match self.resolver.resolve(node.as_ref(), query).await {
                Ok(result) => return Some((node, result)),
                Err(e) => {
                    let failed = node.identifier();
                    warn!("⚠️ [{}] Búsqueda falló en {}: {}", guild_id, failed, e);
                    self.nodes.report_failure(&failed);
                    node = self
                        .nodes
                        .select(None)
                        .filter(|next| next.identifier() != failed)?;
                }
            }
        }
        None
    }

    async fn track_ended(
        &self,
        guild_id: u64,
        reason: TrackEndReason,
        play_id: Option<u64>,
    ) -> Transition {
        if reason.is_ours() {
            return Transition::Ignored;
        }

        let session = self.coordinator.session(guild_id);
        if session.status == PlayerStatus::Idle
            || (play_id.is_some() && play_id != session.now_playing)
        {
            debug!("🗑️ [{}] Fin de pista obsoleto ({:?})", guild_id, play_id);
            return Transition::Ignored;
        }

        let state = self.store.get_guild(guild_id);
        let failed = reason == TrackEndReason::LoadFailed;
        let target = if failed {
            if let Some(track) = state.current() {
                self.notify(
                    guild_id,
                    session.text_channel,
                    Notice::TrackSkipped {
                        track: track.clone(),
                        reason: "playback failed".to_string(),
                    },
                )
                .await;
            }
            queue::skip_target(&state)
        } else {
            queue::ended_target(&state)
        };

        // -1 solo cuando la cola terminó sola y sin loop
        match target {
            Some(index) => self.start_at(guild_id, index, None).await,
            None if !failed && state.loop_mode == LoopMode::Off => {
                self.go_idle(guild_id, true).await;
                Transition::Exhausted
            }
            None => {
                warn!("⚠️ [{}] Sin pista para continuar tras un fallo", guild_id);
                self.go_idle(guild_id, false).await;
                Transition::PlaybackFailed
            }
        }
    }

    async fn skip_requested(&self, guild_id: u64, play_id: Option<u64>) -> Transition {
        let session = self.coordinator.session(guild_id);
        if session.status == PlayerStatus::Idle {
            return Transition::NothingPlaying;
        }
        if play_id.is_some() && play_id != session.now_playing {
            debug!("🗑️ [{}] Skip obsoleto ({:?})", guild_id, play_id);
            return Transition::Ignored;
        }

        match queue::skip_target(&self.store.get_guild(guild_id)) {
            Some(index) => self.start_at(guild_id, index, None).await,
            None => Transition::NothingToSkip,
        }
    }

    async fn previous_requested(&self, guild_id: u64) -> Transition {
        match queue::previous_target(&self.store.get_guild(guild_id)) {
            Some(index) => self.start_at(guild_id, index, None).await,
            None => Transition::NoPrevious,
        }
    }

    /// Reproduce el track en `index`, saltando tracks rotos y nodos caídos.
    /// Se rinde tras `max_auto_advance` intentos extra.
    async fn start_at(
        &self,
        guild_id: u64,
        index: usize,
        node: Option<Arc<dyn AudioNode>>,
    ) -> Transition {
        let mut index = index;
        let mut node = node.or_else(|| self.pick_node(guild_id));
        let mut failures = 0u32;

        loop {
            let Some(current) = node.clone() else {
                warn!("❌ [{}] No hay nodos disponibles", guild_id);
                self.go_idle(guild_id, false).await;
                return Transition::Unavailable;
            };

            self.store.set_index(guild_id, index as i64);
            let state = self.store.get_guild(guild_id);
            let Some(track) = state.current().cloned() else {
                if state.loop_mode == LoopMode::Off {
                    self.go_idle(guild_id, true).await;
                    return Transition::Exhausted;
                }
                self.go_idle(guild_id, false).await;
                return Transition::PlaybackFailed;
            };

            let error = match self.issue_play(guild_id, &current, &track, state.volume).await {
                Ok(play_id) => {
                    info!(
                        "▶️ [{}] '{}' (posición {}, play {})",
                        guild_id, track.title, index, play_id
                    );
                    return Transition::Playing { index, track };
                }
                Err(e) => e,
            };

            failures += 1;
            if failures > self.settings.max_auto_advance {
                error!(
                    "❌ [{}] Demasiados fallos seguidos, deteniendo: {}",
                    guild_id, error
                );
                self.go_idle(guild_id, false).await;
                return Transition::PlaybackFailed;
            }

            if error.is_transport() {
                let failed = current.identifier();
                warn!(
                    "🔌 [{}] Nodo {} no responde ({}), cambiando de nodo",
                    guild_id, failed, error
                );
                self.nodes.report_failure(&failed);
                node = self.nodes.select(None);
                continue;
            }

            warn!("⏭️ [{}] No se pudo reproducir '{}': {}", guild_id, track.title, error);
            let channel = self.coordinator.session(guild_id).text_channel;
            self.notify(
                guild_id,
                channel,
                Notice::TrackSkipped {
                    track,
                    reason: error.to_string(),
                },
            )
            .await;

            match queue::skip_target(&state) {
                Some(next) if next != index => index = next,
                _ => {
                    self.go_idle(guild_id, false).await;
                    return Transition::PlaybackFailed;
                }
            }
        }
    }

    async fn issue_play(
        &self,
        guild_id: u64,
        node: &Arc<dyn AudioNode>,
        track: &Track,
        volume: u16,
    ) -> Result<u64, NodeError> {
        let loaded = self.resolve_track(node.as_ref(), track).await?;
        let play_id = self.coordinator.next_play_id();
        let request = PlayRequest {
            encoded: loaded.encoded,
            play_id,
            volume,
            position_ms: 0,
            voice: self.coordinator.session(guild_id).voice,
            equalizer: self.coordinator.preferences(guild_id).eq_preset.bands(),
        };

        if let Err(e) = node.play(guild_id, request).await {
            if !e.is_transport() {
                self.cache.remove(&track.lookup_key().to_string());
            }
            return Err(e);
        }

        let node_id = node.identifier();
        self.coordinator.update_session(guild_id, |session| {
            session.status = PlayerStatus::Playing;
            session.node_id = Some(node_id);
            session.now_playing = Some(play_id);
        });
        Ok(play_id)
    }

    /// Forma reproducible de un track de la cola, del caché si se puede
    async fn resolve_track(
        &self,
        node: &dyn AudioNode,
        track: &Track,
    ) -> Result<LoadedTrack, NodeError> {
        let key = track.lookup_key().to_string();
        if key.is_empty() {
            return Err(NodeError::LoadFailed(format!("'{}' has no URI", track.title)));
        }
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let result = self
            .settings
            .retry
            .run("resolución de pista", || node.load_tracks(&key))
            .await?;
        let loaded = match result {
            LoadResult::Error(message) => return Err(NodeError::LoadFailed(message)),
            other => other.first().cloned(),
        }
        .ok_or_else(|| NodeError::LoadFailed(format!("nothing found for {key}")))?;

        self.cache.insert(key, loaded.clone());
        Ok(loaded)
    }

    /// Marca la guild inactiva y arma el temporizador de desconexión.
    /// `exhausted` indica que la cola terminó sin loop, y el índice pasa a -1.
    async fn go_idle(&self, guild_id: u64, exhausted: bool) {
        let session = self.coordinator.session(guild_id);
        if !exhausted && session.status != PlayerStatus::Idle {
            if let Some(node) = self.current_node(&session) {
                if let Err(e) = node.stop(guild_id).await {
                    debug!("[{}] stop falló: {}", guild_id, e);
                }
            }
        }
        if exhausted {
            self.store.set_index(guild_id, EXHAUSTED);
        }

        let generation = self.coordinator.update_session(guild_id, |session| {
            session.status = PlayerStatus::Idle;
            session.now_playing = None;
            session.generation
        });
        if exhausted {
            info!("🏁 [{}] Cola terminada", guild_id);
            self.notify(guild_id, session.text_channel, Notice::QueueFinished)
                .await;
        }
        self.schedule_idle_disconnect(guild_id, generation);
    }

    fn schedule_idle_disconnect(&self, guild_id: u64, generation: u64) {
        let engine = self.clone();
        let delay = self.settings.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _guard = engine.coordinator.lock(guild_id).await;
            let session = engine.coordinator.session(guild_id);
            if session.status == PlayerStatus::Idle && session.generation == generation {
                info!(
                    "💤 [{}] Inactivo {}, desconectando",
                    guild_id,
                    humantime::format_duration(delay)
                );
                engine.teardown(guild_id, true).await;
            }
        });
    }

    async fn teardown(&self, guild_id: u64, idle: bool) {
        let session = self.coordinator.session(guild_id);
        if let Some(node) = self.current_node(&session) {
            if let Err(e) = node.destroy(guild_id).await {
                warn!("⚠️ [{}] No se pudo destruir el player: {}", guild_id, e);
            }
        }
        if let Err(e) = self.gateway.leave(guild_id).await {
            warn!("⚠️ [{}] No se pudo salir del canal de voz: {}", guild_id, e);
        }
        self.store.clear_guild(guild_id);
        self.coordinator.reset(guild_id);
        self.notify(guild_id, session.text_channel, Notice::Disconnected { idle })
            .await;
        info!("👋 [{}] Desconectado", guild_id);
    }

    fn preload_next(&self, guild_id: u64, state: &GuildQueueState, session: &GuildSession) {
        let Some(next) = queue::ended_target(state).filter(|&i| Some(i) != state.position()) else {
            return;
        };
        let track = state.queue[next].clone();
        if self.cache.contains(&track.lookup_key().to_string()) {
            return;
        }
        let Some(node) = self.nodes.select(session.node_id.as_deref()) else {
            return;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.resolve_track(node.as_ref(), &track).await {
                Ok(_) => debug!("⚡ [{}] Precargada '{}'", guild_id, track.title),
                Err(e) => debug!("[{}] Precarga de '{}' falló: {}", guild_id, track.title, e),
            }
        });
    }

    fn snapshot(
        &self,
        guild_id: u64,
        state: &GuildQueueState,
        session: &GuildSession,
    ) -> Option<NowPlaying> {
        let index = state.position()?;
        let next = queue::ended_target(state)
            .filter(|&i| i != index)
            .map(|i| state.queue[i].clone());
        Some(NowPlaying {
            track: state.queue[index].clone(),
            index,
            queue_len: state.queue.len(),
            next,
            loop_mode: state.loop_mode,
            shuffle: state.shuffle,
            volume: state.volume,
            paused: session.status == PlayerStatus::Paused,
            eq_preset: self.coordinator.preferences(guild_id).eq_preset,
            play_id: session.now_playing,
        })
    }

    fn pick_node(&self, guild_id: u64) -> Option<Arc<dyn AudioNode>> {
        let session = self.coordinator.session(guild_id);
        self.nodes.select(session.node_id.as_deref())
    }

    fn current_node(&self, session: &GuildSession) -> Option<Arc<dyn AudioNode>> {
        session
            .node_id
            .as_deref()
            .and_then(|id| self.nodes.get(id))
    }

    async fn notify(&self, guild_id: u64, channel_id: Option<u64>, notice: Notice) {
        self.notifier.notify(guild_id, channel_id, notice).await;
    }
}
