//! # Cache Module
//!
//! Caching of resolved tracks.
//!
//! Re-resolving a queued track against an audio node costs one HTTP round
//! trip per play. The engine keeps the node's answer for each track key here
//! so replays, loops and "back" do not pay it again, and preloads the next
//! track of a queue while the current one is still playing.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_SIZE=256   # Maximum number of resolved tracks kept
//! CACHE_TTL=3600   # Time-to-live in seconds (1 hour)
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use std::time::Duration;
use tracing::info;

use crate::audio::node::LoadedTrack;

/// Tracks resueltos, indexados por la clave de búsqueda del track (URI o identificador)
pub type TrackCache = LRUCache<String, LoadedTrack>;

impl TrackCache {
    pub fn for_tracks(capacity: usize, ttl: Duration) -> Self {
        Self::with_ttl(capacity, ttl)
    }

    /// Limpia entradas expiradas; la llama la tarea de mantenimiento
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
