use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::audio::queue::{GuildQueueState, LoopMode, Track};

type Document = BTreeMap<String, GuildQueueState>;

/// Cambios de un solo campo para [`QueueStore::set_guild_prop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuildProp {
    Loop(LoopMode),
    Volume(u16),
    Shuffle(bool),
    Index(i64),
}

/// Almacenamiento de colas en un único documento JSON indexado por guild.
///
/// Cada operación lee el archivo completo, cambia la entrada de una guild y
/// reescribe todo bajo un lock global. La escritura va a un archivo temporal
/// en el mismo directorio que luego se renombra sobre el original, así un
/// fallo nunca deja un documento a medias. Un archivo ausente o corrupto se
/// lee como almacenamiento vacío.
pub struct QueueStore {
    path: PathBuf,
    default_volume: u16,
    lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>, default_volume: u16) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }

        let store = Self {
            path,
            default_volume,
            lock: Mutex::new(()),
        };

        if !store.path.exists() {
            store.write(&Document::new());
        }

        info!("📁 Cola persistente en: {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Document {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Document::new(),
            Err(e) => {
                warn!("⚠️ No se pudo leer {}: {}", self.path.display(), e);
                return Document::new();
            }
        };

        if raw.trim().is_empty() {
            return Document::new();
        }

        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "⚠️ Archivo de cola corrupto ({}), se usa un estado vacío: {}",
                    self.path.display(),
                    e
                );
                Document::new()
            }
        }
    }

    fn write(&self, doc: &Document) {
        if let Err(e) = self.try_write(doc) {
            error!("❌ Error guardando {}: {:#}", self.path.display(), e);
        }
    }

    fn try_write(&self, doc: &Document) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let json = serde_json::to_string_pretty(doc)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    /// Lectura-modificación-escritura atómica del estado de una guild.
    ///
    /// Si no existe se crea con valores por defecto; siempre se persiste.
    pub fn update<R>(&self, guild_id: u64, f: impl FnOnce(&mut GuildQueueState) -> R) -> R {
        let _guard = self.lock.lock();
        let mut doc = self.read();
        let state = doc
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildQueueState::with_volume(self.default_volume));
        let result = f(state);
        self.write(&doc);
        result
    }

    /// Obtiene el estado de la guild, creándolo con valores por defecto si falta
    pub fn get_guild(&self, guild_id: u64) -> GuildQueueState {
        let _guard = self.lock.lock();
        let mut doc = self.read();
        let key = guild_id.to_string();
        if let Some(state) = doc.get(&key) {
            return state.clone();
        }

        let state = GuildQueueState::with_volume(self.default_volume);
        doc.insert(key, state.clone());
        self.write(&doc);
        debug!("📝 Estado por defecto creado para guild {}", guild_id);
        state
    }

    pub fn get_queue(&self, guild_id: u64) -> Vec<Track> {
        self.get_guild(guild_id).queue
    }

    pub fn get_index(&self, guild_id: u64) -> i64 {
        self.get_guild(guild_id).index
    }

    /// Agrega un track a la cola y retorna su posición
    pub fn append_track(&self, guild_id: u64, track: Track) -> usize {
        self.update(guild_id, |state| {
            state.queue.push(track);
            state.queue.len() - 1
        })
    }

    /// Agrega tracks en orden y retorna la posición del primero
    pub fn extend_tracks(&self, guild_id: u64, tracks: Vec<Track>) -> usize {
        self.update(guild_id, |state| {
            let first = state.queue.len();
            state.queue.extend(tracks);
            first
        })
    }

    /// Track en el índice actual, si el índice está dentro de la cola
    pub fn current_track(&self, guild_id: u64) -> Option<Track> {
        self.get_guild(guild_id).current().cloned()
    }

    pub fn set_index(&self, guild_id: u64, index: i64) {
        self.update(guild_id, |state| state.index = index);
    }

    /// Elimina el track en `position` manteniendo el índice sobre el mismo track.
    ///
    /// Quitar antes del índice lo decrementa. Quitar en el índice lo conserva
    /// (el siguiente ocupa su lugar), acotado a la cola resultante. Un índice
    /// agotado sigue agotado. Posiciones fuera de rango no hacen nada.
    pub fn remove_at(&self, guild_id: u64, position: usize) -> Option<Track> {
        self.update(guild_id, |state| {
            if position >= state.queue.len() {
                return None;
            }

            let removed = state.queue.remove(position);
            if state.index >= 0 {
                let mut index = state.index;
                if (position as i64) < index {
                    index -= 1;
                }
                let last = state.queue.len() as i64 - 1;
                state.index = index.clamp(0, last.max(0));
            }
            Some(removed)
        })
    }

    /// Reemplaza la cola y vuelve a acotar el índice
    pub fn set_queue(&self, guild_id: u64, tracks: Vec<Track>) {
        self.update(guild_id, |state| {
            state.queue = tracks;
            let last = state.queue.len() as i64 - 1;
            state.index = state.index.clamp(0, last.max(0));
        });
    }

    /// Reinicia la guild (cola vacía, volumen por defecto)
    pub fn clear_guild(&self, guild_id: u64) {
        let _guard = self.lock.lock();
        let mut doc = self.read();
        doc.insert(
            guild_id.to_string(),
            GuildQueueState::with_volume(self.default_volume),
        );
        self.write(&doc);
        info!("🗑️ Estado de cola reiniciado para guild {}", guild_id);
    }

    pub fn set_guild_prop(&self, guild_id: u64, prop: GuildProp) {
        self.update(guild_id, |state| match prop {
            GuildProp::Loop(mode) => state.loop_mode = mode,
            GuildProp::Volume(volume) => state.volume = volume,
            GuildProp::Shuffle(shuffle) => state.shuffle = shuffle,
            GuildProp::Index(index) => state.index = index,
        });
    }

    /// IDs de guilds con entrada guardada
    pub fn guild_ids(&self) -> Vec<u64> {
        let _guard = self.lock.lock();
        self.read()
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    pub fn stats(&self) -> StorageStats {
        let _guard = self.lock.lock();
        let doc = self.read();
        let per_guild: HashMap<u64, usize> = doc
            .iter()
            .filter_map(|(k, v)| k.parse().ok().map(|id| (id, v.queue.len())))
            .collect();
        StorageStats {
            guilds: per_guild.len(),
            tracks: per_guild.values().sum(),
        }
    }
}

/// Estadísticas del almacenamiento
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub guilds: usize,
    pub tracks: usize,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guilds: {}, Tracks en cola: {}", self.guilds, self.tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::EXHAUSTED;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const GUILD: u64 = 42;

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            uri: format!("https://example.com/{title}"),
            identifier: title.to_string(),
            ..Track::default()
        }
    }

    fn store() -> (TempDir, QueueStore) {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::new(dir.path().join("queue_data.json"), 70).unwrap();
        (dir, store)
    }

    fn titles(store: &QueueStore) -> Vec<String> {
        store.get_queue(GUILD).into_iter().map(|t| t.title).collect()
    }

    #[test]
    fn creates_defaults_lazily() {
        let (_dir, store) = store();
        let state = store.get_guild(GUILD);
        assert_eq!(state, GuildQueueState::with_volume(70));
        assert_eq!(store.guild_ids(), vec![GUILD]);
    }

    #[test]
    fn persists_across_instances() {
        let (dir, store) = store();
        store.append_track(GUILD, track("A"));
        store.set_guild_prop(GUILD, GuildProp::Loop(LoopMode::Queue));
        drop(store);

        let reopened = QueueStore::new(dir.path().join("queue_data.json"), 70).unwrap();
        let state = reopened.get_guild(GUILD);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.loop_mode, LoopMode::Queue);
    }

    #[test]
    fn written_document_matches_shape() {
        let (_dir, store) = store();
        store.append_track(GUILD, track("A"));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let guild = &value["42"];
        assert_eq!(guild["index"], 0);
        assert_eq!(guild["loop"], 0);
        assert_eq!(guild["shuffle"], false);
        assert_eq!(guild["volume"], 70);
        assert_eq!(guild["queue"][0]["title"], "A");
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(store.get_queue(GUILD).is_empty());
        // la siguiente escritura reemplaza el archivo corrupto
        store.append_track(GUILD, track("A"));
        assert_eq!(titles(&store), vec!["A"]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B")]);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn extend_returns_first_position() {
        let (_dir, store) = store();
        assert_eq!(store.append_track(GUILD, track("A")), 0);
        assert_eq!(store.extend_tracks(GUILD, vec![track("B"), track("C")]), 1);
        assert_eq!(titles(&store), vec!["A", "B", "C"]);
    }

    #[test]
    fn remove_before_index_shifts_it_down() {
        let (_dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B"), track("C")]);
        store.set_index(GUILD, 2);

        let removed = store.remove_at(GUILD, 0);
        assert_eq!(removed.map(|t| t.title), Some("A".to_string()));
        assert_eq!(store.get_index(GUILD), 1);
        assert_eq!(store.current_track(GUILD).map(|t| t.title), Some("C".to_string()));
    }

    #[test]
    fn remove_at_index_keeps_slot_and_clamps() {
        let (_dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B"), track("C")]);
        store.set_index(GUILD, 1);

        store.remove_at(GUILD, 1);
        assert_eq!(store.get_index(GUILD), 1);
        assert_eq!(store.current_track(GUILD).map(|t| t.title), Some("C".to_string()));

        store.remove_at(GUILD, 1);
        assert_eq!(store.get_index(GUILD), 0);

        store.remove_at(GUILD, 0);
        assert_eq!(store.get_index(GUILD), 0);
        assert!(store.get_queue(GUILD).is_empty());
    }

    #[test]
    fn remove_after_index_and_out_of_range() {
        let (_dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B")]);
        store.set_index(GUILD, 0);

        assert!(store.remove_at(GUILD, 5).is_none());
        store.remove_at(GUILD, 1);
        assert_eq!(store.get_index(GUILD), 0);
        assert_eq!(titles(&store), vec!["A"]);
    }

    #[test]
    fn remove_keeps_exhausted_sentinel() {
        let (_dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B")]);
        store.set_index(GUILD, EXHAUSTED);

        store.remove_at(GUILD, 0);
        assert_eq!(store.get_index(GUILD), EXHAUSTED);
    }

    #[test]
    fn set_queue_clamps_index() {
        let (_dir, store) = store();
        store.extend_tracks(GUILD, vec![track("A"), track("B"), track("C")]);
        store.set_index(GUILD, 2);

        store.set_queue(GUILD, vec![track("X")]);
        assert_eq!(store.get_index(GUILD), 0);

        store.set_queue(GUILD, Vec::new());
        assert_eq!(store.get_index(GUILD), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let (_dir, store) = store();
        store.append_track(GUILD, track("A"));
        store.set_guild_prop(GUILD, GuildProp::Volume(150));
        store.set_guild_prop(GUILD, GuildProp::Shuffle(true));

        store.clear_guild(GUILD);
        assert_eq!(store.get_guild(GUILD), GuildQueueState::with_volume(70));
    }

    #[test]
    fn guilds_are_isolated() {
        let (_dir, store) = store();
        store.append_track(1, track("A"));
        store.append_track(2, track("B"));
        store.clear_guild(1);

        assert!(store.get_queue(1).is_empty());
        assert_eq!(store.get_queue(2).len(), 1);
        assert_eq!(store.stats().tracks, 1);
    }
}
