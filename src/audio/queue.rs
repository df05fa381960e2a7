use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Índice guardado cuando la cola terminó sin loop
pub const EXHAUSTED: i64 = -1;

pub const TRACKS_PER_PAGE: usize = 10;

/// Entrada de la cola. Inmutable una vez agregada; `duration` en milisegundos
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub title: String,
    pub uri: String,
    pub duration: u64,
    pub identifier: String,
    pub author: String,
    pub requester: u64,
}

impl Default for Track {
    fn default() -> Self {
        Self {
            title: "Unknown".to_string(),
            uri: String::new(),
            duration: 0,
            identifier: String::new(),
            author: "Unknown".to_string(),
            requester: 0,
        }
    }
}

impl Track {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration)
    }

    /// Lo que se le pasa al nodo para volver a resolver el track
    pub fn lookup_key(&self) -> &str {
        if self.uri.is_empty() {
            &self.identifier
        } else {
            &self.uri
        }
    }
}

/// Se guarda en disco como `0`, `1` o `2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl LoopMode {
    /// `OFF → TRACK → QUEUE → OFF`
    pub fn next(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Track,
            LoopMode::Track => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            LoopMode::Off => "➡️",
            LoopMode::Track => "🔂",
            LoopMode::Queue => "🔁",
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopMode::Off => "Off",
            LoopMode::Track => "Track",
            LoopMode::Queue => "Queue",
        };
        f.write_str(label)
    }
}

impl From<LoopMode> for u8 {
    fn from(mode: LoopMode) -> Self {
        match mode {
            LoopMode::Off => 0,
            LoopMode::Track => 1,
            LoopMode::Queue => 2,
        }
    }
}

impl TryFrom<u8> for LoopMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LoopMode::Off),
            1 => Ok(LoopMode::Track),
            2 => Ok(LoopMode::Queue),
            other => Err(format!("invalid loop mode {other}")),
        }
    }
}

/// Estado persistido de la cola de una guild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildQueueState {
    pub queue: Vec<Track>,
    pub index: i64,
    #[serde(rename = "loop")]
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u16,
}

impl Default for GuildQueueState {
    fn default() -> Self {
        Self::with_volume(70)
    }
}

impl GuildQueueState {
    pub fn with_volume(volume: u16) -> Self {
        Self {
            queue: Vec::new(),
            index: 0,
            loop_mode: LoopMode::Off,
            shuffle: false,
            volume,
        }
    }

    /// El índice como posición, si apunta a un track existente
    pub fn position(&self) -> Option<usize> {
        usize::try_from(self.index)
            .ok()
            .filter(|&i| i < self.queue.len())
    }

    pub fn current(&self) -> Option<&Track> {
        self.position().map(|i| &self.queue[i])
    }

    pub fn is_exhausted(&self) -> bool {
        self.index == EXHAUSTED
    }

    pub fn total_duration(&self) -> Duration {
        self.queue.iter().map(Track::duration).sum()
    }

    pub fn page(&self, page: usize) -> QueuePage {
        QueuePage::of(self, page, TRACKS_PER_PAGE)
    }

    /// Página con el track actual (desde 1), la primera si no hay reproducción
    pub fn current_page(&self) -> usize {
        self.position().map_or(1, |i| i / TRACKS_PER_PAGE + 1)
    }
}

/// A dónde ir cuando el track actual terminó solo.
///
/// Loop de track repite, si no el siguiente, si no el loop de cola vuelve al
/// inicio. `None` significa que la cola se agotó.
pub fn ended_target(state: &GuildQueueState) -> Option<usize> {
    let current = state.position()?;
    match state.loop_mode {
        LoopMode::Track => Some(current),
        _ if current + 1 < state.queue.len() => Some(current + 1),
        LoopMode::Queue => Some(0),
        LoopMode::Off => None,
    }
}

/// A dónde va un skip explícito. El loop de track no lo detiene
pub fn skip_target(state: &GuildQueueState) -> Option<usize> {
    let current = state.position()?;
    if current + 1 < state.queue.len() {
        Some(current + 1)
    } else if state.loop_mode == LoopMode::Queue {
        Some(0)
    } else {
        None
    }
}

/// A dónde va "back": el anterior, o el último si estaba en el primero
pub fn previous_target(state: &GuildQueueState) -> Option<usize> {
    if state.queue.is_empty() {
        return None;
    }
    match usize::try_from(state.index) {
        Ok(i) if i > 0 && i <= state.queue.len() => Some(i - 1),
        _ => Some(state.queue.len() - 1),
    }
}

/// Mezcla la cola dejando el track actual al principio.
///
/// Retorna el nuevo orden y el nuevo índice (0 si había track actual, el
/// mismo índice si no).
pub fn shuffle_keeping_current<R: Rng + ?Sized>(
    state: &GuildQueueState,
    rng: &mut R,
) -> (Vec<Track>, i64) {
    let mut tracks = state.queue.clone();
    match state.position() {
        Some(current) => {
            let playing = tracks.remove(current);
            tracks.shuffle(rng);
            tracks.insert(0, playing);
            (tracks, 0)
        }
        None => {
            tracks.shuffle(rng);
            (tracks, state.index)
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    /// Pares `(posición en la cola, track)` de esta página
    pub items: Vec<(usize, Track)>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl QueuePage {
    pub fn of(state: &GuildQueueState, page: usize, items_per_page: usize) -> Self {
        let total_items = state.queue.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let safe_page = page.clamp(1, total_pages);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(total_items);

        Self {
            items: state.queue[start..end]
                .iter()
                .cloned()
                .enumerate()
                .map(|(offset, track)| (start + offset, track))
                .collect(),
            current_page: safe_page,
            total_pages,
            total_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            uri: format!("https://example.com/{title}"),
            duration: 180_000,
            identifier: title.to_string(),
            author: "tester".to_string(),
            requester: 1,
        }
    }

    fn state(titles: &[&str], index: i64, loop_mode: LoopMode) -> GuildQueueState {
        GuildQueueState {
            queue: titles.iter().map(|t| track(t)).collect(),
            index,
            loop_mode,
            ..GuildQueueState::default()
        }
    }

    #[test]
    fn loop_mode_cycles_and_serializes_as_integer() {
        assert_eq!(LoopMode::Off.next(), LoopMode::Track);
        assert_eq!(LoopMode::Track.next(), LoopMode::Queue);
        assert_eq!(LoopMode::Queue.next(), LoopMode::Off);

        let json = serde_json::to_string(&state(&["A"], 0, LoopMode::Queue)).unwrap();
        assert!(json.contains("\"loop\":2"));
        assert!(serde_json::from_str::<LoopMode>("7").is_err());
    }

    #[test]
    fn track_loop_replays_on_natural_end() {
        let s = state(&["A", "B"], 0, LoopMode::Track);
        assert_eq!(ended_target(&s), Some(0));
    }

    #[test]
    fn skip_overrides_track_loop() {
        let s = state(&["A", "B"], 0, LoopMode::Track);
        assert_eq!(skip_target(&s), Some(1));
    }

    #[test]
    fn queue_loop_wraps() {
        let s = state(&["A", "B", "C"], 2, LoopMode::Queue);
        assert_eq!(ended_target(&s), Some(0));
        assert_eq!(skip_target(&s), Some(0));
    }

    #[test]
    fn exhausts_without_loop() {
        let s = state(&["A", "B", "C"], 2, LoopMode::Off);
        assert_eq!(ended_target(&s), None);
        assert_eq!(skip_target(&s), None);
        assert_eq!(ended_target(&state(&["A"], EXHAUSTED, LoopMode::Off)), None);
    }

    #[test]
    fn previous_wraps_to_last() {
        assert_eq!(previous_target(&state(&["A", "B", "C"], 2, LoopMode::Off)), Some(1));
        assert_eq!(previous_target(&state(&["A", "B", "C"], 0, LoopMode::Off)), Some(2));
        assert_eq!(previous_target(&state(&["A", "B"], EXHAUSTED, LoopMode::Off)), Some(1));
        assert_eq!(previous_target(&state(&[], 0, LoopMode::Off)), None);
    }

    #[test]
    fn shuffle_keeps_current_track_first() {
        let s = state(&["A", "B", "C", "D", "E"], 2, LoopMode::Off);
        let mut rng = StdRng::seed_from_u64(7);
        let (shuffled, index) = shuffle_keeping_current(&s, &mut rng);

        assert_eq!(index, 0);
        assert_eq!(shuffled[0].title, "C");
        assert_eq!(shuffled.len(), 5);
        let mut titles: Vec<_> = shuffled.iter().map(|t| t.title.clone()).collect();
        titles.sort();
        assert_eq!(titles, vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn pages_are_clamped_and_numbered() {
        let titles: Vec<String> = (0..23).map(|i| format!("T{i}")).collect();
        let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        let s = state(&refs, 12, LoopMode::Off);

        let page = s.page(2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.first().map(|(i, _)| *i), Some(10));
        assert_eq!(page.items.len(), 10);
        assert_eq!(s.current_page(), 2);

        let last = s.page(99);
        assert_eq!(last.current_page, 3);
        assert_eq!(last.items.len(), 3);

        let empty = GuildQueueState::default().page(1);
        assert_eq!(empty.total_pages, 1);
        assert!(empty.items.is_empty());
    }
}
