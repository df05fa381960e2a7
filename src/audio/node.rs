//! Audio node abstraction.
//!
//! The engine only talks to nodes through [`AudioNode`]; the Lavalink client
//! is one implementation, tests use fakes and mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::equalizer::EqBand;
use crate::audio::queue::Track;
use crate::audio::voice::VoiceConnection;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} has no active session")]
    NoSession(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("node answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("unexpected node response: {0}")]
    Decode(String),
    #[error("track could not be loaded: {0}")]
    LoadFailed(String),
}

impl NodeError {
    /// Verdadero cuando falla el nodo y no el track.
    ///
    /// Un fallo de transporte mueve la guild a otro nodo; cualquier otro
    /// salta el track.
    pub fn is_transport(&self) -> bool {
        match self {
            NodeError::NoSession(_) | NodeError::Timeout => true,
            NodeError::Http(e) => !e.is_decode(),
            NodeError::Status { status, .. } => *status >= 500 || *status == 404,
            NodeError::Decode(_) | NodeError::LoadFailed(_) => false,
        }
    }
}

/// Metadata de un track según el nodo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: String,
    pub length: u64,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub is_stream: bool,
}

/// Track resuelto, listo para el nodo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedTrack {
    pub encoded: String,
    pub info: TrackInfo,
}

impl LoadedTrack {
    pub fn to_track(&self, requester: u64) -> Track {
        Track {
            title: self.info.title.clone(),
            uri: self.info.uri.clone().unwrap_or_default(),
            duration: if self.info.is_stream { 0 } else { self.info.length },
            identifier: self.info.identifier.clone(),
            author: self.info.author.clone(),
            requester,
        }
    }
}

/// Resultado de una búsqueda en el nodo
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(LoadedTrack),
    Playlist { name: String, tracks: Vec<LoadedTrack> },
    Search(Vec<LoadedTrack>),
    Empty,
    Error(String),
}

impl LoadResult {
    pub fn is_empty(&self) -> bool {
        match self {
            LoadResult::Track(_) => false,
            LoadResult::Playlist { tracks, .. } => tracks.is_empty(),
            LoadResult::Search(tracks) => tracks.is_empty(),
            LoadResult::Empty | LoadResult::Error(_) => true,
        }
    }

    /// Primer track reproducible: el track, el primer resultado o la primera entrada de la playlist
    pub fn first(&self) -> Option<&LoadedTrack> {
        match self {
            LoadResult::Track(track) => Some(track),
            LoadResult::Playlist { tracks, .. } | LoadResult::Search(tracks) => tracks.first(),
            LoadResult::Empty | LoadResult::Error(_) => None,
        }
    }
}

/// Todo lo que el nodo necesita para reproducir en una guild
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub encoded: String,
    /// Vuelve en los eventos del track para descartar los obsoletos
    pub play_id: u64,
    pub volume: u16,
    pub position_ms: u64,
    pub voice: Option<VoiceConnection>,
    pub equalizer: Vec<EqBand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "finished" => Self::Finished,
            "loadFailed" => Self::LoadFailed,
            "stopped" => Self::Stopped,
            "replaced" => Self::Replaced,
            _ => Self::Cleanup,
        }
    }

    /// Finales causados por nuestros stop/replace o por destruir el player
    pub fn is_ours(self) -> bool {
        matches!(self, Self::Stopped | Self::Replaced | Self::Cleanup)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackStart { play_id: Option<u64> },
    TrackEnd { play_id: Option<u64>, reason: TrackEndReason },
    TrackException { play_id: Option<u64>, message: String },
    TrackStuck { play_id: Option<u64>, threshold_ms: u64 },
    VoiceClosed { code: u16, reason: String },
}

/// Eventos que los nodos envían al motor
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Player {
        node: String,
        guild_id: u64,
        event: PlayerEvent,
    },
    Ready {
        node: String,
        resumed: bool,
    },
    Disconnected {
        node: String,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioNode: Send + Sync {
    fn identifier(&self) -> String;

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError>;

    async fn play(&self, guild_id: u64, request: PlayRequest) -> Result<(), NodeError>;

    async fn stop(&self, guild_id: u64) -> Result<(), NodeError>;

    async fn set_pause(&self, guild_id: u64, paused: bool) -> Result<(), NodeError>;

    async fn set_volume(&self, guild_id: u64, volume: u16) -> Result<(), NodeError>;

    async fn seek(&self, guild_id: u64, position_ms: u64) -> Result<(), NodeError>;

    async fn set_equalizer(&self, guild_id: u64, bands: Vec<EqBand>) -> Result<(), NodeError>;

    async fn destroy(&self, guild_id: u64) -> Result<(), NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(title: &str) -> LoadedTrack {
        LoadedTrack {
            encoded: format!("enc-{title}"),
            info: TrackInfo {
                identifier: title.to_string(),
                title: title.to_string(),
                author: "artist".to_string(),
                length: 1000,
                uri: Some(format!("https://example.com/{title}")),
                is_stream: false,
            },
        }
    }

    #[test]
    fn end_reasons_we_cause_are_recognised() {
        assert!(TrackEndReason::parse("replaced").is_ours());
        assert!(TrackEndReason::parse("stopped").is_ours());
        assert!(TrackEndReason::parse("cleanup").is_ours());
        assert!(!TrackEndReason::parse("finished").is_ours());
        assert_eq!(TrackEndReason::parse("loadFailed"), TrackEndReason::LoadFailed);
    }

    #[test]
    fn load_result_first_and_empty() {
        assert!(LoadResult::Empty.is_empty());
        assert!(LoadResult::Search(vec![]).is_empty());
        let playlist = LoadResult::Playlist {
            name: "mix".to_string(),
            tracks: vec![loaded("a"), loaded("b")],
        };
        assert_eq!(playlist.first().map(|t| t.info.title.as_str()), Some("a"));
    }

    #[test]
    fn transport_errors_are_classified() {
        assert!(NodeError::Timeout.is_transport());
        assert!(NodeError::NoSession("n".into()).is_transport());
        assert!(NodeError::Status { status: 503, message: String::new() }.is_transport());
        assert!(!NodeError::Status { status: 400, message: String::new() }.is_transport());
        assert!(!NodeError::LoadFailed("x".into()).is_transport());
    }

    #[test]
    fn streams_have_no_duration() {
        let mut track = loaded("live");
        track.info.is_stream = true;
        assert_eq!(track.to_track(9).duration, 0);
        assert_eq!(track.to_track(9).requester, 9);
    }
}
