//! # Audio Module
//!
//! Persistent queues and playback continuation for Akio.
//!
//! ## Architecture
//!
//! ### [`queue`] - Queue Rules
//! - Per-guild queue state as it is persisted
//! - Pure "what plays next" rules for end, skip, back and shuffle
//!
//! ### [`engine`] - Playback Engine
//! - Serializes every queue-moving event per guild
//! - Issues plays on audio nodes and skips unplayable tracks
//! - Goes idle when the queue runs out and disconnects after a timeout
//!
//! ### [`lavalink_client`] - Lavalink v4 Client
//! - REST player updates and track loading
//! - One websocket per node feeding [`node::NodeEvent`]s to the engine
//!
//! ### Support
//! - [`coordinator`]: per-guild locks and runtime sessions
//! - [`search`]: query → node lookup strategies
//! - [`equalizer`]: 15-band presets
//! - [`voice`]: voice credentials and leaving channels

pub mod coordinator;
pub mod engine;
pub mod equalizer;
pub mod lavalink_client;
pub mod node;
pub mod queue;
pub mod search;
pub mod voice;

pub use coordinator::{PlaybackCoordinator, PlayerStatus};
pub use engine::{
    EngineSettings, Notice, NowPlaying, PlaybackEngine, PlaybackEvent, PlaybackNotifier,
    Transition,
};
pub use queue::{GuildQueueState, LoopMode, Track};
