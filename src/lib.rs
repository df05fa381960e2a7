//! # Akio
//!
//! Discord music bot that plays through public Lavalink nodes.
//!
//! - [`storage`]: per-guild queues persisted to a JSON file
//! - [`audio`]: the playback engine and the Lavalink client
//! - [`nodes`]: discovery, health checks and selection of audio nodes
//! - [`bot`] and [`ui`]: slash commands, buttons and embeds

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod nodes;
pub mod retry;
pub mod storage;
pub mod ui;
