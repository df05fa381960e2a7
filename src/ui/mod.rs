//! Discord-facing presentation: embeds and player buttons.

pub mod buttons;
pub mod embeds;
