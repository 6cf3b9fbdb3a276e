//! nexusbridge - Nexus Collections installer for Mod Organizer 2
//!
//! Takes a Nexus Mods Collection (a curated bundle of mods, install
//! options, file overrides and plugin load order) and installs it
//! directly into an existing MO2 instance.

pub mod collection;
pub mod downloaders;
pub mod games;
pub mod loot;
pub mod mo2;

pub use games::{validate_game_path, GameType};
pub use mo2::Mo2Instance;
