//! Subcommand implementations.

pub mod encode;
pub mod race;
