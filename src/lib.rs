pub mod cache;
pub mod config;
pub mod engine;
pub mod game;
pub mod ledger;
pub mod server;
pub mod tokio_tools;

pub mod db;

#[cfg(test)]
pub mod test_utils;

pub use config::{DuelRules, EngineConfig};
