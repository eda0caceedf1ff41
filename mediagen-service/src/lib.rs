pub mod components;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod handlers;
pub mod materializer;
pub mod models;
pub mod normalizer;
pub mod provider;
pub mod recorder;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::MediaGenConfig;
pub use error::MediaGenError;
pub use server::{create_router, run_server, AppState};
