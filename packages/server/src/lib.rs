//! Control API and process wiring for the intake orchestration core.

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod routes;

pub use app::{build_app, AppState};
pub use config::Config;
pub use core::{Core, CoreBuilder};
