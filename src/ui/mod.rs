//! Status and control HTTP API

pub mod server;
pub mod handlers;

pub use server::{AppState, WebServer};
