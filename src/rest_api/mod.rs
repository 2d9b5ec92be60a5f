//! REST API module for health, metrics and Module inspection

mod dto;
mod handlers;
mod server;

pub use server::run_server;
