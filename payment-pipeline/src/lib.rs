pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod startup;

pub use startup::{AppState, Application};
