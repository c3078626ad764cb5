//! HTTP admission API: route wiring, handlers, and payload shaping around
//! the anti-abuse engine.

mod handlers;
mod render;
mod server;
mod types;

pub use handlers::{AppState, ISSUES_PATH};
pub use server::ApiServer;
