pub mod port;
pub mod server;

pub use server::{AppConfig, AppState, router};
