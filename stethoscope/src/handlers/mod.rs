mod app;
mod endpoints;

pub use app::{app, AppState};
