mod routes;
mod server;

pub mod annotator;
pub mod app;
pub mod classifier;
pub mod config;
pub mod service;
pub mod slots;
pub mod source;
pub mod stream;
pub mod telemetry;

pub use app::start_app;
