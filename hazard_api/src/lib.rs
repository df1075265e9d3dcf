mod annotate;
mod artifact;
mod cleanup;
mod encoder;
mod pipeline;
mod routes;
mod sampler;
mod server;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
