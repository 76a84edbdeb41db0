//! HTTP/SSE façade for the Port Daddy coordination core.

pub mod models;
pub mod server;
pub mod telemetry;
