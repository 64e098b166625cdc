//! HTTP API
//!
//! Draw ingestion, gap alerts, draw sync and the guarded analytics endpoints.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{build_app, ApiServer};
