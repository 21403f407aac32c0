//! Long running services of the server.

pub mod audit;
pub mod engine;
pub mod server;
