//! Middlewares for the HTTP server.
//!
//! This module exposes tower [layers](tower::Layer) and related utilities to configure the
//! axum/hyper HTTP server. Most of the middlewares are registered as a layer on the
//! [`Router`](axum::Router), [`NormalizePath`] wraps the router since it rewrites the path before
//! routing.
//!
//! See [`make_app`](crate::services::server) for where these middlewares are registered.

mod handle_panic;
mod normalize_path;
mod trace;

pub use self::handle_panic::*;
pub use self::normalize_path::*;
pub use self::trace::*;
