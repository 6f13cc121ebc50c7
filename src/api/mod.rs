//! API Module
//!
//! HTTP handlers and routing for the admin REST API. The daemon exposes the
//! cache and the worker pool through it; see [`create_router`] for the
//! endpoint list.

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
