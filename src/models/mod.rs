//! Request and Response models for the admin API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{BatchRequest, ResizeRequest, SetRequest, SubmitTaskRequest, MAX_KEY_LENGTH};
pub use responses::{
    BatchItem, BatchResponse, CacheStatsResponse, ClearResponse, DeleteResponse, ErrorResponse,
    GetResponse, HealthResponse, ResizeResponse, SetResponse,
};
