//! Route handlers for the HTTP API.

pub mod admin;
pub mod events;
pub mod jobs;
