//! Axum middleware layers

pub mod auth;
