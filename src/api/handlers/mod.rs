//! Route handlers for both realms, the internal service surface and health.

pub mod admin;
pub mod auth;
pub mod health;
pub mod internal;
