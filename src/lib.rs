//! wavr: account registration and invite redemption for Studio Finder.

pub mod admin;
pub mod config;
pub mod error;
pub mod identity;
pub mod local;
pub mod registration;
pub mod routes;
pub mod store;
