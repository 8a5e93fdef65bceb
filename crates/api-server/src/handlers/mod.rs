//! API request handlers.

pub mod audit_logs;
pub mod auth;
pub mod groups;
pub mod health;
pub mod roles;
pub mod users;
