pub mod account;
pub mod admin;
pub mod auth;
pub mod extract;
pub mod health;
pub mod mfa;
pub mod oauth;
pub mod password;

pub use health::{health_check, readiness_check};
