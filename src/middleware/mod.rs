pub mod auth;
pub mod request_context;

pub use auth::{AdminUser, AuthUser, require_admin, require_auth};
pub use request_context::request_context;
