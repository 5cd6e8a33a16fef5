pub mod account;
pub mod admin;
pub mod auth;
pub mod cache;
pub mod crypto;
pub mod email;
pub mod impersonation;
pub mod lockout;
pub mod mfa;
pub mod oauth;
pub mod password;
pub mod password_reset;
pub mod security;
pub mod token;

pub use account::AccountService;
pub use admin::AdminService;
pub use auth::AuthService;
pub use cache::Cache;
pub use email::EmailService;
pub use impersonation::ImpersonationService;
pub use mfa::{MfaService, TotpService};
pub use oauth::OAuthService;
pub use password_reset::PasswordResetService;
pub use security::SecurityService;
pub use token::JwtService;
