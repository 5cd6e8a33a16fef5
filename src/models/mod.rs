pub mod impersonation;
pub mod password_reset_token;
pub mod session;
pub mod social_account;
pub mod user;
pub mod user_security;

pub use impersonation::{ImpersonationRecord, is_impersonation_id, new_impersonation_id};
pub use password_reset_token::PasswordResetToken;
pub use session::{Session, SessionSummary};
pub use social_account::{OAuthProvider, SocialAccount};
pub use user::{User, UserRole, UserStatus};
pub use user_security::{SecurityOverview, StatusHistoryEntry, UserSecurity};
