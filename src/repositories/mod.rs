pub mod password_reset_token;
pub mod session;
pub mod social_account;
pub mod user;
pub mod user_security;

pub use password_reset_token::PasswordResetTokenRepository;
pub use session::{NewSession, SessionRepository};
pub use social_account::SocialAccountRepository;
pub use user::{NewUser, UserFilter, UserRepository};
pub use user_security::UserSecurityRepository;
