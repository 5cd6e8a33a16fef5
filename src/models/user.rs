use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ユーザーロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "user_role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    User,
    Author,
    Moderator,
    Admin,
    SuperAdmin,
}

impl UserRole {
    /// 管理者権限を持つか
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    /// なりすまし対象にできるか（管理者は不可）
    pub fn can_be_impersonated(self) -> bool {
        !self.is_admin()
    }
}

/// アカウント状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "user_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    PendingVerification,
    Active,
    Suspended,
    Banned,
    Deactivated,
}

impl UserStatus {
    /// ログイン可能な状態か
    pub fn can_login(self) -> bool {
        matches!(self, Self::Active | Self::PendingVerification)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub role: UserRole,
    pub status: UserStatus,
    pub email_verified: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_roles_cannot_be_impersonated() {
        assert!(!UserRole::Admin.can_be_impersonated());
        assert!(!UserRole::SuperAdmin.can_be_impersonated());
        assert!(UserRole::User.can_be_impersonated());
        assert!(UserRole::Author.can_be_impersonated());
        assert!(UserRole::Moderator.can_be_impersonated());
    }

    #[test]
    fn test_login_statuses() {
        assert!(UserStatus::Active.can_login());
        assert!(UserStatus::PendingVerification.can_login());
        assert!(!UserStatus::Suspended.can_login());
        assert!(!UserStatus::Banned.can_login());
        assert!(!UserStatus::Deactivated.can_login());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(
            serde_json::to_string(&UserRole::SuperAdmin).unwrap(),
            "\"SUPER_ADMIN\""
        );
        let status: UserStatus = serde_json::from_str("\"PENDING_VERIFICATION\"").unwrap();
        assert_eq!(status, UserStatus::PendingVerification);
    }
}
