use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::UserStatus;

/// ステータス変更履歴の1エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub from: UserStatus,
    pub to: UserStatus,
    pub reason: Option<String>,
    pub changed_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

/// ユーザーのセキュリティ状態（ユーザーごとに1行）
///
/// MFA シークレットは AES-256-GCM で暗号化、バックアップコードは SHA256 ハッシュで保存
#[derive(Debug, Clone, FromRow)]
pub struct UserSecurity {
    pub user_id: Uuid,
    pub failed_login_count: i32,
    pub locked_until: Option<OffsetDateTime>,
    pub mfa_enabled: bool,
    pub mfa_secret_encrypted: Option<Vec<u8>>,
    pub mfa_backup_codes: Vec<String>,
    pub status_history: Json<Vec<StatusHistoryEntry>>,
    pub force_logout_at: Option<OffsetDateTime>,
    pub password_changed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl UserSecurity {
    /// 指定時刻でロック中か
    pub fn is_locked_at(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// ロック期限切れ（遅延解除の対象）か
    pub fn has_expired_lock(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| until <= now)
    }
}

/// キャッシュ・API 用のセキュリティ情報（秘密情報を含まない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOverview {
    pub user_id: Uuid,
    pub failed_login_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,
    pub mfa_enabled: bool,
    pub backup_codes_remaining: usize,
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub force_logout_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub password_changed_at: Option<OffsetDateTime>,
}

impl From<UserSecurity> for SecurityOverview {
    fn from(security: UserSecurity) -> Self {
        Self {
            user_id: security.user_id,
            failed_login_count: security.failed_login_count,
            locked_until: security.locked_until,
            mfa_enabled: security.mfa_enabled,
            backup_codes_remaining: security.mfa_backup_codes.len(),
            status_history: security.status_history.0,
            force_logout_at: security.force_logout_at,
            password_changed_at: security.password_changed_at,
        }
    }
}

/// 履歴を追加し、最大件数を超えた古いエントリを切り詰める
pub fn append_status_history(
    history: &mut Vec<StatusHistoryEntry>,
    entry: StatusHistoryEntry,
    max_len: usize,
) {
    history.push(entry);
    if history.len() > max_len {
        let excess = history.len() - max_len;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn security(locked_until: Option<OffsetDateTime>) -> UserSecurity {
        UserSecurity {
            user_id: Uuid::new_v4(),
            failed_login_count: 5,
            locked_until,
            mfa_enabled: false,
            mfa_secret_encrypted: None,
            mfa_backup_codes: vec!["a".into(), "b".into()],
            status_history: Json(Vec::new()),
            force_logout_at: None,
            password_changed_at: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn entry(to: UserStatus) -> StatusHistoryEntry {
        StatusHistoryEntry {
            from: UserStatus::Active,
            to,
            reason: None,
            changed_by: Uuid::nil(),
            changed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_lock_state() {
        let now = OffsetDateTime::now_utc();
        let locked = security(Some(now + Duration::minutes(5)));
        assert!(locked.is_locked_at(now));
        assert!(!locked.has_expired_lock(now));

        let expired = security(Some(now - Duration::minutes(5)));
        assert!(!expired.is_locked_at(now));
        assert!(expired.has_expired_lock(now));

        let unlocked = security(None);
        assert!(!unlocked.is_locked_at(now));
        assert!(!unlocked.has_expired_lock(now));
    }

    #[test]
    fn test_append_status_history_trims_oldest() {
        let mut history = vec![entry(UserStatus::Suspended), entry(UserStatus::Active)];
        append_status_history(&mut history, entry(UserStatus::Banned), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, UserStatus::Active);
        assert_eq!(history[1].to, UserStatus::Banned);
    }

    #[test]
    fn test_overview_hides_secrets() {
        let overview = SecurityOverview::from(security(None));
        assert_eq!(overview.backup_codes_remaining, 2);
        let json = serde_json::to_value(&overview).unwrap();
        assert!(json.get("mfaSecretEncrypted").is_none());
        assert!(json.get("mfaBackupCodes").is_none());
    }
}
