use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ログインセッション
///
/// 削除せず revoked_at を設定して論理的に無効化する。
/// リフレッシュトークンは SHA256 ハッシュのみ保存。
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_active_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_reason: Option<String>,
}

impl Session {
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// ログイン履歴・アクティブセッション一覧用 DTO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_reason: Option<String>,
    /// リクエスト元のセッションか（キャッシュには常に false で保存）
    #[serde(default)]
    pub is_current: bool,
}

impl From<Session> for SessionSummary {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            expires_at: session.expires_at,
            revoked_at: session.revoked_at,
            revoked_reason: session.revoked_reason,
            is_current: false,
        }
    }
}

impl SessionSummary {
    /// 現在のセッションに印を付ける
    pub fn mark_current(mut sessions: Vec<Self>, current: Option<Uuid>) -> Vec<Self> {
        for session in &mut sessions {
            session.is_current = Some(session.id) == current;
        }
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn session(revoked: bool, expires_in: Duration) -> Session {
        let now = OffsetDateTime::now_utc();
        Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            refresh_token_hash: "hash".to_string(),
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: None,
            created_at: now,
            last_active_at: now,
            expires_at: now + expires_in,
            revoked_at: revoked.then_some(now),
            revoked_reason: revoked.then(|| "logout".to_string()),
        }
    }

    #[test]
    fn test_is_active() {
        let now = OffsetDateTime::now_utc();
        assert!(session(false, Duration::hours(1)).is_active_at(now));
        assert!(!session(true, Duration::hours(1)).is_active_at(now));
        assert!(!session(false, Duration::hours(-1)).is_active_at(now));
    }

    #[test]
    fn test_mark_current() {
        let a = SessionSummary::from(session(false, Duration::hours(1)));
        let b = SessionSummary::from(session(false, Duration::hours(1)));
        let current = b.id;
        let marked = SessionSummary::mark_current(vec![a, b], Some(current));
        assert!(!marked[0].is_current);
        assert!(marked[1].is_current);
    }

    #[test]
    fn test_summary_omits_refresh_hash() {
        let summary = SessionSummary::from(session(false, Duration::hours(1)));
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("refreshTokenHash").is_none());
        assert_eq!(json["ipAddress"], "127.0.0.1");
    }
}
