use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// なりすまし用セッションIDのプレフィックス
pub const IMPERSONATION_PREFIX: &str = "imp_";

/// なりすましセッションIDを生成（`imp_<uuid>`）
pub fn new_impersonation_id() -> String {
    format!("{}{}", IMPERSONATION_PREFIX, Uuid::new_v4())
}

pub fn is_impersonation_id(session_id: &str) -> bool {
    session_id.starts_with(IMPERSONATION_PREFIX)
}

/// なりすまし記録（キャッシュのみに保存、TTL で失効）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationRecord {
    pub id: String,
    pub admin_id: Uuid,
    pub admin_email: String,
    pub target_user_id: Uuid,
    pub target_email: String,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impersonation_id_format() {
        let id = new_impersonation_id();
        assert!(is_impersonation_id(&id));
        assert!(Uuid::parse_str(&id[IMPERSONATION_PREFIX.len()..]).is_ok());
        assert!(!is_impersonation_id(&Uuid::new_v4().to_string()));
    }
}
