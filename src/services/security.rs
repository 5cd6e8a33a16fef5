//! アカウントセキュリティサービス
//!
//! - ログイン失敗回数の記録と閾値によるロック
//! - ロック期限切れの遅延解除（ロック確認時に解除）
//! - 失敗回数の減衰（外部から起動）
//! - 強制ログアウト・セッション無効化
//! - セキュリティ情報 / セッション一覧のキャッシュと無効化

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{SecurityOverview, SessionSummary, StatusHistoryEntry, UserSecurity};
use crate::repositories::{SessionRepository, UserSecurityRepository};
use crate::response::{PageQuery, Paginated};
use crate::services::cache::{Cache, keys};
use crate::services::lockout::{LockoutPolicy, decay_cutoff};

/// キャッシュ TTL・減衰などの設定値
#[derive(Debug, Clone, Copy)]
pub struct SecuritySettings {
    pub security_cache_ttl_secs: u64,
    pub sessions_cache_ttl_secs: u64,
    pub failed_login_decay_minutes: i64,
    pub status_history_max_len: usize,
}

/// ログイン失敗記録の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLoginOutcome {
    pub failed_login_count: i32,
    pub locked_until: Option<OffsetDateTime>,
}

/// 新しい失敗回数に対して設定すべきロック期限
///
/// 既存のロックより長い場合のみ更新する（短縮しない）
pub fn next_lock(
    policy: &LockoutPolicy,
    failed_login_count: i32,
    current_locked_until: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    let candidate = policy.locked_until(failed_login_count, now)?;
    match current_locked_until {
        Some(current) if current >= candidate => None,
        _ => Some(candidate),
    }
}

/// 強制ログアウト以前に発行されたトークンか
///
/// `iat` は秒精度のため、強制ログアウトと同じ秒に発行されたトークンも拒否する
pub fn issued_before_force_logout(
    issued_at: i64,
    force_logout_at: Option<OffsetDateTime>,
) -> bool {
    force_logout_at.is_some_and(|at| issued_at <= at.unix_timestamp())
}

#[derive(Clone)]
pub struct SecurityService {
    security_repo: UserSecurityRepository,
    session_repo: SessionRepository,
    cache: Cache,
    policy: Arc<LockoutPolicy>,
    settings: SecuritySettings,
}

impl SecurityService {
    pub fn new(
        security_repo: UserSecurityRepository,
        session_repo: SessionRepository,
        cache: Cache,
        policy: LockoutPolicy,
        settings: SecuritySettings,
    ) -> Self {
        Self {
            security_repo,
            session_repo,
            cache,
            policy: Arc::new(policy),
            settings,
        }
    }

    /// セキュリティ行を DB から直接取得（MFA シークレット参照など）
    pub async fn get_security(&self, user_id: Uuid) -> Result<UserSecurity, AppError> {
        self.security_repo
            .find_by_user_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("セキュリティ情報が見つかりません".to_string()))
    }

    /// セキュリティ情報（キャッシュ優先、TTL: security_cache_ttl_secs）
    pub async fn get_overview(&self, user_id: Uuid) -> Result<SecurityOverview, AppError> {
        let key = keys::user_security(user_id);
        self.cache
            .get_or_load(&key, self.settings.security_cache_ttl_secs, || async {
                self.get_security(user_id).await.map(SecurityOverview::from)
            })
            .await
    }

    /// 有効なセッション一覧（キャッシュ優先、TTL: sessions_cache_ttl_secs）
    pub async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<SessionSummary>, AppError> {
        let key = keys::user_sessions(user_id);
        self.cache
            .get_or_load(&key, self.settings.sessions_cache_ttl_secs, || async {
                let sessions = self.session_repo.list_active(user_id).await?;
                Ok::<_, AppError>(sessions.into_iter().map(SessionSummary::from).collect())
            })
            .await
    }

    /// ログイン履歴（無効化済みを含む、DB から直接取得）
    pub async fn login_history(
        &self,
        user_id: Uuid,
        page: &PageQuery,
    ) -> Result<Paginated<SessionSummary>, AppError> {
        let (sessions, total) = self
            .session_repo
            .list_history(user_id, i64::from(page.limit()), page.offset())
            .await?;
        Ok(Paginated::new(
            sessions.into_iter().map(SessionSummary::from).collect(),
            page,
            total,
        ))
    }

    /// ロック中なら解除時刻を返す
    ///
    /// 期限切れのロックはこの呼び出しで解除する（スケジュール解除はしない）
    pub async fn is_account_locked(&self, user_id: Uuid) -> Result<Option<OffsetDateTime>, AppError> {
        let security = self.get_security(user_id).await?;
        let now = OffsetDateTime::now_utc();

        if security.is_locked_at(now) {
            return Ok(security.locked_until);
        }

        if security.has_expired_lock(now) && self.security_repo.clear_expired_lock(user_id, now).await? {
            tracing::info!(user_id = %user_id, "期限切れロックを解除");
            self.invalidate_security(user_id).await;
        }

        Ok(None)
    }

    /// ロック中ならエラー
    pub async fn ensure_not_locked(&self, user_id: Uuid) -> Result<(), AppError> {
        match self.is_account_locked(user_id).await? {
            Some(locked_until) => Err(AppError::AccountLocked { locked_until }),
            None => Ok(()),
        }
    }

    /// ログイン失敗を記録し、閾値に達していればロック
    pub async fn record_failed_login(&self, user_id: Uuid) -> Result<FailedLoginOutcome, AppError> {
        let security = self
            .security_repo
            .increment_failed_login(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("セキュリティ情報が見つかりません".to_string()))?;

        let now = OffsetDateTime::now_utc();
        let mut locked_until = security.locked_until.filter(|until| *until > now);

        if let Some(until) = next_lock(
            &self.policy,
            security.failed_login_count,
            locked_until,
            now,
        ) {
            self.security_repo.set_locked_until(user_id, until).await?;
            tracing::warn!(
                user_id = %user_id,
                failed_login_count = security.failed_login_count,
                locked_until = %until,
                "ログイン失敗が閾値に達したためアカウントをロック"
            );
            locked_until = Some(until);
        } else {
            tracing::info!(
                user_id = %user_id,
                failed_login_count = security.failed_login_count,
                "ログイン失敗を記録"
            );
        }

        self.invalidate_security(user_id).await;

        Ok(FailedLoginOutcome {
            failed_login_count: security.failed_login_count,
            locked_until,
        })
    }

    /// ログイン成功時: 失敗回数・ロックをリセット
    pub async fn record_successful_login(&self, user_id: Uuid) -> Result<(), AppError> {
        self.security_repo.reset_failed_logins(user_id).await?;
        self.invalidate_user(user_id).await;
        Ok(())
    }

    /// 失敗回数の減衰を1回実行
    ///
    /// # Returns
    /// 減衰したアカウント数
    pub async fn decay_failed_logins(&self) -> Result<u64, AppError> {
        let now = OffsetDateTime::now_utc();
        let cutoff = decay_cutoff(now, self.settings.failed_login_decay_minutes);
        let decayed = self.security_repo.decay_failed_logins(cutoff, now).await?;
        tracing::info!(decayed = decayed, cutoff = %cutoff, "ログイン失敗回数を減衰");
        Ok(decayed)
    }

    /// 管理者によるロック解除
    pub async fn unlock(&self, user_id: Uuid) -> Result<(), AppError> {
        self.security_repo.reset_failed_logins(user_id).await?;
        self.invalidate_security(user_id).await;
        tracing::info!(user_id = %user_id, "アカウントロックを解除");
        Ok(())
    }

    /// 全セッションを無効化し、それ以前に発行されたトークンを拒否させる
    ///
    /// # Returns
    /// 無効化したセッション数
    pub async fn force_logout_all(&self, user_id: Uuid, reason: &str) -> Result<u64, AppError> {
        self.security_repo
            .set_force_logout_at(user_id, OffsetDateTime::now_utc())
            .await?;
        let revoked = self.session_repo.revoke_all(user_id, None, reason).await?;
        self.invalidate_user(user_id).await;
        tracing::warn!(user_id = %user_id, revoked = revoked, reason = %reason, "強制ログアウト");
        Ok(revoked)
    }

    pub async fn revoke_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> Result<bool, AppError> {
        let revoked = self.session_repo.revoke(user_id, session_id, reason).await?;
        self.invalidate_sessions(user_id).await;
        Ok(revoked)
    }

    /// 現在のセッション以外を無効化
    pub async fn revoke_other_sessions(
        &self,
        user_id: Uuid,
        current: Option<Uuid>,
        reason: &str,
    ) -> Result<u64, AppError> {
        let revoked = self.session_repo.revoke_all(user_id, current, reason).await?;
        self.invalidate_sessions(user_id).await;
        Ok(revoked)
    }

    /// ステータス変更履歴を追記
    pub async fn record_status_change(
        &self,
        user_id: Uuid,
        entry: StatusHistoryEntry,
    ) -> Result<(), AppError> {
        self.security_repo
            .append_status_history(user_id, entry, self.settings.status_history_max_len)
            .await?;
        self.invalidate_security(user_id).await;
        Ok(())
    }

    /// アクセストークンのセッションが有効か（有効セッション一覧のキャッシュを参照）
    pub async fn ensure_session_active(&self, user_id: Uuid, session_id: Uuid) -> Result<(), AppError> {
        let now = OffsetDateTime::now_utc();
        let active = self
            .list_active_sessions(user_id)
            .await?
            .iter()
            .any(|session| session.id == session_id && session.expires_at > now);
        if active {
            Ok(())
        } else {
            Err(AppError::SessionRevoked)
        }
    }

    /// force_logout_at 以前（同一秒を含む）に発行されたトークンを拒否
    pub async fn ensure_token_current(&self, user_id: Uuid, issued_at: i64) -> Result<(), AppError> {
        let overview = self.get_overview(user_id).await?;
        if issued_before_force_logout(issued_at, overview.force_logout_at) {
            return Err(AppError::SessionRevoked);
        }
        Ok(())
    }

    pub async fn invalidate_security(&self, user_id: Uuid) {
        self.cache.invalidate(&[keys::user_security(user_id)]).await;
    }

    pub async fn invalidate_sessions(&self, user_id: Uuid) {
        self.cache.invalidate(&[keys::user_sessions(user_id)]).await;
    }

    /// パスワード変更・強制ログアウト・ステータス変更などの後に呼ぶ
    pub async fn invalidate_user(&self, user_id: Uuid) {
        self.cache
            .invalidate(&[keys::user_security(user_id), keys::user_sessions(user_id)])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn policy() -> LockoutPolicy {
        "5:15,10:60".parse().unwrap()
    }

    #[test]
    fn test_next_lock_below_threshold() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(next_lock(&policy(), 4, None, now), None);
    }

    #[test]
    fn test_next_lock_at_threshold() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            next_lock(&policy(), 5, None, now),
            Some(now + Duration::minutes(15))
        );
    }

    #[test]
    fn test_next_lock_escalates() {
        let now = OffsetDateTime::now_utc();
        let current = Some(now + Duration::minutes(10));
        assert_eq!(
            next_lock(&policy(), 10, current, now),
            Some(now + Duration::minutes(60))
        );
    }

    #[test]
    fn test_next_lock_never_shortens() {
        let now = OffsetDateTime::now_utc();
        let current = Some(now + Duration::minutes(60));
        assert_eq!(next_lock(&policy(), 6, current, now), None);
    }

    #[test]
    fn test_token_from_same_second_as_force_logout_rejected() {
        let at = OffsetDateTime::now_utc();
        let issued_same_second = at.unix_timestamp();
        assert!(issued_before_force_logout(issued_same_second, Some(at)));
        assert!(issued_before_force_logout(issued_same_second - 1, Some(at)));
        assert!(!issued_before_force_logout(issued_same_second + 1, Some(at)));
        assert!(!issued_before_force_logout(issued_same_second, None));
    }

    #[test]
    fn test_consecutive_failures_lock_at_first_threshold() {
        let now = OffsetDateTime::now_utc();
        let policy = policy();
        let mut locked_until = None;
        let mut locked_at_attempt = None;
        for attempt in 1..=7 {
            if let Some(until) = next_lock(&policy, attempt, locked_until, now) {
                locked_until = Some(until);
                locked_at_attempt.get_or_insert(attempt);
            }
        }
        assert_eq!(locked_at_attempt, Some(5));
        assert_eq!(locked_until, Some(now + Duration::minutes(15)));
    }

    mod db {
        use super::*;
        use sqlx::PgPool;

        use crate::repositories::{NewUser, UserRepository};

        fn service(pool: &PgPool) -> SecurityService {
            SecurityService::new(
                UserSecurityRepository::new(pool.clone()),
                SessionRepository::new(pool.clone()),
                Cache::memory(),
                policy(),
                SecuritySettings {
                    security_cache_ttl_secs: 60,
                    sessions_cache_ttl_secs: 30,
                    failed_login_decay_minutes: 60,
                    status_history_max_len: 50,
                },
            )
        }

        async fn create_user(pool: &PgPool, username: &str) -> Uuid {
            let email = format!("{username}@example.com");
            UserRepository::new(pool.clone())
                .create_user(NewUser {
                    email: &email,
                    username,
                    display_name: username,
                    password_hash: Some("$argon2id$dummy"),
                    email_verified: true,
                })
                .await
                .unwrap()
                .id
        }

        async fn set_state(pool: &PgPool, user_id: Uuid, count: i32, lock: &str, updated: &str) {
            sqlx::query(&format!(
                "UPDATE user_security SET failed_login_count = $2, locked_until = {lock}, \
                 updated_at = {updated} WHERE user_id = $1"
            ))
            .bind(user_id)
            .bind(count)
            .execute(pool)
            .await
            .unwrap();
        }

        async fn row(pool: &PgPool, user_id: Uuid) -> (i32, Option<OffsetDateTime>) {
            sqlx::query_as("SELECT failed_login_count, locked_until FROM user_security WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(pool)
                .await
                .unwrap()
        }

        #[sqlx::test(migrations = "./migrations")]
        async fn test_expired_lock_cleared_on_check_and_count_kept(pool: PgPool) {
            let service = service(&pool);
            let user_id = create_user(&pool, "expired").await;
            set_state(&pool, user_id, 5, "NOW() - INTERVAL '1 minute'", "NOW()").await;

            assert_eq!(service.is_account_locked(user_id).await.unwrap(), None);
            assert_eq!(row(&pool, user_id).await, (5, None));
        }

        #[sqlx::test(migrations = "./migrations")]
        async fn test_active_lock_reported(pool: PgPool) {
            let service = service(&pool);
            let user_id = create_user(&pool, "locked").await;
            set_state(&pool, user_id, 5, "NOW() + INTERVAL '10 minutes'", "NOW()").await;

            let locked_until = service.is_account_locked(user_id).await.unwrap();
            assert!(locked_until.is_some_and(|until| until > OffsetDateTime::now_utc()));
            assert!(matches!(
                service.ensure_not_locked(user_id).await,
                Err(AppError::AccountLocked { .. })
            ));
            assert_eq!(row(&pool, user_id).await.0, 5);
        }

        #[sqlx::test(migrations = "./migrations")]
        async fn test_decay_decrements_once_per_window_and_skips_locked(pool: PgPool) {
            let service = service(&pool);
            let stale = create_user(&pool, "stale").await;
            let locked = create_user(&pool, "lockedstale").await;
            let recent = create_user(&pool, "recent").await;
            let clean = create_user(&pool, "clean").await;
            set_state(&pool, stale, 3, "NULL", "NOW() - INTERVAL '2 hours'").await;
            set_state(&pool, locked, 6, "NOW() + INTERVAL '1 hour'", "NOW() - INTERVAL '2 hours'").await;
            set_state(&pool, recent, 2, "NULL", "NOW()").await;
            set_state(&pool, clean, 0, "NULL", "NOW() - INTERVAL '2 hours'").await;

            assert_eq!(service.decay_failed_logins().await.unwrap(), 1);
            assert_eq!(row(&pool, stale).await.0, 2);
            assert_eq!(row(&pool, locked).await.0, 6);
            assert_eq!(row(&pool, recent).await.0, 2);
            assert_eq!(row(&pool, clean).await.0, 0);

            // updated_at が更新されたため同じ窓内では再減衰しない
            assert_eq!(service.decay_failed_logins().await.unwrap(), 0);
            assert_eq!(row(&pool, stale).await.0, 2);
        }

        #[sqlx::test(migrations = "./migrations")]
        async fn test_failures_lock_then_success_resets(pool: PgPool) {
            let service = service(&pool);
            let user_id = create_user(&pool, "reader").await;

            let mut outcome = None;
            for _ in 0..5 {
                outcome = Some(service.record_failed_login(user_id).await.unwrap());
            }
            let outcome = outcome.unwrap();
            assert_eq!(outcome.failed_login_count, 5);
            let until = outcome.locked_until.unwrap();
            let expected = OffsetDateTime::now_utc() + Duration::minutes(15);
            assert!((expected - until).abs() < Duration::seconds(5));

            service.record_successful_login(user_id).await.unwrap();
            assert_eq!(row(&pool, user_id).await, (0, None));
            assert_eq!(service.is_account_locked(user_id).await.unwrap(), None);
        }
    }
}
