use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::Session;

/// セッション作成パラメータ
#[derive(Debug)]
pub struct NewSession<'a> {
    pub user_id: Uuid,
    pub refresh_token_hash: &'a str,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new_session: NewSession<'_>) -> Result<Session, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (user_id, refresh_token_hash, ip_address, user_agent, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, refresh_token_hash, ip_address, user_agent, created_at,
                      last_active_at, expires_at, revoked_at, revoked_reason
            "#,
        )
        .bind(new_session.user_id)
        .bind(new_session.refresh_token_hash)
        .bind(new_session.ip_address)
        .bind(new_session.user_agent)
        .bind(new_session.expires_at)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn find_by_refresh_token_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, refresh_token_hash, ip_address, user_agent, created_at,
                   last_active_at, expires_at, revoked_at, revoked_reason
            FROM sessions
            WHERE refresh_token_hash = $1
            "#,
        )
        .bind(refresh_token_hash)
        .fetch_optional(&self.pool)
        .await
    }

    /// 有効なセッション一覧（最終利用の新しい順）
    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, refresh_token_hash, ip_address, user_agent, created_at,
                   last_active_at, expires_at, revoked_at, revoked_reason
            FROM sessions
            WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > NOW()
            ORDER BY last_active_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// ログイン履歴（無効化済みを含む、作成日時の新しい順）
    pub async fn list_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Session>, i64), sqlx::Error> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, refresh_token_hash, ip_address, user_agent, created_at,
                   last_active_at, expires_at, revoked_at, revoked_reason
            FROM sessions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM sessions WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((sessions, total))
    }

    /// リフレッシュトークンをローテーション
    pub async fn rotate_refresh_token(
        &self,
        session_id: Uuid,
        refresh_token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET refresh_token_hash = $2, expires_at = $3, last_active_at = NOW()
            WHERE id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(refresh_token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// セッションを無効化
    ///
    /// # Returns
    /// 無効化した場合 true（既に無効 / 他ユーザーのセッションなら false）
    pub async fn revoke(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET revoked_at = NOW(), revoked_reason = $3
            WHERE id = $1 AND user_id = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// ユーザーの全セッションを無効化（except を除く）
    ///
    /// # Returns
    /// 無効化した件数
    pub async fn revoke_all(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        reason: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET revoked_at = NOW(), revoked_reason = $3
            WHERE user_id = $1
              AND revoked_at IS NULL
              AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(user_id)
        .bind(except)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
