use sqlx::PgPool;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::UserSecurity;
use crate::models::user_security::{StatusHistoryEntry, append_status_history};

#[derive(Clone)]
pub struct UserSecurityRepository {
    pool: PgPool,
}

impl UserSecurityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserSecurity>, sqlx::Error> {
        sqlx::query_as::<_, UserSecurity>(
            r#"
            SELECT user_id, failed_login_count, locked_until, mfa_enabled, mfa_secret_encrypted,
                   mfa_backup_codes, status_history, force_logout_at, password_changed_at, updated_at
            FROM user_security
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 失敗回数を加算して更新後の行を返す
    ///
    /// # Note
    /// 読み取りと書き込みを1文で行い、同時失敗時の加算漏れを防ぐ
    pub async fn increment_failed_login(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserSecurity>, sqlx::Error> {
        sqlx::query_as::<_, UserSecurity>(
            r#"
            UPDATE user_security
            SET failed_login_count = failed_login_count + 1, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, failed_login_count, locked_until, mfa_enabled, mfa_secret_encrypted,
                      mfa_backup_codes, status_history, force_logout_at, password_changed_at, updated_at
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn set_locked_until(
        &self,
        user_id: Uuid,
        locked_until: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET locked_until = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ログイン成功時: 失敗回数とロックをリセット
    pub async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET failed_login_count = 0, locked_until = NULL, updated_at = NOW()
            WHERE user_id = $1
              AND (failed_login_count <> 0 OR locked_until IS NOT NULL)
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 期限切れロックを解除（失敗回数は保持）
    ///
    /// # Returns
    /// 解除した場合 true
    pub async fn clear_expired_lock(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_security
            SET locked_until = NULL
            WHERE user_id = $1 AND locked_until IS NOT NULL AND locked_until <= $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 失敗回数の減衰
    ///
    /// cutoff より前に更新され、ロック中でない行の失敗回数を1減らす
    ///
    /// # Returns
    /// 更新された行数
    pub async fn decay_failed_logins(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_security
            SET failed_login_count = failed_login_count - 1, updated_at = NOW()
            WHERE failed_login_count > 0
              AND (locked_until IS NULL OR locked_until <= $2)
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn set_force_logout_at(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET force_logout_at = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// パスワード変更を記録し、ロック状態もリセット
    pub async fn mark_password_changed(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET password_changed_at = NOW(), failed_login_count = 0, locked_until = NULL,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// ステータス履歴を追記（最大件数を超えた分は古い順に削除）
    pub async fn append_status_history(
        &self,
        user_id: Uuid,
        entry: StatusHistoryEntry,
        max_len: usize,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Json(mut history) = sqlx::query_scalar::<_, Json<Vec<StatusHistoryEntry>>>(
            r#"
            SELECT status_history
            FROM user_security
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        append_status_history(&mut history, entry, max_len);

        sqlx::query(
            r#"
            UPDATE user_security
            SET status_history = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(Json(history))
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    /// MFA 設定開始: 暗号化シークレットを保存（有効化は検証成功後）
    pub async fn set_pending_mfa_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET mfa_secret_encrypted = $2, mfa_enabled = false, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn enable_mfa(
        &self,
        user_id: Uuid,
        backup_code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET mfa_enabled = true, mfa_backup_codes = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn disable_mfa(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET mfa_enabled = false, mfa_secret_encrypted = NULL, mfa_backup_codes = '{}',
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        backup_code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE user_security
            SET mfa_backup_codes = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// バックアップコードを消費（一致するハッシュがあれば削除）
    ///
    /// # Returns
    /// 消費できた場合 true
    pub async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_security
            SET mfa_backup_codes = array_remove(mfa_backup_codes, $2), updated_at = NOW()
            WHERE user_id = $1 AND $2 = ANY(mfa_backup_codes)
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
