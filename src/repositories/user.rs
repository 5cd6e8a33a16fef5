use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{User, UserRole, UserStatus};

/// ユーザー作成パラメータ
#[derive(Debug)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub display_name: &'a str,
    /// None の場合はソーシャルログイン専用ユーザー
    pub password_hash: Option<&'a str>,
    pub email_verified: bool,
}

/// 一覧検索条件
#[derive(Debug, Default)]
pub struct UserFilter {
    pub search: Option<String>,
    pub role: Option<UserRole>,
    pub status: Option<UserStatus>,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// メールアドレスでユーザーを検索
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, display_name, password_hash, role, status,
                   email_verified, last_login_at, created_at, updated_at
            FROM users
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーIDでユーザーを検索
    pub async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, display_name, password_hash, role, status,
                   email_verified, last_login_at, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザー名が使用済みか
    pub async fn username_exists(&self, username: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM users WHERE LOWER(username) = LOWER($1))
            "#,
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
    }

    /// ユーザーとセキュリティ行を同一トランザクションで作成
    ///
    /// # Errors
    /// - UNIQUE制約違反時: `users_email_key` / `users_username_key`
    ///   （`AppError` への変換で EmailAlreadyExists / UsernameAlreadyExists になる）
    pub async fn create_user(&self, new_user: NewUser<'_>) -> Result<User, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, username, display_name, password_hash, email_verified)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, email, username, display_name, password_hash, role, status,
                      email_verified, last_login_at, created_at, updated_at
            "#,
        )
        .bind(new_user.email)
        .bind(new_user.username)
        .bind(new_user.display_name)
        .bind(new_user.password_hash)
        .bind(new_user.email_verified)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_security (user_id)
            VALUES ($1)
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(user)
    }

    /// ユーザーのパスワードを更新
    ///
    /// # Note
    /// password_hash はログに出力しないこと
    pub async fn update_password(
        &self,
        user_id: Uuid,
        new_password_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_password_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        display_name: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET display_name = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, email, username, display_name, password_hash, role, status,
                      email_verified, last_login_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn update_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, email, username, display_name, password_hash, role, status,
                      email_verified, last_login_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn update_role(
        &self,
        user_id: Uuid,
        role: UserRole,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET role = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, email, username, display_name, password_hash, role, status,
                      email_verified, last_login_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(role)
        .fetch_optional(&self.pool)
        .await
    }

    /// ソーシャルログインでメールが確認できた場合に検証済みにする
    pub async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET email_verified = true,
                status = CASE WHEN status = 'PENDING_VERIFICATION' THEN 'ACTIVE'::user_status ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn touch_last_login(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_login_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 条件に一致するユーザーをページ単位で取得（作成日時の降順）
    pub async fn list(
        &self,
        filter: &UserFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<User>, i64), sqlx::Error> {
        let pattern = filter.search.as_ref().map(|s| format!("%{}%", s.trim()));

        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, display_name, password_hash, role, status,
                   email_verified, last_login_at, created_at, updated_at
            FROM users
            WHERE ($1::text IS NULL OR email ILIKE $1 OR username ILIKE $1 OR display_name ILIKE $1)
              AND ($2::user_role IS NULL OR role = $2)
              AND ($3::user_status IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(pattern.as_deref())
        .bind(filter.role)
        .bind(filter.status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM users
            WHERE ($1::text IS NULL OR email ILIKE $1 OR username ILIKE $1 OR display_name ILIKE $1)
              AND ($2::user_role IS NULL OR role = $2)
              AND ($3::user_status IS NULL OR status = $3)
            "#,
        )
        .bind(pattern.as_deref())
        .bind(filter.role)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        Ok((users, total))
    }
}
