use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{OAuthProvider, SocialAccount};

#[derive(Clone)]
pub struct SocialAccountRepository {
    pool: PgPool,
}

impl SocialAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// プロバイダとプロバイダIDで紐付けを検索
    pub async fn find_by_provider_and_id(
        &self,
        provider: OAuthProvider,
        provider_id: &str,
    ) -> Result<Option<SocialAccount>, sqlx::Error> {
        sqlx::query_as::<_, SocialAccount>(
            r#"
            SELECT id, user_id, provider, provider_id, email, created_at
            FROM social_accounts
            WHERE provider = $1 AND provider_id = $2
            "#,
        )
        .bind(provider)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーに紐付くソーシャルアカウント一覧
    pub async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<SocialAccount>, sqlx::Error> {
        sqlx::query_as::<_, SocialAccount>(
            r#"
            SELECT id, user_id, provider, provider_id, email, created_at
            FROM social_accounts
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// # Errors
    /// - UNIQUE制約違反時: 同一プロバイダ・プロバイダIDの組み合わせが既に存在
    pub async fn create(
        &self,
        user_id: Uuid,
        provider: OAuthProvider,
        provider_id: &str,
        email: Option<&str>,
    ) -> Result<SocialAccount, sqlx::Error> {
        sqlx::query_as::<_, SocialAccount>(
            r#"
            INSERT INTO social_accounts (user_id, provider, provider_id, email)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, provider, provider_id, email, created_at
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(provider_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await
    }
}
