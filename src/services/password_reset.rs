use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::{PasswordResetTokenRepository, UserRepository, UserSecurityRepository};
use crate::services::EmailService;
use crate::services::auth::normalize_email;
use crate::services::password::hash_password;
use crate::services::security::SecurityService;
use crate::services::token::{generate_opaque_token, hash_token};

const DEFAULT_RESET_URL_BASE: &str = "http://localhost:3000/password-reset";

/// リセットURLを構築
fn build_reset_url(base: Option<&str>, token: &str) -> String {
    let base = base.unwrap_or(DEFAULT_RESET_URL_BASE);
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}token={}", urlencoding::encode(token))
}

/// パスワードリセットサービス
#[derive(Clone)]
pub struct PasswordResetService {
    user_repo: UserRepository,
    token_repo: PasswordResetTokenRepository,
    security_repo: UserSecurityRepository,
    security: SecurityService,
    email_service: EmailService,
    config: Arc<Config>,
}

impl PasswordResetService {
    pub fn new(
        user_repo: UserRepository,
        token_repo: PasswordResetTokenRepository,
        security_repo: UserSecurityRepository,
        security: SecurityService,
        email_service: EmailService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            user_repo,
            token_repo,
            security_repo,
            security,
            email_service,
            config,
        }
    }

    /// パスワードリセットをリクエスト
    ///
    /// # Security
    /// - ユーザーが存在しない場合も常に成功を返す（情報漏洩防止）
    /// - トークン（平文）はログに出力しない
    pub async fn request_reset(&self, email: &str) -> Result<(), AppError> {
        let email = normalize_email(email);

        let Some(user) = self.user_repo.find_by_email(&email).await? else {
            tracing::info!("パスワードリセット: ユーザー不在（成功レスポンス返却）");
            return Ok(());
        };

        if !user.status.can_login() {
            tracing::info!(user_id = %user.id, status = ?user.status, "パスワードリセット: 無効なアカウント状態（送信なし）");
            return Ok(());
        }

        let token = generate_opaque_token();
        let expires_at = OffsetDateTime::now_utc()
            + Duration::seconds(self.config.password_reset_token_ttl_secs);

        self.token_repo
            .create(user.id, &hash_token(&token), expires_at)
            .await?;

        let reset_url = build_reset_url(self.config.password_reset_url_base.as_deref(), &token);
        self.email_service
            .send_password_reset_email(&user.email, &reset_url)
            .await?;

        tracing::info!(user_id = %user.id, "パスワードリセットメール送信完了");
        Ok(())
    }

    /// トークンを検証してパスワードを再設定
    ///
    /// 全セッションを無効化し、それ以前のアクセストークンも拒否させる
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AppError> {
        let reset_token = self
            .token_repo
            .find_by_token_hash(&hash_token(token))
            .await?
            .ok_or(AppError::TokenNotFound)?;

        if !reset_token.is_usable_at(OffsetDateTime::now_utc()) {
            tracing::warn!(token_id = %reset_token.id, "使用済みまたは期限切れトークン");
            return Err(AppError::TokenExpired);
        }

        // 未使用の場合のみ更新される（二重使用の検出）
        if !self.token_repo.mark_as_used(reset_token.id).await? {
            tracing::warn!(token_id = %reset_token.id, "トークン二重使用");
            return Err(AppError::TokenExpired);
        }

        let user_id = reset_token.user_id;
        let password_hash = hash_password(new_password)?;
        self.user_repo.update_password(user_id, &password_hash).await?;
        self.security_repo.mark_password_changed(user_id).await?;
        self.security
            .force_logout_all(user_id, "password_reset")
            .await?;

        if let Some(user) = self.user_repo.find_by_id(user_id).await? {
            if let Err(e) = self.email_service.send_password_changed_email(&user.email).await {
                tracing::warn!(user_id = %user_id, error = %e, "パスワード変更通知の送信失敗");
            }
        }

        tracing::info!(user_id = %user_id, "パスワードリセット完了");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_reset_url_default() {
        assert_eq!(
            build_reset_url(None, "abc"),
            "http://localhost:3000/password-reset?token=abc"
        );
    }

    #[test]
    fn test_build_reset_url_with_query() {
        assert_eq!(
            build_reset_url(Some("https://ownverso.app/reset?lang=ja"), "a-b_c"),
            "https://ownverso.app/reset?lang=ja&token=a-b_c"
        );
    }

    #[test]
    fn test_build_reset_url_encodes_token() {
        assert_eq!(
            build_reset_url(Some("https://ownverso.app/reset"), "a+b/c"),
            "https://ownverso.app/reset?token=a%2Bb%2Fc"
        );
    }
}
