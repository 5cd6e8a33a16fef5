use uuid::Uuid;

use crate::error::AppError;
use crate::models::{SocialAccount, User};
use crate::repositories::{SocialAccountRepository, UserRepository, UserSecurityRepository};
use crate::services::EmailService;
use crate::services::password::{hash_password, verify_password};
use crate::services::security::SecurityService;

/// ログイン中ユーザー自身のアカウント操作
#[derive(Clone)]
pub struct AccountService {
    user_repo: UserRepository,
    security_repo: UserSecurityRepository,
    social_account_repo: SocialAccountRepository,
    security: SecurityService,
    email_service: EmailService,
}

impl AccountService {
    pub fn new(
        user_repo: UserRepository,
        security_repo: UserSecurityRepository,
        social_account_repo: SocialAccountRepository,
        security: SecurityService,
        email_service: EmailService,
    ) -> Self {
        Self {
            user_repo,
            security_repo,
            social_account_repo,
            security,
            email_service,
        }
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, AppError> {
        self.user_repo
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))
    }

    pub async fn update_profile(&self, user_id: Uuid, display_name: &str) -> Result<User, AppError> {
        let user = self
            .user_repo
            .update_profile(user_id, display_name.trim())
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))?;
        tracing::info!(user_id = %user_id, "プロフィール更新");
        Ok(user)
    }

    pub async fn linked_accounts(&self, user_id: Uuid) -> Result<Vec<SocialAccount>, AppError> {
        Ok(self.social_account_repo.find_by_user_id(user_id).await?)
    }

    /// パスワード変更（現在のセッション以外は無効化）
    ///
    /// ソーシャルログイン専用ユーザーは現在のパスワードなしで初回設定できる
    ///
    /// # Returns
    /// 無効化したセッション数
    pub async fn change_password(
        &self,
        user: &User,
        current_password: Option<&str>,
        new_password: &str,
        current_session: Option<Uuid>,
    ) -> Result<u64, AppError> {
        if let Some(hash) = user.password_hash.as_deref() {
            let current = current_password.ok_or_else(|| {
                AppError::Validation("現在のパスワードは必須です".to_string())
            })?;
            if !verify_password(current, hash)? {
                tracing::warn!(user_id = %user.id, "パスワード変更失敗: 現在のパスワード不一致");
                return Err(AppError::Authentication(
                    "現在のパスワードが正しくありません".to_string(),
                ));
            }
            if current == new_password {
                return Err(AppError::Validation(
                    "新しいパスワードは現在のパスワードと異なる必要があります".to_string(),
                ));
            }
        }

        let password_hash = hash_password(new_password)?;
        self.user_repo.update_password(user.id, &password_hash).await?;
        self.security_repo.mark_password_changed(user.id).await?;
        let revoked = self
            .security
            .revoke_other_sessions(user.id, current_session, "password_changed")
            .await?;
        self.security.invalidate_user(user.id).await;

        if let Err(e) = self.email_service.send_password_changed_email(&user.email).await {
            tracing::warn!(user_id = %user.id, error = %e, "パスワード変更通知の送信失敗");
        }

        tracing::info!(user_id = %user.id, revoked = revoked, "パスワード変更完了");
        Ok(revoked)
    }
}
