use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::User;
use crate::repositories::{NewSession, NewUser, SessionRepository, UserRepository};
use crate::services::mfa::MfaService;
use crate::services::password::{dummy_verify, hash_password, verify_password};
use crate::services::security::SecurityService;
use crate::services::token::{JwtService, generate_opaque_token, hash_token};

const INVALID_CREDENTIALS: &str = "メールアドレスまたはパスワードが正しくありません";

/// セッション作成時に記録するクライアント情報
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// 発行済みトークン一式
///
/// # Security
/// refresh_token は平文。DB にはハッシュのみ保存し、ログには出さない
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub access_token_expires_at: OffsetDateTime,
    #[serde(skip)]
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_token_expires_at: OffsetDateTime,
    pub session_id: Uuid,
}

/// ログイン結果
#[derive(Debug)]
pub enum LoginOutcome {
    /// パスワードは正しいが MFA コードが必要
    MfaRequired { user_id: Uuid },
    Authenticated { user: User, tokens: AuthTokens },
}

/// メールアドレスは小文字・前後空白なしで扱う
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 登録・ログイン・トークン更新・ログアウト
#[derive(Clone)]
pub struct AuthService {
    user_repo: UserRepository,
    session_repo: SessionRepository,
    security: SecurityService,
    mfa: MfaService,
    jwt: JwtService,
    refresh_ttl: Duration,
}

impl AuthService {
    pub fn new(
        user_repo: UserRepository,
        session_repo: SessionRepository,
        security: SecurityService,
        mfa: MfaService,
        jwt: JwtService,
        refresh_ttl_secs: i64,
    ) -> Self {
        Self {
            user_repo,
            session_repo,
            security,
            mfa,
            jwt,
            refresh_ttl: Duration::seconds(refresh_ttl_secs),
        }
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        display_name: Option<&str>,
        password: &str,
    ) -> Result<User, AppError> {
        let email = normalize_email(email);
        let username = username.trim();

        if self.user_repo.username_exists(username).await? {
            return Err(AppError::UsernameAlreadyExists);
        }

        let password_hash = hash_password(password)?;
        let user = self
            .user_repo
            .create_user(NewUser {
                email: &email,
                username,
                display_name: display_name.map(str::trim).unwrap_or(username),
                password_hash: Some(&password_hash),
                email_verified: false,
            })
            .await?;

        tracing::info!(user_id = %user.id, "ユーザー登録完了");
        Ok(user)
    }

    /// パスワードログイン
    ///
    /// 1. ユーザー検索（不在時もダミー検証で応答時間を揃える）
    /// 2. ステータス確認
    /// 3. ロック確認（期限切れロックはここで解除）
    /// 4. パスワード検証（失敗時は失敗回数を記録）
    /// 5. MFA 検証（有効時のみ、失敗も失敗回数に数える）
    /// 6. 失敗回数リセット・セッション作成・トークン発行
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        mfa_code: Option<&str>,
        client: &ClientInfo,
    ) -> Result<LoginOutcome, AppError> {
        let email = normalize_email(email);

        let Some(user) = self.user_repo.find_by_email(&email).await? else {
            dummy_verify(password);
            tracing::warn!("ログイン失敗: ユーザー不在");
            return Err(AppError::Authentication(INVALID_CREDENTIALS.to_string()));
        };

        if !user.status.can_login() {
            tracing::warn!(user_id = %user.id, status = ?user.status, "ログイン拒否: 無効なアカウント状態");
            return Err(AppError::AccountInactive(user.status));
        }

        self.security.ensure_not_locked(user.id).await?;

        let password_ok = match user.password_hash.as_deref() {
            Some(hash) => verify_password(password, hash)?,
            None => {
                dummy_verify(password);
                false
            }
        };
        if !password_ok {
            self.security.record_failed_login(user.id).await?;
            tracing::warn!(user_id = %user.id, "ログイン失敗: パスワード不一致");
            return Err(AppError::Authentication(INVALID_CREDENTIALS.to_string()));
        }

        let security = self.security.get_security(user.id).await?;
        if security.mfa_enabled {
            let Some(code) = mfa_code.filter(|code| !code.trim().is_empty()) else {
                tracing::info!(user_id = %user.id, "MFAコード要求");
                return Ok(LoginOutcome::MfaRequired { user_id: user.id });
            };
            if !self.mfa.verify(&security, code).await? {
                self.security.record_failed_login(user.id).await?;
                tracing::warn!(user_id = %user.id, "ログイン失敗: MFAコード不一致");
                return Err(AppError::MfaInvalid);
            }
        }

        let tokens = self.complete_login(&user, client).await?;
        Ok(LoginOutcome::Authenticated { user, tokens })
    }

    /// 本人確認済みユーザーのログイン処理（パスワード・ソーシャル共通）
    pub async fn complete_login(&self, user: &User, client: &ClientInfo) -> Result<AuthTokens, AppError> {
        self.security.record_successful_login(user.id).await?;
        let tokens = self.create_session(user, client).await?;
        self.user_repo.touch_last_login(user.id).await?;

        tracing::info!(user_id = %user.id, session_id = %tokens.session_id, "ログイン成功");
        Ok(tokens)
    }

    async fn create_session(&self, user: &User, client: &ClientInfo) -> Result<AuthTokens, AppError> {
        let refresh_token = generate_opaque_token();
        let refresh_token_expires_at = OffsetDateTime::now_utc() + self.refresh_ttl;

        let session = self
            .session_repo
            .create(NewSession {
                user_id: user.id,
                refresh_token_hash: &hash_token(&refresh_token),
                ip_address: client.ip_address.as_deref(),
                user_agent: client.user_agent.as_deref(),
                expires_at: refresh_token_expires_at,
            })
            .await?;
        self.security.invalidate_sessions(user.id).await;

        let access = self.jwt.issue_access_token(user, session.id)?;

        Ok(AuthTokens {
            access_token: access.token,
            access_token_expires_at: access.expires_at,
            refresh_token,
            refresh_token_expires_at,
            session_id: session.id,
        })
    }

    /// リフレッシュトークンをローテーションして新しいトークンを発行
    pub async fn refresh(&self, refresh_token: &str) -> Result<(User, AuthTokens), AppError> {
        let session = self
            .session_repo
            .find_by_refresh_token_hash(&hash_token(refresh_token))
            .await?
            .ok_or(AppError::TokenInvalid)?;

        let now = OffsetDateTime::now_utc();
        if !session.is_active_at(now) {
            tracing::warn!(session_id = %session.id, "無効なセッションでのトークン更新");
            return Err(AppError::SessionRevoked);
        }

        let overview = self.security.get_overview(session.user_id).await?;
        if overview
            .force_logout_at
            .is_some_and(|at| session.created_at < at)
        {
            self.security
                .revoke_session(session.user_id, session.id, "force_logout")
                .await?;
            return Err(AppError::SessionRevoked);
        }

        let user = self
            .user_repo
            .find_by_id(session.user_id)
            .await?
            .ok_or(AppError::TokenInvalid)?;
        if !user.status.can_login() {
            return Err(AppError::AccountInactive(user.status));
        }

        let new_refresh_token = generate_opaque_token();
        let refresh_token_expires_at = now + self.refresh_ttl;
        self.session_repo
            .rotate_refresh_token(session.id, &hash_token(&new_refresh_token), refresh_token_expires_at)
            .await?;
        self.security.invalidate_sessions(user.id).await;

        let access = self.jwt.issue_access_token(&user, session.id)?;

        tracing::debug!(user_id = %user.id, session_id = %session.id, "トークン更新");

        Ok((
            user,
            AuthTokens {
                access_token: access.token,
                access_token_expires_at: access.expires_at,
                refresh_token: new_refresh_token,
                refresh_token_expires_at,
                session_id: session.id,
            },
        ))
    }

    /// 現在のセッションを無効化
    pub async fn logout(&self, user_id: Uuid, session_id: Uuid) -> Result<(), AppError> {
        self.security
            .revoke_session(user_id, session_id, "logout")
            .await?;
        tracing::info!(user_id = %user_id, session_id = %session_id, "ログアウト");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Reader@Example.COM "), "reader@example.com");
    }

    #[test]
    fn test_tokens_serialization_hides_refresh_token() {
        let now = OffsetDateTime::now_utc();
        let tokens = AuthTokens {
            access_token: "access".to_string(),
            access_token_expires_at: now,
            refresh_token: "refresh-secret".to_string(),
            refresh_token_expires_at: now,
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&tokens).unwrap();
        assert_eq!(json["accessToken"], "access");
        assert!(json.get("refreshToken").is_none());
        assert!(!json.to_string().contains("refresh-secret"));
    }
}
