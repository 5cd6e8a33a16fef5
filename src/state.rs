use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::cookie::AuthCookies;
use crate::error::AppError;
use crate::models::OAuthProvider;
use crate::repositories::{
    PasswordResetTokenRepository, SessionRepository, SocialAccountRepository, UserRepository,
    UserSecurityRepository,
};
use crate::services::crypto::SecretCipher;
use crate::services::oauth::{OAuthProviderClient, OAuthStateCodec};
use crate::services::security::SecuritySettings;
use crate::services::{
    AccountService, AdminService, AuthService, Cache, EmailService, ImpersonationService,
    JwtService, MfaService, OAuthService, PasswordResetService, SecurityService, TotpService,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール（ヘルスチェック用）
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    pub cookies: AuthCookies,
    pub jwt: JwtService,
    pub security: SecurityService,
    pub auth: AuthService,
    pub mfa: MfaService,
    pub oauth: OAuthService,
    pub password_reset: PasswordResetService,
    pub account: AccountService,
    pub admin: AdminService,
    pub impersonation: ImpersonationService,
}

impl AppState {
    pub fn new(db_pool: PgPool, cache: Cache, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let user_repo = UserRepository::new(db_pool.clone());
        let security_repo = UserSecurityRepository::new(db_pool.clone());
        let session_repo = SessionRepository::new(db_pool.clone());
        let social_account_repo = SocialAccountRepository::new(db_pool.clone());
        let token_repo = PasswordResetTokenRepository::new(db_pool.clone());

        let policy = config.lockout_policy().map_err(|e| {
            tracing::error!(error = %e, "ロック閾値設定が不正");
            AppError::Internal(anyhow::anyhow!("invalid lockout thresholds: {e}"))
        })?;

        let jwt = JwtService::new(
            config.jwt_secret.expose_secret(),
            config.jwt_issuer.clone(),
            config.access_token_ttl_secs,
        )?;

        let security = SecurityService::new(
            security_repo.clone(),
            session_repo.clone(),
            cache.clone(),
            policy,
            SecuritySettings {
                security_cache_ttl_secs: config.security_cache_ttl_secs,
                sessions_cache_ttl_secs: config.sessions_cache_ttl_secs,
                failed_login_decay_minutes: config.failed_login_decay_minutes,
                status_history_max_len: config.status_history_max_len,
            },
        );

        let totp = TotpService::new(
            config.totp_issuer.clone(),
            SecretCipher::from_base64(config.encryption_key.expose_secret(), "mfa secret")?,
        );
        let mfa = MfaService::new(
            security_repo.clone(),
            security.clone(),
            totp,
            config.mfa_backup_code_count,
        );

        let auth = AuthService::new(
            user_repo.clone(),
            session_repo,
            security.clone(),
            mfa.clone(),
            jwt.clone(),
            config.refresh_token_ttl_secs,
        );

        let email_service = EmailService::new(config.clone());

        let oauth = OAuthService::new(
            oauth_client(
                OAuthProvider::Google,
                config.google_client_id.as_ref(),
                config.google_client_secret.as_ref().map(|s| s.expose_secret().as_str()),
                config.google_redirect_uri.as_ref(),
            )?,
            oauth_client(
                OAuthProvider::Github,
                config.github_client_id.as_ref(),
                config.github_client_secret.as_ref().map(|s| s.expose_secret().as_str()),
                config.github_redirect_uri.as_ref(),
            )?,
            OAuthStateCodec::new(SecretCipher::from_base64(
                config.oauth_state_secret.expose_secret(),
                "oauth state",
            )?),
            user_repo.clone(),
            social_account_repo.clone(),
            security.clone(),
            auth.clone(),
        );

        let password_reset = PasswordResetService::new(
            user_repo.clone(),
            token_repo,
            security_repo.clone(),
            security.clone(),
            email_service.clone(),
            config.clone(),
        );

        let account = AccountService::new(
            user_repo.clone(),
            security_repo,
            social_account_repo,
            security.clone(),
            email_service,
        );

        let admin = AdminService::new(user_repo.clone(), security.clone());

        let impersonation =
            ImpersonationService::new(user_repo, cache, jwt.clone(), config.impersonation_ttl_secs);

        Ok(Self {
            db_pool,
            cookies: AuthCookies::new(config.cookie_secure),
            config,
            jwt,
            security,
            auth,
            mfa,
            oauth,
            password_reset,
            account,
            admin,
            impersonation,
        })
    }
}

/// 3項目すべて設定されている場合のみクライアントを作成
fn oauth_client(
    provider: OAuthProvider,
    client_id: Option<&String>,
    client_secret: Option<&str>,
    redirect_uri: Option<&String>,
) -> Result<Option<OAuthProviderClient>, AppError> {
    match (client_id, client_secret, redirect_uri) {
        (Some(client_id), Some(client_secret), Some(redirect_uri)) => {
            tracing::info!(provider = provider.as_str(), "OAuth プロバイダを初期化");
            Ok(Some(OAuthProviderClient::new(
                provider,
                client_id.clone(),
                client_secret.to_string(),
                redirect_uri.clone(),
            )?))
        }
        _ => {
            tracing::info!(provider = provider.as_str(), "OAuth 未設定（スキップ）");
            Ok(None)
        }
    }
}
