//! ソーシャルログイン（Google / GitHub）
//!
//! 認可 URL 生成とコード交換は `oauth2`、ユーザー情報取得は `reqwest` で行う。
//!
//! # Security
//! - client_secret・アクセストークンはログに出力しない
//! - state は AES-256-GCM で暗号化し、プロバイダ・nonce・発行時刻を含める
//! - nonce は Cookie にも保存し、コールバック時に一致を確認する（CSRF 対策）

use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::models::{OAuthProvider, User};
use crate::repositories::{NewUser, SocialAccountRepository, UserRepository};
use crate::services::auth::{AuthService, AuthTokens, ClientInfo, normalize_email};
use crate::services::crypto::SecretCipher;
use crate::services::security::SecurityService;
use crate::services::token::generate_opaque_token;

/// state の有効期間（秒）
const STATE_MAX_AGE_SECS: i64 = 10 * 60;
const USER_AGENT: &str = "ownverso-auth";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

const GITHUB_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";
const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

/// プロバイダから取得したユーザー情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProfile {
    pub provider_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: Option<String>,
    #[serde(default)]
    verified_email: bool,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// 暗号化して state パラメータに載せる内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub provider: OAuthProvider,
    pub nonce: String,
    pub issued_at: i64,
}

impl OAuthState {
    fn new(provider: OAuthProvider) -> Self {
        Self {
            provider,
            nonce: generate_opaque_token(),
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// プロバイダ・nonce・有効期間を検証
    fn validate(
        &self,
        provider: OAuthProvider,
        cookie_nonce: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), AppError> {
        if self.provider != provider {
            tracing::warn!(expected = provider.as_str(), actual = self.provider.as_str(), "stateのプロバイダ不一致");
            return Err(AppError::OAuthStateInvalid);
        }
        if cookie_nonce != Some(self.nonce.as_str()) {
            tracing::warn!("stateのnonce不一致（CSRFの可能性）");
            return Err(AppError::OAuthStateInvalid);
        }
        let age = now.unix_timestamp() - self.issued_at;
        if !(0..=STATE_MAX_AGE_SECS).contains(&age) {
            tracing::warn!(age_secs = age, "state期限切れ");
            return Err(AppError::OAuthStateInvalid);
        }
        Ok(())
    }
}

/// state の暗号化・復号
#[derive(Clone)]
pub struct OAuthStateCodec {
    cipher: SecretCipher,
}

impl OAuthStateCodec {
    pub fn new(cipher: SecretCipher) -> Self {
        Self { cipher }
    }

    pub fn encode(&self, state: &OAuthState) -> Result<String, AppError> {
        let json = serde_json::to_vec(state).map_err(|e| AppError::Internal(e.into()))?;
        self.cipher.seal_url_safe(&json)
    }

    pub fn decode(&self, sealed: &str) -> Result<OAuthState, AppError> {
        let plaintext = self.cipher.open_url_safe(sealed)?.map_err(|e| {
            tracing::warn!(error = %e, "state復号エラー（改ざんの可能性）");
            AppError::OAuthStateInvalid
        })?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            tracing::warn!(error = %e, "stateのデシリアライズエラー");
            AppError::OAuthStateInvalid
        })
    }
}

/// プロバイダごとの OAuth クライアント
#[derive(Clone)]
pub struct OAuthProviderClient {
    provider: OAuthProvider,
    client: BasicClient,
    http_client: reqwest::Client,
}

impl OAuthProviderClient {
    /// # Security
    /// `client_secret` は機密情報のため、ログ出力禁止
    pub fn new(
        provider: OAuthProvider,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Result<Self, AppError> {
        let (auth_url, token_url) = match provider {
            OAuthProvider::Google => (GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL),
            OAuthProvider::Github => (GITHUB_AUTH_URL, GITHUB_TOKEN_URL),
        };

        let invalid_url = |e: oauth2::url::ParseError| {
            tracing::error!(error = %e, provider = provider.as_str(), "OAuth URL設定エラー");
            AppError::Internal(anyhow::anyhow!("invalid oauth url"))
        };

        let client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(auth_url.to_string()).map_err(invalid_url)?,
            Some(TokenUrl::new(token_url.to_string()).map_err(invalid_url)?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_uri).map_err(invalid_url)?);

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            provider,
            client,
            http_client,
        })
    }

    pub fn authorize_url(&self, state: String) -> String {
        let request = self.client.authorize_url(|| CsrfToken::new(state));
        let request = match self.provider {
            OAuthProvider::Google => request
                .add_scope(Scope::new("openid".to_string()))
                .add_scope(Scope::new("email".to_string()))
                .add_scope(Scope::new("profile".to_string()))
                .add_extra_param("prompt", "select_account"),
            OAuthProvider::Github => request
                .add_scope(Scope::new("read:user".to_string()))
                .add_scope(Scope::new("user:email".to_string())),
        };
        let (url, _) = request.url();
        url.to_string()
    }

    /// 認可コードをアクセストークンに交換
    pub async fn exchange_code(&self, code: &str) -> Result<String, AppError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, provider = self.provider.as_str(), "トークン交換エラー");
                AppError::OAuthProviderError
            })?;
        Ok(token.access_token().secret().clone())
    }

    pub async fn fetch_profile(&self, access_token: &str) -> Result<OAuthProfile, AppError> {
        match self.provider {
            OAuthProvider::Google => self.fetch_google_profile(access_token).await,
            OAuthProvider::Github => self.fetch_github_profile(access_token).await,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, AppError> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, url = %url, "ユーザー情報API通信エラー");
                AppError::OAuthProviderError
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, url = %url, "ユーザー情報取得エラー");
            return Err(AppError::OAuthError(format!("userinfo request failed: {status}")));
        }

        response.json::<T>().await.map_err(|e| {
            tracing::error!(error = ?e, url = %url, "ユーザー情報レスポンスのパースエラー");
            AppError::OAuthError("invalid userinfo response".to_string())
        })
    }

    async fn fetch_google_profile(&self, access_token: &str) -> Result<OAuthProfile, AppError> {
        let info: GoogleUserInfo = self.get_json(GOOGLE_USERINFO_URL, access_token).await?;
        Ok(OAuthProfile {
            provider_id: info.id,
            email: info.email,
            email_verified: info.verified_email,
            name: info.name,
            login: None,
        })
    }

    async fn fetch_github_profile(&self, access_token: &str) -> Result<OAuthProfile, AppError> {
        let user: GitHubUser = self.get_json(GITHUB_USER_URL, access_token).await?;
        // 公開メールは未検証の可能性があるため emails API の primary + verified を使う
        let emails: Vec<GitHubEmail> = self.get_json(GITHUB_EMAILS_URL, access_token).await?;
        let primary = pick_github_email(&emails);

        Ok(OAuthProfile {
            provider_id: user.id.to_string(),
            email: primary.map(|e| e.email.clone()),
            email_verified: primary.is_some(),
            name: user.name,
            login: Some(user.login),
        })
    }
}

/// 検証済みの primary、なければ検証済みの先頭
fn pick_github_email(emails: &[GitHubEmail]) -> Option<&GitHubEmail> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .or_else(|| emails.iter().find(|e| e.verified))
}

/// メールアドレス・ログイン名からユーザー名の候補を作る
pub fn username_candidate(profile: &OAuthProfile) -> String {
    let source = profile
        .login
        .as_deref()
        .or_else(|| profile.email.as_deref().and_then(|e| e.split('@').next()))
        .unwrap_or("user");

    let mut candidate: String = source
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(24)
        .collect::<String>()
        .to_lowercase();
    if candidate.len() < 3 {
        candidate = format!("user{candidate}");
    }
    candidate
}

/// 認可開始の結果（nonce は Cookie に保存する）
#[derive(Debug)]
pub struct OAuthStart {
    pub authorize_url: String,
    pub nonce: String,
}

/// ソーシャルログインのユースケース
#[derive(Clone)]
pub struct OAuthService {
    google: Option<OAuthProviderClient>,
    github: Option<OAuthProviderClient>,
    state_codec: OAuthStateCodec,
    user_repo: UserRepository,
    social_account_repo: SocialAccountRepository,
    security: SecurityService,
    auth: AuthService,
}

impl OAuthService {
    pub fn new(
        google: Option<OAuthProviderClient>,
        github: Option<OAuthProviderClient>,
        state_codec: OAuthStateCodec,
        user_repo: UserRepository,
        social_account_repo: SocialAccountRepository,
        security: SecurityService,
        auth: AuthService,
    ) -> Self {
        Self {
            google,
            github,
            state_codec,
            user_repo,
            social_account_repo,
            security,
            auth,
        }
    }

    fn client(&self, provider: OAuthProvider) -> Result<&OAuthProviderClient, AppError> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Github => self.github.as_ref(),
        }
        .ok_or_else(|| AppError::OAuthNotConfigured(provider.as_str().to_string()))
    }

    pub fn start(&self, provider: OAuthProvider) -> Result<OAuthStart, AppError> {
        let client = self.client(provider)?;
        let state = OAuthState::new(provider);
        let sealed = self.state_codec.encode(&state)?;

        tracing::info!(provider = provider.as_str(), "OAuth認可開始");

        Ok(OAuthStart {
            authorize_url: client.authorize_url(sealed),
            nonce: state.nonce,
        })
    }

    /// コールバック処理: state 検証 → コード交換 → ユーザー解決 → ログイン
    pub async fn callback(
        &self,
        provider: OAuthProvider,
        code: &str,
        state: &str,
        cookie_nonce: Option<&str>,
        client_info: &ClientInfo,
    ) -> Result<(User, AuthTokens), AppError> {
        let client = self.client(provider)?;

        self.state_codec
            .decode(state)?
            .validate(provider, cookie_nonce, OffsetDateTime::now_utc())?;

        let access_token = client.exchange_code(code).await?;
        let profile = client.fetch_profile(&access_token).await?;

        let user = self.resolve_user(provider, &profile).await?;

        if !user.status.can_login() {
            tracing::warn!(user_id = %user.id, status = ?user.status, "OAuthログイン拒否: 無効なアカウント状態");
            return Err(AppError::AccountInactive(user.status));
        }
        self.security.ensure_not_locked(user.id).await?;

        let tokens = self.auth.complete_login(&user, client_info).await?;
        tracing::info!(user_id = %user.id, provider = provider.as_str(), "OAuthログイン成功");
        Ok((user, tokens))
    }

    /// 既存の紐付け → 検証済みメールでの紐付け → 新規作成 の順で解決
    async fn resolve_user(
        &self,
        provider: OAuthProvider,
        profile: &OAuthProfile,
    ) -> Result<User, AppError> {
        if let Some(account) = self
            .social_account_repo
            .find_by_provider_and_id(provider, &profile.provider_id)
            .await?
        {
            return self
                .user_repo
                .find_by_id(account.user_id)
                .await?
                .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()));
        }

        let email = profile
            .email
            .as_deref()
            .map(normalize_email)
            .ok_or_else(|| {
                AppError::OAuthError("プロバイダからメールアドレスを取得できませんでした".to_string())
            })?;

        if let Some(existing) = self.user_repo.find_by_email(&email).await? {
            if !profile.email_verified {
                tracing::warn!(user_id = %existing.id, provider = provider.as_str(), "未検証メールでの紐付けを拒否");
                return Err(AppError::EmailAlreadyExists);
            }
            self.social_account_repo
                .create(existing.id, provider, &profile.provider_id, Some(&email))
                .await?;
            if !existing.email_verified {
                self.user_repo.mark_email_verified(existing.id).await?;
            }
            tracing::info!(user_id = %existing.id, provider = provider.as_str(), "既存ユーザーにソーシャルアカウントを紐付け");
            return self
                .user_repo
                .find_by_id(existing.id)
                .await?
                .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()));
        }

        let username = self.available_username(profile).await?;
        let display_name = profile.name.clone().unwrap_or_else(|| username.clone());
        let user = self
            .user_repo
            .create_user(NewUser {
                email: &email,
                username: &username,
                display_name: &display_name,
                password_hash: None,
                email_verified: profile.email_verified,
            })
            .await?;
        self.social_account_repo
            .create(user.id, provider, &profile.provider_id, Some(&email))
            .await?;

        tracing::info!(user_id = %user.id, provider = provider.as_str(), "ソーシャルログインでユーザー作成");
        Ok(user)
    }

    async fn available_username(&self, profile: &OAuthProfile) -> Result<String, AppError> {
        let base = username_candidate(profile);
        if !self.user_repo.username_exists(&base).await? {
            return Ok(base);
        }
        for _ in 0..5 {
            let suffix: String = generate_opaque_token()
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .take(6)
                .collect::<String>()
                .to_lowercase();
            let candidate = format!("{base}_{suffix}");
            if !self.user_repo.username_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(AppError::UsernameAlreadyExists)
    }
}
