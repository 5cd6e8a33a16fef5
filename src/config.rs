use secrecy::SecretBox;
use serde::Deserialize;

use crate::services::lockout::{LockoutPolicy, LockoutPolicyError};

/// 実行環境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Development,
    Test,
    Production,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    /// 未設定時はプロセス内メモリキャッシュを使用
    #[serde(default)]
    pub redis_url: Option<SecretBox<String>>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub app_env: AppEnv,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default)]
    pub run_migrations: bool,

    // JWT / セッション設定
    pub jwt_secret: SecretBox<String>,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
    #[serde(default = "default_access_token_ttl_secs")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_token_ttl_secs")]
    pub refresh_token_ttl_secs: i64,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    // アカウントロック設定
    /// "試行回数:ロック分数" のカンマ区切り（例: "5:15,10:60"）
    #[serde(default = "default_lockout_thresholds")]
    pub lockout_thresholds: String,
    #[serde(default = "default_failed_login_decay_minutes")]
    pub failed_login_decay_minutes: i64,
    #[serde(default = "default_status_history_max_len")]
    pub status_history_max_len: usize,

    // キャッシュ設定
    #[serde(default = "default_security_cache_ttl_secs")]
    pub security_cache_ttl_secs: u64,
    #[serde(default = "default_sessions_cache_ttl_secs")]
    pub sessions_cache_ttl_secs: u64,
    #[serde(default = "default_impersonation_ttl_secs")]
    pub impersonation_ttl_secs: u64,

    // SMTP設定（オプション - email機能有効時のみ使用）
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<SecretBox<String>>,
    pub smtp_password: Option<SecretBox<String>>,
    #[serde(default)]
    pub smtp_from_address: Option<String>,

    // パスワードリセット設定
    #[serde(default)]
    pub password_reset_url_base: Option<String>,
    #[serde(default = "default_password_reset_token_ttl_secs")]
    pub password_reset_token_ttl_secs: i64,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    #[serde(default = "default_totp_issuer")]
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    #[serde(default = "default_mfa_backup_code_count")]
    pub mfa_backup_code_count: usize,

    // OAuth2 ソーシャルログイン設定
    /// OAuthステート暗号化用シークレット（必須、32バイト）
    pub oauth_state_secret: SecretBox<String>,

    // Google OAuth設定（オプション）
    #[serde(default)]
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<SecretBox<String>>,
    #[serde(default)]
    pub google_redirect_uri: Option<String>,

    // GitHub OAuth設定（オプション）
    #[serde(default)]
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<SecretBox<String>>,
    #[serde(default)]
    pub github_redirect_uri: Option<String>,

    /// CORS 許可オリジン（カンマ区切り、未設定時は同一オリジンのみ）
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 4000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_JWT_ISSUER: &str = "ownverso";
const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 3600;
const DEFAULT_LOCKOUT_THRESHOLDS: &str = "5:15,10:60,20:1440";
const DEFAULT_FAILED_LOGIN_DECAY_MINUTES: i64 = 60;
const DEFAULT_STATUS_HISTORY_MAX_LEN: usize = 50;
const DEFAULT_SECURITY_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_SESSIONS_CACHE_TTL_SECS: u64 = 30;
const DEFAULT_IMPERSONATION_TTL_SECS: u64 = 3600;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_PASSWORD_RESET_TOKEN_TTL_SECS: i64 = 3600;
const DEFAULT_TOTP_ISSUER: &str = "Ownverso";
const DEFAULT_MFA_BACKUP_CODE_COUNT: usize = 10;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_true() -> bool {
    true
}

fn default_jwt_issuer() -> String {
    DEFAULT_JWT_ISSUER.to_string()
}

fn default_access_token_ttl_secs() -> i64 {
    DEFAULT_ACCESS_TOKEN_TTL_SECS
}

fn default_refresh_token_ttl_secs() -> i64 {
    DEFAULT_REFRESH_TOKEN_TTL_SECS
}

fn default_lockout_thresholds() -> String {
    DEFAULT_LOCKOUT_THRESHOLDS.to_string()
}

fn default_failed_login_decay_minutes() -> i64 {
    DEFAULT_FAILED_LOGIN_DECAY_MINUTES
}

fn default_status_history_max_len() -> usize {
    DEFAULT_STATUS_HISTORY_MAX_LEN
}

fn default_security_cache_ttl_secs() -> u64 {
    DEFAULT_SECURITY_CACHE_TTL_SECS
}

fn default_sessions_cache_ttl_secs() -> u64 {
    DEFAULT_SESSIONS_CACHE_TTL_SECS
}

fn default_impersonation_ttl_secs() -> u64 {
    DEFAULT_IMPERSONATION_TTL_SECS
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_password_reset_token_ttl_secs() -> i64 {
    DEFAULT_PASSWORD_RESET_TOKEN_TTL_SECS
}

fn default_totp_issuer() -> String {
    DEFAULT_TOTP_ISSUER.to_string()
}

fn default_mfa_backup_code_count() -> usize {
    DEFAULT_MFA_BACKUP_CODE_COUNT
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// 本番環境ではエラー詳細をレスポンスに含めない
    pub fn expose_error_details(&self) -> bool {
        self.app_env != AppEnv::Production
    }

    /// ロック閾値設定をパース
    pub fn lockout_policy(&self) -> Result<LockoutPolicy, LockoutPolicyError> {
        self.lockout_thresholds.parse()
    }

    /// CORS 許可オリジン一覧
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// テスト用の最小構成
    pub(crate) fn test_config() -> Config {
        let vars = vec![
            (
                "DATABASE_URL".to_string(),
                "postgres://localhost/ownverso_test".to_string(),
            ),
            ("APP_ENV".to_string(), "test".to_string()),
            (
                "JWT_SECRET".to_string(),
                "test-secret-test-secret-test-secret".to_string(),
            ),
            (
                "ENCRYPTION_KEY".to_string(),
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
            ),
            (
                "OAUTH_STATE_SECRET".to_string(),
                "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=".to_string(),
            ),
        ];
        envy::from_iter(vars).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = test_config();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.access_token_ttl_secs, 900);
        assert_eq!(config.security_cache_ttl_secs, 60);
        assert_eq!(config.sessions_cache_ttl_secs, 30);
        assert_eq!(config.impersonation_ttl_secs, 3600);
        assert!(config.redis_url.is_none());
        assert!(config.expose_error_details());
    }

    #[test]
    fn test_default_lockout_policy_parses() {
        let config = test_config();
        let policy = config.lockout_policy().unwrap();
        assert_eq!(policy.thresholds().len(), 3);
    }

    #[test]
    fn test_cors_origins_split() {
        let mut config = test_config();
        config.cors_allowed_origins = Some("https://a.example, ,https://b.example".to_string());
        assert_eq!(
            config.cors_origins(),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_production_hides_error_details() {
        let mut config = test_config();
        config.app_env = AppEnv::Production;
        assert!(!config.expose_error_details());
    }
}
