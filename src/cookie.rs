//! 認証 Cookie の組み立てと取り出し

use axum::http::{HeaderMap, HeaderValue, header};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::services::auth::AuthTokens;

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
pub const OAUTH_NONCE_COOKIE: &str = "oauth_nonce";

/// リフレッシュトークンは更新・ログイン系エンドポイントにのみ送る
const REFRESH_TOKEN_PATH: &str = "/api/v1/auth";
const OAUTH_NONCE_PATH: &str = "/api/v1/auth/oauth";
const OAUTH_NONCE_MAX_AGE_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: &'static str,
    pub secure: bool,
    pub same_site: SameSite,
    pub path: &'static str,
    pub max_age_secs: Option<i64>,
}

impl CookieConfig {
    /// Set-Cookie ヘッダー値（常に HttpOnly）
    pub fn build_set_cookie(&self, value: &str) -> String {
        let mut cookie = format!("{}={}; HttpOnly", self.name, value);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str(&format!("; SameSite={}", self.same_site.as_str()));
        cookie.push_str(&format!("; Path={}", self.path));
        if let Some(max_age) = self.max_age_secs {
            cookie.push_str(&format!("; Max-Age={}", max_age.max(0)));
        }
        cookie
    }

    /// 削除用（Max-Age=0）
    pub fn build_delete_cookie(&self) -> String {
        let mut cookie = format!("{}=; HttpOnly", self.name);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str(&format!(
            "; SameSite={}; Path={}; Max-Age=0",
            self.same_site.as_str(),
            self.path
        ));
        cookie
    }
}

/// Cookie ヘッダーから値を取り出す
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
}

/// 認証関連 Cookie の発行
#[derive(Debug, Clone, Copy)]
pub struct AuthCookies {
    secure: bool,
}

impl AuthCookies {
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }

    fn config(&self, name: &'static str, path: &'static str, max_age_secs: Option<i64>) -> CookieConfig {
        CookieConfig {
            name,
            secure: self.secure,
            same_site: if name == OAUTH_NONCE_COOKIE {
                // プロバイダからのリダイレクト（トップレベル GET）で送られる必要がある
                SameSite::Lax
            } else {
                SameSite::Strict
            },
            path,
            max_age_secs,
        }
    }

    fn append(headers: &mut HeaderMap, value: String) -> Result<(), AppError> {
        let value = HeaderValue::from_str(&value).map_err(|e| {
            tracing::error!(error = %e, "Set-Cookie ヘッダー生成エラー");
            AppError::Internal(anyhow::anyhow!("invalid cookie value"))
        })?;
        headers.append(header::SET_COOKIE, value);
        Ok(())
    }

    pub fn set_tokens(&self, headers: &mut HeaderMap, tokens: &AuthTokens) -> Result<(), AppError> {
        let now = OffsetDateTime::now_utc();
        let access_max_age = (tokens.access_token_expires_at - now).whole_seconds();
        let refresh_max_age = (tokens.refresh_token_expires_at - now).whole_seconds();

        Self::append(
            headers,
            self.config(ACCESS_TOKEN_COOKIE, "/", Some(access_max_age))
                .build_set_cookie(&tokens.access_token),
        )?;
        Self::append(
            headers,
            self.config(REFRESH_TOKEN_COOKIE, REFRESH_TOKEN_PATH, Some(refresh_max_age))
                .build_set_cookie(&tokens.refresh_token),
        )
    }

    pub fn clear_tokens(&self, headers: &mut HeaderMap) -> Result<(), AppError> {
        Self::append(
            headers,
            self.config(ACCESS_TOKEN_COOKIE, "/", None).build_delete_cookie(),
        )?;
        Self::append(
            headers,
            self.config(REFRESH_TOKEN_COOKIE, REFRESH_TOKEN_PATH, None)
                .build_delete_cookie(),
        )
    }

    pub fn set_oauth_nonce(&self, headers: &mut HeaderMap, nonce: &str) -> Result<(), AppError> {
        Self::append(
            headers,
            self.config(OAUTH_NONCE_COOKIE, OAUTH_NONCE_PATH, Some(OAUTH_NONCE_MAX_AGE_SECS))
                .build_set_cookie(nonce),
        )
    }

    pub fn clear_oauth_nonce(&self, headers: &mut HeaderMap) -> Result<(), AppError> {
        Self::append(
            headers,
            self.config(OAUTH_NONCE_COOKIE, OAUTH_NONCE_PATH, None)
                .build_delete_cookie(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_build_set_cookie() {
        let config = CookieConfig {
            name: "access_token",
            secure: true,
            same_site: SameSite::Strict,
            path: "/",
            max_age_secs: Some(900),
        };
        assert_eq!(
            config.build_set_cookie("abc"),
            "access_token=abc; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=900"
        );
        assert_eq!(
            config.build_delete_cookie(),
            "access_token=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0"
        );
    }

    #[test]
    fn test_extract_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("foo=bar; access_token=abc123; empty="),
        );
        assert_eq!(
            extract_cookie(&headers, ACCESS_TOKEN_COOKIE),
            Some("abc123".to_string())
        );
        assert_eq!(extract_cookie(&headers, "foo"), Some("bar".to_string()));
        assert_eq!(extract_cookie(&headers, "empty"), None);
        assert_eq!(extract_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_set_and_clear_tokens() {
        let now = OffsetDateTime::now_utc();
        let tokens = AuthTokens {
            access_token: "access".to_string(),
            access_token_expires_at: now + Duration::minutes(15),
            refresh_token: "refresh".to_string(),
            refresh_token_expires_at: now + Duration::days(30),
            session_id: Uuid::new_v4(),
        };
        let cookies = AuthCookies::new(false);

        let mut headers = HeaderMap::new();
        cookies.set_tokens(&mut headers, &tokens).unwrap();
        let values: Vec<_> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values[0].starts_with("access_token=access; HttpOnly; SameSite=Strict; Path=/;"));
        assert!(values[1].contains("Path=/api/v1/auth"));
        assert!(!values[1].contains("Secure"));

        let mut cleared = HeaderMap::new();
        cookies.clear_tokens(&mut cleared).unwrap();
        assert!(
            cleared
                .get_all(header::SET_COOKIE)
                .iter()
                .all(|v| v.to_str().unwrap().ends_with("Max-Age=0"))
        );
    }
}
