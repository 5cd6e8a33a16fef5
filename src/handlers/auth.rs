//! 登録・ログイン・トークン更新・ログアウト

use axum::{
    Extension,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cookie::{REFRESH_TOKEN_COOKIE, extract_cookie};
use crate::error::AppError;
use crate::handlers::extract::{ValidatedJson, client_info, validate_username};
use crate::middleware::AuthUser;
use crate::models::User;
use crate::response::ApiResponse;
use crate::services::auth::{AuthTokens, LoginOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[garde(email, length(max = 255))]
    pub email: String,
    #[garde(custom(validate_username))]
    pub username: String,
    #[garde(length(chars, min = 1, max = 100))]
    pub display_name: Option<String>,
    // SecretBox不要（Deserialize後すぐハッシュ化）
    #[garde(length(min = 8, max = 128))]
    pub password: String,
}

/// ユーザー登録
///
/// POST /api/v1/auth/register
///
/// # Security
/// - パスワードはログに出力しない
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<RegisterRequest>,
) -> Result<ApiResponse<User>, AppError> {
    let user = state
        .auth
        .register(
            &request.email,
            &request.username,
            request.display_name.as_deref(),
            &request.password,
        )
        .await?;

    Ok(ApiResponse::created(user))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[garde(length(min = 1, max = 255))]
    pub email: String,
    #[garde(length(min = 1, max = 128))]
    pub password: String,
    /// TOTP またはバックアップコード（MFA 有効ユーザーのみ）
    #[garde(length(max = 16))]
    pub mfa_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<AuthTokens>,
}

/// パスワードログイン
///
/// POST /api/v1/auth/login
///
/// MFA 有効かつコード未指定なら `mfaRequired: true` を返し、
/// コードを付けて再送してもらう。成功時はトークンを Cookie にも設定する。
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<LoginRequest>,
) -> Result<(HeaderMap, ApiResponse<LoginResponse>), AppError> {
    let client = client_info(&headers);
    let outcome = state
        .auth
        .login(
            &request.email,
            &request.password,
            request.mfa_code.as_deref(),
            &client,
        )
        .await?;

    let mut response_headers = HeaderMap::new();
    let body = match outcome {
        LoginOutcome::MfaRequired { user_id } => LoginResponse {
            mfa_required: true,
            user_id: Some(user_id),
            user: None,
            tokens: None,
        },
        LoginOutcome::Authenticated { user, tokens } => {
            state.cookies.set_tokens(&mut response_headers, &tokens)?;
            LoginResponse {
                mfa_required: false,
                user_id: Some(user.id),
                user: Some(user),
                tokens: Some(tokens),
            }
        }
    };

    Ok((response_headers, ApiResponse::ok(body)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: User,
    pub tokens: AuthTokens,
}

/// リフレッシュトークンを Cookie、なければボディから取り出す
fn refresh_token_from(headers: &HeaderMap, body: &Bytes) -> Result<String, AppError> {
    if let Some(token) = extract_cookie(headers, REFRESH_TOKEN_COOKIE) {
        return Ok(token);
    }

    let request = if body.is_empty() {
        RefreshRequest::default()
    } else {
        serde_json::from_slice::<RefreshRequest>(body)
            .map_err(|e| AppError::BadRequest(format!("リクエストボディが不正です: {e}")))?
    };

    request
        .refresh_token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or(AppError::Unauthorized)
}

/// トークン更新（リフレッシュトークンはローテーション）
///
/// POST /api/v1/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(HeaderMap, ApiResponse<SessionResponse>), AppError> {
    let refresh_token = refresh_token_from(&headers, &body)?;
    let (user, tokens) = state.auth.refresh(&refresh_token).await?;

    let mut response_headers = HeaderMap::new();
    state.cookies.set_tokens(&mut response_headers, &tokens)?;

    Ok((response_headers, ApiResponse::ok(SessionResponse { user, tokens })))
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// ログアウト
///
/// POST /api/v1/auth/logout
///
/// なりすまし中はなりすましを終了する（元の管理者セッションは残る）
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<(HeaderMap, ApiResponse<MessageResponse>), AppError> {
    match (&auth_user.impersonation, auth_user.session_id) {
        (Some(impersonation), _) => {
            state
                .impersonation
                .end(&impersonation.id, impersonation.admin_id)
                .await?;
        }
        (None, Some(session_id)) => {
            state.auth.logout(auth_user.user_id, session_id).await?;
        }
        (None, None) => return Err(AppError::Unauthorized),
    }

    let mut response_headers = HeaderMap::new();
    state.cookies.clear_tokens(&mut response_headers)?;

    Ok((
        response_headers,
        ApiResponse::ok(MessageResponse {
            message: "ログアウトしました",
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationInfo {
    pub impersonation_id: String,
    pub admin_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: User,
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonation: Option<ImpersonationInfo>,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

/// 認証中ユーザーの情報
///
/// GET /api/v1/auth/me
pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<MeResponse>, AppError> {
    let user = state.account.get_user(auth_user.user_id).await?;

    Ok(ApiResponse::ok(MeResponse {
        user,
        session_id: auth_user.session_id,
        impersonation: auth_user.impersonation.map(|imp| ImpersonationInfo {
            impersonation_id: imp.id,
            admin_id: imp.admin_id,
        }),
        server_time: OffsetDateTime::now_utc(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};

    fn register_request(email: &str, username: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            username: username.to_string(),
            display_name: None,
            password: password.to_string(),
        }
    }

    #[test]
    fn test_register_validation() {
        assert!(
            register_request("reader@example.com", "reader", "password123")
                .validate()
                .is_ok()
        );
        assert!(
            register_request("invalid-email", "reader", "password123")
                .validate()
                .is_err()
        );
        assert!(
            register_request("reader@example.com", "reader", "short")
                .validate()
                .is_err()
        );
        assert!(
            register_request("reader@example.com", "no spaces", "password123")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_login_rejects_empty_password() {
        let request = LoginRequest {
            email: "reader@example.com".to_string(),
            password: String::new(),
            mfa_code: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_refresh_token_prefers_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("refresh_token=from-cookie"));
        let body = Bytes::from_static(br#"{"refreshToken":"from-body"}"#);
        assert_eq!(refresh_token_from(&headers, &body).unwrap(), "from-cookie");
    }

    #[test]
    fn test_refresh_token_from_body() {
        let body = Bytes::from_static(br#"{"refreshToken":"from-body"}"#);
        assert_eq!(
            refresh_token_from(&HeaderMap::new(), &body).unwrap(),
            "from-body"
        );
    }

    #[test]
    fn test_refresh_token_missing() {
        assert!(matches!(
            refresh_token_from(&HeaderMap::new(), &Bytes::new()),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            refresh_token_from(&HeaderMap::new(), &Bytes::from_static(b"not json")),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_mfa_required_response_shape() {
        let response = LoginResponse {
            mfa_required: true,
            user_id: Some(Uuid::nil()),
            user: None,
            tokens: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["mfaRequired"], true);
        assert!(value.get("tokens").is_none());
        assert!(value.get("user").is_none());
    }
}
