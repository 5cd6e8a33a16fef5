//! OAuth ソーシャルログインハンドラー
//!
//! Google および GitHub を使用したソーシャルログイン処理を提供する。
//!
//! # Security
//! - state パラメータは AES-256-GCM で暗号化され、nonce と発行時刻を含む
//! - nonce は HttpOnly Cookie にも保存し、コールバック時に照合する
//! - プロバイダのアクセストークンはログに出力しない

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use crate::cookie::{OAUTH_NONCE_COOKIE, extract_cookie};
use crate::error::AppError;
use crate::handlers::auth::SessionResponse;
use crate::handlers::extract::client_info;
use crate::models::OAuthProvider;
use crate::response::ApiResponse;
use crate::state::AppState;

/// OAuth コールバック時のクエリパラメータ
#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// ユーザーが拒否した場合などにプロバイダが付与する
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStartResponse {
    /// フロントエンドはこの URL にリダイレクトする
    pub authorization_url: String,
}

/// 認可 URL の生成
///
/// GET /api/v1/auth/oauth/{provider}
pub async fn start(
    State(state): State<AppState>,
    Path(provider): Path<OAuthProvider>,
) -> Result<(HeaderMap, ApiResponse<OAuthStartResponse>), AppError> {
    let started = state.oauth.start(provider)?;

    let mut headers = HeaderMap::new();
    state.cookies.set_oauth_nonce(&mut headers, &started.nonce)?;

    tracing::info!(provider = provider.as_str(), "OAuth 認可開始");

    Ok((
        headers,
        ApiResponse::ok(OAuthStartResponse {
            authorization_url: started.authorize_url,
        }),
    ))
}

/// コールバック: state 検証 → コード交換 → ログイン
///
/// GET /api/v1/auth/oauth/{provider}/callback
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<OAuthProvider>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<(HeaderMap, ApiResponse<SessionResponse>), AppError> {
    if let Some(error) = query.error {
        tracing::warn!(provider = provider.as_str(), error = %error, "OAuth プロバイダがエラーを返却");
        return Err(AppError::OAuthError(error));
    }

    let code = query
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::BadRequest("code パラメータは必須です".to_string()))?;
    let sealed_state = query.state.ok_or(AppError::OAuthStateInvalid)?;
    let cookie_nonce = extract_cookie(&headers, OAUTH_NONCE_COOKIE);

    let (user, tokens) = state
        .oauth
        .callback(
            provider,
            &code,
            &sealed_state,
            cookie_nonce.as_deref(),
            &client_info(&headers),
        )
        .await?;

    let mut response_headers = HeaderMap::new();
    state.cookies.clear_oauth_nonce(&mut response_headers)?;
    state.cookies.set_tokens(&mut response_headers, &tokens)?;

    Ok((
        response_headers,
        ApiResponse::ok(SessionResponse { user, tokens }),
    ))
}
