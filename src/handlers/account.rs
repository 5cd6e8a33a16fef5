//! 本人のプロフィール・セキュリティ情報・セッション管理

use axum::{
    Extension,
    extract::{Path, Query, State},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::extract::ValidatedJson;
use crate::middleware::AuthUser;
use crate::models::{SecurityOverview, SessionSummary, SocialAccount, User};
use crate::response::{ApiResponse, PageQuery, Paginated};
use crate::state::AppState;

/// GET /api/v1/users/me
pub async fn profile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<User>, AppError> {
    let user = state.account.get_user(auth_user.user_id).await?;
    Ok(ApiResponse::ok(user))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[garde(length(chars, min = 1, max = 100))]
    pub display_name: String,
}

/// PATCH /api/v1/users/me
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ValidatedJson(request): ValidatedJson<UpdateProfileRequest>,
) -> Result<ApiResponse<User>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let user = state
        .account
        .update_profile(auth_user.user_id, &request.display_name)
        .await?;
    Ok(ApiResponse::ok(user))
}

/// GET /api/v1/users/me/linked-accounts
pub async fn linked_accounts(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<Vec<SocialAccount>>, AppError> {
    let accounts = state.account.linked_accounts(auth_user.user_id).await?;
    Ok(ApiResponse::ok(accounts))
}

/// ロック状態・MFA・ステータス履歴の概要（キャッシュ経由）
///
/// GET /api/v1/users/me/security
pub async fn security_overview(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<SecurityOverview>, AppError> {
    let overview = state.security.get_overview(auth_user.user_id).await?;
    Ok(ApiResponse::ok(overview))
}

/// 有効なセッション一覧（現在のセッションに印を付ける）
///
/// GET /api/v1/users/me/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<Vec<SessionSummary>>, AppError> {
    let sessions = state.security.list_active_sessions(auth_user.user_id).await?;
    Ok(ApiResponse::ok(SessionSummary::mark_current(
        sessions,
        auth_user.session_id,
    )))
}

/// ログイン履歴（無効化済みを含む）
///
/// GET /api/v1/users/me/sessions/history?page=&limit=
pub async fn session_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Paginated<SessionSummary>>, AppError> {
    let mut history = state
        .security
        .login_history(auth_user.user_id, &page)
        .await?;
    history.data = SessionSummary::mark_current(history.data, auth_user.session_id);
    Ok(ApiResponse::ok(history))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeResponse {
    pub revoked_sessions: u64,
}

/// 指定セッションを無効化
///
/// DELETE /api/v1/users/me/sessions/{session_id}
pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<ApiResponse<RevokeResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let revoked = state
        .security
        .revoke_session(auth_user.user_id, session_id, "user_revoked")
        .await?;
    if !revoked {
        return Err(AppError::NotFound("セッションが見つかりません".to_string()));
    }

    tracing::info!(user_id = %auth_user.user_id, session_id = %session_id, "セッション無効化");
    Ok(ApiResponse::ok(RevokeResponse {
        revoked_sessions: 1,
    }))
}

/// 現在のセッション以外をすべて無効化
///
/// DELETE /api/v1/users/me/sessions
pub async fn revoke_other_sessions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<RevokeResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let revoked_sessions = state
        .security
        .revoke_other_sessions(auth_user.user_id, auth_user.session_id, "user_revoked_others")
        .await?;

    tracing::info!(user_id = %auth_user.user_id, revoked = revoked_sessions, "他セッション一括無効化");
    Ok(ApiResponse::ok(RevokeResponse { revoked_sessions }))
}
