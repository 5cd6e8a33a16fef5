//! 管理者向けユーザー管理・なりすまし
//!
//! すべて `require_auth` + `require_admin` の内側で動く。

use axum::{
    Extension,
    extract::{Path, Query, State},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::extract::ValidatedJson;
use crate::middleware::AdminUser;
use crate::models::{ImpersonationRecord, User, UserRole, UserStatus};
use crate::repositories::UserFilter;
use crate::response::{ApiResponse, PageQuery, Paginated};
use crate::services::admin::UserSecurityView;
use crate::services::impersonation::ImpersonationStarted;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub role: Option<UserRole>,
    pub status: Option<UserStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl UserListQuery {
    fn split(self) -> (UserFilter, PageQuery) {
        (
            UserFilter {
                search: self.search.filter(|s| !s.trim().is_empty()),
                role: self.role,
                status: self.status,
            },
            PageQuery {
                page: self.page,
                limit: self.limit,
            },
        )
    }
}

/// GET /api/v1/admin/users?search=&role=&status=&page=&limit=
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserListQuery>,
) -> Result<ApiResponse<Paginated<User>>, AppError> {
    let (filter, page) = query.split();
    let users = state.admin.list_users(&filter, &page).await?;
    Ok(ApiResponse::ok(users))
}

/// GET /api/v1/admin/users/{user_id}/security
pub async fn user_security(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<UserSecurityView>, AppError> {
    let view = state.admin.user_security(user_id).await?;
    Ok(ApiResponse::ok(view))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateStatusRequest {
    #[garde(skip)]
    pub status: UserStatus,
    #[garde(length(chars, max = 500))]
    pub reason: Option<String>,
}

/// PATCH /api/v1/admin/users/{user_id}/status
pub async fn update_status(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(user_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<UpdateStatusRequest>,
) -> Result<ApiResponse<User>, AppError> {
    let user = state
        .admin
        .update_status(&admin, user_id, request.status, request.reason)
        .await?;
    Ok(ApiResponse::ok(user))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    #[garde(skip)]
    pub role: UserRole,
}

/// PATCH /api/v1/admin/users/{user_id}/role
pub async fn update_role(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(user_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<UpdateRoleRequest>,
) -> Result<ApiResponse<User>, AppError> {
    let user = state.admin.update_role(&admin, user_id, request.role).await?;
    Ok(ApiResponse::ok(user))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedResponse {
    pub affected: u64,
}

/// POST /api/v1/admin/users/{user_id}/unlock
pub async fn unlock(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<AffectedResponse>, AppError> {
    state.admin.unlock(&admin, user_id).await?;
    Ok(ApiResponse::ok(AffectedResponse { affected: 1 }))
}

/// 全セッション無効化
///
/// POST /api/v1/admin/users/{user_id}/force-logout
pub async fn force_logout(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<AffectedResponse>, AppError> {
    let affected = state.admin.force_logout(&admin, user_id).await?;
    Ok(ApiResponse::ok(AffectedResponse { affected }))
}

/// 失敗回数の減衰を1回実行
///
/// POST /api/v1/admin/security/decay-failed-logins
pub async fn decay_failed_logins(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
) -> Result<ApiResponse<AffectedResponse>, AppError> {
    let affected = state.admin.decay_failed_logins(&admin).await?;
    Ok(ApiResponse::ok(AffectedResponse { affected }))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ImpersonateRequest {
    #[garde(length(chars, max = 500))]
    pub reason: Option<String>,
}

/// なりすまし開始（短命トークンを発行）
///
/// POST /api/v1/admin/users/{user_id}/impersonate
pub async fn start_impersonation(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(user_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ImpersonateRequest>,
) -> Result<ApiResponse<ImpersonationStarted>, AppError> {
    let started = state
        .impersonation
        .start(&admin, user_id, request.reason)
        .await?;
    Ok(ApiResponse::created(started))
}

/// なりすまし終了（開始した管理者のみ）
///
/// DELETE /api/v1/admin/impersonations/{impersonation_id}
pub async fn end_impersonation(
    State(state): State<AppState>,
    Extension(AdminUser(admin)): Extension<AdminUser>,
    Path(impersonation_id): Path<String>,
) -> Result<ApiResponse<ImpersonationRecord>, AppError> {
    let record = state
        .impersonation
        .end(&impersonation_id, admin.id)
        .await?;
    Ok(ApiResponse::ok(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_list_query_split() {
        let query: UserListQuery = serde_json::from_value(serde_json::json!({
            "search": "  ",
            "role": "AUTHOR",
            "status": "SUSPENDED",
            "page": 2
        }))
        .unwrap();

        let (filter, page) = query.split();
        assert!(filter.search.is_none());
        assert_eq!(filter.role, Some(UserRole::Author));
        assert_eq!(filter.status, Some(UserStatus::Suspended));
        assert_eq!(page.page(), 2);
    }

    #[test]
    fn test_status_reason_length() {
        let request = UpdateStatusRequest {
            status: UserStatus::Suspended,
            reason: Some("x".repeat(501)),
        };
        assert!(request.validate().is_err());
    }
}
