//! パスワードリセット・変更

use axum::{Extension, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::handlers::auth::MessageResponse;
use crate::handlers::extract::ValidatedJson;
use crate::middleware::AuthUser;
use crate::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    #[garde(email, length(max = 255))]
    pub email: String,
}

/// リセットメール送信
///
/// POST /api/v1/auth/forgot-password
///
/// # Security
/// 常に200を返す（ユーザー存在有無を漏洩しない）
pub async fn forgot_password(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ForgotPasswordRequest>,
) -> Result<ApiResponse<MessageResponse>, AppError> {
    state.password_reset.request_reset(&request.email).await?;

    Ok(ApiResponse::ok(MessageResponse {
        message: "パスワードリセット手順をメールで送信しました",
    }))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[garde(length(min = 1, max = 256))]
    pub token: String,
    #[garde(length(min = 8, max = 128))]
    pub new_password: String,
}

/// トークンで新しいパスワードを設定（全セッション無効化）
///
/// POST /api/v1/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ResetPasswordRequest>,
) -> Result<ApiResponse<MessageResponse>, AppError> {
    state
        .password_reset
        .reset_password(&request.token, &request.new_password)
        .await?;

    Ok(ApiResponse::ok(MessageResponse {
        message: "パスワードを再設定しました",
    }))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    /// ソーシャルログイン専用ユーザーは省略可
    #[garde(length(min = 1, max = 128))]
    pub current_password: Option<String>,
    #[garde(length(min = 8, max = 128))]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordResponse {
    pub revoked_sessions: u64,
}

/// パスワード変更（現在のセッション以外は無効化）
///
/// PUT /api/v1/users/me/password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ValidatedJson(request): ValidatedJson<ChangePasswordRequest>,
) -> Result<ApiResponse<ChangePasswordResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let user = state.account.get_user(auth_user.user_id).await?;

    let revoked_sessions = state
        .account
        .change_password(
            &user,
            request.current_password.as_deref(),
            &request.new_password,
            auth_user.session_id,
        )
        .await?;

    Ok(ApiResponse::ok(ChangePasswordResponse { revoked_sessions }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forgot_password_validation() {
        let valid = ForgotPasswordRequest {
            email: "reader@example.com".to_string(),
        };
        assert!(valid.validate().is_ok());

        let invalid = ForgotPasswordRequest {
            email: "invalid-email".to_string(),
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_reset_password_validation() {
        let short = ResetPasswordRequest {
            token: "token".to_string(),
            new_password: "short".to_string(),
        };
        assert!(short.validate().is_err());

        let valid = ResetPasswordRequest {
            token: "token".to_string(),
            new_password: "new_password123".to_string(),
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_change_password_current_optional() {
        let request = ChangePasswordRequest {
            current_password: None,
            new_password: "new_password123".to_string(),
        };
        assert!(request.validate().is_ok());
    }
}
