//! 二要素認証（TOTP）の設定

use axum::{Extension, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::handlers::extract::{ValidatedJson, validate_mfa_code};
use crate::middleware::AuthUser;
use crate::response::ApiResponse;
use crate::services::mfa::MfaSetup;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct MfaCodeRequest {
    #[garde(custom(validate_mfa_code))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisableMfaRequest {
    #[garde(length(min = 1, max = 128))]
    pub password: String,
    #[garde(custom(validate_mfa_code))]
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCodesResponse {
    /// 一度だけ表示する平文コード
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaStatusResponse {
    pub mfa_enabled: bool,
}

/// シークレット生成と QR コード発行
///
/// POST /api/v1/users/me/mfa/setup
///
/// enable で検証されるまで MFA は有効にならない
pub async fn setup(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<ApiResponse<MfaSetup>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let user = state.account.get_user(auth_user.user_id).await?;
    let setup = state.mfa.setup(&user).await?;
    Ok(ApiResponse::ok(setup))
}

/// コード検証して有効化（バックアップコードを返す）
///
/// POST /api/v1/users/me/mfa/enable
pub async fn enable(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ValidatedJson(request): ValidatedJson<MfaCodeRequest>,
) -> Result<ApiResponse<BackupCodesResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let backup_codes = state.mfa.enable(auth_user.user_id, &request.code).await?;
    Ok(ApiResponse::ok(BackupCodesResponse { backup_codes }))
}

/// 無効化（パスワードとコードの両方が必要）
///
/// POST /api/v1/users/me/mfa/disable
pub async fn disable(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ValidatedJson(request): ValidatedJson<DisableMfaRequest>,
) -> Result<ApiResponse<MfaStatusResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let user = state.account.get_user(auth_user.user_id).await?;
    state
        .mfa
        .disable(&user, &request.password, &request.code)
        .await?;
    Ok(ApiResponse::ok(MfaStatusResponse { mfa_enabled: false }))
}

/// バックアップコード再発行
///
/// POST /api/v1/users/me/mfa/backup-codes
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ValidatedJson(request): ValidatedJson<MfaCodeRequest>,
) -> Result<ApiResponse<BackupCodesResponse>, AppError> {
    auth_user.ensure_not_impersonating()?;
    let backup_codes = state
        .mfa
        .regenerate_backup_codes(auth_user.user_id, &request.code)
        .await?;
    Ok(ApiResponse::ok(BackupCodesResponse { backup_codes }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_validation() {
        let ok = MfaCodeRequest {
            code: "123456".to_string(),
        };
        assert!(ok.validate().is_ok());

        let backup = MfaCodeRequest {
            code: "ABCD-EFGH".to_string(),
        };
        assert!(backup.validate().is_ok());

        let empty = MfaCodeRequest {
            code: "  ".to_string(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_disable_requires_password() {
        let request = DisableMfaRequest {
            password: String::new(),
            code: "123456".to_string(),
        };
        assert!(request.validate().is_err());
    }
}
