use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::context;
use crate::models::UserStatus;
use crate::response::{format_timestamp, now_rfc3339};
use crate::services::cache::CacheError;

/// PostgreSQL SQLSTATE: 一意制約違反
const PG_UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL SQLSTATE: 外部キー制約違反
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("認証エラー: {0}")]
    Authentication(String),

    #[error("認証が必要です")]
    Unauthorized,

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("不正なリクエスト: {0}")]
    BadRequest(String),

    #[error("権限がありません: {0}")]
    Forbidden(String),

    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    #[error("競合が発生しました: {0}")]
    Conflict(String),

    #[error("アカウントはロックされています")]
    AccountLocked { locked_until: OffsetDateTime },

    #[error("アカウントは利用できません: {0:?}")]
    AccountInactive(UserStatus),

    #[error("データベースエラー")]
    Database(sqlx::Error),

    #[error("キャッシュエラー")]
    Cache(#[from] CacheError),

    #[error("外部サービスエラー")]
    Upstream(#[from] reqwest::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("このメールアドレスは既に使用されています")]
    EmailAlreadyExists,

    #[error("このユーザー名は既に使用されています")]
    UsernameAlreadyExists,

    #[error("無効または期限切れのリンクです")]
    TokenExpired,

    #[error("トークンが見つかりません")]
    TokenNotFound,

    #[error("無効なトークンです")]
    TokenInvalid,

    #[error("アクセストークンの有効期限が切れています")]
    AccessTokenExpired,

    #[error("セッションは無効化されています")]
    SessionRevoked,

    #[error("認証コードが無効です")]
    MfaInvalid,

    #[error("二要素認証は既に有効です")]
    MfaAlreadyEnabled,

    #[error("二要素認証が有効化されていません")]
    MfaNotEnabled,

    #[error("OAuth認証エラー: {0}")]
    OAuthError(String),

    #[error("無効なstateパラメータ")]
    OAuthStateInvalid,

    #[error("OAuthプロバイダーエラー")]
    OAuthProviderError,

    #[error("OAuthプロバイダーが設定されていません: {0}")]
    OAuthNotConfigured(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound("リソースが見つかりません".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => match db_err.constraint() {
                    Some("users_email_key") => Self::EmailAlreadyExists,
                    Some("users_username_key") => Self::UsernameAlreadyExists,
                    _ => Self::Conflict("既に存在します".to_string()),
                },
                Some(PG_FOREIGN_KEY_VIOLATION) => {
                    Self::BadRequest("関連するリソースが存在しません".to_string())
                }
                _ => Self::Database(e),
            },
            _ => Self::Database(e),
        }
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        Self::Validation(report.to_string())
    }
}

impl AppError {
    /// 機械可読なエラーコード
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "INVALID_CREDENTIALS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::AccountInactive(_) => "ACCOUNT_INACTIVE",
            Self::Database(_) | Self::Cache(_) | Self::Internal(_) => "INTERNAL_ERROR",
            Self::Upstream(_) | Self::OAuthProviderError => "BAD_GATEWAY",
            Self::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            Self::UsernameAlreadyExists => "USERNAME_ALREADY_EXISTS",
            Self::TokenExpired | Self::TokenNotFound => "INVALID_RESET_TOKEN",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::AccessTokenExpired => "TOKEN_EXPIRED",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::MfaInvalid => "MFA_INVALID",
            Self::MfaAlreadyEnabled => "MFA_ALREADY_ENABLED",
            Self::MfaNotEnabled => "MFA_NOT_ENABLED",
            Self::OAuthError(_) => "OAUTH_FAILED",
            Self::OAuthStateInvalid => "OAUTH_STATE_INVALID",
            Self::OAuthNotConfigured(_) => "OAUTH_NOT_CONFIGURED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_)
            | Self::Unauthorized
            | Self::TokenInvalid
            | Self::AccessTokenExpired
            | Self::SessionRevoked
            | Self::MfaInvalid
            | Self::OAuthError(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_)
            | Self::BadRequest(_)
            | Self::TokenExpired
            | Self::TokenNotFound
            | Self::MfaNotEnabled
            | Self::OAuthStateInvalid => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) | Self::AccountInactive(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::OAuthNotConfigured(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_)
            | Self::EmailAlreadyExists
            | Self::UsernameAlreadyExists
            | Self::MfaAlreadyEnabled => StatusCode::CONFLICT,
            Self::AccountLocked { .. } => StatusCode::LOCKED,
            Self::Database(_) | Self::Cache(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Upstream(_) | Self::OAuthProviderError => StatusCode::BAD_GATEWAY,
        }
    }

    /// クライアントに返すメッセージ
    fn public_message(&self) -> String {
        match self {
            Self::TokenNotFound => "無効なリクエストです".to_string(),
            Self::Database(_) | Self::Cache(_) | Self::Internal(_) => {
                "内部エラーが発生しました".to_string()
            }
            Self::Upstream(_) | Self::OAuthProviderError => {
                "外部サービスとの通信に失敗しました".to_string()
            }
            Self::OAuthError(_) => "認証に失敗しました".to_string(),
            Self::OAuthStateInvalid => "無効なリクエストです".to_string(),
            Self::Authentication(msg)
            | Self::Validation(msg)
            | Self::BadRequest(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    fn details(&self, expose: bool) -> Option<serde_json::Value> {
        match self {
            Self::AccountLocked { locked_until } => {
                Some(json!({ "lockedUntil": format_timestamp(*locked_until) }))
            }
            Self::AccountInactive(status) => Some(json!({ "status": status })),
            Self::Database(e) if expose => Some(json!({ "cause": e.to_string() })),
            Self::Cache(e) if expose => Some(json!({ "cause": e.to_string() })),
            Self::Internal(e) if expose => Some(json!({ "cause": format!("{e:#}") })),
            Self::Upstream(e) if expose => Some(json!({ "cause": e.to_string() })),
            _ => None,
        }
    }

    fn log(&self) {
        match self {
            Self::Database(e) => tracing::error!(error = ?e, "データベースエラー"),
            Self::Cache(e) => tracing::error!(error = ?e, "キャッシュエラー"),
            Self::Internal(e) => tracing::error!(error = ?e, "内部エラー"),
            Self::Upstream(e) => tracing::error!(error = ?e, "外部サービス通信エラー"),
            Self::OAuthError(e) => tracing::error!(error = %e, "OAuth認証エラー"),
            Self::OAuthStateInvalid => {
                tracing::warn!("無効なOAuth stateパラメータ（CSRF攻撃の可能性）")
            }
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// エラーレスポンスのエンベロープ
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
    pub timestamp: String,
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();

        let context = context::current();
        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.public_message(),
                details: self.details(context.expose_error_details),
            },
            timestamp: now_rfc3339(),
            request_id: context.request_id,
        };

        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Authentication("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::EmailAlreadyExists.status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::AccountLocked {
                locked_until: OffsetDateTime::now_utc()
            }
            .status(),
            StatusCode::LOCKED
        );
        assert_eq!(AppError::SessionRevoked.code(), "SESSION_REVOKED");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let context = RequestContext {
            request_id: Some("req-42".to_string()),
            expose_error_details: false,
        };
        let response = context::scope(context, async {
            AppError::NotFound("ユーザーが見つかりません".into()).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "ユーザーが見つかりません");
        assert_eq!(body["requestId"], "req-42");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_internal_details_hidden_in_production() {
        let hidden = context::scope(RequestContext::default(), async {
            AppError::Internal(anyhow::anyhow!("boom")).into_response()
        })
        .await;
        let body = body_json(hidden).await;
        assert!(body["error"].get("details").is_none());

        let exposed = context::scope(
            RequestContext {
                request_id: None,
                expose_error_details: true,
            },
            async { AppError::Internal(anyhow::anyhow!("boom")).into_response() },
        )
        .await;
        let body = body_json(exposed).await;
        assert_eq!(body["error"]["details"]["cause"], "boom");
    }

    #[tokio::test]
    async fn test_locked_details_include_locked_until() {
        let response = AppError::AccountLocked {
            locked_until: OffsetDateTime::now_utc(),
        }
        .into_response();
        let body = body_json(response).await;
        assert!(body["error"]["details"]["lockedUntil"].is_string());
    }
}
