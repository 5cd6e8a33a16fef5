use axum::extract::State;
use serde::Serialize;

use crate::error::AppError;
use crate::response::ApiResponse;
use crate::state::AppState;

/// ヘルスチェックレスポンス
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// ヘルスチェックハンドラー
///
/// GET /api/v1/health
///
/// プロセスの稼働のみを返す（依存サービスは確認しない）。
pub async fn health_check() -> ApiResponse<HealthResponse> {
    ApiResponse::ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// レディネスチェック
///
/// GET /api/v1/health/ready
///
/// DB に接続できない場合はエラー（500）を返す。
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<ApiResponse<HealthResponse>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db_pool).await.map_err(|e| {
        tracing::error!(error = ?e, "レディネスチェック: DB 接続失敗");
        AppError::Database(e)
    })?;

    Ok(ApiResponse::ok(HealthResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_returns_ok() {
        let response = health_check().await;
        assert_eq!(response.data.status, "ok");
        assert_eq!(response.data.version, env!("CARGO_PKG_VERSION"));
    }
}
