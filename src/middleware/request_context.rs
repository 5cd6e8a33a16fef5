use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::context::{self, RequestContext};
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// requestId とエラー詳細の公開可否をリクエストスコープに設定
///
/// `SetRequestIdLayer` より内側に置く（ヘッダーが付与済みであること）
pub async fn request_context(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let context = RequestContext {
        request_id,
        expose_error_details: state.config.expose_error_details(),
    };

    context::scope(context, next.run(request)).await
}
