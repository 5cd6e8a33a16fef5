//! リクエスト単位のコンテキスト
//!
//! レスポンスエンベロープに載せる requestId と、エラー詳細の公開可否を
//! タスクローカルで保持する。

use std::future::Future;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub expose_error_details: bool,
}

/// 現在のリクエストコンテキスト（スコープ外では既定値）
pub fn current() -> RequestContext {
    REQUEST_CONTEXT
        .try_with(Clone::clone)
        .unwrap_or_default()
}

/// コンテキストを設定して Future を実行
pub async fn scope<F>(context: RequestContext, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_CONTEXT.scope(context, future).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_outside_scope_is_default() {
        let context = current();
        assert!(context.request_id.is_none());
        assert!(!context.expose_error_details);
    }

    #[tokio::test]
    async fn test_scope_sets_context() {
        let context = RequestContext {
            request_id: Some("req-1".to_string()),
            expose_error_details: true,
        };
        let seen = scope(context, async { current() }).await;
        assert_eq!(seen.request_id.as_deref(), Some("req-1"));
        assert!(seen.expose_error_details);
    }
}
