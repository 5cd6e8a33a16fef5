//! ルーター構築
//!
//! すべての API は `/api/v1` 配下。

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post, put},
};
use http::{HeaderName, HeaderValue, Method, header};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::handlers::{self, account, admin, auth, mfa, oauth, password};
use crate::middleware::{request_context, require_admin, require_auth};
use crate::state::AppState;

/// 認証不要のルート
fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness_check))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/forgot-password", post(password::forgot_password))
        .route("/auth/reset-password", post(password::reset_password))
        .route("/auth/oauth/{provider}", get(oauth::start))
        .route("/auth/oauth/{provider}/callback", get(oauth::callback))
}

/// ログイン済みユーザーのルート
fn user_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route(
            "/users/me",
            get(account::profile).patch(account::update_profile),
        )
        .route("/users/me/linked-accounts", get(account::linked_accounts))
        .route("/users/me/password", put(password::change_password))
        .route("/users/me/security", get(account::security_overview))
        .route(
            "/users/me/sessions",
            get(account::list_sessions).delete(account::revoke_other_sessions),
        )
        .route("/users/me/sessions/history", get(account::session_history))
        .route(
            "/users/me/sessions/{session_id}",
            delete(account::revoke_session),
        )
        .route("/users/me/mfa/setup", post(mfa::setup))
        .route("/users/me/mfa/enable", post(mfa::enable))
        .route("/users/me/mfa/disable", post(mfa::disable))
        .route(
            "/users/me/mfa/backup-codes",
            post(mfa::regenerate_backup_codes),
        )
        .route_layer(from_fn_with_state(state.clone(), require_auth))
}

/// 管理者ルート（require_auth → require_admin の順に通る）
fn admin_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/{user_id}/security", get(admin::user_security))
        .route("/admin/users/{user_id}/status", patch(admin::update_status))
        .route("/admin/users/{user_id}/role", patch(admin::update_role))
        .route("/admin/users/{user_id}/unlock", post(admin::unlock))
        .route(
            "/admin/users/{user_id}/force-logout",
            post(admin::force_logout),
        )
        .route(
            "/admin/users/{user_id}/impersonate",
            post(admin::start_impersonation),
        )
        .route(
            "/admin/impersonations/{impersonation_id}",
            delete(admin::end_impersonation),
        )
        .route(
            "/admin/security/decay-failed-logins",
            post(admin::decay_failed_logins),
        )
        .route_layer(from_fn_with_state(state.clone(), require_admin))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
}

/// 許可オリジンが設定されている場合のみ CORS を有効化（Cookie 送信のため credentials 許可）
fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "不正な CORS オリジンを無視");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                header::ACCEPT,
                HeaderName::from_static("x-request-id"),
            ])
            .expose_headers([HeaderName::from_static("x-request-id")])
            .allow_credentials(true),
    )
}

/// Router の構築
pub fn create_router(state: AppState) -> Router {
    let api = public_routes()
        .merge(user_routes(&state))
        .merge(admin_routes(&state));

    let mut router = Router::new()
        .nest("/api/v1", api)
        .layer(from_fn_with_state(state.clone(), request_context));

    if let Some(cors) = cors_layer(&state.config) {
        router = router.layer(cors);
    }

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
