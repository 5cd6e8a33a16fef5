//! 認証ミドルウェア
//!
//! Bearer ヘッダーまたは `access_token` Cookie から JWT を取り出して検証し、
//! `AuthUser` をリクエスト拡張に挿入する。

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::cookie::{ACCESS_TOKEN_COOKIE, extract_cookie};
use crate::error::AppError;
use crate::models::{User, UserRole, is_impersonation_id};
use crate::services::token::AccessClaims;
use crate::state::AppState;

/// なりすまし中の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Impersonation {
    pub id: String,
    pub admin_id: Uuid,
}

/// 認証済みユーザー（トークンのクレーム由来）
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    /// 通常ログインのセッションID（なりすまし時は None）
    pub session_id: Option<Uuid>,
    pub impersonation: Option<Impersonation>,
}

impl AuthUser {
    /// なりすまし中は本人操作（パスワード変更など）を禁止する
    pub fn ensure_not_impersonating(&self) -> Result<(), AppError> {
        match &self.impersonation {
            Some(_) => Err(AppError::Forbidden(
                "なりすまし中はこの操作を実行できません".to_string(),
            )),
            None => Ok(()),
        }
    }
}

/// 管理者ルートで DB から読み直したユーザー
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

/// Authorization: Bearer を優先し、なければ Cookie
pub fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| extract_cookie(headers, ACCESS_TOKEN_COOKIE))
}

async fn authenticate(state: &AppState, claims: AccessClaims) -> Result<AuthUser, AppError> {
    if is_impersonation_id(&claims.sid) {
        let record = state
            .impersonation
            .find_active(&claims.sid)
            .await?
            .ok_or(AppError::SessionRevoked)?;

        if record.target_user_id != claims.sub || Some(record.admin_id) != claims.imp {
            tracing::warn!(impersonation_id = %claims.sid, "なりすまし記録とトークンが不一致");
            return Err(AppError::TokenInvalid);
        }

        // 対象ユーザーが強制ログアウト・停止された場合もなりすましを無効にする
        state
            .security
            .ensure_token_current(claims.sub, claims.iat)
            .await?;

        return Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
            session_id: None,
            impersonation: Some(Impersonation {
                id: claims.sid,
                admin_id: record.admin_id,
            }),
        });
    }

    let session_id = Uuid::parse_str(&claims.sid).map_err(|_| AppError::TokenInvalid)?;
    state
        .security
        .ensure_session_active(claims.sub, session_id)
        .await?;
    state
        .security
        .ensure_token_current(claims.sub, claims.iat)
        .await?;

    Ok(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
        session_id: Some(session_id),
        impersonation: None,
    })
}

/// 認証必須ルート用ミドルウェア
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_access_token(request.headers()).ok_or(AppError::Unauthorized)?;
    let claims = state.jwt.verify(&token)?;
    let auth_user = authenticate(&state, claims).await?;

    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}

/// 管理者ルート用ミドルウェア（`require_auth` の内側に置く）
///
/// ロールはトークンではなく DB の最新値で判定する
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_user = request
        .extensions()
        .get::<AuthUser>()
        .cloned()
        .ok_or(AppError::Unauthorized)?;
    auth_user.ensure_not_impersonating()?;

    let user = state.account.get_user(auth_user.user_id).await?;
    if !user.role.is_admin() {
        tracing::warn!(user_id = %user.id, role = ?user.role, "管理者ルートへのアクセス拒否");
        return Err(AppError::Forbidden("管理者権限が必要です".to_string()));
    }

    request.extensions_mut().insert(AdminUser(user));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use axum::http::HeaderValue;
    use sqlx::postgres::PgPoolOptions;
    use time::{Duration, OffsetDateTime};

    use crate::config::tests::test_config;
    use crate::models::{ImpersonationRecord, SecurityOverview, new_impersonation_id};
    use crate::services::Cache;
    use crate::services::cache::keys;

    /// DB には接続しない（キャッシュに載せた値だけで認証を通す）
    fn state_with_cache(cache: Cache) -> AppState {
        let pool = PgPoolOptions::new()
            .acquire_timeout(StdDuration::from_millis(200))
            .connect_lazy("postgres://localhost/ownverso_test")
            .unwrap();
        AppState::new(pool, cache, test_config()).unwrap()
    }

    fn overview(user_id: Uuid, force_logout_at: Option<OffsetDateTime>) -> SecurityOverview {
        SecurityOverview {
            user_id,
            failed_login_count: 0,
            locked_until: None,
            mfa_enabled: false,
            backup_codes_remaining: 0,
            status_history: Vec::new(),
            force_logout_at,
            password_changed_at: None,
        }
    }

    /// なりすまし記録をキャッシュに保存し、対応するクレームを返す
    async fn seed_impersonation(cache: &Cache, issued_at: OffsetDateTime) -> AccessClaims {
        let admin_id = Uuid::new_v4();
        let target_id = Uuid::new_v4();
        let impersonation_id = new_impersonation_id();
        let record = ImpersonationRecord {
            id: impersonation_id.clone(),
            admin_id,
            admin_email: "root@example.com".to_string(),
            target_user_id: target_id,
            target_email: "reader@example.com".to_string(),
            reason: None,
            started_at: issued_at,
            expires_at: issued_at + Duration::hours(1),
        };
        cache
            .set_json(&keys::impersonation(&impersonation_id), &record, 3600)
            .await
            .unwrap();

        AccessClaims {
            sub: target_id,
            email: "reader@example.com".to_string(),
            role: UserRole::User,
            sid: impersonation_id,
            imp: Some(admin_id),
            iss: "ownverso".to_string(),
            iat: issued_at.unix_timestamp(),
            exp: (issued_at + Duration::hours(1)).unix_timestamp(),
            jti: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_impersonation_token_accepted_while_record_exists() {
        let cache = Cache::memory();
        let state = state_with_cache(cache.clone());
        let claims = seed_impersonation(&cache, OffsetDateTime::now_utc()).await;
        cache
            .set_json(&keys::user_security(claims.sub), &overview(claims.sub, None), 60)
            .await
            .unwrap();

        let auth_user = authenticate(&state, claims.clone()).await.unwrap();
        assert_eq!(auth_user.user_id, claims.sub);
        assert_eq!(
            auth_user.impersonation.map(|imp| imp.id),
            Some(claims.sid)
        );
    }

    #[tokio::test]
    async fn test_impersonation_token_rejected_after_force_logout() {
        let cache = Cache::memory();
        let state = state_with_cache(cache.clone());
        let issued_at = OffsetDateTime::now_utc() - Duration::seconds(5);
        let claims = seed_impersonation(&cache, issued_at).await;
        cache
            .set_json(
                &keys::user_security(claims.sub),
                &overview(claims.sub, Some(OffsetDateTime::now_utc())),
                60,
            )
            .await
            .unwrap();

        assert!(matches!(
            authenticate(&state, claims).await,
            Err(AppError::SessionRevoked)
        ));
    }

    #[tokio::test]
    async fn test_impersonation_token_rejected_without_record() {
        let cache = Cache::memory();
        let state = state_with_cache(cache.clone());
        let claims = seed_impersonation(&Cache::memory(), OffsetDateTime::now_utc()).await;

        assert!(matches!(
            authenticate(&state, claims).await,
            Err(AppError::SessionRevoked)
        ));
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_access_token(&headers), Some("abc.def".to_string()));
    }

    #[test]
    fn test_bearer_takes_precedence_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        headers.insert(header::COOKIE, HeaderValue::from_static("access_token=cookie-token"));
        assert_eq!(extract_access_token(&headers), Some("header-token".to_string()));
    }

    #[test]
    fn test_cookie_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        headers.insert(header::COOKIE, HeaderValue::from_static("access_token=cookie-token"));
        assert_eq!(extract_access_token(&headers), Some("cookie-token".to_string()));
    }

    #[test]
    fn test_missing_token() {
        assert_eq!(extract_access_token(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_access_token(&headers), None);
    }

    #[test]
    fn test_impersonating_user_blocked_from_self_service() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            email: "reader@example.com".to_string(),
            role: UserRole::User,
            session_id: None,
            impersonation: Some(Impersonation {
                id: "imp_x".to_string(),
                admin_id: Uuid::new_v4(),
            }),
        };
        assert!(matches!(
            user.ensure_not_impersonating(),
            Err(AppError::Forbidden(_))
        ));
    }
}
