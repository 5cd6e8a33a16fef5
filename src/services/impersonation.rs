//! 管理者によるなりすまし
//!
//! 記録はキャッシュのみに保存し、TTL 経過または終了操作で失効する。
//! なりすましトークンは記録が存在する間だけ受け付ける。

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ImpersonationRecord, User, UserRole, new_impersonation_id};
use crate::repositories::UserRepository;
use crate::services::cache::{Cache, keys};
use crate::services::token::JwtService;

/// なりすまし開始の可否を判定
///
/// - 実行者は SUPER_ADMIN のみ
/// - 対象が ADMIN / SUPER_ADMIN の場合は実行者に関係なく不可
/// - 自分自身は不可
pub fn ensure_can_impersonate(
    actor_id: Uuid,
    actor_role: UserRole,
    target_id: Uuid,
    target_role: UserRole,
) -> Result<(), AppError> {
    if !target_role.can_be_impersonated() {
        return Err(AppError::Forbidden(
            "管理者アカウントにはなりすませません".to_string(),
        ));
    }
    if actor_role != UserRole::SuperAdmin {
        return Err(AppError::Forbidden(
            "なりすましには SUPER_ADMIN 権限が必要です".to_string(),
        ));
    }
    if actor_id == target_id {
        return Err(AppError::BadRequest(
            "自分自身にはなりすませません".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationStarted {
    pub impersonation_id: String,
    pub access_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub target_user: User,
}

#[derive(Clone)]
pub struct ImpersonationService {
    user_repo: UserRepository,
    cache: Cache,
    jwt: JwtService,
    ttl_secs: u64,
}

impl ImpersonationService {
    pub fn new(user_repo: UserRepository, cache: Cache, jwt: JwtService, ttl_secs: u64) -> Self {
        Self {
            user_repo,
            cache,
            jwt,
            ttl_secs,
        }
    }

    pub async fn start(
        &self,
        admin: &User,
        target_user_id: Uuid,
        reason: Option<String>,
    ) -> Result<ImpersonationStarted, AppError> {
        let target = self
            .user_repo
            .find_by_id(target_user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))?;

        ensure_can_impersonate(admin.id, admin.role, target.id, target.role)?;

        if !target.status.can_login() {
            return Err(AppError::AccountInactive(target.status));
        }

        let ttl = Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX));
        let impersonation_id = new_impersonation_id();
        let issued = self
            .jwt
            .issue_impersonation_token(&target, &impersonation_id, admin.id, ttl)?;

        let record = ImpersonationRecord {
            id: impersonation_id.clone(),
            admin_id: admin.id,
            admin_email: admin.email.clone(),
            target_user_id: target.id,
            target_email: target.email.clone(),
            reason,
            started_at: OffsetDateTime::now_utc(),
            expires_at: issued.expires_at,
        };

        // 記録のないトークンは拒否されるので、保存失敗は握りつぶさない
        self.cache
            .set_json(&keys::impersonation(&impersonation_id), &record, self.ttl_secs)
            .await?;

        tracing::warn!(
            impersonation_id = %impersonation_id,
            admin_id = %admin.id,
            target_user_id = %target.id,
            reason = ?record.reason,
            "なりすまし開始"
        );

        Ok(ImpersonationStarted {
            impersonation_id,
            access_token: issued.token,
            expires_at: issued.expires_at,
            target_user: target,
        })
    }

    /// 有効な記録（なければ None）
    pub async fn find_active(
        &self,
        impersonation_id: &str,
    ) -> Result<Option<ImpersonationRecord>, AppError> {
        Ok(self
            .cache
            .get_json::<ImpersonationRecord>(&keys::impersonation(impersonation_id))
            .await?)
    }

    /// なりすましを終了（開始した管理者のみ）
    pub async fn end(
        &self,
        impersonation_id: &str,
        admin_id: Uuid,
    ) -> Result<ImpersonationRecord, AppError> {
        let record = self
            .find_active(impersonation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("なりすましセッションが見つかりません".to_string()))?;

        if record.admin_id != admin_id {
            return Err(AppError::Forbidden(
                "他の管理者のなりすましは終了できません".to_string(),
            ));
        }

        self.cache
            .delete(&[keys::impersonation(impersonation_id)])
            .await?;

        tracing::warn!(
            impersonation_id = %impersonation_id,
            admin_id = %admin_id,
            target_user_id = %record.target_user_id,
            "なりすまし終了"
        );

        Ok(record)
    }
}
