use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{SecurityOverview, SessionSummary, StatusHistoryEntry, User, UserRole, UserStatus};
use crate::repositories::{UserFilter, UserRepository};
use crate::response::{PageQuery, Paginated};
use crate::services::security::SecurityService;

/// 管理操作の可否を判定
///
/// - 自分自身のステータス・ロールは変更不可
/// - 管理者アカウントの変更、管理者ロールの付与は SUPER_ADMIN のみ
pub fn ensure_can_manage(
    actor_id: Uuid,
    actor_role: UserRole,
    target_id: Uuid,
    target_role: UserRole,
    new_role: Option<UserRole>,
) -> Result<(), AppError> {
    if !actor_role.is_admin() {
        return Err(AppError::Forbidden("管理者権限が必要です".to_string()));
    }
    if actor_id == target_id {
        return Err(AppError::Forbidden(
            "自分自身のアカウントは変更できません".to_string(),
        ));
    }
    let touches_admin = target_role.is_admin() || new_role.is_some_and(UserRole::is_admin);
    if touches_admin && actor_role != UserRole::SuperAdmin {
        return Err(AppError::Forbidden(
            "管理者アカウントの操作には SUPER_ADMIN 権限が必要です".to_string(),
        ));
    }
    Ok(())
}

/// 管理画面用のユーザーセキュリティ情報
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSecurityView {
    pub user: User,
    pub security: SecurityOverview,
    pub active_sessions: Vec<SessionSummary>,
}

#[derive(Clone)]
pub struct AdminService {
    user_repo: UserRepository,
    security: SecurityService,
}

impl AdminService {
    pub fn new(user_repo: UserRepository, security: SecurityService) -> Self {
        Self {
            user_repo,
            security,
        }
    }

    async fn find_user(&self, user_id: Uuid) -> Result<User, AppError> {
        self.user_repo
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))
    }

    pub async fn list_users(
        &self,
        filter: &UserFilter,
        page: &PageQuery,
    ) -> Result<Paginated<User>, AppError> {
        let (users, total) = self
            .user_repo
            .list(filter, i64::from(page.limit()), page.offset())
            .await?;
        Ok(Paginated::new(users, page, total))
    }

    pub async fn user_security(&self, user_id: Uuid) -> Result<UserSecurityView, AppError> {
        let user = self.find_user(user_id).await?;
        let security = self.security.get_overview(user_id).await?;
        let active_sessions = self.security.list_active_sessions(user_id).await?;
        Ok(UserSecurityView {
            user,
            security,
            active_sessions,
        })
    }

    /// ステータス変更（履歴を追記し、ログイン不可になる場合は強制ログアウト）
    pub async fn update_status(
        &self,
        actor: &User,
        user_id: Uuid,
        status: UserStatus,
        reason: Option<String>,
    ) -> Result<User, AppError> {
        let target = self.find_user(user_id).await?;
        ensure_can_manage(actor.id, actor.role, target.id, target.role, None)?;

        if target.status == status {
            return Ok(target);
        }

        let updated = self
            .user_repo
            .update_status(user_id, status)
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))?;

        self.security
            .record_status_change(
                user_id,
                StatusHistoryEntry {
                    from: target.status,
                    to: status,
                    reason,
                    changed_by: actor.id,
                    changed_at: OffsetDateTime::now_utc(),
                },
            )
            .await?;

        if !status.can_login() {
            self.security.force_logout_all(user_id, "status_changed").await?;
        }

        tracing::warn!(
            actor_id = %actor.id,
            user_id = %user_id,
            from = ?target.status,
            to = ?status,
            "ユーザーステータス変更"
        );
        Ok(updated)
    }

    pub async fn update_role(
        &self,
        actor: &User,
        user_id: Uuid,
        role: UserRole,
    ) -> Result<User, AppError> {
        let target = self.find_user(user_id).await?;
        ensure_can_manage(actor.id, actor.role, target.id, target.role, Some(role))?;

        if target.role == role {
            return Ok(target);
        }

        let updated = self
            .user_repo
            .update_role(user_id, role)
            .await?
            .ok_or_else(|| AppError::NotFound("ユーザーが見つかりません".to_string()))?;
        self.security.invalidate_user(user_id).await;

        tracing::warn!(
            actor_id = %actor.id,
            user_id = %user_id,
            from = ?target.role,
            to = ?role,
            "ユーザーロール変更"
        );
        Ok(updated)
    }

    pub async fn unlock(&self, actor: &User, user_id: Uuid) -> Result<(), AppError> {
        let target = self.find_user(user_id).await?;
        ensure_can_manage(actor.id, actor.role, target.id, target.role, None)?;
        self.security.unlock(user_id).await?;
        tracing::info!(actor_id = %actor.id, user_id = %user_id, "管理者によるロック解除");
        Ok(())
    }

    /// # Returns
    /// 無効化したセッション数
    pub async fn force_logout(&self, actor: &User, user_id: Uuid) -> Result<u64, AppError> {
        let target = self.find_user(user_id).await?;
        ensure_can_manage(actor.id, actor.role, target.id, target.role, None)?;
        let revoked = self.security.force_logout_all(user_id, "admin_force_logout").await?;
        tracing::warn!(actor_id = %actor.id, user_id = %user_id, revoked = revoked, "管理者による強制ログアウト");
        Ok(revoked)
    }

    pub async fn decay_failed_logins(&self, actor: &User) -> Result<u64, AppError> {
        let decayed = self.security.decay_failed_logins().await?;
        tracing::info!(actor_id = %actor.id, decayed = decayed, "失敗回数減衰を実行");
        Ok(decayed)
    }
}
