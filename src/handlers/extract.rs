//! ハンドラー共通の抽出ヘルパー

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
    http::{HeaderMap, header},
};
use garde::Validate;
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::services::auth::ClientInfo;

/// JSON ボディを読み取り、garde で検証するエクストラクター
///
/// JSON の形式エラーは 400 BAD_REQUEST、検証エラーは 400 VALIDATION_ERROR
#[derive(Debug)]
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
    T::Context: Default,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state)
            .await
            .map_err(|rejection: JsonRejection| AppError::BadRequest(rejection.body_text()))?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// ユーザー名: 3〜32文字の英数字・`_`・`-`
pub fn validate_username(value: &str, _context: &()) -> garde::Result {
    let len = value.chars().count();
    if !(3..=32).contains(&len) {
        return Err(garde::Error::new("3〜32文字で入力してください"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(garde::Error::new("英数字・_・- のみ使用できます"));
    }
    Ok(())
}

/// TOTP（6桁）またはバックアップコード（XXXX-XXXX）
pub fn validate_mfa_code(value: &str, _context: &()) -> garde::Result {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(garde::Error::new("認証コードの形式が正しくありません"));
    }
    Ok(())
}

/// プロキシ経由を考慮したクライアント情報
///
/// X-Forwarded-For の先頭 → X-Real-IP の順に参照
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .map(str::to_string);

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|ua| ua.chars().take(512).collect());

    ClientInfo {
        ip_address,
        user_agent,
    }
}
