use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{User, UserRole};

const MIN_SECRET_LEN: usize = 32;
const LEEWAY_SECS: u64 = 5;

/// アクセストークンのクレーム
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// ユーザーID
    pub sub: Uuid,
    pub email: String,
    pub role: UserRole,
    /// セッションID（なりすまし時は `imp_<uuid>`）
    pub sid: String,
    /// なりすまし中の管理者ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imp: Option<Uuid>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

/// JWT アクセストークンの発行・検証
///
/// # Security
/// 署名鍵・トークン本体はログに出力しない
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
}

impl JwtService {
    pub fn new(secret: &str, issuer: String, access_ttl_secs: i64) -> Result<Self, AppError> {
        if secret.len() < MIN_SECRET_LEN {
            tracing::error!(
                expected = MIN_SECRET_LEN,
                actual = secret.len(),
                "JWTシークレットが短すぎる"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "jwt secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = LEEWAY_SECS;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            access_ttl: Duration::seconds(access_ttl_secs),
        })
    }

    /// 通常ログインのアクセストークン
    pub fn issue_access_token(&self, user: &User, session_id: Uuid) -> Result<IssuedToken, AppError> {
        self.issue(user, &session_id.to_string(), None, self.access_ttl)
    }

    /// なりすまし用アクセストークン（対象ユーザーの身元で発行）
    pub fn issue_impersonation_token(
        &self,
        target: &User,
        impersonation_id: &str,
        admin_id: Uuid,
        ttl: Duration,
    ) -> Result<IssuedToken, AppError> {
        self.issue(target, impersonation_id, Some(admin_id), ttl)
    }

    fn issue(
        &self,
        user: &User,
        session_id: &str,
        impersonator: Option<Uuid>,
        ttl: Duration,
    ) -> Result<IssuedToken, AppError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;
        let claims = AccessClaims {
            sub: user.id,
            email: user.email.clone(),
            role: user.role,
            sid: session_id.to_string(),
            imp: impersonator,
            iss: self.issuer.clone(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| {
                tracing::error!(error = ?e, "JWT生成エラー");
                AppError::Internal(anyhow::anyhow!("token generation failed"))
            })?;

        Ok(IssuedToken { token, expires_at })
    }

    /// 署名・期限・発行者を検証してクレームを返す
    pub fn verify(&self, token: &str) -> Result<AccessClaims, AppError> {
        decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::AccessTokenExpired,
                _ => {
                    tracing::debug!(error = %e, "JWT検証失敗");
                    AppError::TokenInvalid
                }
            })
    }
}

/// 32バイトのランダムトークン（リフレッシュトークン・リセットトークン用）
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// トークンをSHA256でハッシュ化（DB保存用）
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
