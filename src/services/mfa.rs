//! 多要素認証（TOTP + バックアップコード）
//!
//! # Security
//! - TOTP シークレットは AES-256-GCM で暗号化して保存
//! - バックアップコードは SHA256 ハッシュのみ保存し、平文は生成時に一度だけ返す
//! - シークレット・コードはログに出力しない

use data_encoding::BASE32_NOPAD;
use rand::{Rng, RngCore};
use serde::Serialize;
use totp_rs::{Algorithm, TOTP};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{User, UserSecurity};
use crate::repositories::UserSecurityRepository;
use crate::services::crypto::SecretCipher;
use crate::services::password::verify_password;
use crate::services::security::SecurityService;
use crate::services::token::hash_token;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECS: u64 = 30;
const SECRET_BYTES: usize = 20;

/// 紛らわしい文字（0/O, 1/I）を除いた英数字
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const BACKUP_CODE_HALF_LEN: usize = 4;

/// TOTP の生成・検証
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    cipher: SecretCipher,
}

impl TotpService {
    pub fn new(issuer: String, cipher: SecretCipher) -> Self {
        Self { issuer, cipher }
    }

    /// 20バイトのランダムシークレット（Base32、パディングなし）
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE32_NOPAD.encode(&bytes)
    }

    pub fn encrypt_secret(&self, secret: &str) -> Result<Vec<u8>, AppError> {
        self.cipher.encrypt(secret.as_bytes())
    }

    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<String, AppError> {
        let plaintext = self.cipher.decrypt(encrypted)?.map_err(|e| {
            tracing::error!(error = %e, "MFAシークレット復号エラー");
            AppError::Internal(anyhow::anyhow!("mfa secret decryption error"))
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Internal(anyhow::anyhow!("invalid utf8 after decryption"))
        })
    }

    fn totp(&self, secret: &str, account_name: &str) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32_NOPAD.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECS,
            secret_bytes,
            Some(self.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }

    /// 認証アプリ登録用の otpauth:// URL
    pub fn otpauth_url(&self, account_name: &str, secret: &str) -> Result<String, AppError> {
        Ok(self.totp(secret, account_name)?.get_url())
    }

    /// QRコード（PNG）の data URL
    pub fn qr_code_data_url(&self, account_name: &str, secret: &str) -> Result<String, AppError> {
        let png_base64 = self.totp(secret, account_name)?.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;
        Ok(format!("data:image/png;base64,{png_base64}"))
    }

    /// 前後1ステップ（±30秒）を許容して検証
    pub fn verify_code(&self, secret: &str, code: &str) -> Result<bool, AppError> {
        if code.len() != TOTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(false);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = ?e, "システム時刻取得エラー");
                AppError::Internal(anyhow::anyhow!("system time error"))
            })?
            .as_secs();

        Ok(self.totp(secret, "")?.check(code, now))
    }
}

/// `XXXX-XXXX` 形式のバックアップコードを生成
///
/// # Returns
/// (平文コード, SHA256 ハッシュ) のペア
pub fn generate_backup_codes(count: usize) -> (Vec<String>, Vec<String>) {
    let mut rng = rand::thread_rng();
    let codes: Vec<String> = (0..count)
        .map(|_| {
            let mut pick = || {
                (0..BACKUP_CODE_HALF_LEN)
                    .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
                    .collect::<String>()
            };
            let head = pick();
            let tail = pick();
            format!("{head}-{tail}")
        })
        .collect();
    let hashes = codes.iter().map(|code| hash_backup_code(code)).collect();
    (codes, hashes)
}

/// 入力揺れ（小文字・ハイフン・空白）を吸収してからハッシュ化
pub fn hash_backup_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    hash_token(&normalized)
}

fn looks_like_totp(code: &str) -> bool {
    code.len() == TOTP_DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

/// MFA 設定開始時のレスポンス
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaSetup {
    pub secret: String,
    pub otpauth_url: String,
    pub qr_code: String,
}

/// MFA の設定・有効化・無効化とログイン時の検証
#[derive(Clone)]
pub struct MfaService {
    security_repo: UserSecurityRepository,
    security: SecurityService,
    totp: TotpService,
    backup_code_count: usize,
}

impl MfaService {
    pub fn new(
        security_repo: UserSecurityRepository,
        security: SecurityService,
        totp: TotpService,
        backup_code_count: usize,
    ) -> Self {
        Self {
            security_repo,
            security,
            totp,
            backup_code_count,
        }
    }

    /// シークレットを発行（有効化は `enable` で確認コード検証後）
    pub async fn setup(&self, user: &User) -> Result<MfaSetup, AppError> {
        let current = self.security.get_security(user.id).await?;
        if current.mfa_enabled {
            return Err(AppError::MfaAlreadyEnabled);
        }

        let secret = TotpService::generate_secret();
        let encrypted = self.totp.encrypt_secret(&secret)?;
        self.security_repo
            .set_pending_mfa_secret(user.id, &encrypted)
            .await?;
        self.security.invalidate_security(user.id).await;

        tracing::info!(user_id = %user.id, "MFA設定開始");

        Ok(MfaSetup {
            otpauth_url: self.totp.otpauth_url(&user.email, &secret)?,
            qr_code: self.totp.qr_code_data_url(&user.email, &secret)?,
            secret,
        })
    }

    /// 確認コードを検証して有効化し、バックアップコードを返す
    pub async fn enable(&self, user_id: Uuid, code: &str) -> Result<Vec<String>, AppError> {
        let current = self.security.get_security(user_id).await?;
        if current.mfa_enabled {
            return Err(AppError::MfaAlreadyEnabled);
        }
        let encrypted = current
            .mfa_secret_encrypted
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("MFAの設定が開始されていません".to_string()))?;

        let secret = self.totp.decrypt_secret(encrypted)?;
        if !self.totp.verify_code(&secret, code)? {
            tracing::warn!(user_id = %user_id, "MFA有効化: 確認コード不一致");
            return Err(AppError::MfaInvalid);
        }

        let (codes, hashes) = generate_backup_codes(self.backup_code_count);
        self.security_repo.enable_mfa(user_id, &hashes).await?;
        self.security.invalidate_security(user_id).await;

        tracing::info!(user_id = %user_id, "MFA有効化");
        Ok(codes)
    }

    /// パスワードと MFA コードを確認して無効化
    pub async fn disable(&self, user: &User, password: &str, code: &str) -> Result<(), AppError> {
        if let Some(hash) = user.password_hash.as_deref() {
            if !verify_password(password, hash)? {
                return Err(AppError::Authentication("パスワードが正しくありません".to_string()));
            }
        }

        let current = self.security.get_security(user.id).await?;
        if !current.mfa_enabled {
            return Err(AppError::MfaNotEnabled);
        }
        if !self.verify(&current, code).await? {
            return Err(AppError::MfaInvalid);
        }

        self.security_repo.disable_mfa(user.id).await?;
        self.security.invalidate_security(user.id).await;

        tracing::info!(user_id = %user.id, "MFA無効化");
        Ok(())
    }

    /// バックアップコードを再発行（既存コードはすべて無効）
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<Vec<String>, AppError> {
        let current = self.security.get_security(user_id).await?;
        if !current.mfa_enabled {
            return Err(AppError::MfaNotEnabled);
        }
        if !self.verify_totp(&current, code)? {
            return Err(AppError::MfaInvalid);
        }

        let (codes, hashes) = generate_backup_codes(self.backup_code_count);
        self.security_repo
            .replace_backup_codes(user_id, &hashes)
            .await?;
        self.security.invalidate_security(user_id).await;

        tracing::info!(user_id = %user_id, "バックアップコード再発行");
        Ok(codes)
    }

    /// TOTP またはバックアップコードで検証（バックアップコードは消費）
    pub async fn verify(&self, security: &UserSecurity, code: &str) -> Result<bool, AppError> {
        let code = code.trim();
        if looks_like_totp(code) {
            return self.verify_totp(security, code);
        }

        let consumed = self
            .security_repo
            .consume_backup_code(security.user_id, &hash_backup_code(code))
            .await?;
        if consumed {
            self.security.invalidate_security(security.user_id).await;
            tracing::info!(
                user_id = %security.user_id,
                remaining = security.mfa_backup_codes.len().saturating_sub(1),
                "バックアップコードを使用"
            );
        }
        Ok(consumed)
    }

    fn verify_totp(&self, security: &UserSecurity, code: &str) -> Result<bool, AppError> {
        let Some(encrypted) = security.mfa_secret_encrypted.as_deref() else {
            return Ok(false);
        };
        let secret = self.totp.decrypt_secret(encrypted)?;
        self.totp.verify_code(&secret, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    fn service() -> TotpService {
        let cipher = SecretCipher::from_base64(&STANDARD.encode([0u8; 32]), "mfa").unwrap();
        TotpService::new("Ownverso".to_string(), cipher)
    }

    fn current_code(secret: &str) -> String {
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            BASE32_NOPAD.decode(secret.as_bytes()).unwrap(),
            None,
            String::new(),
        )
        .unwrap();
        totp.generate_current().unwrap()
    }

    #[test]
    fn test_generate_secret() {
        let secret = TotpService::generate_secret();
        // 20バイト = Base32 で32文字
        assert_eq!(secret.len(), 32);
        assert!(
            secret
                .chars()
                .all(|c| "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567".contains(c))
        );
    }

    #[test]
    fn test_secret_encryption() {
        let service = service();
        let secret = TotpService::generate_secret();
        let encrypted = service.encrypt_secret(&secret).unwrap();
        assert_ne!(encrypted, secret.as_bytes());
        assert_eq!(service.decrypt_secret(&encrypted).unwrap(), secret);
    }

    #[test]
    fn test_verify_current_code() {
        let service = service();
        let secret = TotpService::generate_secret();
        let code = current_code(&secret);
        assert!(service.verify_code(&secret, &code).unwrap());
    }

    #[test]
    fn test_verify_rejects_malformed_code() {
        let service = service();
        let secret = TotpService::generate_secret();
        assert!(!service.verify_code(&secret, "12345").unwrap());
        assert!(!service.verify_code(&secret, "12345a").unwrap());
    }

    #[test]
    fn test_otpauth_url_and_qr() {
        let service = service();
        let secret = TotpService::generate_secret();
        let url = service.otpauth_url("reader@example.com", &secret).unwrap();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("issuer=Ownverso"));

        let qr = service.qr_code_data_url("reader@example.com", &secret).unwrap();
        assert!(qr.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_backup_codes() {
        let (codes, hashes) = generate_backup_codes(10);
        assert_eq!(codes.len(), 10);
        assert_eq!(hashes.len(), 10);
        for (code, hash) in codes.iter().zip(&hashes) {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert_eq!(&hash_backup_code(code), hash);
        }
    }

    #[test]
    fn test_backup_code_normalization() {
        assert_eq!(hash_backup_code("abcd-efgh"), hash_backup_code("ABCDEFGH"));
        assert_eq!(hash_backup_code(" ABCD EFGH "), hash_backup_code("ABCD-EFGH"));
        assert_ne!(hash_backup_code("ABCD-EFGH"), hash_backup_code("ABCD-EFGJ"));
    }

    #[test]
    fn test_looks_like_totp() {
        assert!(looks_like_totp("123456"));
        assert!(!looks_like_totp("ABCD-EFGH"));
        assert!(!looks_like_totp("1234567"));
    }
}
