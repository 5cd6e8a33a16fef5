use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rand::RngCore;

use crate::error::AppError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// 復号失敗の種類
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("暗号化データが短すぎる")]
    TooShort,
    #[error("認証タグの検証に失敗")]
    Tampered,
}

/// AES-256-GCM による秘密値の暗号化
///
/// 出力形式は 12バイト nonce + 暗号文（タグ込み）。
/// MFA シークレットと OAuth state で共用する。
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl SecretCipher {
    /// Base64（STANDARD / URL-safe どちらも可）の32バイトキーから作成
    pub fn from_base64(key_base64: &str, purpose: &'static str) -> Result<Self, AppError> {
        let key_bytes = STANDARD
            .decode(key_base64)
            .or_else(|_| URL_SAFE_NO_PAD.decode(key_base64))
            .map_err(|e| {
                tracing::error!(error = ?e, purpose = purpose, "暗号化キーのBase64デコードエラー");
                AppError::Internal(anyhow::anyhow!("invalid {purpose} key format"))
            })?;

        let key: [u8; KEY_LEN] = key_bytes.as_slice().try_into().map_err(|_| {
            tracing::error!(
                purpose = purpose,
                expected = KEY_LEN,
                actual = key_bytes.len(),
                "暗号化キーの長さが不正"
            );
            AppError::Internal(anyhow::anyhow!("{purpose} key must be {KEY_LEN} bytes"))
        })?;

        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256Gcm, AppError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| {
                tracing::error!(error = ?e, "暗号化エラー");
                AppError::Internal(anyhow::anyhow!("encryption error"))
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// 復号失敗は呼び出し側で用途に応じたエラーへ変換する
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Result<Vec<u8>, DecryptError>, AppError> {
        if sealed.len() < NONCE_LEN {
            return Ok(Err(DecryptError::TooShort));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        Ok(self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecryptError::Tampered))
    }

    /// URL に埋め込める形式で暗号化
    pub fn seal_url_safe(&self, plaintext: &[u8]) -> Result<String, AppError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(plaintext)?))
    }

    /// `seal_url_safe` の逆変換。Base64 不正も `Tampered` として扱う
    pub fn open_url_safe(&self, sealed: &str) -> Result<Result<Vec<u8>, DecryptError>, AppError> {
        match URL_SAFE_NO_PAD.decode(sealed) {
            Ok(bytes) => self.decrypt(&bytes),
            Err(_) => Ok(Err(DecryptError::Tampered)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_base64(&STANDARD.encode([7u8; 32]), "test").unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"JBSWY3DPEHPK3PXP").unwrap();
        // nonce + 平文 + 16バイトタグ
        assert_eq!(sealed.len(), 12 + 16 + 16);
        assert_eq!(cipher.decrypt(&sealed).unwrap().unwrap(), b"JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let cipher = cipher();
        assert_ne!(cipher.encrypt(b"x").unwrap(), cipher.encrypt(b"x").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext() {
        let cipher = cipher();
        let mut sealed = cipher.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(cipher.decrypt(&sealed).unwrap(), Err(DecryptError::Tampered));
        assert_eq!(cipher.decrypt(&[0u8; 4]).unwrap(), Err(DecryptError::TooShort));
    }

    #[test]
    fn test_url_safe_roundtrip_and_garbage() {
        let cipher = cipher();
        let sealed = cipher.seal_url_safe(b"state").unwrap();
        assert!(!sealed.contains('+') && !sealed.contains('/') && !sealed.contains('='));
        assert_eq!(cipher.open_url_safe(&sealed).unwrap().unwrap(), b"state");
        assert_eq!(
            cipher.open_url_safe("not base64 !!").unwrap(),
            Err(DecryptError::Tampered)
        );
    }

    #[test]
    fn test_invalid_keys() {
        assert!(SecretCipher::from_base64(&STANDARD.encode([0u8; 16]), "test").is_err());
        assert!(SecretCipher::from_base64("not-valid-base64!!!", "test").is_err());
    }
}
