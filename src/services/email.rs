use std::sync::Arc;

use crate::config::Config;
use crate::error::AppError;

/// メール送信サービス
///
/// `email` フィーチャー有効かつ SMTP 設定済みの場合は lettre で送信し、
/// それ以外はログ出力のみ（開発環境向け）
#[derive(Clone)]
pub struct EmailService {
    config: Arc<Config>,
}

struct OutgoingEmail<'a> {
    to: &'a str,
    subject: &'a str,
    body: String,
}

impl EmailService {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn smtp_configured(&self) -> bool {
        self.config.smtp_host.is_some()
            && self.config.smtp_username.is_some()
            && self.config.smtp_password.is_some()
            && self.config.smtp_from_address.is_some()
    }

    /// パスワードリセットメール
    ///
    /// # Security
    /// リセット URL にはトークンが含まれるため、送信モードではログに出さない
    pub async fn send_password_reset_email(&self, to: &str, reset_url: &str) -> Result<(), AppError> {
        let ttl_minutes = self.config.password_reset_token_ttl_secs / 60;
        self.send(OutgoingEmail {
            to,
            subject: "パスワード再設定のご案内",
            body: format!(
                "以下のリンクからパスワードを再設定してください（有効期限: {ttl_minutes}分）。\n\n{reset_url}\n\n\
                 このメールに心当たりがない場合は破棄してください。"
            ),
        })
        .await
    }

    /// パスワード変更完了の通知
    pub async fn send_password_changed_email(&self, to: &str) -> Result<(), AppError> {
        self.send(OutgoingEmail {
            to,
            subject: "パスワードが変更されました",
            body: "アカウントのパスワードが変更されました。\
                   心当たりがない場合は直ちにパスワードを再設定してください。"
                .to_string(),
        })
        .await
    }

    async fn send(&self, email: OutgoingEmail<'_>) -> Result<(), AppError> {
        if !self.smtp_configured() || !cfg!(feature = "email") {
            // 本文にはリセットトークンが含まれるため長さのみ記録
            tracing::info!(
                to = %email.to,
                subject = %email.subject,
                body_len = email.body.len(),
                "メール送信（開発モード）"
            );
            return Ok(());
        }

        self.deliver(&email).await?;
        tracing::info!(to = %email.to, subject = %email.subject, "メール送信完了");
        Ok(())
    }

    #[cfg(feature = "email")]
    async fn deliver(&self, email: &OutgoingEmail<'_>) -> Result<(), AppError> {
        use lettre::message::header::ContentType;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
        use secrecy::ExposeSecret;

        let (Some(host), Some(username), Some(password), Some(from)) = (
            self.config.smtp_host.as_deref(),
            self.config.smtp_username.as_ref(),
            self.config.smtp_password.as_ref(),
            self.config.smtp_from_address.as_deref(),
        ) else {
            return Err(AppError::Internal(anyhow::anyhow!("smtp is not configured")));
        };

        let message = Message::builder()
            .from(from.parse().map_err(|e| {
                tracing::error!(error = %e, "送信元アドレスが不正");
                AppError::Internal(anyhow::anyhow!("invalid smtp from address"))
            })?)
            .to(email.to.parse().map_err(|_| {
                AppError::Validation("メールアドレスの形式が不正です".to_string())
            })?)
            .subject(email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| {
                tracing::error!(error = %e, "メール組み立てエラー");
                AppError::Internal(anyhow::anyhow!("email build error"))
            })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| {
                tracing::error!(error = %e, "SMTP接続設定エラー");
                AppError::Internal(anyhow::anyhow!("smtp relay error"))
            })?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                username.expose_secret().clone(),
                password.expose_secret().clone(),
            ))
            .build();

        transport.send(message).await.map_err(|e| {
            tracing::error!(error = %e, "SMTP送信エラー");
            AppError::Internal(anyhow::anyhow!("smtp send error"))
        })?;

        Ok(())
    }

    #[cfg(not(feature = "email"))]
    async fn deliver(&self, _email: &OutgoingEmail<'_>) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use crate::config::tests::test_config;

    /// ログ出力を取り込むバッファ
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_reset_token_not_logged_in_dev_mode() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let service = EmailService::new(Arc::new(test_config()));
        service
            .send_password_reset_email(
                "reader@example.com",
                "http://localhost/reset?token=plaintext-reset-token",
            )
            .await
            .unwrap();

        let output = logs.contents();
        assert!(output.contains("メール送信（開発モード）"));
        assert!(!output.contains("plaintext-reset-token"));
    }

    #[tokio::test]
    async fn test_send_without_smtp_is_logged_only() {
        let service = EmailService::new(Arc::new(test_config()));
        assert!(!service.smtp_configured());
        service
            .send_password_reset_email("reader@example.com", "http://localhost/reset?token=x")
            .await
            .unwrap();
        service
            .send_password_changed_email("reader@example.com")
            .await
            .unwrap();
    }
}
