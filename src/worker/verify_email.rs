//! `send-verify-email` handler
//!
//! Creates a one-time verification record for the user and mails them the
//! link that consumes it. Runs at-least-once: a redelivery after a crash
//! issues a fresh code, and any unexpired code already mailed stays valid.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::error::TaskError;
use super::processor::TaskHandler;
use super::task::{PayloadSendVerifyEmail, Task, TaskKind};
use crate::config::VerifyEmailConfig;
use crate::mail::{EmailContent, EmailSender};
use crate::store::{CreateVerifyEmailParams, Store, User, VerifyEmail};

pub const SECRET_CODE_LEN: usize = 32;

pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    settings: VerifyEmailConfig,
}

impl SendVerifyEmailHandler {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn EmailSender>,
        settings: VerifyEmailConfig,
    ) -> Self {
        Self {
            store,
            mailer,
            settings,
        }
    }

    async fn send_verify_email(&self, payload: PayloadSendVerifyEmail) -> Result<(), TaskError> {
        let user = self
            .store
            .get_user(&payload.username)
            .await
            .map_err(|e| TaskError::from_store("get user", e))?;

        if user.is_email_verified {
            info!(
                target: "WORKER",
                username = %user.username,
                "email already verified, nothing to send"
            );
            return Ok(());
        }

        let ttl = Duration::from_secs(self.settings.expires_in_secs);
        let expired_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| TaskError::Permanent("verify email expiry out of range".to_string()))?;
        let verify_email = self
            .store
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_secret_code(),
                expired_at,
            })
            .await
            .map_err(|e| TaskError::from_store("create verify email", e))?;

        let email = compose(&user, &verify_email, &self.settings.base_url);
        self.mailer
            .send_email(&email)
            .await
            .map_err(|e| {
                let reason = format!("send verify email: {e}");
                if e.is_permanent() {
                    TaskError::Permanent(reason)
                } else {
                    TaskError::Retryable(reason)
                }
            })?;

        info!(
            target: "WORKER",
            username = %user.username,
            email = %user.email,
            email_id = verify_email.id,
            "verification email sent"
        );
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SendVerifyEmail
    }

    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::SendVerifyEmail(payload) => self.send_verify_email(payload).await,
        }
    }
}

pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

pub fn verify_url(base_url: &str, verify_email: &VerifyEmail) -> String {
    format!(
        "{}?email_id={}&secret_code={}",
        base_url, verify_email.id, verify_email.secret_code
    )
}

fn compose(user: &User, verify_email: &VerifyEmail, base_url: &str) -> EmailContent {
    let link = verify_url(base_url, verify_email);
    let content = format!(
        "Hello {},<br/>\
         Thanks for opening an account with Simple Bank.<br/>\
         Please <a href=\"{}\">confirm your email address</a> to finish setting it up.<br/>",
        user.full_name, link
    );
    EmailContent::new(
        "Verify your Simple Bank email",
        content,
        vec![user.email.clone()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailError;
    use crate::store::{CreateUserParams, MemoryStore};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailContent>>,
        fail: Option<fn() -> MailError>,
    }

    #[async_trait]
    impl EmailSender for RecordingMailer {
        async fn send_email(&self, email: &EmailContent) -> Result<(), MailError> {
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            self.sent.lock().await.push(email.clone());
            Ok(())
        }
    }

    async fn store_with_alice() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_user(CreateUserParams {
                username: "alice".into(),
                hashed_password: "hashed".into(),
                full_name: "Alice Liddell".into(),
                email: "alice@example.com".into(),
            })
            .await
            .unwrap();
        store
    }

    fn task(username: &str) -> Task {
        Task::SendVerifyEmail(PayloadSendVerifyEmail {
            username: username.into(),
        })
    }

    #[tokio::test]
    async fn test_sends_link_with_fresh_code() {
        let store = store_with_alice().await;
        let mailer = Arc::new(RecordingMailer::default());
        let handler = SendVerifyEmailHandler::new(
            store.clone(),
            mailer.clone(),
            VerifyEmailConfig::default(),
        );

        handler.handle(task("alice")).await.unwrap();

        let records = store.verify_emails_for("alice").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].secret_code.len(), SECRET_CODE_LEN);
        assert!(!records[0].is_used);

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["alice@example.com".to_string()]);
        assert!(sent[0].content.contains(&records[0].secret_code));
        assert!(sent[0].content.contains("Alice Liddell"));
    }

    #[tokio::test]
    async fn test_unknown_user_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(RecordingMailer::default());
        let handler =
            SendVerifyEmailHandler::new(store, mailer.clone(), VerifyEmailConfig::default());

        let err = handler.handle(task("ghost")).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let store = store_with_alice().await;
        store.set_unavailable(true);
        let handler = SendVerifyEmailHandler::new(
            store,
            Arc::new(RecordingMailer::default()),
            VerifyEmailConfig::default(),
        );

        let err = handler.handle(task("alice")).await.unwrap_err();
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_mail_failure_is_retryable() {
        let store = store_with_alice().await;
        let mailer = Arc::new(RecordingMailer {
            fail: Some(|| MailError::Transport("connection refused".into())),
            ..RecordingMailer::default()
        });
        let handler = SendVerifyEmailHandler::new(store, mailer, VerifyEmailConfig::default());

        let err = handler.handle(task("alice")).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.reason().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_relay_rejection_is_permanent() {
        let store = store_with_alice().await;
        let mailer = Arc::new(RecordingMailer {
            fail: Some(|| MailError::Rejected {
                status: 422,
                body: "unknown recipient".into(),
            }),
            ..RecordingMailer::default()
        });
        let handler = SendVerifyEmailHandler::new(store, mailer, VerifyEmailConfig::default());

        let err = handler.handle(task("alice")).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(err.reason().contains("422"));
    }

    #[tokio::test]
    async fn test_relay_outage_is_retryable() {
        let store = store_with_alice().await;
        let mailer = Arc::new(RecordingMailer {
            fail: Some(|| MailError::Rejected {
                status: 503,
                body: "try later".into(),
            }),
            ..RecordingMailer::default()
        });
        let handler = SendVerifyEmailHandler::new(store, mailer, VerifyEmailConfig::default());

        let err = handler.handle(task("alice")).await.unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_verify_url_format() {
        let record = VerifyEmail {
            id: 7,
            username: "alice".into(),
            email: "alice@example.com".into(),
            secret_code: "abc".into(),
            is_used: false,
            created_at: Utc::now(),
            expired_at: Utc::now(),
        };
        assert_eq!(
            verify_url("http://localhost:8080/v1/verify_email", &record),
            "http://localhost:8080/v1/verify_email?email_id=7&secret_code=abc"
        );
    }

    #[test]
    fn test_secret_codes_differ() {
        let a = random_secret_code();
        let b = random_secret_code();
        assert_eq!(a.len(), SECRET_CODE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
