//! Outbound Notifier
//!
//! [`EmailSender`] is the only way the system talks to users. Handlers
//! build an [`EmailContent`] and hand it to whichever sender is configured:
//!
//! - [`HttpRelaySender`] - posts the message to an HTTP mail relay
//! - [`LogSender`] - writes the message to the log (development, tests)

pub mod relay;

pub use relay::HttpRelaySender;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::EmailConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    /// HTML body
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<PathBuf>,
}

impl EmailContent {
    pub fn new(subject: impl Into<String>, content: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            content: content.into(),
            to,
            ..Self::default()
        }
    }

    /// Reject messages no transport could deliver
    pub fn validate(&self) -> Result<(), MailError> {
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(MailError::InvalidMessage("no recipients".to_string()));
        }
        if self.subject.trim().is_empty() {
            return Err(MailError::InvalidMessage("empty subject".to_string()));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("failed to attach file {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mail transport error: {0}")]
    Transport(String),

    #[error("mail relay rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl MailError {
    /// True when resending the same message can never succeed
    ///
    /// Relay 4xx answers are final, except request timeout (408) and rate
    /// limiting (429). Transport failures and 5xx are transient.
    pub fn is_permanent(&self) -> bool {
        match self {
            MailError::InvalidMessage(_) | MailError::Attachment { .. } => true,
            MailError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            MailError::Transport(_) => false,
        }
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &EmailContent) -> Result<(), MailError>;
}

/// Logs messages instead of delivering them
#[derive(Debug, Clone, Default)]
pub struct LogSender {
    from: String,
}

impl LogSender {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl EmailSender for LogSender {
    async fn send_email(&self, email: &EmailContent) -> Result<(), MailError> {
        email.validate()?;
        info!(
            target: "MAIL",
            from = %self.from,
            to = ?email.to,
            cc = ?email.cc,
            subject = %email.subject,
            attachments = email.attach_files.len(),
            "email not delivered (log sender)"
        );
        Ok(())
    }
}

/// Pick the sender described by `config`
pub fn build_sender(config: &EmailConfig) -> Result<Arc<dyn EmailSender>, MailError> {
    let from = format!("{} <{}>", config.sender_name, config.sender_address);
    match &config.relay_url {
        Some(url) => Ok(Arc::new(HttpRelaySender::new(
            url,
            config.api_key.clone(),
            &config.sender_name,
            &config.sender_address,
        )?)),
        None => Ok(Arc::new(LogSender::new(from))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_recipient() {
        let email = EmailContent::new("Welcome", "<p>hi</p>", vec![]);
        assert!(matches!(
            email.validate(),
            Err(MailError::InvalidMessage(_))
        ));

        let bcc_only = EmailContent {
            bcc: vec!["audit@simplebank.local".into()],
            ..email
        };
        assert!(bcc_only.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_subject() {
        let email = EmailContent::new("  ", "body", vec!["a@b.c".into()]);
        assert!(email.validate().is_err());
    }

    #[tokio::test]
    async fn test_log_sender_accepts_valid_message() {
        let sender = LogSender::new("Simple Bank <no-reply@simplebank.local>");
        let email = EmailContent::new("Welcome", "<p>hi</p>", vec!["alice@example.com".into()]);
        sender.send_email(&email).await.unwrap();
    }

    #[test]
    fn test_permanent_mail_errors() {
        assert!(MailError::InvalidMessage("no recipients".into()).is_permanent());
        assert!(
            MailError::Attachment {
                path: PathBuf::from("/missing.pdf"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }
            .is_permanent()
        );
        for status in [400, 403, 422] {
            let rejected = MailError::Rejected {
                status,
                body: String::new(),
            };
            assert!(rejected.is_permanent(), "status {status}");
        }
    }

    #[test]
    fn test_transient_mail_errors() {
        assert!(!MailError::Transport("connection reset".into()).is_permanent());
        for status in [408, 429, 500, 502, 503] {
            let rejected = MailError::Rejected {
                status,
                body: String::new(),
            };
            assert!(!rejected.is_permanent(), "status {status}");
        }
    }

    #[test]
    fn test_build_sender_without_relay() {
        assert!(build_sender(&EmailConfig::default()).is_ok());
    }
}
