//! HTTP mail relay sender

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EmailContent, EmailSender, MailError};

#[derive(Debug, Serialize)]
struct Mailbox<'a> {
    name: &'a str,
    address: &'a str,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Attachment {
    filename: String,
    /// base64
    content: String,
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from: Mailbox<'a>,
    to: &'a [String],
    cc: &'a [String],
    bcc: &'a [String],
    subject: &'a str,
    html: &'a str,
    attachments: Vec<Attachment>,
}

pub struct HttpRelaySender {
    client: reqwest::Client,
    relay_url: String,
    api_key: Option<String>,
    sender_name: String,
    sender_address: String,
}

impl HttpRelaySender {
    pub fn new(
        relay_url: &str,
        api_key: Option<String>,
        sender_name: &str,
        sender_address: &str,
    ) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MailError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            relay_url: relay_url.to_string(),
            api_key,
            sender_name: sender_name.to_string(),
            sender_address: sender_address.to_string(),
        })
    }
}

async fn load_attachments(paths: &[PathBuf]) -> Result<Vec<Attachment>, MailError> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| MailError::Attachment {
                path: path.clone(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        attachments.push(Attachment {
            filename,
            content: STANDARD.encode(bytes),
        });
    }
    Ok(attachments)
}

#[async_trait]
impl EmailSender for HttpRelaySender {
    async fn send_email(&self, email: &EmailContent) -> Result<(), MailError> {
        email.validate()?;
        let request = RelayRequest {
            from: Mailbox {
                name: &self.sender_name,
                address: &self.sender_address,
            },
            to: &email.to,
            cc: &email.cc,
            bcc: &email.bcc,
            subject: &email.subject,
            html: &email.content,
            attachments: load_attachments(&email.attach_files).await?,
        };

        let mut builder = self.client.post(&self.relay_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MailError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "MAIL", status = status.as_u16(), "mail relay rejected message");
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(target: "MAIL", to = ?email.to, subject = %email.subject, "email handed to relay");
        Ok(())
    }
}
