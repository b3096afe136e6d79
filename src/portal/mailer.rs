//! Outgoing email (sign-in links and invitations).

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::config::{MailMode, MailSection};
use crate::errors::PortalError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Delivery backend. `LogMailer` for development, `WebhookMailer` to hand the
/// message to an external relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        info!(
            to = %message.to,
            subject = %message.subject,
            body = %message.text,
            "Outgoing email (log mode)"
        );
        Ok(())
    }
}

pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| PortalError::Mail(e.to_string()))
            .context("Failed to reach mail webhook")?;
        if !resp.status().is_success() {
            return Err(PortalError::Mail(format!("webhook returned {}", resp.status())).into());
        }
        info!(to = %message.to, subject = %message.subject, "Email handed to webhook");
        Ok(())
    }
}

/// Build the configured mailer.
pub fn from_config(config: &MailSection) -> Result<Arc<dyn Mailer>> {
    match config.mode {
        MailMode::Log => Ok(Arc::new(LogMailer)),
        MailMode::Webhook => {
            let url = config
                .webhook_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .context("mail.webhook_url is required when mail.mode = \"webhook\"")?;
            Ok(Arc::new(WebhookMailer::new(url)))
        }
    }
}

/// Sign-in email for a magic link.
pub fn sign_in_message(from: &str, to: &str, link: &str) -> MailMessage {
    MailMessage {
        from: from.to_string(),
        to: to.to_string(),
        subject: "Your Fireside sign-in link".to_string(),
        text: format!(
            "Use this link to sign in to Fireside Reviews:\n\n{}\n\nIf you did not request it, ignore this email.",
            link
        ),
    }
}

/// Invitation email for a newly added user.
pub fn invite_message(from: &str, to: &str, full_name: Option<&str>, link: &str) -> MailMessage {
    let greeting = match full_name {
        Some(name) => format!("Hi {},", name),
        None => "Hi,".to_string(),
    };
    MailMessage {
        from: from.to_string(),
        to: to.to_string(),
        subject: "You're invited to Fireside Reviews".to_string(),
        text: format!(
            "{}\n\nYou have been added to Fireside Reviews. Sign in here:\n\n{}",
            greeting, link
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures messages instead of sending them.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<MailMessage>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &MailMessage) -> Result<()> {
            self.sent
                .lock()
                .map_err(|e| anyhow::anyhow!("poisoned: {}", e))?
                .push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn test_webhook_mode_requires_url() {
        let config = MailSection {
            mode: MailMode::Webhook,
            ..Default::default()
        };
        let err = from_config(&config).err().expect("missing url must fail");
        assert!(err.to_string().contains("webhook_url"));

        let config = MailSection {
            mode: MailMode::Webhook,
            webhook_url: Some("http://127.0.0.1:9/mail".to_string()),
            ..Default::default()
        };
        assert!(from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_messages() {
        let mailer = from_config(&MailSection::default()).unwrap();
        let msg = sign_in_message("from@example.com", "erin@example.com", "http://x/auth/callback?token=t");
        mailer.send(&msg).await.unwrap();
    }

    #[test]
    fn test_message_bodies_carry_link() {
        let msg = invite_message("f", "erin@example.com", Some("Erin"), "http://link");
        assert!(msg.text.starts_with("Hi Erin,"));
        assert!(msg.text.contains("http://link"));
        let msg = sign_in_message("f", "erin@example.com", "http://link");
        assert!(msg.text.contains("http://link"));
        assert_eq!(msg.to, "erin@example.com");
    }

    #[tokio::test]
    async fn test_webhook_failure_is_a_mail_error() {
        // Port 9 (discard) is closed on test hosts; the connection is refused.
        let mailer = WebhookMailer::new("http://127.0.0.1:9/mail");
        let msg = sign_in_message("f", "erin@example.com", "http://link");
        let err = mailer.send(&msg).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PortalError>(),
            Some(PortalError::Mail(_))
        ));
    }
}
