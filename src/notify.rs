// src/notify.rs

//! Run summary and e-mail notification
//!
//! Every run collects human readable summary lines (downloads, installs,
//! ignored errors, action requests). With `[notification] active` they
//! are mailed to the configured receivers at the end of the run; a failed
//! run gets its subject prefixed with `ERROR`.

use crate::config::NotificationConfig;
use crate::error::{Error, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{debug, info};

/// Collects summary lines and optionally mails them
#[derive(Debug)]
pub struct Notifier {
    subject: String,
    lines: Vec<String>,
    email: Option<NotificationConfig>,
}

impl Notifier {
    /// Collect lines without sending them anywhere
    pub fn disabled() -> Self {
        Self {
            subject: String::new(),
            lines: Vec::new(),
            email: None,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        if !config.active {
            return Self::disabled();
        }
        info!("E-Mail notification is activated");
        Self {
            subject: config.subject.clone(),
            lines: Vec::new(),
            email: Some(config.clone()),
        }
    }

    pub fn append_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("Notification: {}", line);
        self.lines.push(line);
    }

    /// Mark the run as failed
    pub fn set_failed(&mut self) {
        if !self.subject.starts_with("ERROR ") {
            self.subject = format!("ERROR {}", self.subject);
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn has_message(&self) -> bool {
        !self.lines.is_empty()
    }

    pub fn body(&self) -> String {
        let mut body = self.lines.join("\n");
        body.push('\n');
        body
    }

    /// Send the collected lines if e-mail is configured and there is
    /// anything to report
    pub fn notify(&self) -> Result<()> {
        let Some(config) = &self.email else {
            return Ok(());
        };
        if !self.has_message() {
            return Ok(());
        }
        if config.receivers.is_empty() {
            return Err(Error::NotificationError("No receivers configured".into()));
        }

        let message = build_message(config, &self.subject, self.body())?;
        let transport = build_transport(config)?;
        info!(
            "Sending notification to {} via {}:{}",
            config.receivers.join(", "),
            config.smtp_host,
            config.smtp_port
        );
        transport
            .send(&message)
            .map_err(|e| Error::NotificationError(format!("Failed to send e-mail: {e}")))?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| Error::NotificationError(format!("Invalid e-mail address '{address}': {e}")))
}

fn build_message(config: &NotificationConfig, subject: &str, body: String) -> Result<Message> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&config.sender)?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for receiver in &config.receivers {
        builder = builder.to(parse_mailbox(receiver)?);
    }
    builder
        .body(body)
        .map_err(|e| Error::NotificationError(format!("Failed to build e-mail: {e}")))
}

fn build_transport(config: &NotificationConfig) -> Result<SmtpTransport> {
    let builder = if config.use_starttls {
        SmtpTransport::starttls_relay(&config.smtp_host)
            .map_err(|e| Error::NotificationError(format!("STARTTLS setup failed: {e}")))?
    } else {
        SmtpTransport::builder_dangerous(&config.smtp_host)
    };
    let builder = builder.port(config.smtp_port);

    let builder = match (&config.smtp_user, &config.smtp_password) {
        (Some(user), Some(password)) => builder.credentials(Credentials::new(user.clone(), password.clone())),
        _ => builder,
    };
    Ok(builder.build())
}
