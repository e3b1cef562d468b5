//! SMTP delivery backend.
//!
//! Wraps lettre's async transport behind the [`SmtpSender`] trait so the
//! worker pipeline and the health prober never touch the transport directly.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::warn;

use crate::config::SmtpConfig;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Worth retrying: 4xx responses, timeouts, connection resets.
    RetryableFailure(String),
    /// Do not retry: 5xx addressing, auth rejection, size limits.
    PermanentFailure(String),
}

#[async_trait]
pub trait SmtpSender: Send + Sync {
    async fn send(&self, message: Message) -> SendOutcome;

    /// Connectivity probe for the health monitor.
    async fn test_connection(&self) -> bool;
}

/// Production sender over `AsyncSmtpTransport<Tokio1Executor>`.
pub struct LettreSmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    send_timeout: Duration,
}

impl LettreSmtpSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, lettre::transport::smtp::Error> {
        let mut builder = if config.use_tls {
            let tls = TlsParameters::new(config.host.clone())?;
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
                .tls(Tls::Required(tls))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.port(config.port).build(),
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl SmtpSender for LettreSmtpSender {
    async fn send(&self, message: Message) -> SendOutcome {
        let attempt = tokio::time::timeout(self.send_timeout, self.transport.send(message));

        match attempt.await {
            Ok(Ok(_)) => SendOutcome::Sent,
            Ok(Err(e)) if e.is_permanent() => SendOutcome::PermanentFailure(e.to_string()),
            // Transient SMTP codes, connection drops, DNS hiccups.
            Ok(Err(e)) => SendOutcome::RetryableFailure(e.to_string()),
            Err(_) => SendOutcome::RetryableFailure(format!(
                "smtp send timed out after {}s",
                self.send_timeout.as_secs()
            )),
        }
    }

    async fn test_connection(&self) -> bool {
        match self.transport.test_connection().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "smtp connection test failed");
                false
            }
        }
    }
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SendOutcome::Sent => None,
            SendOutcome::RetryableFailure(e) | SendOutcome::PermanentFailure(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_helpers() {
        assert!(SendOutcome::Sent.is_sent());
        assert!(SendOutcome::Sent.error().is_none());

        let retry = SendOutcome::RetryableFailure("421 busy".into());
        assert!(!retry.is_sent());
        assert_eq!(retry.error(), Some("421 busy"));
    }
}
