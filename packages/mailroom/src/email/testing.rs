//! Test double for the SMTP backend.

use async_trait::async_trait;
use lettre::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::smtp::{SendOutcome, SmtpSender};

/// Record of one delivery attempt handed to the mock.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub recipients: Vec<String>,
    pub raw: Vec<u8>,
}

/// Scripted SMTP sender: pops queued outcomes, then keeps returning the
/// default. Records every attempt for assertions.
pub struct MockSmtpSender {
    scripted: Mutex<VecDeque<SendOutcome>>,
    default_outcome: SendOutcome,
    attempts: Mutex<Vec<SentRecord>>,
    reachable: AtomicBool,
}

impl Default for MockSmtpSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSmtpSender {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_outcome: SendOutcome::Sent,
            attempts: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn with_default(default_outcome: SendOutcome) -> Self {
        Self {
            default_outcome,
            ..Self::new()
        }
    }

    /// Queue an outcome for the next attempt.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Queue the same failure for the next `n` attempts.
    pub fn fail_next(&self, n: usize, outcome: SendOutcome) {
        for _ in 0..n {
            self.push_outcome(outcome.clone());
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<SentRecord> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl SmtpSender for MockSmtpSender {
    async fn send(&self, message: Message) -> SendOutcome {
        let recipients = message
            .envelope()
            .to()
            .iter()
            .map(|addr| addr.to_string())
            .collect();

        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentRecord {
                recipients,
                raw: message.formatted(),
            });

        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }

    async fn test_connection(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::builder()
            .from("noreply@example.com".parse().unwrap())
            .to("a@example.com".parse().unwrap())
            .subject("test")
            .body("hello".to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn scripted_outcomes_drain_then_default_applies() {
        let mock = MockSmtpSender::new();
        mock.fail_next(2, SendOutcome::RetryableFailure("421 busy".into()));

        assert_eq!(
            mock.send(message()).await,
            SendOutcome::RetryableFailure("421 busy".into())
        );
        assert_eq!(
            mock.send(message()).await,
            SendOutcome::RetryableFailure("421 busy".into())
        );
        assert_eq!(mock.send(message()).await, SendOutcome::Sent);
        assert_eq!(mock.attempt_count(), 3);
    }

    #[tokio::test]
    async fn records_recipients() {
        let mock = MockSmtpSender::new();
        mock.send(message()).await;
        assert_eq!(mock.attempts()[0].recipients, vec!["a@example.com"]);
    }
}
