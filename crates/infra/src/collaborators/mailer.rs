//! Outbound e-mail.

use std::sync::{Arc, Mutex};

use tracing::info;

use super::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Mailer: Send + Sync {
    fn send(&self, mail: &Mail) -> Result<(), ProviderError>;
}

impl<M> Mailer for Arc<M>
where
    M: Mailer + ?Sized,
{
    fn send(&self, mail: &Mail) -> Result<(), ProviderError> {
        (**self).send(mail)
    }
}

/// Writes each mail to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: &Mail) -> Result<(), ProviderError> {
        info!(to = %mail.to, subject = %mail.subject, body = %mail.body, "mail sent");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMailer {
    sent: Mutex<Vec<Mail>>,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Mail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Mailer for InMemoryMailer {
    fn send(&self, mail: &Mail) -> Result<(), ProviderError> {
        self.sent
            .lock()
            .map_err(|_| ProviderError::Transient("mailer lock poisoned".into()))?
            .push(mail.clone());
        Ok(())
    }
}
