//! Notification: tell the user their results are ready.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use annoflow_events::{LifecycleEvent, ResultsReady, Topic};

use super::{unexpected, DeliveryContext, StageError, StageProcessor};
use crate::collaborators::{AccountDirectory, Mail, Mailer};
use crate::config::NotifyConfig;

pub struct NotificationStage {
    accounts: Arc<dyn AccountDirectory>,
    mailer: Arc<dyn Mailer>,
    sender: String,
    job_link_base: String,
}

impl NotificationStage {
    pub fn new(accounts: Arc<dyn AccountDirectory>, mailer: Arc<dyn Mailer>, config: &NotifyConfig) -> Self {
        Self {
            accounts,
            mailer,
            sender: config.sender.clone(),
            job_link_base: config.job_link_base.clone(),
        }
    }

    fn compose(&self, to: String, ready: &ResultsReady) -> Result<Mail, StageError> {
        let completed = DateTime::<Utc>::from_timestamp(ready.complete_time, 0).ok_or_else(|| {
            StageError::Validation(format!("complete_time {} out of range", ready.complete_time))
        })?;

        Ok(Mail {
            from: self.sender.clone(),
            to,
            subject: format!("Results available for job {}", ready.job_id),
            body: format!(
                "Your annotation job completed at {}. Click here to view job details and results: {}{}.",
                completed.format("%Y-%m-%d @ %H:%M:%S"),
                self.job_link_base,
                ready.job_id
            ),
        })
    }

    fn notify(&self, ready: ResultsReady) -> Result<(), StageError> {
        let profile = self.accounts.get_user_profile(&ready.user_id)?;
        let mail = self.compose(profile.email, &ready)?;
        // Any delivery failure is worth retrying; the message stays queued.
        self.mailer
            .send(&mail)
            .map_err(|e| StageError::Transient(e.to_string()))?;
        info!(job_id = %ready.job_id, user_id = %ready.user_id, "completion notice sent");
        Ok(())
    }
}

impl StageProcessor for NotificationStage {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn topic(&self) -> Topic {
        Topic::JobResults
    }

    fn process(&self, event: LifecycleEvent, _ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::ResultsReady(ready) => self.notify(ready),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}
