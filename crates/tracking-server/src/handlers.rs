//! Queue consumers' side effects: turning jobs into emails.

use crate::mail::{Mailer, OutgoingEmail};
use async_trait::async_trait;
use event_pipeline::{DeliveryContext, DeliveryHandler, EmailJob, ExportJob, NotificationEvent};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends everything found on the email queue.
pub struct EmailDeliveryHandler {
    mailer: Arc<dyn Mailer>,
    from: String,
    ops_email: String,
}

impl EmailDeliveryHandler {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        from: impl Into<String>,
        ops_email: impl Into<String>,
    ) -> Self {
        Self {
            mailer,
            from: from.into(),
            ops_email: ops_email.into(),
        }
    }

    /// Direct emails pass through. Lifecycle events go to the ops recipient.
    pub fn render(&self, job: EmailJob) -> OutgoingEmail {
        match job {
            EmailJob::Direct(message) => OutgoingEmail {
                from: self.from.clone(),
                to: message.to,
                subject: message.subject,
                body: message.body,
                attachments: message.files,
            },
            EmailJob::Notification(NotificationEvent::DeliveryCreated {
                delivery_id,
                from,
                to,
            }) => OutgoingEmail {
                from: self.from.clone(),
                to: self.ops_email.clone(),
                subject: format!("Delivery #{delivery_id} created"),
                body: format!("A new delivery #{delivery_id} was created from {from} to {to}."),
                attachments: Vec::new(),
            },
            EmailJob::Notification(NotificationEvent::DamageReported {
                delivery_id,
                photo,
                file_size,
                mime_type,
            }) => OutgoingEmail {
                from: self.from.clone(),
                to: self.ops_email.clone(),
                subject: format!("Damage reported for delivery #{delivery_id}"),
                body: format!(
                    "Damage was reported for delivery #{delivery_id}. \
                     Photo {photo} ({file_size} bytes, {mime_type}) is attached."
                ),
                attachments: vec![photo],
            },
        }
    }
}

#[async_trait]
impl DeliveryHandler for EmailDeliveryHandler {
    type Event = EmailJob;

    async fn deliver(&self, job: EmailJob, ctx: &DeliveryContext) -> anyhow::Result<()> {
        let email = self.render(job);
        debug!(
            message_id = %ctx.message_id,
            retry_count = ctx.retry_count,
            to = %email.to,
            "sending email"
        );
        self.mailer.send(&email).await?;
        Ok(())
    }
}

/// Tells the requester their export is ready.
pub struct ExportDeliveryHandler {
    mailer: Arc<dyn Mailer>,
    from: String,
}

impl ExportDeliveryHandler {
    pub fn new(mailer: Arc<dyn Mailer>, from: impl Into<String>) -> Self {
        Self {
            mailer,
            from: from.into(),
        }
    }
}

#[async_trait]
impl DeliveryHandler for ExportDeliveryHandler {
    type Event = ExportJob;

    async fn deliver(&self, job: ExportJob, ctx: &DeliveryContext) -> anyhow::Result<()> {
        // Nobody to tell; retrying cannot fix a missing address.
        if job.email.trim().is_empty() {
            warn!(
                job_id = %job.job_id,
                message_id = %ctx.message_id,
                "export job has no recipient, skipping"
            );
            return Ok(());
        }

        let email = OutgoingEmail {
            from: self.from.clone(),
            to: job.email,
            subject: format!("Your {} export is ready", job.format),
            body: format!(
                "Export job {} finished. The {} file is attached.",
                job.job_id, job.format
            ),
            attachments: vec![format!("{}.{}", job.job_id, job.format)],
        };
        self.mailer.send(&email).await?;
        Ok(())
    }
}
