//! Queue names and the job payloads carried on them.

use serde::{Deserialize, Serialize};

/// Outbound email work: direct messages and delivery notifications.
pub const EMAIL_QUEUE: &str = "email.queue";
/// Failed email deliveries awaiting retry or inspection.
pub const EMAIL_DLQ: &str = "email.dlq";
/// Asynchronous export requests.
pub const EXPORT_QUEUE: &str = "export.queue";
pub const EXPORT_DLQ: &str = "export.dlq";

/// A fully addressed email, e.g. a password reset or verification link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            files: Vec::new(),
        }
    }
}

/// A delivery lifecycle event that operations should hear about by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum NotificationEvent {
    #[serde(rename = "delivery.created")]
    DeliveryCreated {
        delivery_id: u64,
        from: String,
        to: String,
    },

    #[serde(rename = "damage.reported")]
    DamageReported {
        delivery_id: u64,
        photo: String,
        file_size: u64,
        mime_type: String,
    },
}

impl NotificationEvent {
    pub fn delivery_id(&self) -> u64 {
        match self {
            NotificationEvent::DeliveryCreated { delivery_id, .. }
            | NotificationEvent::DamageReported { delivery_id, .. } => *delivery_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::DeliveryCreated { .. } => "delivery.created",
            NotificationEvent::DamageReported { .. } => "damage.reported",
        }
    }
}

/// Anything found on the email queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmailJob {
    Notification(NotificationEvent),
    Direct(EmailMessage),
}

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportFormat::Csv => f.write_str("csv"),
            ExportFormat::Xlsx => f.write_str("xlsx"),
        }
    }
}

/// A request to export the delivery list and email the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub job_id: String,
    pub format: ExportFormat,
    pub email: String,
}

impl ExportJob {
    /// New job with a random `job-<uuid>` id.
    pub fn new(format: ExportFormat, email: impl Into<String>) -> Self {
        Self {
            job_id: format!("job-{}", uuid::Uuid::new_v4().simple()),
            format,
            email: email.into(),
        }
    }
}
