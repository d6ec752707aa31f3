//! Entry points the rest of the system calls when a delivery changes.

use crate::error::ServerResult;
use event_pipeline::{
    EmailMessage, EventPublisher, ExportFormat, ExportJob, NotificationEvent, EMAIL_QUEUE,
    EXPORT_QUEUE,
};
use std::sync::Arc;
use tracing::{debug, warn};
use tracking_hub::{ConnectionRegistry, ScanType, TrackingEvent};

/// A damage report as filed by a courier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageReport {
    pub delivery_id: u64,
    pub damage_type: String,
    pub description: String,
    pub photo: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// Routes delivery events to live viewers and onto the work queues.
///
/// With a bridge configured, live events go through the broker so every
/// instance (this one included) delivers them. Without one they go straight
/// to local viewers.
#[derive(Clone)]
pub struct DeliveryNotifier {
    registry: ConnectionRegistry,
    publisher: EventPublisher,
}

impl DeliveryNotifier {
    pub fn new(registry: ConnectionRegistry, publisher: EventPublisher) -> Self {
        Self { registry, publisher }
    }

    /// Fan a tracking event out to its delivery's viewers. Returns how many
    /// receivers took it: broker subscribers when bridged, local viewers
    /// otherwise.
    pub async fn broadcast(&self, event: &TrackingEvent) -> ServerResult<usize> {
        let key = event.key();
        let receivers = match self.registry.bridge() {
            Some(bridge) => bridge.publish_event(&key, event).await?,
            None => {
                let payload: Arc<str> = Arc::from(event.to_json()?);
                self.registry.broadcast_local(&key, payload).delivered
            }
        };
        debug!(key = %key, event = event.name(), receivers, "tracking event broadcast");
        Ok(receivers)
    }

    pub async fn scan_updated(
        &self,
        delivery_id: u64,
        event_type: ScanType,
        location: impl Into<String>,
    ) -> ServerResult<usize> {
        self.broadcast(&TrackingEvent::scan_updated(delivery_id, event_type, location))
            .await
    }

    pub async fn status_changed(
        &self,
        delivery_id: u64,
        status: impl Into<String>,
        previous_status: Option<String>,
    ) -> ServerResult<usize> {
        self.broadcast(&TrackingEvent::status_changed(delivery_id, status, previous_status))
            .await
    }

    /// Tell viewers about the damage and queue an email to operations.
    ///
    /// Both are attempted; the first failure is returned.
    pub async fn damage_reported(&self, report: DamageReport) -> ServerResult<()> {
        let live = self
            .broadcast(&TrackingEvent::damage_reported(
                report.delivery_id,
                report.damage_type,
                report.description,
            ))
            .await;
        if let Err(e) = &live {
            warn!(
                delivery_id = report.delivery_id,
                error = %e,
                "failed to broadcast damage report"
            );
        }

        let queued = self
            .publisher
            .publish(
                EMAIL_QUEUE,
                &NotificationEvent::DamageReported {
                    delivery_id: report.delivery_id,
                    photo: report.photo,
                    file_size: report.file_size,
                    mime_type: report.mime_type,
                },
            )
            .await;

        live?;
        queued?;
        Ok(())
    }

    /// Queue the "delivery created" email. Returns the broker message id.
    pub async fn delivery_created(
        &self,
        delivery_id: u64,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> ServerResult<String> {
        let event = NotificationEvent::DeliveryCreated {
            delivery_id,
            from: from.into(),
            to: to.into(),
        };
        Ok(self.publisher.publish(EMAIL_QUEUE, &event).await?)
    }

    /// Queue an export. The returned job carries the id to hand back to the requester.
    pub async fn request_export(
        &self,
        format: ExportFormat,
        email: impl Into<String>,
    ) -> ServerResult<ExportJob> {
        let job = ExportJob::new(format, email);
        self.publisher.publish(EXPORT_QUEUE, &job).await?;
        Ok(job)
    }

    pub async fn send_email(&self, message: &EmailMessage) -> ServerResult<String> {
        Ok(self.publisher.publish(EMAIL_QUEUE, message).await?)
    }
}
