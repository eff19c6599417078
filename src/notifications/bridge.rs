use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{Notification, NotificationType, Notifier, Severity};
use crate::{
    auth::UserRole,
    participation::{Membership, Tour},
};

const ADMINS: &[UserRole] = &[UserRole::Admin];
const ADMINS_AND_LEADERS: &[UserRole] = &[UserRole::Admin, UserRole::Leader];

#[derive(Debug, Clone)]
pub struct SosAlert {
    pub user_id: Uuid,
    pub username: String,
    pub tour_id: Option<Uuid>,
    pub message: Option<String>,
    pub location: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub user_id: Uuid,
    pub username: String,
    pub tour_id: Option<Uuid>,
    pub description: String,
    pub severity: Option<Severity>,
}

/// Turns workflow transitions and incident reports into pushes.
///
/// Returns the number of channels reached; callers only log it. Delivery
/// never feeds back into the outcome of the operation that triggered it.
#[derive(Clone)]
pub struct NotificationBridge {
    notifier: Arc<dyn Notifier>,
}

impl NotificationBridge {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn join_requested(&self, membership: &Membership, tour: &Tour) -> usize {
        let notification = Notification::new(
            &format!("tour-request-{}", membership.id),
            NotificationType::TourRequest,
            Severity::Medium,
            "New tour join request",
            format!("A user requested to join \"{}\"", tour.name),
            membership_payload(membership, tour),
        );
        let delivered = self.notifier.push_to_roles(ADMINS, notification);
        debug!(request_id = %membership.id, delivered, "join request notification sent");
        delivered
    }

    pub fn request_approved(&self, membership: &Membership, tour: &Tour) -> usize {
        let notification = Notification::new(
            &format!("tour-approved-{}", membership.id),
            NotificationType::TourRequest,
            Severity::Medium,
            "Tour request approved",
            format!("Your request to join \"{}\" was approved", tour.name),
            membership_payload(membership, tour),
        );
        let delivered = self.notifier.push_to(membership.user_id, notification);
        debug!(request_id = %membership.id, delivered, "approval notification sent");
        delivered
    }

    pub fn request_rejected(&self, membership: &Membership, tour: &Tour) -> usize {
        let message = match membership.rejection_reason.as_deref() {
            Some(reason) => format!(
                "Your request to join \"{}\" was rejected: {reason}",
                tour.name
            ),
            None => format!("Your request to join \"{}\" was rejected", tour.name),
        };
        let notification = Notification::new(
            &format!("tour-rejected-{}", membership.id),
            NotificationType::TourRequest,
            Severity::Low,
            "Tour request rejected",
            message,
            membership_payload(membership, tour),
        );
        let delivered = self.notifier.push_to(membership.user_id, notification);
        debug!(request_id = %membership.id, delivered, "rejection notification sent");
        delivered
    }

    pub fn sos_triggered(&self, alert: &SosAlert) -> usize {
        let notification = Notification::new(
            &format!("sos-{}", alert.user_id),
            NotificationType::Sos,
            Severity::Critical,
            "SOS alert",
            alert
                .message
                .clone()
                .unwrap_or_else(|| format!("{} triggered an SOS", alert.username)),
            json!({
                "user_id": alert.user_id,
                "username": alert.username,
                "tour_id": alert.tour_id,
                "location": alert.location,
            }),
        );
        let delivered = self.notifier.push_to_roles(ADMINS_AND_LEADERS, notification);
        debug!(user_id = %alert.user_id, delivered, "sos notification sent");
        delivered
    }

    pub fn health_reported(&self, report: &HealthReport) -> usize {
        let notification = Notification::new(
            &format!("health-{}", report.user_id),
            NotificationType::Health,
            report.severity.unwrap_or(Severity::High),
            "Health report",
            format!("{}: {}", report.username, report.description),
            json!({
                "user_id": report.user_id,
                "username": report.username,
                "tour_id": report.tour_id,
                "description": report.description,
            }),
        );
        let delivered = self.notifier.push_to_roles(ADMINS_AND_LEADERS, notification);
        debug!(user_id = %report.user_id, delivered, "health notification sent");
        delivered
    }

    pub fn announce(
        &self,
        author_id: Uuid,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> usize {
        let notification = Notification::new(
            &format!("announcement-{author_id}"),
            NotificationType::Announcement,
            severity,
            title,
            message,
            json!({ "author_id": author_id }),
        );
        self.notifier.broadcast(notification)
    }
}

fn membership_payload(membership: &Membership, tour: &Tour) -> Value {
    json!({
        "request_id": membership.id,
        "tour_id": tour.id,
        "tour_name": tour.name,
        "user_id": membership.user_id,
        "role": membership.role,
        "status": membership.status,
        "rejection_reason": membership.rejection_reason,
    })
}
