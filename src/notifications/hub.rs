use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Frame, Notification, NotificationType, Severity};
use crate::auth::UserRole;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("notification channel closed")]
pub struct SinkClosed;

/// Write side of a client connection.
///
/// `try_send` must never wait: a full or closed sink is reported as an error
/// and the hub evicts the channel.
pub trait FrameSink: Send + Sync + 'static {
    fn try_send(&self, frame: Frame) -> Result<(), SinkClosed>;
}

impl FrameSink for mpsc::Sender<Frame> {
    fn try_send(&self, frame: Frame) -> Result<(), SinkClosed> {
        mpsc::Sender::try_send(self, frame).map_err(|_| SinkClosed)
    }
}

/// Push capability used by notification producers.
pub trait Notifier: Send + Sync {
    fn push_to(&self, user_id: Uuid, notification: Notification) -> usize;
    fn push_to_roles(&self, roles: &[UserRole], notification: Notification) -> usize;
    fn broadcast(&self, notification: Notification) -> usize;
}

/// Identifies one registration, so a stale connection can release itself
/// without evicting a newer one for the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    pub user_id: Uuid,
    id: u64,
}

struct Channel {
    id: u64,
    role: UserRole,
    sink: Box<dyn FrameSink>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<Uuid, Channel>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` as the only channel for `user_id` and sends it a
    /// connected acknowledgment. Any earlier channel for the user is dropped,
    /// even when the acknowledgment fails and `sink` itself is not registered.
    pub fn connect(&self, user_id: Uuid, role: UserRole, sink: impl FrameSink) -> ChannelHandle {
        let handle = ChannelHandle {
            user_id,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let channel = Channel {
            id: handle.id,
            role,
            sink: Box::new(sink),
            connected_at: Utc::now(),
        };
        let ack = Frame::Notification(Arc::new(connected_ack(user_id, role)));

        let mut channels = self.lock();
        let acknowledged = channel.sink.try_send(ack).is_ok();
        let replaced = if acknowledged {
            channels.insert(user_id, channel).is_some()
        } else {
            channels.remove(&user_id).is_some()
        };
        drop(channels);

        if acknowledged {
            info!(%user_id, role = role.as_str(), replaced, "notification channel connected");
        } else {
            debug!(%user_id, "notification channel failed before acknowledgment");
        }
        handle
    }

    pub fn disconnect(&self, user_id: Uuid) -> bool {
        let removed = self.lock().remove(&user_id).is_some();
        if removed {
            info!(%user_id, "notification channel disconnected");
        }
        removed
    }

    /// Removes the registration behind `handle` if it is still the live one.
    pub fn release(&self, handle: ChannelHandle) -> bool {
        let mut channels = self.lock();
        let current = channels
            .get(&handle.user_id)
            .is_some_and(|channel| channel.id == handle.id);
        if current {
            channels.remove(&handle.user_id);
            drop(channels);
            info!(user_id = %handle.user_id, "notification channel closed by client");
        }
        current
    }

    pub fn push_to(&self, user_id: Uuid, notification: Notification) -> usize {
        let frame = Frame::Notification(Arc::new(notification));
        let mut channels = self.lock();
        let Some(channel) = channels.get(&user_id) else {
            return 0;
        };
        if channel.sink.try_send(frame).is_ok() {
            return 1;
        }
        channels.remove(&user_id);
        drop(channels);
        debug!(%user_id, "evicted notification channel after failed write");
        0
    }

    pub fn push_to_roles(&self, roles: &[UserRole], notification: Notification) -> usize {
        let frame = Frame::Notification(Arc::new(notification));
        self.deliver_where(frame, |channel| roles.contains(&channel.role))
    }

    pub fn broadcast(&self, notification: Notification) -> usize {
        let frame = Frame::Notification(Arc::new(notification));
        self.deliver_where(frame, |_| true)
    }

    /// Writes a heartbeat frame to every channel and returns how many are alive.
    pub fn heartbeat(&self) -> usize {
        self.deliver_where(Frame::Heartbeat, |_| true)
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.lock().contains_key(&user_id)
    }

    pub fn connected_since(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock().get(&user_id).map(|channel| channel.connected_at)
    }

    pub fn connected_count(&self) -> usize {
        self.lock().len()
    }

    fn deliver_where<F>(&self, frame: Frame, matches: F) -> usize
    where
        F: Fn(&Channel) -> bool,
    {
        let mut channels = self.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (user_id, channel) in channels.iter() {
            if !matches(channel) {
                continue;
            }
            match channel.sink.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(SinkClosed) => dead.push(*user_id),
            }
        }
        for user_id in &dead {
            channels.remove(user_id);
        }
        drop(channels);

        for user_id in dead {
            debug!(%user_id, "evicted notification channel after failed write");
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for NotificationHub {
    fn push_to(&self, user_id: Uuid, notification: Notification) -> usize {
        NotificationHub::push_to(self, user_id, notification)
    }

    fn push_to_roles(&self, roles: &[UserRole], notification: Notification) -> usize {
        NotificationHub::push_to_roles(self, roles, notification)
    }

    fn broadcast(&self, notification: Notification) -> usize {
        NotificationHub::broadcast(self, notification)
    }
}

/// Runs [`NotificationHub::heartbeat`] every `period` until the task is aborted.
pub fn spawn_heartbeat(hub: Arc<NotificationHub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let alive = hub.heartbeat();
            debug!(alive, "notification heartbeat sent");
        }
    })
}

fn connected_ack(user_id: Uuid, role: UserRole) -> Notification {
    Notification::new(
        &format!("connected-{user_id}"),
        NotificationType::Announcement,
        Severity::Low,
        "Connected",
        "Notification stream established",
        json!({
            "event": "connected",
            "user_id": user_id,
            "role": role,
        }),
    )
}
