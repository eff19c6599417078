use std::sync::Arc;

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    notifications::{NotificationBridge, NotificationHub},
    participation::{ParticipationStore, ParticipationWorkflow},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub workflow: ParticipationWorkflow,
    pub hub: Arc<NotificationHub>,
    pub bridge: NotificationBridge,
    pub jwt: JwtService,
}

impl AppState {
    /// Wires the workflow and incident reports to push through `hub`.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ParticipationStore>,
        hub: Arc<NotificationHub>,
        jwt: JwtService,
    ) -> Self {
        let bridge = NotificationBridge::new(hub.clone());
        let workflow = ParticipationWorkflow::new(store, bridge.clone());
        Self {
            config: Arc::new(config),
            workflow,
            hub,
            bridge,
            jwt,
        }
    }
}
