//! Offline push fallback.
//!
//! Provider integrations (APNs, FCM) live outside this core. The gateway
//! wires [`LogPushSender`], which records what would have been pushed.

use async_trait::async_trait;
use parley_core::{PushError, PushNotification, PushSender, UserId};
use tracing::info;

/// Push sender that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, user_id: &UserId, notification: PushNotification) -> Result<(), PushError> {
        info!(
            user_id = %user_id,
            title = %notification.title,
            body = %notification.body,
            "push notification (log only)"
        );
        Ok(())
    }
}
