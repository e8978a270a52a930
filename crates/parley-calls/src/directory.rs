//! `SQLite`-backed conversation membership and device presence records.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{
    ConversationDirectory, ConversationId, DeviceId, DeviceRecorder, DirectoryError, RecorderError,
    UserId,
};
use tracing::debug;

use crate::clock::Clock;
use crate::errors::{StoreError, StoreResult};
use crate::sqlite::repositories::{ConversationRepo, DeviceRepo, UserRepo};
use crate::sqlite::store::CallStore;

/// Directory over the shared database.
///
/// The async trait impls run on the blocking pool. The inherent helpers are
/// synchronous and used for provisioning (and by tests).
#[derive(Clone)]
pub struct SqliteDirectory {
    store: CallStore,
    clock: Arc<dyn Clock>,
}

impl SqliteDirectory {
    /// Create a directory over `store`.
    pub fn new(store: CallStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a user if absent.
    pub fn create_user(&self, id: &UserId, display_name: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        self.store
            .immediate(|tx| UserRepo::create(tx, id, display_name, now))
    }

    /// Make two users mutual contacts.
    pub fn add_contact(&self, a: &UserId, b: &UserId) -> StoreResult<()> {
        let now = self.clock.now_millis();
        self.store.immediate(|tx| UserRepo::add_contact(tx, a, b, now))
    }

    /// Create a group conversation.
    pub fn create_group(&self, members: &[UserId]) -> StoreResult<ConversationId> {
        let now = self.clock.now_millis();
        self.store
            .immediate(|tx| ConversationRepo::create_group(tx, members, now))
    }

    /// Remove a member from a conversation.
    pub fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> StoreResult<bool> {
        self.store
            .immediate(|tx| ConversationRepo::remove_member(tx, conversation, user))
    }

    /// Find or create the 1:1 conversation of a pair.
    pub fn private_conversation(&self, a: &UserId, b: &UserId) -> StoreResult<ConversationId> {
        let now = self.clock.now_millis();
        self.store
            .immediate(|tx| ConversationRepo::get_or_create_private(tx, a, b, now))
    }

    /// Register a device for a user.
    pub fn register_device(&self, user: &UserId, device: &DeviceId) -> StoreResult<()> {
        self.store
            .immediate(|tx| DeviceRepo::register(tx, user, device))
    }

    /// Whether a device is currently flagged online.
    pub fn is_device_online(&self, device: &DeviceId) -> StoreResult<bool> {
        self.store.read(|conn| DeviceRepo::is_online(conn, device))
    }

    async fn set_online(&self, user: &UserId, device: &DeviceId, online: bool) -> Result<(), RecorderError> {
        let (user, device) = (user.clone(), device.clone());
        let now = self.clock.now_millis();
        let updated = self
            .store
            .blocking(move |store| {
                store.immediate(|tx| DeviceRepo::set_online(tx, &user, &device, online, now))
            })
            .await
            .map_err(|e: StoreError| RecorderError::Unavailable(e.to_string()))?;
        if updated {
            Ok(())
        } else {
            Err(RecorderError::NotRegistered)
        }
    }
}

#[async_trait]
impl ConversationDirectory for SqliteDirectory {
    async fn participants(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Vec<UserId>>, DirectoryError> {
        let id = conversation_id.clone();
        self.store
            .blocking(move |store| store.read(|conn| ConversationRepo::members(conn, &id)))
            .await
            .map_err(|e: StoreError| DirectoryError(e.to_string()))
    }
}

#[async_trait]
impl DeviceRecorder for SqliteDirectory {
    async fn device_online(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), RecorderError> {
        debug!(user_id = %user_id, device_id = %device_id, "recording device online");
        self.set_online(user_id, device_id, true).await
    }

    async fn device_offline(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), RecorderError> {
        debug!(user_id = %user_id, device_id = %device_id, "recording device offline");
        self.set_online(user_id, device_id, false).await
    }
}
