//! Registry of live device connections.
//!
//! Two maps behind one lock: `device -> connection` and
//! `user -> {devices}`. Every public method takes the lock once, mutates
//! both maps together, and releases it before any socket work, so the maps
//! always agree: the number of connections equals the sum of every user's
//! device-set size, and no user keeps an empty set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::{DeviceId, ServerEvent, UserId, close_code};
use thiserror::Error;
use tracing::{debug, info};

use super::connection::Connection;

/// Connection caps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Distinct devices one user may have connected at once.
    pub max_devices_per_user: usize,
    /// Connections across all users.
    pub max_total_connections: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_devices_per_user: 5,
            max_total_connections: 10_000,
        }
    }
}

/// Why a new device was refused.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LimitExceeded {
    /// The user already has the maximum number of devices connected.
    #[error("USER_DEVICE_LIMIT")]
    UserDeviceLimit,
    /// The process is at its connection cap.
    #[error("GLOBAL_CONNECTION_LIMIT")]
    GlobalConnectionLimit,
    /// The device ID is connected under a different user.
    #[error("DEVICE_IN_USE")]
    DeviceInUse,
}

impl LimitExceeded {
    /// Close code sent to the refused socket.
    pub fn close_code(self) -> u16 {
        match self {
            Self::UserDeviceLimit | Self::DeviceInUse => close_code::DEVICE_LIMIT,
            Self::GlobalConnectionLimit => close_code::GLOBAL_LIMIT,
        }
    }

    /// Reason string, also used as the metric label.
    pub fn reason(self) -> &'static str {
        match self {
            Self::UserDeviceLimit => "USER_DEVICE_LIMIT",
            Self::GlobalConnectionLimit => "GLOBAL_CONNECTION_LIMIT",
            Self::DeviceInUse => "DEVICE_IN_USE",
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<DeviceId, Arc<Connection>>,
    user_devices: HashMap<UserId, HashSet<DeviceId>>,
    limits: ConnectionLimits,
}

impl Inner {
    fn can_add(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), LimitExceeded> {
        if let Some(existing) = self.connections.get(device_id) {
            return if existing.user_id == *user_id {
                Ok(())
            } else {
                Err(LimitExceeded::DeviceInUse)
            };
        }
        let devices = self.user_devices.get(user_id).map_or(0, HashSet::len);
        if devices >= self.limits.max_devices_per_user {
            return Err(LimitExceeded::UserDeviceLimit);
        }
        if self.connections.len() >= self.limits.max_total_connections {
            return Err(LimitExceeded::GlobalConnectionLimit);
        }
        Ok(())
    }

    fn detach(&mut self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(device_id)?;
        if let Some(devices) = self.user_devices.get_mut(&conn.user_id) {
            let _ = devices.remove(device_id);
            if devices.is_empty() {
                let _ = self.user_devices.remove(&conn.user_id);
            }
        }
        Some(conn)
    }
}

/// Process-local connection registry.
#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    /// Create an empty registry.
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                limits,
                ..Inner::default()
            }),
        }
    }

    /// Whether `device_id` may connect for `user_id`. A device already
    /// connected for the same user (a reconnect) always may; one connected
    /// for another user never may.
    pub fn can_add(&self, user_id: &UserId, device_id: &DeviceId) -> Result<(), LimitExceeded> {
        self.inner.lock().can_add(user_id, device_id)
    }

    /// Register a connection, replacing any existing one for the same
    /// device. The replaced socket is closed with 1000 and returned.
    /// Other devices of the user are untouched.
    pub fn add(&self, conn: Arc<Connection>) -> Result<Option<Arc<Connection>>, LimitExceeded> {
        let replaced = {
            let mut inner = self.inner.lock();
            inner.can_add(&conn.user_id, &conn.device_id)?;
            let replaced = inner.detach(&conn.device_id);
            let _ = inner
                .user_devices
                .entry(conn.user_id.clone())
                .or_default()
                .insert(conn.device_id.clone());
            let _ = inner.connections.insert(conn.device_id.clone(), conn.clone());
            replaced
        };

        if let Some(old) = &replaced {
            info!(
                user_id = %conn.user_id,
                device_id = %conn.device_id,
                "replacing existing connection for device"
            );
            old.close(close_code::NORMAL, "replaced");
        }
        debug!(user_id = %conn.user_id, device_id = %conn.device_id, "connection registered");
        Ok(replaced)
    }

    /// Unregister whatever connection holds `device_id`. Idempotent.
    pub fn remove(&self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        self.inner.lock().detach(device_id)
    }

    /// Unregister `conn` only if it is still the registered connection for
    /// its device. Returns `false` when it was already replaced or removed.
    pub fn remove_connection(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .connections
            .get(&conn.device_id)
            .is_some_and(|c| c.id == conn.id);
        if current {
            let _ = inner.detach(&conn.device_id);
        }
        current
    }

    /// Connection for a device.
    pub fn get(&self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(device_id).cloned()
    }

    /// All of a user's local connections.
    pub fn get_by_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .user_devices
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|d| inner.connections.get(d).cloned())
            .collect()
    }

    /// Every local connection.
    pub fn get_all(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Whether the user has at least one local connection.
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.inner.lock().user_devices.contains_key(user_id)
    }

    /// The user's locally connected device IDs.
    pub fn user_device_ids(&self, user_id: &UserId) -> Vec<DeviceId> {
        self.inner
            .lock()
            .user_devices
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a liveness signal for a device. Returns whether it is connected.
    pub fn update_pong_time(&self, device_id: &DeviceId) -> bool {
        match self.get(device_id) {
            Some(conn) => {
                conn.mark_alive();
                true
            }
            None => false,
        }
    }

    /// Send to one device. Returns whether the frame was enqueued.
    pub fn send(&self, device_id: &DeviceId, event: &ServerEvent) -> bool {
        self.get(device_id).is_some_and(|c| c.send_event(event))
    }

    /// Send to every local device of a user. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        let conns = self.get_by_user(user_id);
        if conns.is_empty() {
            return 0;
        }
        deliver(&conns, event)
    }

    /// Send to every local connection. Returns how many accepted it.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        deliver(&self.get_all(), event)
    }

    /// Close one device's socket. The session's close path unregisters it.
    pub fn close(&self, device_id: &DeviceId, code: u16, reason: &str) -> bool {
        match self.get(device_id) {
            Some(conn) => {
                conn.close(code, reason);
                true
            }
            None => false,
        }
    }

    /// Close every socket. Returns how many were closed.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let conns = self.get_all();
        for conn in &conns {
            conn.close(code, reason);
        }
        info!(count = conns.len(), code, reason, "closed all connections");
        conns.len()
    }

    /// Replace the connection caps. Existing connections are kept.
    pub fn set_limits(&self, limits: ConnectionLimits) {
        self.inner.lock().limits = limits;
    }

    /// Current caps.
    pub fn limits(&self) -> ConnectionLimits {
        self.inner.lock().limits
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.inner.lock().user_devices.len()
    }

    #[cfg(test)]
    fn device_set_total(&self) -> (usize, bool) {
        let inner = self.inner.lock();
        let total = inner.user_devices.values().map(HashSet::len).sum();
        let any_empty = inner.user_devices.values().any(HashSet::is_empty);
        (total, any_empty)
    }
}

/// Serialize once, enqueue to each open connection.
fn deliver(conns: &[Arc<Connection>], event: &ServerEvent) -> usize {
    let json = match event.to_json() {
        Ok(json) => Arc::new(json),
        Err(e) => {
            tracing::warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
            return 0;
        }
    };
    conns
        .iter()
        .filter(|c| c.is_open() && c.send_text(json.clone()))
        .count()
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use assert_matches::assert_matches;
    use parley_core::Claims;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn conn(user: &str, device: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let c = Connection::new(UserId::from(user), DeviceId::from(device), Claims::default(), tx);
        (Arc::new(c), rx)
    }

    fn manager(per_user: usize, total: usize) -> ConnectionManager {
        ConnectionManager::new(ConnectionLimits {
            max_devices_per_user: per_user,
            max_total_connections: total,
        })
    }

    #[test]
    fn five_devices_then_limit_then_reconnect() {
        let mgr = manager(5, 100);
        let mut keep = Vec::new();
        for i in 1..=5 {
            let (c, rx) = conn("a", &format!("d{i}"));
            assert!(mgr.add(c).unwrap().is_none());
            keep.push(rx);
        }

        let (sixth, _rx6) = conn("a", "d6");
        assert_matches!(mgr.add(sixth), Err(LimitExceeded::UserDeviceLimit));
        assert_eq!(mgr.connection_count(), 5);

        let (again, _rx3) = conn("a", "d3");
        assert!(mgr.can_add(&UserId::from("a"), &DeviceId::from("d3")).is_ok());
        assert!(mgr.add(again).unwrap().is_some());
        assert_eq!(mgr.connection_count(), 5);
        assert_eq!(mgr.user_device_ids(&UserId::from("a")).len(), 5);
    }

    #[test]
    fn global_limit_only_for_new_devices() {
        let mgr = manager(5, 2);
        let (a, _ra) = conn("a", "a1");
        let (b, _rb) = conn("b", "b1");
        mgr.add(a).unwrap();
        mgr.add(b).unwrap();

        assert_eq!(
            mgr.can_add(&UserId::from("c"), &DeviceId::from("c1")),
            Err(LimitExceeded::GlobalConnectionLimit)
        );
        assert!(mgr.can_add(&UserId::from("a"), &DeviceId::from("a1")).is_ok());
    }

    #[test]
    fn limit_codes_and_reasons() {
        assert_eq!(LimitExceeded::UserDeviceLimit.close_code(), 4003);
        assert_eq!(LimitExceeded::GlobalConnectionLimit.close_code(), 4004);
        assert_eq!(LimitExceeded::UserDeviceLimit.to_string(), "USER_DEVICE_LIMIT");
        assert_eq!(LimitExceeded::GlobalConnectionLimit.reason(), "GLOBAL_CONNECTION_LIMIT");
    }

    #[tokio::test]
    async fn replacement_closes_only_prior_socket_once() {
        let mgr = manager(5, 100);
        let (first, mut first_rx) = conn("a", "phone");
        let (laptop, mut laptop_rx) = conn("a", "laptop");
        mgr.add(first.clone()).unwrap();
        mgr.add(laptop).unwrap();

        let (second, _second_rx) = conn("a", "phone");
        let replaced = mgr.add(second.clone()).unwrap().unwrap();
        assert_eq!(replaced.id, first.id);

        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close {
                code: 1000,
                reason: "replaced".into()
            })
        );
        assert!(first_rx.try_recv().is_err());
        assert!(laptop_rx.try_recv().is_err());
        assert!(second.is_open());
        assert_eq!(mgr.connection_count(), 2);
    }

    #[test]
    fn stale_connection_does_not_evict_successor() {
        let mgr = manager(5, 100);
        let (first, _r1) = conn("a", "phone");
        let (second, _r2) = conn("a", "phone");
        mgr.add(first.clone()).unwrap();
        mgr.add(second.clone()).unwrap();

        assert!(!mgr.remove_connection(&first));
        assert_eq!(mgr.get(&DeviceId::from("phone")).unwrap().id, second.id);
        assert!(mgr.remove_connection(&second));
        assert!(!mgr.is_user_online(&UserId::from("a")));
    }

    #[test]
    fn foreign_device_id_is_refused_and_owner_kept() {
        let mgr = manager(1, 100);
        let (alice, _ra) = conn("alice", "phone");
        let (bob, _rb) = conn("bob", "b1");
        mgr.add(alice.clone()).unwrap();
        mgr.add(bob).unwrap();

        let (intruder, _ri) = conn("bob", "phone");
        assert_eq!(
            mgr.can_add(&UserId::from("bob"), &DeviceId::from("phone")),
            Err(LimitExceeded::DeviceInUse)
        );
        assert_matches!(mgr.add(intruder), Err(LimitExceeded::DeviceInUse));

        assert!(alice.is_open());
        assert!(!alice.closed().is_cancelled());
        assert_eq!(mgr.get(&DeviceId::from("phone")).unwrap().id, alice.id);
        assert_eq!(mgr.user_device_ids(&UserId::from("bob")).len(), 1);
        assert_eq!(mgr.connection_count(), 2);
    }

    #[test]
    fn device_in_use_maps_to_device_limit_close() {
        assert_eq!(LimitExceeded::DeviceInUse.close_code(), 4003);
        assert_eq!(LimitExceeded::DeviceInUse.reason(), "DEVICE_IN_USE");
    }

    #[test]
    fn remove_is_idempotent_and_prunes() {
        let mgr = manager(5, 100);
        let (a, _ra) = conn("a", "d1");
        mgr.add(a).unwrap();
        assert!(mgr.remove(&DeviceId::from("d1")).is_some());
        assert!(mgr.remove(&DeviceId::from("d1")).is_none());
        assert_eq!(mgr.user_count(), 0);
        assert!(mgr.user_device_ids(&UserId::from("a")).is_empty());
    }

    #[tokio::test]
    async fn send_to_user_counts_open_sockets_only() {
        let mgr = manager(5, 100);
        let (phone, mut phone_rx) = conn("a", "phone");
        let (laptop, _laptop_rx) = conn("a", "laptop");
        let (other, mut other_rx) = conn("b", "tablet");
        mgr.add(phone).unwrap();
        mgr.add(laptop.clone()).unwrap();
        mgr.add(other).unwrap();
        laptop.close(1000, "bye");

        let event = ServerEvent::pong();
        assert_eq!(mgr.send_to_user(&UserId::from("a"), &event), 1);
        assert_matches!(phone_rx.recv().await, Some(Outbound::Text(_)));
        assert!(other_rx.try_recv().is_err());

        assert_eq!(mgr.send_to_user(&UserId::from("nobody"), &event), 0);
        assert!(mgr.send(&DeviceId::from("tablet"), &event));
        assert!(!mgr.send(&DeviceId::from("missing"), &event));
        assert_eq!(mgr.broadcast(&event), 2);
    }

    #[test]
    fn update_pong_time_only_for_known_devices() {
        let mgr = manager(5, 100);
        let (a, _ra) = conn("a", "d1");
        mgr.add(a).unwrap();
        assert!(mgr.update_pong_time(&DeviceId::from("d1")));
        assert!(!mgr.update_pong_time(&DeviceId::from("d2")));
    }

    #[test]
    fn close_all_closes_everything() {
        let mgr = manager(5, 100);
        let (a, _ra) = conn("a", "d1");
        let (b, _rb) = conn("b", "d2");
        mgr.add(a.clone()).unwrap();
        mgr.add(b.clone()).unwrap();
        assert_eq!(mgr.close_all(1001, "server shutdown"), 2);
        assert!(!a.is_open() && !b.is_open());
        assert!(a.closed().is_cancelled());
    }

    #[test]
    fn set_limits_applies_to_new_devices() {
        let mgr = manager(5, 100);
        mgr.set_limits(ConnectionLimits {
            max_devices_per_user: 1,
            max_total_connections: 100,
        });
        assert_eq!(mgr.limits().max_devices_per_user, 1);
        let (a, _ra) = conn("a", "d1");
        mgr.add(a).unwrap();
        assert_eq!(
            mgr.can_add(&UserId::from("a"), &DeviceId::from("d2")),
            Err(LimitExceeded::UserDeviceLimit)
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8, u8),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..8).prop_map(|(u, d)| Op::Add(u, d)),
            (0u8..8).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn maps_stay_consistent(ops in proptest::collection::vec(op(), 0..64)) {
            let mgr = manager(3, 6);
            let mut receivers = Vec::new();
            for op in ops {
                match op {
                    Op::Add(u, d) => {
                        let (c, rx) = conn(&format!("u{u}"), &format!("d{d}"));
                        receivers.push(rx);
                        let _ = mgr.add(c);
                    }
                    Op::Remove(d) => {
                        let _ = mgr.remove(&DeviceId::from(format!("d{d}")));
                    }
                }
                let (total, any_empty) = mgr.device_set_total();
                prop_assert_eq!(mgr.connection_count(), total);
                prop_assert!(!any_empty);
                prop_assert!(mgr.connection_count() <= 6);
            }
        }
    }
}
