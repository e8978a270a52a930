//! Shared fixtures for unit tests.

use std::sync::Arc;

use axum::Router;
use jsonwebtoken::{EncodingKey, Header};
use parley_calls::{CallStore, ConnectionConfig, SqliteDirectory, SystemClock, new_in_memory};
use parley_core::UserId;
use serde_json::json;

use crate::auth::JwtVerifier;
use crate::config::ServerConfig;
use crate::context::{AppContext, Collaborators};
use crate::fanout::FanoutAdapter;
use crate::push::LogPushSender;
use crate::server::ParleyServer;

pub const SECRET: &str = "unit-test-secret";

/// A valid one-hour token for `user`.
pub fn token(user: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    jsonwebtoken::encode(
        &Header::default(),
        &json!({"sub": user, "exp": exp}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// In-memory store plus a disabled fanout adapter.
pub struct TestApp {
    pub config: ServerConfig,
    pub store: CallStore,
    pub directory: SqliteDirectory,
}

impl TestApp {
    pub fn new() -> Self {
        let store = CallStore::new(new_in_memory(&ConnectionConfig::default()).unwrap());
        store.migrate().unwrap();
        let directory = SqliteDirectory::new(store.clone(), Arc::new(SystemClock));
        Self {
            config: ServerConfig::default(),
            store,
            directory,
        }
    }

    pub fn users(&self, ids: &[&str]) {
        for id in ids {
            self.directory.create_user(&UserId::from(*id), id).unwrap();
        }
    }

    pub fn contacts(&self, a: &str, b: &str) {
        self.directory
            .add_contact(&UserId::from(a), &UserId::from(b))
            .unwrap();
    }

    pub fn context(&self) -> AppContext {
        let collaborators = Collaborators::sqlite(
            &self.store,
            Arc::new(JwtVerifier::new(SECRET, None)),
            Arc::new(LogPushSender),
        );
        AppContext::new(
            self.config.clone(),
            self.store.clone(),
            FanoutAdapter::disabled("test"),
            collaborators,
        )
    }

    pub fn into_context(self) -> AppContext {
        self.context()
    }

    pub fn into_server(self) -> ParleyServer {
        ParleyServer::new(self.context())
    }

    /// A fresh router over a fresh context sharing this app's store.
    pub fn router(&self) -> Router {
        ParleyServer::new(self.context()).router()
    }
}
