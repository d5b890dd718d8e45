//! Where the shard store lives and how to open it.
//!
//! Each shard owns one SurrealDB database, so two shards sharing a namespace
//! never see each other's timer rows.

use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

use super::error::{PersistenceResult, from_surrealdb_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Engine URL: `mem://` for the embedded engine, `ws://host:port` for a server
    pub url: String,
    pub namespace: String,
    /// Database holding this shard's executions and timer queue
    pub database: String,
    pub credentials: Option<Credentials>,
}

/// Root sign-in used against a remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl StoreConfig {
    /// Embedded in-process engine; contents vanish with the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "hourglass".to_string(),
            database: "history".to_string(),
            credentials: None,
        }
    }

    #[must_use]
    pub fn remote(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
            ..Self::in_memory()
        }
    }

    #[must_use]
    pub fn with_root_credentials(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            credentials: Some(Credentials {
                username: username.into(),
                password: password.into(),
            }),
            ..self
        }
    }

    #[must_use]
    pub fn with_database(self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Connect, sign in when credentials are set, and select the shard database.
pub(crate) async fn connect(config: &StoreConfig) -> PersistenceResult<Surreal<Any>> {
    let db = Surreal::<Any>::init();
    db.connect(config.url.as_str())
        .await
        .map_err(from_surrealdb_error)?;

    if let Some(Credentials { username, password }) = &config.credentials {
        db.signin(Root { username, password })
            .await
            .map_err(from_surrealdb_error)?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(from_surrealdb_error)?;
    Ok(db)
}
