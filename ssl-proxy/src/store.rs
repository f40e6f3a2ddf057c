//! SQLite persistence for the proxy settings row and the server registry.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::model::{ServerRegistryEntry, Settings};

/// Bytes of randomness in a generated API token
pub const TOKEN_BYTES: usize = 32;

/// Settings and registry store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        debug!(url = %database_url, "Connected to store");
        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Create the tables if they do not exist yet
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                token TEXT NOT NULL,
                proxy_domain TEXT NOT NULL,
                destination_domain TEXT NOT NULL,
                email TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                ssl_key TEXT NOT NULL,
                ssl_cert TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The settings row, if setup has run
    pub async fn select_settings(&self) -> Result<Option<Settings>> {
        let row = sqlx::query(
            "SELECT token, proxy_domain, destination_domain, email FROM settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Settings {
            token: row.get("token"),
            proxy_domain: row.get("proxy_domain"),
            destination_domain: row.get("destination_domain"),
            email: row.get("email"),
        }))
    }

    /// Create the settings row with a fresh token. Fails if one already exists.
    pub async fn insert_settings(
        &self,
        proxy_domain: &str,
        destination_domain: &str,
        email: &str,
    ) -> Result<Settings> {
        let settings = Settings {
            token: generate_token(),
            proxy_domain: proxy_domain.to_string(),
            destination_domain: destination_domain.to_string(),
            email: email.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO settings (id, token, proxy_domain, destination_domain, email)
            VALUES (1, ?, ?, ?, ?)
            "#,
        )
        .bind(&settings.token)
        .bind(&settings.proxy_domain)
        .bind(&settings.destination_domain)
        .bind(&settings.email)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, "settings already exist"))?;

        info!(proxy_domain = %proxy_domain, "Stored proxy settings");
        Ok(settings)
    }

    /// All registry entries in insertion order
    pub async fn select_servers(&self) -> Result<Vec<ServerRegistryEntry>> {
        let rows = sqlx::query("SELECT domain, ssl_key, ssl_cert FROM servers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ServerRegistryEntry {
                domain: row.get("domain"),
                ssl_key: row.get("ssl_key"),
                ssl_cert: row.get("ssl_cert"),
            })
            .collect())
    }

    /// Insert a new entry. An existing domain is a [`ProxyError::Conflict`].
    pub async fn insert_server(&self, entry: &ServerRegistryEntry) -> Result<()> {
        sqlx::query("INSERT INTO servers (domain, ssl_key, ssl_cert) VALUES (?, ?, ?)")
            .bind(&entry.domain)
            .bind(&entry.ssl_key)
            .bind(&entry.ssl_cert)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or(e, &format!("server {} already exists", entry.domain)))?;

        debug!(domain = %entry.domain, "Inserted server");
        Ok(())
    }

    /// Replace key and certificate of an existing entry. A missing domain is
    /// [`ProxyError::NotFound`].
    pub async fn update_server(&self, entry: &ServerRegistryEntry) -> Result<()> {
        let result = sqlx::query("UPDATE servers SET ssl_key = ?, ssl_cert = ? WHERE domain = ?")
            .bind(&entry.ssl_key)
            .bind(&entry.ssl_cert)
            .bind(&entry.domain)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ProxyError::NotFound(format!("server {}", entry.domain)));
        }

        debug!(domain = %entry.domain, "Updated server");
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

fn conflict_or(err: sqlx::Error, message: &str) -> ProxyError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ProxyError::Conflict(message.to_string())
        }
        _ => ProxyError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_settings_created_once() {
        let store = store().await;
        assert!(store.select_settings().await.unwrap().is_none());

        let created = store
            .insert_settings("proxy.example.com", "app.example.com", "ops@example.com")
            .await
            .unwrap();
        assert_eq!(created.token.len(), TOKEN_BYTES * 2);
        assert!(created.token.chars().all(|c| c.is_ascii_hexdigit()));

        let loaded = store.select_settings().await.unwrap().unwrap();
        assert_eq!(loaded, created);

        let again = store.insert_settings("other", "other", "other").await;
        assert!(matches!(again, Err(ProxyError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn test_insert_and_select_servers() {
        let store = store().await;
        store.insert_server(&ServerRegistryEntry::new("b.com", "k1", "c1")).await.unwrap();
        store.insert_server(&ServerRegistryEntry::new("a.com", "k2", "c2")).await.unwrap();

        let servers = store.select_servers().await.unwrap();
        let domains: Vec<_> = servers.iter().map(|s| s.domain.as_str()).collect();
        assert_eq!(domains, vec!["b.com", "a.com"]);
        assert_eq!(servers[1], ServerRegistryEntry::new("a.com", "k2", "c2"));
    }

    #[tokio::test]
    async fn test_duplicate_domain_is_conflict() {
        let store = store().await;
        let entry = ServerRegistryEntry::new("x.com", "k", "c");
        store.insert_server(&entry).await.unwrap();

        let err = store.insert_server(&entry).await.unwrap_err();
        assert!(matches!(err, ProxyError::Conflict(_)));
        assert_eq!(store.select_servers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_existing_and_missing() {
        let store = store().await;
        store.insert_server(&ServerRegistryEntry::new("x.com", "k", "c")).await.unwrap();

        store.update_server(&ServerRegistryEntry::new("x.com", "k2", "c2")).await.unwrap();
        assert_eq!(
            store.select_servers().await.unwrap(),
            vec![ServerRegistryEntry::new("x.com", "k2", "c2")]
        );

        let err = store
            .update_server(&ServerRegistryEntry::new("y.com", "k", "c"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ping_fails_after_close() {
        let store = store().await;
        store.ping().await.unwrap();
        store.close().await;
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("settings.db").display());
        let store = Store::connect(&url).await.unwrap();
        store.init().await.unwrap();
        store.ping().await.unwrap();
        assert!(dir.path().join("settings.db").exists());
    }
}
