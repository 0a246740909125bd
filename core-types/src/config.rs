// Copyright (c) James Kassemi, SC, US. All rights reserved.

use config::{Config, ConfigError, Environment};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Process configuration, assembled from the environment section by section.
///
/// Each section maps a fixed env prefix onto a struct (`AWS_ACCESS_KEY_ID`
/// becomes `object_store.access_key_id`, `SUPABASE_HOST` becomes
/// `remote.host`, and so on). Missing remote credentials leave `remote`
/// unset; the ledger then runs with the dual-writer disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub object_store: ObjectStoreConfig,
    pub lake: LakeConfig,
    pub ledger: LedgerConfig,
    pub dashboard: DashboardConfig,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_threads")]
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Hours after which a foreign `started` record is considered abandoned
    /// and may be reclaimed.
    #[serde(default = "default_staleness_hours")]
    pub staleness_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_bind")]
    pub bind: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_remote_database")]
    pub database: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket() -> String {
    "vendor-data-s3".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_database_path() -> String {
    "./multi_exchange_data_lake.duckdb".to_string()
}

fn default_memory_limit() -> String {
    "8GB".to_string()
}

fn default_threads() -> u32 {
    4
}

fn default_staleness_hours() -> i64 {
    2
}

fn default_dashboard_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_dashboard_port() -> u16 {
    12345
}

fn default_remote_port() -> u16 {
    6543
}

fn default_remote_database() -> String {
    "postgres".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            object_store: section("AWS")?,
            lake: section("DUCKDB")?,
            ledger: section("LEDGER")?,
            dashboard: section("DASHBOARD")?,
            // Any missing remote credential disables the mirror instead of
            // failing startup.
            remote: section::<RemoteConfig>("SUPABASE").ok(),
        })
    }
}

fn section<T: DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    Config::builder()
        .add_source(Environment::with_prefix(prefix))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_fall_back_to_defaults() {
        let store: ObjectStoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(store.bucket, "vendor-data-s3");
        assert_eq!(store.default_region, "us-east-1");
        assert_eq!(store.request_timeout_secs, 60);

        let lake: LakeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(lake.database_path, "./multi_exchange_data_lake.duckdb");
        assert_eq!(lake.threads, 4);

        let ledger: LedgerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(ledger.staleness_hours, 2);

        let dashboard: DashboardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(dashboard.port, 12345);
    }

    #[test]
    fn remote_requires_credentials() {
        assert!(serde_json::from_str::<RemoteConfig>("{}").is_err());
        let remote: RemoteConfig = serde_json::from_str(
            r#"{"host": "db.example.net", "user": "svc", "password": "hunter2"}"#,
        )
        .unwrap();
        assert_eq!(remote.port, 6543);
        assert_eq!(remote.database, "postgres");
        assert_eq!(remote.connect_timeout_secs, 10);
    }
}
