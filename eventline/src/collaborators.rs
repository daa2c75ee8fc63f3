//! Narrow interfaces to services outside the core.
//!
//! The HTTP transport, authentication plugins and persistence backends live
//! outside this crate; the core only calls them through these traits.

use crate::errors::StorageResult;
use crate::types::{EventName, Timestamp};
use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity established by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Subject identifier
    pub id: String,
    /// Authentication method that established it
    pub method: String,
    /// Additional claims
    pub claims: Map<String, Value>,
}

impl Principal {
    /// The principal of unauthenticated requests.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            method: "UNSECURED".to_string(),
            claims: Map::new(),
        }
    }
}

/// What an authenticator is asked to verify.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Event being invoked
    pub event: &'a EventName,
    /// Methods the event accepts; empty means no authentication required
    pub methods: &'a [String],
    /// Request headers
    pub headers: &'a BTreeMap<String, String>,
}

/// A rejected authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Unauthorized(pub String);

/// Authentication plugin interface.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies a request, returning the caller's principal.
    async fn authenticate(&self, request: AuthRequest<'_>) -> Result<Principal, Unauthorized>;
}

#[async_trait]
impl<T: Authenticator + ?Sized> Authenticator for Arc<T> {
    async fn authenticate(&self, request: AuthRequest<'_>) -> Result<Principal, Unauthorized> {
        (**self).authenticate(request).await
    }
}

/// Accepts every request as [`Principal::anonymous`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsecured;

#[async_trait]
impl Authenticator for Unsecured {
    async fn authenticate(&self, _request: AuthRequest<'_>) -> Result<Principal, Unauthorized> {
        Ok(Principal::anonymous())
    }
}

/// Persistence backend interface.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()>;

    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Date based key partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionKey;

impl PartitionKey {
    /// `YYYY/MM/DD/HH/` prefix for a timestamp, in UTC.
    pub fn by_date(ts: &Timestamp) -> String {
        let dt = ts.as_datetime();
        format!(
            "{:04}/{:02}/{:02}/{:02}/",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour()
        )
    }

    /// `key` prefixed with its date partition.
    pub fn partitioned(key: &str, ts: &Timestamp) -> String {
        format!("{}{key}", Self::by_date(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn date_partition_prefix() {
        let ts = Timestamp::new(Utc.with_ymd_and_hms(2024, 3, 7, 9, 15, 0).unwrap());
        assert_eq!(PartitionKey::by_date(&ts), "2024/03/07/09/");
        assert_eq!(PartitionKey::partitioned("item-1", &ts), "2024/03/07/09/item-1");
    }

    #[tokio::test]
    async fn unsecured_accepts_everything() {
        let event = EventName::try_new("anything").unwrap();
        let headers = BTreeMap::new();
        let principal = Unsecured
            .authenticate(AuthRequest {
                event: &event,
                methods: &["BASIC".to_string()],
                headers: &headers,
            })
            .await
            .unwrap();
        assert_eq!(principal, Principal::anonymous());
    }
}
