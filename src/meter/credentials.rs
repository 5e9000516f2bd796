use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::config::KeysConfig;
use super::ids::{self, API_KEY_PREFIX};
use super::ledger::{CallKind, RetryPolicy};
use super::limits::KeyedRateLimiter;
use super::observability::MeterMetrics;
use super::pricing::is_known_operation;
use super::session::SessionSigner;
use super::store::{KeyInsertOutcome, KeyLimits, LedgerStore};
use super::store_types::{Account, ApiKeyRecord, PermissionScope, Role, WILDCARD_PERMISSION};
use crate::error::{MeterError, Result};

/// A caller-presented secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Session(String),
    ApiKey(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Session(_) => f.write_str("Session(<redacted>)"),
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

impl Credential {
    /// Classifies a raw header value. An optional `Bearer ` prefix is
    /// stripped; `sk_` values are API keys, anything else a session token.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();
        if raw.starts_with(API_KEY_PREFIX) {
            Credential::ApiKey(raw.to_string())
        } else {
            Credential::Session(raw.to_string())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialKind {
    Session,
    ApiKey { key_id: String },
}

/// Who is calling and what they may do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub account_id: String,
    pub role: Role,
    pub permission_scope: PermissionScope,
    pub credential: CredentialKind,
}

impl Identity {
    fn rate_limit_key(&self) -> String {
        match &self.credential {
            CredentialKind::Session => format!("session:{}", self.account_id),
            CredentialKind::ApiKey { key_id } => format!("key:{key_id}"),
        }
    }
}

/// Listing view of a key; the secret itself is only returned at creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub key_preview: String,
    pub permissions: PermissionScope,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        let tail: String = record
            .key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            key_preview: format!("{API_KEY_PREFIX}...{tail}"),
            permissions: record.permissions.clone(),
            expires_at: record.expires_at,
            last_used_at: record.last_used_at,
            created_at: record.created_at,
        }
    }
}

pub struct CredentialResolver {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    signer: SessionSigner,
    limiter: Option<KeyedRateLimiter>,
    keys: KeysConfig,
    metrics: Arc<MeterMetrics>,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
        signer: SessionSigner,
        keys: KeysConfig,
        metrics: Arc<MeterMetrics>,
    ) -> Self {
        Self {
            store,
            retry,
            signer,
            limiter: None,
            keys,
            metrics,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: KeyedRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Resolves `credential` to an identity allowed to run `operation`.
    pub async fn authenticate(
        &self,
        credential: &Credential,
        operation: &str,
        now: OffsetDateTime,
    ) -> Result<Identity> {
        let result = self.resolve(credential, operation, now).await;
        match &result {
            Ok(identity) => {
                self.metrics.record_authentication();
                tracing::debug!(account_id = %identity.account_id, operation, "authenticated");
            }
            Err(MeterError::RateLimited { .. }) => self.metrics.record_rate_limited(),
            Err(err) => {
                self.metrics.record_auth_failure();
                tracing::debug!(operation, error = %err, "authentication failed");
            }
        }
        result
    }

    async fn resolve(
        &self,
        credential: &Credential,
        operation: &str,
        now: OffsetDateTime,
    ) -> Result<Identity> {
        let identity = match credential {
            Credential::Session(token) => self.resolve_session(token, now).await?,
            Credential::ApiKey(key) => self.resolve_api_key(key, operation, now).await?,
        };

        if let Some(limiter) = self.limiter.as_ref() {
            let epoch_secs = u64::try_from(now.unix_timestamp()).unwrap_or(0);
            limiter
                .check_and_consume(&identity.rate_limit_key(), epoch_secs)
                .await?;
        }
        Ok(identity)
    }

    async fn resolve_session(&self, token: &str, now: OffsetDateTime) -> Result<Identity> {
        let claims = self.signer.verify(token, now)?;
        let account = self.active_account(&claims.sub).await?;
        Ok(Identity {
            account_id: account.id,
            role: account.role,
            permission_scope: PermissionScope::All,
            credential: CredentialKind::Session,
        })
    }

    async fn resolve_api_key(
        &self,
        key: &str,
        operation: &str,
        now: OffsetDateTime,
    ) -> Result<Identity> {
        let record = self
            .retry
            .run("find_api_key", CallKind::Read, || self.store.find_api_key(key))
            .await?
            .ok_or_else(|| MeterError::CredentialInvalid {
                reason: "unknown api key".to_string(),
            })?;
        if record.is_expired(now) {
            return Err(MeterError::CredentialExpired);
        }

        let account = self.active_account(&record.account_id).await?;
        if !record.permissions.allows(operation) {
            return Err(MeterError::PermissionDenied {
                operation: operation.to_string(),
            });
        }

        if let Err(err) = self
            .retry
            .run("touch_api_key", CallKind::Write, || {
                self.store.touch_api_key(&record.id, now)
            })
            .await
        {
            tracing::warn!(key_id = %record.id, error = %err, "failed to update api key last_used_at");
        }

        Ok(Identity {
            account_id: account.id,
            role: account.role,
            permission_scope: record.permissions,
            credential: CredentialKind::ApiKey { key_id: record.id },
        })
    }

    /// Credentials pointing at a deleted account are invalid; suspended
    /// accounts are refused outright.
    async fn active_account(&self, account_id: &str) -> Result<Account> {
        let account = self
            .retry
            .run("get_account", CallKind::Read, || self.store.get_account(account_id))
            .await?
            .ok_or_else(|| MeterError::CredentialInvalid {
                reason: "credential refers to an unknown account".to_string(),
            })?;
        if account.role == Role::Suspended {
            return Err(MeterError::AccountSuspended {
                account_id: account.id,
            });
        }
        Ok(account)
    }

    pub fn issue_session(&self, account: &Account, now: OffsetDateTime) -> Result<String> {
        if account.role == Role::Suspended {
            return Err(MeterError::AccountSuspended {
                account_id: account.id.clone(),
            });
        }
        self.signer.issue(&account.id, account.role, now)
    }

    /// Normalises requested permissions: `*` wins, unknown operations are
    /// dropped, and an empty result falls back to the configured defaults.
    pub fn normalize_permissions(&self, requested: &[String]) -> PermissionScope {
        if requested
            .iter()
            .any(|permission| permission.trim() == WILDCARD_PERMISSION)
        {
            return PermissionScope::All;
        }
        let known: Vec<String> = requested
            .iter()
            .map(|permission| permission.trim().to_ascii_lowercase())
            .filter(|permission| is_known_operation(permission))
            .collect();
        if known.is_empty() {
            return PermissionScope::from(self.keys.default_permissions.clone());
        }
        PermissionScope::from(known)
    }

    pub async fn create_api_key(
        &self,
        account_id: &str,
        name: &str,
        permissions: &[String],
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<ApiKeyRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MeterError::invalid("api key name is required"));
        }
        if expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(MeterError::invalid("api key expiry must be in the future"));
        }

        let record = ApiKeyRecord {
            id: ids::api_key_id()?,
            account_id: account_id.to_string(),
            name: name.to_string(),
            key: ids::api_key_secret()?,
            permissions: self.normalize_permissions(permissions),
            expires_at,
            last_used_at: None,
            created_at: now,
        };
        let limits = KeyLimits {
            unfunded: self.keys.free_account_limit,
            funded: self.keys.funded_account_limit,
        };
        let outcome = self
            .retry
            .run("insert_api_key", CallKind::Write, || {
                self.store.insert_api_key(record.clone(), limits)
            })
            .await?;
        match outcome {
            KeyInsertOutcome::Created => {
                tracing::info!(account_id, key_id = %record.id, "created api key");
                Ok(record)
            }
            KeyInsertOutcome::LimitReached { limit } => Err(MeterError::KeyLimitReached { limit }),
        }
    }

    pub async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeySummary>> {
        let records = self
            .retry
            .run("list_api_keys", CallKind::Read, || self.store.list_api_keys(account_id))
            .await?;
        Ok(records.iter().map(ApiKeySummary::from).collect())
    }

    pub async fn revoke_api_key(&self, account_id: &str, key_id: &str) -> Result<()> {
        let deleted = self
            .retry
            .run("delete_api_key", CallKind::Write, || {
                self.store.delete_api_key(account_id, key_id)
            })
            .await?;
        if !deleted {
            return Err(MeterError::ApiKeyNotFound {
                key_id: key_id.to_string(),
            });
        }
        tracing::info!(account_id, key_id, "revoked api key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::memory_store::MemoryStore;
    use std::time::Duration;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-10 12:00 UTC);

    fn resolver(store: Arc<MemoryStore>) -> CredentialResolver {
        CredentialResolver::new(
            store,
            RetryPolicy::new(Duration::from_secs(1), 1, 0),
            SessionSigner::new("secret", time::Duration::days(7)).expect("signer"),
            KeysConfig::default(),
            Arc::new(MeterMetrics::default()),
        )
    }

    async fn store_with_account(balance: i64, role: Role) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_account(
                Account {
                    id: "acc-1".to_string(),
                    balance,
                    free_operations_used: 0,
                    free_operations_reset_at: datetime!(2026-04-01 0:00 UTC),
                    role,
                    version: 0,
                    created_at: NOW,
                },
                None,
            )
            .await
            .expect("create");
        store
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn classifies_credentials_by_prefix() {
        assert!(matches!(Credential::parse("sk_abc"), Credential::ApiKey(_)));
        assert!(matches!(
            Credential::parse("Bearer sk_abc"),
            Credential::ApiKey(key) if key == "sk_abc"
        ));
        assert!(matches!(Credential::parse("eyJ.sig"), Credential::Session(_)));
        assert_eq!(format!("{:?}", Credential::parse("sk_abc")), "ApiKey(<redacted>)");
    }

    #[tokio::test]
    async fn scoped_key_is_denied_outside_its_scope() {
        let store = store_with_account(1_000_000, Role::Normal).await;
        let resolver = resolver(store.clone());
        let record = resolver
            .create_api_key("acc-1", "ci", &strings(&["merge", "split"]), None, NOW)
            .await
            .expect("create");

        let credential = Credential::ApiKey(record.key.clone());
        let identity = resolver
            .authenticate(&credential, "merge", NOW)
            .await
            .expect("merge allowed");
        assert_eq!(identity.account_id, "acc-1");

        let err = resolver
            .authenticate(&credential, "convert", NOW)
            .await
            .expect_err("convert denied");
        assert!(matches!(err, MeterError::PermissionDenied { operation } if operation == "convert"));

        let touched = store
            .find_api_key(&record.key)
            .await
            .expect("find")
            .expect("record");
        assert_eq!(touched.last_used_at, Some(NOW));
    }

    #[tokio::test]
    async fn wildcard_key_allows_any_operation() {
        let store = store_with_account(1_000_000, Role::Normal).await;
        let resolver = resolver(store);
        let record = resolver
            .create_api_key("acc-1", "all", &strings(&["*", "merge"]), None, NOW)
            .await
            .expect("create");
        assert_eq!(record.permissions, PermissionScope::All);

        let credential = Credential::ApiKey(record.key);
        for operation in ["convert", "ocr", "anything-else"] {
            resolver
                .authenticate(&credential, operation, NOW)
                .await
                .expect("allowed");
        }
    }

    #[tokio::test]
    async fn expired_key_is_rejected_even_with_wildcard() {
        let store = store_with_account(1_000_000, Role::Normal).await;
        let resolver = resolver(store);
        let record = resolver
            .create_api_key(
                "acc-1",
                "short",
                &strings(&["*"]),
                Some(NOW + time::Duration::hours(1)),
                NOW,
            )
            .await
            .expect("create");

        let err = resolver
            .authenticate(
                &Credential::ApiKey(record.key),
                "merge",
                NOW + time::Duration::hours(1),
            )
            .await
            .expect_err("expired");
        assert!(matches!(err, MeterError::CredentialExpired));
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let store = store_with_account(0, Role::Normal).await;
        let err = resolver(store)
            .authenticate(&Credential::ApiKey("sk_nope".to_string()), "merge", NOW)
            .await
            .expect_err("unknown");
        assert!(matches!(err, MeterError::CredentialInvalid { .. }));
    }

    #[tokio::test]
    async fn sessions_are_fully_privileged_but_respect_suspension() {
        let store = store_with_account(0, Role::Normal).await;
        let resolver = resolver(store.clone());
        let account = store.get_account("acc-1").await.expect("get").expect("account");
        let token = resolver.issue_session(&account, NOW).expect("issue");

        let identity = resolver
            .authenticate(&Credential::Session(token.clone()), "convert", NOW)
            .await
            .expect("session");
        assert_eq!(identity.permission_scope, PermissionScope::All);
        assert_eq!(identity.credential, CredentialKind::Session);

        store.set_role("acc-1", Role::Suspended).await.expect("suspend");
        let err = resolver
            .authenticate(&Credential::Session(token), "convert", NOW)
            .await
            .expect_err("suspended");
        assert!(matches!(err, MeterError::AccountSuspended { .. }));
    }

    #[tokio::test]
    async fn key_limit_follows_funding() {
        let store = store_with_account(0, Role::Normal).await;
        let resolver = resolver(store);
        resolver
            .create_api_key("acc-1", "first", &[], None, NOW)
            .await
            .expect("first");
        let err = resolver
            .create_api_key("acc-1", "second", &[], None, NOW)
            .await
            .expect_err("limit");
        assert!(matches!(err, MeterError::KeyLimitReached { limit: 1 }));
    }

    #[tokio::test]
    async fn revoke_and_list_keys() {
        let store = store_with_account(10_000_000, Role::Normal).await;
        let resolver = resolver(store);
        let record = resolver
            .create_api_key("acc-1", "ci", &strings(&["teleport"]), None, NOW)
            .await
            .expect("create");
        assert_eq!(
            record.permissions,
            PermissionScope::from(strings(&["convert", "compress", "merge", "split"]))
        );

        let listed = resolver.list_api_keys("acc-1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].key_preview.starts_with("sk_..."));
        assert!(!listed[0].key_preview.contains(&record.key[3..20]));

        resolver
            .revoke_api_key("acc-1", &record.id)
            .await
            .expect("revoke");
        let err = resolver
            .revoke_api_key("acc-1", &record.id)
            .await
            .expect_err("gone");
        assert!(matches!(err, MeterError::ApiKeyNotFound { .. }));
    }

    #[tokio::test]
    async fn rate_limit_applies_per_credential() {
        let store = store_with_account(0, Role::Normal).await;
        let resolver = resolver(store.clone()).with_rate_limiter(KeyedRateLimiter::new(1, 60));
        let account = store.get_account("acc-1").await.expect("get").expect("account");
        let token = resolver.issue_session(&account, NOW).expect("issue");
        let credential = Credential::Session(token);

        resolver
            .authenticate(&credential, "merge", NOW)
            .await
            .expect("first");
        let err = resolver
            .authenticate(&credential, "merge", NOW)
            .await
            .expect_err("second");
        assert!(matches!(err, MeterError::RateLimited { .. }));
    }
}
