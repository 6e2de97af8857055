//! 版本化 KV 客户端
//!
//! Wraps a config store proxy with lazy creation: any call that fails with a
//! lost connection discards the proxy so the next call re-resolves it.
//! Values under registered "encrypted scopes" are sealed with AES-256-GCM
//! before they leave the process.

mod crypto;

pub use crypto::{KEY_LEN, ScopeKey};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::config::KvConfig;
use crate::error::{OrbError, OrbResult};
use crate::resolver::Resolver;
use crate::rpc::{ConfigStore, ProxyFactory};

/// Whether `key` is `scope` itself or lies below it (case-insensitive)
fn in_scope(key: &str, scope: &str) -> bool {
    let (key, scope) = (key.as_bytes(), scope.trim_end_matches('/').as_bytes());
    if !key
        .get(..scope.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scope))
    {
        return false;
    }
    matches!(key.get(scope.len()), None | Some(b'/'))
}

pub struct VersionedKvClient {
    config: KvConfig,
    resolver: Arc<Resolver>,
    factory: Arc<dyn ProxyFactory<dyn ConfigStore>>,
    proxy: Mutex<Option<Arc<dyn ConfigStore>>>,
    encrypted_scopes: RwLock<Vec<String>>,
    key: Option<ScopeKey>,
}

impl std::fmt::Debug for VersionedKvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedKvClient")
            .field("binding", &self.config.binding)
            .field("encrypted_scopes", &*self.encrypted_scopes.read())
            .field("connected", &self.proxy.lock().is_some())
            .finish()
    }
}

impl VersionedKvClient {
    pub fn new(
        config: KvConfig,
        resolver: Arc<Resolver>,
        factory: Arc<dyn ProxyFactory<dyn ConfigStore>>,
    ) -> Self {
        let encrypted_scopes = RwLock::new(config.encrypted_scopes.clone());
        Self {
            config,
            resolver,
            factory,
            proxy: Mutex::new(None),
            encrypted_scopes,
            key: None,
        }
    }

    pub fn with_key(mut self, key: ScopeKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Encrypt everything stored at or below `scope` from now on
    pub fn add_encrypted_scope(&self, scope: &str) -> OrbResult<()> {
        shared::binding::validate_scope_path(scope)?;
        let mut scopes = self.encrypted_scopes.write();
        if !scopes.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
            scopes.push(scope.to_string());
        }
        Ok(())
    }

    pub fn is_encrypted(&self, key: &str) -> bool {
        self.encrypted_scopes.read().iter().any(|s| in_scope(key, s))
    }

    pub fn is_connected(&self) -> bool {
        self.proxy.lock().is_some()
    }

    async fn proxy(&self) -> OrbResult<Arc<dyn ConfigStore>> {
        if let Some(proxy) = self.proxy.lock().clone() {
            return Ok(proxy);
        }

        let proxy = self
            .resolver
            .make_client_proxy(
                &*self.factory,
                &self.config.binding,
                self.config.proxy_wait,
                false,
                false,
            )
            .await
            .ok_or_else(|| OrbError::NotFound(self.config.binding.clone()))?;
        *self.proxy.lock() = Some(proxy.clone());
        Ok(proxy)
    }

    fn on_error(&self, err: OrbError) -> OrbError {
        if err.is_connection_lost() {
            tracing::debug!(binding = %self.config.binding, "Config store connection lost: {err}");
            *self.proxy.lock() = None;
            self.resolver.cache().evict(&self.config.binding);
        }
        err
    }

    fn key_for(&self, key: &str) -> OrbResult<Option<&ScopeKey>> {
        if !self.is_encrypted(key) {
            return Ok(None);
        }
        self.key
            .as_ref()
            .map(Some)
            .ok_or_else(|| OrbError::Crypto(format!("'{key}' is in an encrypted scope but no key is set")))
    }

    /// Current value and version, `None` if the key does not exist
    pub async fn read_object(&self, key: &str) -> OrbResult<Option<(Vec<u8>, u64)>> {
        let proxy = self.proxy().await?;
        let object = proxy.read_object(key).await.map_err(|e| self.on_error(e))?;

        match object {
            None => Ok(None),
            Some(object) => {
                let bytes = match self.key_for(key)? {
                    Some(scope_key) => scope_key.decrypt(&object.bytes)?,
                    None => object.bytes,
                };
                Ok(Some((bytes, object.version)))
            }
        }
    }

    /// Value only if its version is newer than `known_version`
    pub async fn read_if_newer(&self, key: &str, known_version: u64) -> OrbResult<Option<(Vec<u8>, u64)>> {
        Ok(self
            .read_object(key)
            .await?
            .filter(|(_, version)| *version > known_version))
    }

    /// Optimistic update.
    ///
    /// `version` is the version the caller last read (0 to create) and is
    /// replaced by the store's current version. Returns false if the caller's
    /// version was stale; nothing is written in that case.
    pub async fn add_or_update(&self, key: &str, version: &mut u64, payload: &[u8]) -> OrbResult<bool> {
        let sealed;
        let bytes = match self.key_for(key)? {
            Some(scope_key) => {
                sealed = scope_key.encrypt(payload)?;
                sealed.as_slice()
            }
            None => payload,
        };

        let proxy = self.proxy().await?;
        let reply = proxy
            .add_or_update(key, *version, bytes)
            .await
            .map_err(|e| self.on_error(e))?;

        if !reply.ok {
            tracing::debug!(key, ours = *version, current = reply.version, "Stale version on update");
        }
        *version = reply.version;
        Ok(reply.ok)
    }

    /// Returns whether the key existed
    pub async fn delete_object(&self, key: &str) -> OrbResult<bool> {
        let proxy = self.proxy().await?;
        proxy.delete_object(key).await.map_err(|e| self.on_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectRefCache;
    use crate::config::{CONFIG_STORE_BINDING, ResolverConfig};
    use crate::memory::{InMemoryConfigStore, InMemoryNameServer, MemoryFactory};
    use crate::rpc::CONFIG_STORE_INTERFACE;
    use shared::{BindingRecord, EndpointId};

    fn setup() -> (Arc<InMemoryConfigStore>, VersionedKvClient) {
        let ns = Arc::new(InMemoryNameServer::new());
        let store = Arc::new(InMemoryConfigStore::new(EndpointId::new_instance(
            CONFIG_STORE_INTERFACE,
            "cfg",
            7000,
        )));
        ns.bind_direct(BindingRecord::new(CONFIG_STORE_BINDING, "config", store.endpoint().clone()).unwrap());

        let resolver = Arc::new(Resolver::new(
            ResolverConfig::default(),
            Arc::new(ObjectRefCache::new()),
            Arc::new(MemoryFactory::new(ns)),
        ));
        let client = VersionedKvClient::new(
            KvConfig::default().with_encrypted_scope("/Secure"),
            resolver,
            Arc::new(MemoryFactory::new(store.clone())),
        )
        .with_key(ScopeKey::generate());
        (store, client)
    }

    #[tokio::test]
    async fn test_plain_and_encrypted_values() {
        let (store, client) = setup();

        let mut version = 0;
        assert!(client.add_or_update("/App/name", &mut version, b"plain").await.unwrap());
        assert_eq!(version, 1);
        assert_eq!(store.raw("/App/name").unwrap(), b"plain");

        let mut version = 0;
        assert!(client.add_or_update("/Secure/pw", &mut version, b"hunter2").await.unwrap());
        assert_ne!(store.raw("/Secure/pw").unwrap(), b"hunter2");
        assert_eq!(
            client.read_object("/Secure/pw").await.unwrap(),
            Some((b"hunter2".to_vec(), 1))
        );
    }

    #[tokio::test]
    async fn test_lost_connection_drops_proxy() {
        let (store, client) = setup();
        assert!(client.read_object("/App/none").await.unwrap().is_none());
        assert!(client.is_connected());

        store.fail_next_calls(1);
        let err = client.read_object("/App/none").await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!client.is_connected());

        // 下一次调用重新解析
        assert!(client.read_object("/App/none").await.unwrap().is_none());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_encrypted_scope_without_key() {
        let (_store, client) = setup();
        let client = VersionedKvClient { key: None, ..client };
        let mut version = 0;
        assert!(matches!(
            client.add_or_update("/secure/x", &mut version, b"v").await,
            Err(OrbError::Crypto(_))
        ));
    }

    #[test]
    fn test_in_scope() {
        assert!(in_scope("/Secure/db/password", "/Secure"));
        assert!(in_scope("/secure/x", "/SECURE/"));
        assert!(in_scope("/Secure", "/Secure"));
        assert!(!in_scope("/SecureNot/x", "/Secure"));
        assert!(!in_scope("/Sec", "/Secure"));
    }

    #[test]
    fn test_in_scope_non_ascii_key() {
        // 前缀长度落在多字节字符中间
        assert!(!in_scope("/Abé/x", "/Abc"));
        assert!(!in_scope("é", "/Abc"));
        assert!(in_scope("/Café/menu", "/Café"));
        assert!(!in_scope("/CAFÉ/menu", "/Café"));
    }

    #[tokio::test]
    async fn test_non_ascii_key_near_encrypted_scope() {
        let (store, client) = setup();
        let mut version = 0;
        assert!(client.add_or_update("/Securé/x", &mut version, b"open").await.unwrap());
        assert_eq!(store.raw("/Securé/x").unwrap(), b"open");
        assert!(!client.is_encrypted("/Securé/x"));
    }
}
