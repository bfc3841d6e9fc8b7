//! Bundle registry adapter.
//!
//! The registry itself lives outside this crate; DMS only needs two queries
//! from it. [`InMemoryRegistry`] backs tests and the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// How much of a bundle record the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundleFlags {
    #[default]
    WithoutAbilities,
    WithAbilities,
}

/// Registry record for an installed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BundleInfo {
    pub bundle_name: String,
    pub uid: u32,
    /// `"<bundle_name>_<signature>"`, when the bundle is signed.
    pub app_id: Option<String>,
    pub version_code: u32,
    /// Ability names, only filled for [`BundleFlags::WithAbilities`].
    pub abilities: Vec<String>,
}

impl BundleInfo {
    pub fn new(bundle_name: impl Into<String>, uid: u32, signature: &str) -> Self {
        let bundle_name = bundle_name.into();
        let app_id = Some(format!("{bundle_name}_{signature}"));
        Self {
            bundle_name,
            uid,
            app_id,
            version_code: 1,
            abilities: Vec::new(),
        }
    }

    pub fn with_abilities<I, S>(mut self, abilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abilities = abilities.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    #[error("no bundle for uid {0}")]
    UidNotFound(u32),

    #[error("registry unavailable")]
    Unavailable,
}

/// Queries DMS issues against the bundle registry.
pub trait BundleRegistry: Send + Sync {
    fn bundle_info(&self, bundle_name: &str, flags: BundleFlags) -> Result<BundleInfo, RegistryError>;

    fn bundle_name_for_uid(&self, uid: u32) -> Result<String, RegistryError>;
}

/// Registry held in memory, keyed by bundle name.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    bundles: RwLock<HashMap<String, BundleInfo>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a bundle.
    pub fn install(&self, info: BundleInfo) {
        self.bundles.write().insert(info.bundle_name.clone(), info);
    }

    pub fn uninstall(&self, bundle_name: &str) -> Option<BundleInfo> {
        self.bundles.write().remove(bundle_name)
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.read().is_empty()
    }
}

impl BundleRegistry for InMemoryRegistry {
    fn bundle_info(&self, bundle_name: &str, flags: BundleFlags) -> Result<BundleInfo, RegistryError> {
        let mut info = self
            .bundles
            .read()
            .get(bundle_name)
            .cloned()
            .ok_or_else(|| RegistryError::BundleNotFound(bundle_name.to_string()))?;
        if flags == BundleFlags::WithoutAbilities {
            info.abilities.clear();
        }
        Ok(info)
    }

    fn bundle_name_for_uid(&self, uid: u32) -> Result<String, RegistryError> {
        self.bundles
            .read()
            .values()
            .find(|info| info.uid == uid)
            .map(|info| info.bundle_name.clone())
            .ok_or(RegistryError::UidNotFound(uid))
    }
}

/// The two ways of reaching the registry.
///
/// `in_process` is only available inside the process hosting the registry;
/// `proxy` is the cross-process client used by test harnesses.
#[derive(Clone)]
pub struct RegistryEndpoints {
    pub in_process: Option<Arc<dyn BundleRegistry>>,
    pub proxy: Arc<dyn BundleRegistry>,
}

impl RegistryEndpoints {
    /// Both endpoints backed by the same registry.
    pub fn shared(registry: Arc<dyn BundleRegistry>) -> Self {
        Self {
            in_process: Some(Arc::clone(&registry)),
            proxy: registry,
        }
    }

    /// Only the cross-process proxy is reachable.
    pub fn proxy_only(proxy: Arc<dyn BundleRegistry>) -> Self {
        Self {
            in_process: None,
            proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_uid() {
        let registry = InMemoryRegistry::new();
        registry.install(BundleInfo::new("com.example.app", 10_001, "SIG").with_abilities(["Main"]));

        let info = registry
            .bundle_info("com.example.app", BundleFlags::WithoutAbilities)
            .unwrap();
        assert_eq!(info.app_id.as_deref(), Some("com.example.app_SIG"));
        assert!(info.abilities.is_empty());

        let info = registry
            .bundle_info("com.example.app", BundleFlags::WithAbilities)
            .unwrap();
        assert_eq!(info.abilities, vec!["Main".to_string()]);

        assert_eq!(registry.bundle_name_for_uid(10_001).unwrap(), "com.example.app");
        assert_eq!(
            registry.bundle_name_for_uid(7),
            Err(RegistryError::UidNotFound(7))
        );
    }

    #[test]
    fn test_uninstall() {
        let registry = InMemoryRegistry::new();
        registry.install(BundleInfo::new("a", 1000, "S"));
        assert_eq!(registry.len(), 1);
        assert!(registry.uninstall("a").is_some());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.bundle_info("a", BundleFlags::default()),
            Err(RegistryError::BundleNotFound(_))
        ));
    }
}
