//! Permission verification for remote start requests.
//!
//! Two questions are answered here:
//!
//! - who is the local caller ([`PermissionVerifier::get_app_id`]), so its
//!   signing identity can be claimed in an outbound request;
//! - may a remote caller start the requested bundle
//!   ([`PermissionVerifier::check_remote_permission`]), decided by comparing
//!   the claimed identity with the one the registry holds for the callee.
//!
//! Identities are never cached; every check goes back to the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PermissionConfig;
use crate::errors::{DmsError, DmsResult};
use crate::registry::{BundleFlags, BundleRegistry, RegistryEndpoints};

/// Trust level of the process running the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Runs inside the registry's host process and uses the in-process endpoint.
    #[default]
    TrustedBroker,
    /// Runs inside a shell-launched test harness and uses the proxy endpoint.
    TestHarness,
    /// May not query the registry at all.
    Untrusted,
}

/// Platform rules for resolving a caller's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityProfile {
    /// Native uids resolve through the on-disk store, others through the
    /// registry's uid index.
    #[default]
    Standard,
    /// No native store; the caller's bundle name is looked up directly.
    Wearable,
}

/// Identity of a local caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    pub uid: u32,
    pub bundle_name: Option<String>,
}

impl CallerInfo {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            bundle_name: None,
        }
    }

    pub fn with_bundle(uid: u32, bundle_name: impl Into<String>) -> Self {
        Self {
            uid,
            bundle_name: Some(bundle_name.into()),
        }
    }
}

/// Resolved signing identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    /// Owning bundle, unknown for native services.
    pub bundle_name: Option<String>,
    /// Raw identity: `"<bundle>_<signature>"` for bundles, the file content
    /// for native services.
    pub signing_identity: String,
}

impl AppIdentity {
    /// The part a peer compares against: the identity with the
    /// `"<bundle>_"` prefix removed when present.
    pub fn signature(&self) -> &str {
        self.bundle_name
            .as_deref()
            .and_then(|bundle| self.signing_identity.strip_prefix(bundle))
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(&self.signing_identity)
    }
}

/// Input of one remote permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheckInfo {
    pub callee_bundle_name: String,
    /// `None` when the request carried no signature field.
    pub caller_signature: Option<String>,
}

/// Directory of `uid_<uid>_appid` files for native services.
#[derive(Debug, Clone)]
pub struct NativeAppIdStore {
    dir: PathBuf,
}

impl NativeAppIdStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, uid: u32) -> PathBuf {
        self.dir.join(format!("uid_{uid}_appid"))
    }

    /// Read the identity for `uid`. The content must be non-empty and
    /// strictly shorter than `capacity`.
    pub fn read(&self, uid: u32, capacity: usize) -> DmsResult<String> {
        let path = self.path_for(uid);
        let content = std::fs::read(&path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to open native app id file");
            DmsError::failure(format!("no native app id for uid {uid}"))
        })?;
        if content.is_empty() || content.len() >= capacity {
            warn!(
                uid,
                len = content.len(),
                capacity,
                "native app id file is empty or larger than available space"
            );
            return Err(DmsError::failure("native app id length out of range"));
        }
        String::from_utf8(content)
            .map_err(|_| DmsError::failure(format!("native app id for uid {uid} is not UTF-8")))
    }
}

/// Resolves caller identities and authorizes remote start requests.
pub struct PermissionVerifier {
    access_mode: AccessMode,
    profile: IdentityProfile,
    native_store: NativeAppIdStore,
    native_uid_ceiling: u32,
    endpoints: RegistryEndpoints,
}

impl PermissionVerifier {
    pub fn new(config: &PermissionConfig, endpoints: RegistryEndpoints) -> Self {
        Self {
            access_mode: config.access_mode,
            profile: config.profile,
            native_store: NativeAppIdStore::new(&config.native_appid_dir),
            native_uid_ceiling: config.native_uid_ceiling,
            endpoints,
        }
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Registry endpoint this process is allowed to use.
    fn registry(&self) -> DmsResult<Arc<dyn BundleRegistry>> {
        if self.profile == IdentityProfile::Wearable {
            return Ok(self
                .endpoints
                .in_process
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.endpoints.proxy)));
        }
        match self.access_mode {
            AccessMode::TrustedBroker => self.endpoints.in_process.clone().ok_or_else(|| {
                warn!("in-process bundle registry not available");
                DmsError::RegistryUnavailable
            }),
            AccessMode::TestHarness => Ok(Arc::clone(&self.endpoints.proxy)),
            AccessMode::Untrusted => {
                warn!("bundle registry query refused for untrusted process");
                Err(DmsError::UnauthorizedCaller)
            }
        }
    }

    /// Resolve the signing identity of a local caller.
    ///
    /// `capacity` bounds the identity length the caller can accept; an
    /// identity must be strictly shorter than it.
    pub fn get_app_id(&self, caller: &CallerInfo, capacity: usize) -> DmsResult<AppIdentity> {
        if capacity == 0 {
            return Err(DmsError::invalid("app id capacity must be non-zero"));
        }

        let bundle_name = match self.profile {
            IdentityProfile::Standard if caller.uid <= self.native_uid_ceiling => {
                let signing_identity = self.native_store.read(caller.uid, capacity)?;
                return Ok(AppIdentity {
                    bundle_name: None,
                    signing_identity,
                });
            }
            IdentityProfile::Standard => {
                let registry = self.registry()?;
                registry.bundle_name_for_uid(caller.uid).map_err(|e| {
                    warn!(uid = caller.uid, error = %e, "bundle name lookup for uid failed");
                    DmsError::failure(format!("no bundle for uid {}", caller.uid))
                })?
            }
            IdentityProfile::Wearable => caller
                .bundle_name
                .clone()
                .ok_or_else(|| DmsError::failure("caller has no bundle name"))?,
        };

        let registry = self.registry()?;
        let info = registry
            .bundle_info(&bundle_name, BundleFlags::WithoutAbilities)
            .map_err(|e| {
                warn!(bundle = %bundle_name, error = %e, "bundle info lookup failed");
                DmsError::BundleLookupFailure(bundle_name.clone())
            })?;
        let signing_identity = info
            .app_id
            .ok_or_else(|| DmsError::failure(format!("bundle {bundle_name} has no app id")))?;
        if signing_identity.len() >= capacity {
            warn!(bundle = %bundle_name, capacity, "app id larger than available space");
            return Err(DmsError::failure("app id exceeds capacity"));
        }

        debug!(uid = caller.uid, bundle = %bundle_name, "resolved caller app id");
        Ok(AppIdentity {
            bundle_name: Some(bundle_name),
            signing_identity,
        })
    }

    /// Decide whether a remote caller claiming `info.caller_signature` may
    /// start `info.callee_bundle_name`.
    pub fn check_remote_permission(&self, info: &PermissionCheckInfo) -> DmsResult<()> {
        let registry = self.registry()?;
        let bundle = registry
            .bundle_info(&info.callee_bundle_name, BundleFlags::WithoutAbilities)
            .map_err(|e| {
                warn!(bundle = %info.callee_bundle_name, error = %e, "callee bundle lookup failed");
                DmsError::BundleLookupFailure(info.callee_bundle_name.clone())
            })?;

        // app id layout: "<bundle>_<signature>"
        let callee_signature = bundle
            .app_id
            .as_deref()
            .and_then(|app_id| app_id.as_bytes().get(info.callee_bundle_name.len() + 1..));
        let (Some(caller), Some(callee)) = (info.caller_signature.as_deref(), callee_signature)
        else {
            warn!(bundle = %info.callee_bundle_name, "signature is missing");
            return Err(DmsError::failure("signature is missing"));
        };

        if caller.len() != callee.len() || !constant_time_eq(caller.as_bytes(), callee) {
            warn!(bundle = %info.callee_bundle_name, "signature mismatch");
            return Err(DmsError::PermissionMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BundleInfo, InMemoryRegistry};

    const CAPACITY: usize = 256;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<InMemoryRegistry>,
        config: PermissionConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let registry = Arc::new(InMemoryRegistry::new());
            registry.install(BundleInfo::new("com.app", 10_010, "SIG123"));
            let config = PermissionConfig {
                native_appid_dir: dir.path().to_path_buf(),
                ..PermissionConfig::default()
            };
            Self {
                _dir: dir,
                registry,
                config,
            }
        }

        fn write_native(&self, uid: u32, content: &[u8]) {
            std::fs::write(self.config.native_appid_dir.join(format!("uid_{uid}_appid")), content)
                .unwrap();
        }

        fn verifier(&self) -> PermissionVerifier {
            PermissionVerifier::new(&self.config, RegistryEndpoints::shared(self.registry.clone()))
        }

        fn verifier_with(&self, mode: AccessMode, endpoints: RegistryEndpoints) -> PermissionVerifier {
            let config = PermissionConfig {
                access_mode: mode,
                ..self.config.clone()
            };
            PermissionVerifier::new(&config, endpoints)
        }
    }

    fn check(signature: Option<&str>) -> PermissionCheckInfo {
        PermissionCheckInfo {
            callee_bundle_name: "com.app".into(),
            caller_signature: signature.map(str::to_string),
        }
    }

    #[test]
    fn test_native_identity_is_file_content() {
        let fx = Fixture::new();
        fx.write_native(42, b"native-service-id");

        let id = fx.verifier().get_app_id(&CallerInfo::new(42), CAPACITY).unwrap();
        assert_eq!(id.signing_identity, "native-service-id");
        assert_eq!(id.bundle_name, None);
        assert_eq!(id.signature(), "native-service-id");
    }

    #[test]
    fn test_native_identity_length_bounds() {
        let fx = Fixture::new();
        fx.write_native(1, b"");
        fx.write_native(2, b"abcd");
        let verifier = fx.verifier();

        assert!(matches!(
            verifier.get_app_id(&CallerInfo::new(1), CAPACITY),
            Err(DmsError::Failure(_))
        ));
        // content must be strictly shorter than the capacity
        assert!(verifier.get_app_id(&CallerInfo::new(2), 4).is_err());
        assert!(verifier.get_app_id(&CallerInfo::new(2), 5).is_ok());
    }

    #[test]
    fn test_unknown_uid_fails() {
        let fx = Fixture::new();
        let verifier = fx.verifier();
        assert!(matches!(
            verifier.get_app_id(&CallerInfo::new(99), CAPACITY),
            Err(DmsError::Failure(_))
        ));
        assert!(matches!(
            verifier.get_app_id(&CallerInfo::new(12_345), CAPACITY),
            Err(DmsError::Failure(_))
        ));
    }

    #[test]
    fn test_zero_capacity_is_invalid() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.verifier().get_app_id(&CallerInfo::new(10_010), 0),
            Err(DmsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_registry_identity() {
        let fx = Fixture::new();
        let verifier = fx.verifier();
        let id = verifier.get_app_id(&CallerInfo::new(10_010), CAPACITY).unwrap();
        assert_eq!(id.signing_identity, "com.app_SIG123");
        assert_eq!(id.signature(), "SIG123");

        assert!(verifier.get_app_id(&CallerInfo::new(10_010), "com.app_SIG123".len()).is_err());
    }

    #[test]
    fn test_registry_record_without_app_id() {
        let fx = Fixture::new();
        fx.registry.install(BundleInfo {
            bundle_name: "com.unsigned".into(),
            uid: 10_020,
            ..BundleInfo::default()
        });
        assert!(matches!(
            fx.verifier().get_app_id(&CallerInfo::new(10_020), CAPACITY),
            Err(DmsError::Failure(_))
        ));
    }

    #[test]
    fn test_matching_signature_is_accepted() {
        let fx = Fixture::new();
        assert_eq!(fx.verifier().check_remote_permission(&check(Some("SIG123"))), Ok(()));
    }

    #[test]
    fn test_differing_signature_is_a_mismatch() {
        let fx = Fixture::new();
        let verifier = fx.verifier();
        assert_eq!(
            verifier.check_remote_permission(&check(Some("SIG999"))),
            Err(DmsError::PermissionMismatch)
        );
        assert_eq!(
            verifier.check_remote_permission(&check(Some("sig123"))),
            Err(DmsError::PermissionMismatch)
        );
        assert_eq!(
            verifier.check_remote_permission(&check(Some("SIG1234"))),
            Err(DmsError::PermissionMismatch)
        );
        assert_eq!(
            verifier.check_remote_permission(&check(Some(""))),
            Err(DmsError::PermissionMismatch)
        );
    }

    #[test]
    fn test_missing_signatures_fail() {
        let fx = Fixture::new();
        let verifier = fx.verifier();
        assert!(matches!(
            verifier.check_remote_permission(&check(None)),
            Err(DmsError::Failure(_))
        ));

        // app id shorter than "<bundle>_" leaves no callee signature
        fx.registry.install(BundleInfo {
            bundle_name: "com.app".into(),
            uid: 10_010,
            app_id: Some("com.app".into()),
            ..BundleInfo::default()
        });
        assert!(matches!(
            verifier.check_remote_permission(&check(Some("SIG123"))),
            Err(DmsError::Failure(_))
        ));
    }

    #[test]
    fn test_unknown_callee_is_a_lookup_failure() {
        let fx = Fixture::new();
        let info = PermissionCheckInfo {
            callee_bundle_name: "com.missing".into(),
            caller_signature: Some("SIG123".into()),
        };
        assert!(matches!(
            fx.verifier().check_remote_permission(&info),
            Err(DmsError::BundleLookupFailure(_))
        ));
    }

    #[test]
    fn test_access_modes_select_endpoint() {
        let fx = Fixture::new();
        let proxy_only = RegistryEndpoints::proxy_only(fx.registry.clone());

        let broker = fx.verifier_with(AccessMode::TrustedBroker, proxy_only.clone());
        assert_eq!(
            broker.check_remote_permission(&check(Some("SIG123"))),
            Err(DmsError::RegistryUnavailable)
        );

        let harness = fx.verifier_with(AccessMode::TestHarness, proxy_only);
        assert_eq!(harness.check_remote_permission(&check(Some("SIG123"))), Ok(()));
    }

    #[test]
    fn test_untrusted_process_is_refused() {
        let fx = Fixture::new();
        fx.write_native(5, b"native");
        let verifier = fx.verifier_with(
            AccessMode::Untrusted,
            RegistryEndpoints::shared(fx.registry.clone()),
        );
        assert_eq!(
            verifier.check_remote_permission(&check(Some("SIG123"))),
            Err(DmsError::UnauthorizedCaller)
        );
        assert_eq!(
            verifier.get_app_id(&CallerInfo::new(10_010), CAPACITY),
            Err(DmsError::UnauthorizedCaller)
        );
        // the native store does not go through the registry
        assert!(verifier.get_app_id(&CallerInfo::new(5), CAPACITY).is_ok());
    }

    #[test]
    fn test_wearable_profile_uses_bundle_name() {
        let mut fx = Fixture::new();
        fx.config.profile = IdentityProfile::Wearable;
        fx.config.access_mode = AccessMode::Untrusted;
        let verifier = fx.verifier();

        let id = verifier
            .get_app_id(&CallerInfo::with_bundle(3, "com.app"), CAPACITY)
            .unwrap();
        assert_eq!(id.signing_identity, "com.app_SIG123");
        assert!(matches!(
            verifier.get_app_id(&CallerInfo::new(3), CAPACITY),
            Err(DmsError::Failure(_))
        ));
        assert_eq!(verifier.check_remote_permission(&check(Some("SIG123"))), Ok(()));
    }
}
