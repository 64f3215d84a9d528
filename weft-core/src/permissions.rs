//! Capability permissions: matcher grammar, signed certificates, and the
//! verification cache that gates RPC handlers and channel listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::identity::{Keypair, PublicKey};
use crate::store::{KvStore, StoreError};

const STORE_PREFIX: &str = "permissions";

/// One positional pattern element in an authorization rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Matcher {
    /// Segment must equal the value.
    Exact(String),
    /// Segment must start with the value.
    Prefix(String),
    /// Matches exactly one segment, any value.
    Any,
    /// Matches zero or more trailing segments. Must be the last matcher.
    AnyRemainingSlots,
}

impl Matcher {
    pub fn exact(value: impl Into<String>) -> Self {
        Matcher::Exact(value.into())
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Matcher::Prefix(value.into())
    }
}

/// Match a concrete key tuple against a matcher list. Every positional
/// matcher must accept its segment and the key must be fully consumed,
/// except when `AnyRemainingSlots` terminates the list early. A mid-list
/// `AnyRemainingSlots` is a caller programming error: logged, match fails.
pub fn match_perm_key(key: &[String], matchers: &[Matcher]) -> bool {
    for (index, matcher) in matchers.iter().enumerate() {
        match matcher {
            Matcher::Exact(value) => {
                if key.get(index) != Some(value) {
                    return false;
                }
            }
            Matcher::Prefix(value) => match key.get(index) {
                Some(segment) if segment.starts_with(value.as_str()) => {}
                _ => return false,
            },
            Matcher::Any => {
                if key.get(index).is_none() {
                    return false;
                }
            }
            Matcher::AnyRemainingSlots => {
                if index + 1 != matchers.len() {
                    tracing::error!("AnyRemainingSlots must be the last matcher");
                    return false;
                }
                return true;
            }
        }
    }
    // No extra trailing segments.
    key.len() == matchers.len()
}

/// The concrete thing a peer is trying to do, checked against permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub device_id: String,
    pub user_id: String,
    pub resource_id: Vec<String>,
    pub action_id: Vec<String>,
}

/// Who signed a permission. The verifier only trusts authorities it already
/// recognizes (e.g. the logged-in user's root key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authorityKind", rename_all = "camelCase")]
pub enum Authority {
    UserRoot { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityKind {
    UserRoot,
}

/// Signature plus authority descriptor binding a permission to its issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cert {
    /// Base64 Ed25519 signature over the canonical permission bytes.
    pub signature: String,
    pub authority: Authority,
}

/// A signed authorization grant (or explicit deny). Never mutated after
/// signing; superseded by newer permissions with the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub device_id: Vec<Matcher>,
    pub user_id: Vec<Matcher>,
    pub resource_id: Vec<Matcher>,
    pub action_id: Vec<Matcher>,

    /// Unix seconds. Whole-second precision so a permission survives every
    /// serialization path without invalidating its signature.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    pub allow: bool,

    pub cert: Cert,
}

/// Everything the issuer chooses; `created_at` and `cert` are filled in at
/// signing time.
#[derive(Debug, Clone)]
pub struct PermissionInput {
    pub device_id: Vec<Matcher>,
    pub user_id: Vec<Matcher>,
    pub resource_id: Vec<Matcher>,
    pub action_id: Vec<Matcher>,
    pub expires_at: Option<i64>,
    pub allow: bool,
}

/// An identity we can verify signatures against.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub public_key: PublicKey,
}

/// An identity that can also sign: a user's root key.
pub struct RootIdentity {
    pub id: String,
    pub keypair: Keypair,
}

impl RootIdentity {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            public_key: self.keypair.public_key().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Allow,
    /// Signature valid but the permission is an explicit deny.
    Reject,
    /// Signature, authority, or validity window is invalid.
    CertFailure,
    /// Signature valid, but the scope does not cover the action.
    MatchFailure,
}

impl PermissionResult {
    /// Callers must treat everything but `Allow` as unauthorized.
    pub fn allowed(&self) -> bool {
        matches!(self, PermissionResult::Allow)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("permission could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsignedPermission<'a> {
    device_id: &'a [Matcher],
    user_id: &'a [Matcher],
    resource_id: &'a [Matcher],
    action_id: &'a [Matcher],
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    allow: bool,
}

/// Canonical bytes that get signed: JSON with recursively sorted keys, so
/// the same permission always serializes to the same bytes.
fn signing_bytes(unsigned: &UnsignedPermission<'_>) -> Result<Vec<u8>, serde_json::Error> {
    // Round-trip through Value: its objects are sorted maps.
    let value = serde_json::to_value(unsigned)?;
    serde_json::to_vec(&value)
}

fn unix_seconds_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Build and sign a permission with the identity's root key. Timestamps are
/// truncated to whole seconds before signing.
pub fn create_permission(
    input: &PermissionInput,
    authority_kind: AuthorityKind,
    identity: &RootIdentity,
) -> Result<Permission, PermissionError> {
    let created_at = unix_seconds_now();
    let unsigned = UnsignedPermission {
        device_id: &input.device_id,
        user_id: &input.user_id,
        resource_id: &input.resource_id,
        action_id: &input.action_id,
        created_at,
        expires_at: input.expires_at,
        allow: input.allow,
    };
    let bytes = signing_bytes(&unsigned)?;
    let signature = identity.keypair.sign(&bytes);
    let authority = match authority_kind {
        AuthorityKind::UserRoot => Authority::UserRoot {
            id: identity.id.clone(),
        },
    };
    Ok(Permission {
        device_id: input.device_id.clone(),
        user_id: input.user_id.clone(),
        resource_id: input.resource_id.clone(),
        action_id: input.action_id.clone(),
        created_at,
        expires_at: input.expires_at,
        allow: input.allow,
        cert: Cert {
            signature: BASE64.encode(signature),
            authority,
        },
    })
}

/// Verify a permission's certificate against a known identity. Rejects a
/// mismatched authority id, a `created_at` in the future, an `expires_at`
/// in the past, and of course a bad signature.
pub fn verify_permission_signature(permission: &Permission, identity: &Identity) -> bool {
    let Authority::UserRoot { id } = &permission.cert.authority;
    if id != &identity.id {
        return false;
    }

    let now = unix_seconds_now();
    if permission.created_at > now {
        return false;
    }
    if let Some(expires_at) = permission.expires_at {
        if expires_at < now {
            return false;
        }
    }

    let unsigned = UnsignedPermission {
        device_id: &permission.device_id,
        user_id: &permission.user_id,
        resource_id: &permission.resource_id,
        action_id: &permission.action_id,
        created_at: permission.created_at,
        expires_at: permission.expires_at,
        allow: permission.allow,
    };
    let Ok(bytes) = signing_bytes(&unsigned) else {
        return false;
    };
    let Ok(signature) = BASE64.decode(&permission.cert.signature) else {
        return false;
    };
    let Ok(signature) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    identity.public_key.verify(&bytes, &signature)
}

/// Whether a permission's scope covers a concrete action.
pub fn match_permission(permission: &Permission, action: &Action) -> bool {
    match_perm_key(
        std::slice::from_ref(&action.device_id),
        &permission.device_id,
    ) && match_perm_key(std::slice::from_ref(&action.user_id), &permission.user_id)
        && match_perm_key(&action.resource_id, &permission.resource_id)
        && match_perm_key(&action.action_id, &permission.action_id)
}

/// Scope equality: same four matcher lists, ignoring cert and timestamps.
fn same_scope(input: &PermissionInput, permission: &Permission) -> bool {
    input.device_id == permission.device_id
        && input.user_id == permission.user_id
        && input.resource_id == permission.resource_id
        && input.action_id == permission.action_id
}

/// In-memory permission index keyed by certificate signature, backed by the
/// persistent store and hydrated from it at startup. Once a certificate has
/// verified against a known identity, the cached result is authoritative
/// for that exact signature string.
pub struct PermissionCache {
    cache: Mutex<HashMap<String, Permission>>,
    store: Arc<dyn KvStore>,
}

impl PermissionCache {
    /// Empty cache over a store (no hydration).
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Load every persisted permission into memory. Undecodable entries are
    /// logged and skipped.
    pub async fn hydrate(store: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let mut cache = HashMap::new();
        for (key, value) in store.entries().await? {
            if key.first().map(String::as_str) != Some(STORE_PREFIX) {
                continue;
            }
            match serde_json::from_value::<Permission>(value) {
                Ok(permission) => {
                    cache.insert(permission.cert.signature.clone(), permission);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable stored permission");
                }
            }
        }
        Ok(Self {
            cache: Mutex::new(cache),
            store,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cache and persist a permission, keyed by its certificate signature.
    pub async fn add_permission(&self, permission: Permission) -> Result<(), StoreError> {
        let signature = permission.cert.signature.clone();
        let value = serde_json::to_value(&permission)?;
        self.lock().insert(signature.clone(), permission);
        self.store
            .set_value(&[STORE_PREFIX.to_string(), signature], value)
            .await
    }

    /// Lookup-or-create: an existing permission with identical scope is
    /// returned unchanged (even if timestamps differ), so certificates are
    /// not churned. Otherwise signs a fresh one and persists it.
    pub async fn create_permission(
        &self,
        input: &PermissionInput,
        authority_kind: AuthorityKind,
        identity: &RootIdentity,
    ) -> Result<Permission, PermissionError> {
        let existing = self
            .lock()
            .values()
            .find(|p| same_scope(input, p))
            .cloned();
        if let Some(permission) = existing {
            tracing::debug!("found existing permission with identical scope");
            return Ok(permission);
        }

        let permission = create_permission(input, authority_kind, identity)?;
        self.add_permission(permission.clone()).await?;
        Ok(permission)
    }

    /// First cached permission whose scope covers the action, if any.
    pub fn find_permission(&self, action: &Action) -> Option<Permission> {
        self.lock()
            .values()
            .find(|p| match_permission(p, action))
            .cloned()
    }

    /// Full authorization check: certificate (with cached short-circuit for
    /// signatures verified before), then scope match, then allow/deny.
    pub async fn verify_permissions(
        &self,
        permission: &Permission,
        action: &Action,
        identity: &Identity,
    ) -> Result<PermissionResult, StoreError> {
        // The short-circuit only applies to a byte-for-byte known permission.
        // A familiar signature attached to a different body must go through
        // full verification, or a replayed cert could smuggle in widened
        // matchers.
        let previously_trusted = self
            .lock()
            .get(&permission.cert.signature)
            .map(|cached| cached == permission)
            .unwrap_or(false);

        if !previously_trusted {
            if !verify_permission_signature(permission, identity) {
                return Ok(PermissionResult::CertFailure);
            }
            self.add_permission(permission.clone()).await?;
        }

        if !match_permission(permission, action) {
            return Ok(PermissionResult::MatchFailure);
        }
        if !permission.allow {
            return Ok(PermissionResult::Reject);
        }
        Ok(PermissionResult::Allow)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Permission>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn root() -> RootIdentity {
        RootIdentity {
            id: "user-1".into(),
            keypair: Keypair::generate(),
        }
    }

    fn note_input(allow: bool) -> PermissionInput {
        PermissionInput {
            device_id: vec![Matcher::Any],
            user_id: vec![Matcher::exact("user-1")],
            resource_id: vec![Matcher::exact("notes"), Matcher::AnyRemainingSlots],
            action_id: vec![Matcher::exact("read")],
            expires_at: None,
            allow,
        }
    }

    fn note_action() -> Action {
        Action {
            device_id: "device-a".into(),
            user_id: "user-1".into(),
            resource_id: segs(&["notes", "abc"]),
            action_id: segs(&["read"]),
        }
    }

    #[test]
    fn matcher_exact_and_any() {
        let matchers = vec![Matcher::exact("notes"), Matcher::Any];
        assert!(match_perm_key(&segs(&["notes", "abc"]), &matchers));
        assert!(!match_perm_key(&segs(&["notes", "abc", "x"]), &matchers));
        assert!(!match_perm_key(&segs(&["notes"]), &matchers));
        assert!(!match_perm_key(&segs(&["other", "abc"]), &matchers));
    }

    #[test]
    fn matcher_any_remaining_slots() {
        let matchers = vec![Matcher::exact("notes"), Matcher::AnyRemainingSlots];
        assert!(match_perm_key(&segs(&["notes", "abc", "x"]), &matchers));
        assert!(match_perm_key(&segs(&["notes"]), &matchers));
        assert!(!match_perm_key(&segs(&["other"]), &matchers));
    }

    #[test]
    fn matcher_any_remaining_slots_mid_list_fails() {
        let matchers = vec![Matcher::AnyRemainingSlots, Matcher::exact("notes")];
        assert!(!match_perm_key(&segs(&["notes", "x"]), &matchers));
    }

    #[test]
    fn matcher_prefix() {
        let matchers = vec![Matcher::prefix("note")];
        assert!(match_perm_key(&segs(&["notes"]), &matchers));
        assert!(!match_perm_key(&segs(&["memo"]), &matchers));
    }

    #[test]
    fn matcher_empty_lists() {
        assert!(match_perm_key(&[], &[]));
        assert!(!match_perm_key(&segs(&["x"]), &[]));
        assert!(!match_perm_key(&[], &[Matcher::Any]));
        assert!(match_perm_key(&[], &[Matcher::AnyRemainingSlots]));
    }

    #[test]
    fn permission_sign_verify_roundtrip() {
        let root = root();
        let permission = create_permission(&note_input(true), AuthorityKind::UserRoot, &root)
            .expect("create");
        assert!(verify_permission_signature(&permission, &root.identity()));
    }

    #[test]
    fn tampered_permission_fails_verification() {
        let root = root();
        let mut permission = create_permission(&note_input(false), AuthorityKind::UserRoot, &root)
            .expect("create");
        permission.allow = true;
        assert!(!verify_permission_signature(&permission, &root.identity()));
    }

    #[test]
    fn wrong_authority_fails_verification() {
        let root = root();
        let permission =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");
        let other = Identity {
            id: "user-2".into(),
            public_key: root.keypair.public_key().clone(),
        };
        assert!(!verify_permission_signature(&permission, &other));
    }

    #[test]
    fn expired_permission_fails_verification() {
        let root = root();
        let mut input = note_input(true);
        input.expires_at = Some(unix_seconds_now() - 10);
        let permission =
            create_permission(&input, AuthorityKind::UserRoot, &root).expect("create");
        assert!(!verify_permission_signature(&permission, &root.identity()));
    }

    #[test]
    fn future_created_at_fails_verification() {
        let root = root();
        let mut permission =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");
        permission.created_at = unix_seconds_now() + 3600;
        assert!(!verify_permission_signature(&permission, &root.identity()));
    }

    #[test]
    fn permission_json_roundtrip_preserves_signature_validity() {
        let root = root();
        let permission =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");
        let json = serde_json::to_string(&permission).expect("encode");
        let back: Permission = serde_json::from_str(&json).expect("decode");
        assert!(verify_permission_signature(&back, &root.identity()));
    }

    #[tokio::test]
    async fn cache_create_is_idempotent_for_same_scope() {
        let cache = PermissionCache::new(Arc::new(MemoryStore::new()));
        let root = root();
        let first = cache
            .create_permission(&note_input(true), AuthorityKind::UserRoot, &root)
            .await
            .expect("create");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = cache
            .create_permission(&note_input(true), AuthorityKind::UserRoot, &root)
            .await
            .expect("create");
        assert_eq!(first.cert.signature, second.cert.signature);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn cache_verify_results() {
        let cache = PermissionCache::new(Arc::new(MemoryStore::new()));
        let root = root();
        let identity = root.identity();
        let allow =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");

        let result = cache
            .verify_permissions(&allow, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::Allow);
        assert!(result.allowed());

        // Scope doesn't cover a different resource.
        let mut other_action = note_action();
        other_action.resource_id = segs(&["photos", "x"]);
        let result = cache
            .verify_permissions(&allow, &other_action, &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::MatchFailure);

        // Explicit deny.
        let deny =
            create_permission(&note_input(false), AuthorityKind::UserRoot, &root).expect("create");
        let result = cache
            .verify_permissions(&deny, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::Reject);

        // Tampered cert.
        let mut tampered = allow.clone();
        tampered.allow = false;
        tampered.cert.signature = BASE64.encode([0u8; 64]);
        let result = cache
            .verify_permissions(&tampered, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::CertFailure);
    }

    #[tokio::test]
    async fn known_cert_on_altered_body_is_reverified_and_rejected() {
        let cache = PermissionCache::new(Arc::new(MemoryStore::new()));
        let root = root();
        let identity = root.identity();
        let genuine =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");

        // First verification caches the signature.
        let result = cache
            .verify_permissions(&genuine, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::Allow);

        // Same cert, widened scope: the cached signature must not vouch for
        // a body it never signed.
        let mut widened = genuine.clone();
        widened.resource_id = vec![Matcher::AnyRemainingSlots];
        let mut action = note_action();
        action.resource_id = segs(&["photos", "x"]);
        let result = cache
            .verify_permissions(&widened, &action, &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::CertFailure);

        // Same cert, allow flipped.
        let mut flipped = create_permission(&note_input(false), AuthorityKind::UserRoot, &root)
            .expect("create");
        let denied = cache
            .verify_permissions(&flipped, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(denied, PermissionResult::Reject);
        flipped.allow = true;
        let result = cache
            .verify_permissions(&flipped, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::CertFailure);

        // The genuine permission still short-circuits to Allow.
        let result = cache
            .verify_permissions(&genuine, &note_action(), &identity)
            .await
            .expect("verify");
        assert_eq!(result, PermissionResult::Allow);
    }

    #[tokio::test]
    async fn verified_permissions_are_persisted_and_rehydrated() {
        let store = Arc::new(MemoryStore::new());
        let root = root();
        let identity = root.identity();
        let permission =
            create_permission(&note_input(true), AuthorityKind::UserRoot, &root).expect("create");

        {
            let cache = PermissionCache::new(store.clone() as Arc<dyn KvStore>);
            let result = cache
                .verify_permissions(&permission, &note_action(), &identity)
                .await
                .expect("verify");
            assert_eq!(result, PermissionResult::Allow);
        }

        // A fresh cache over the same store sees the verified permission.
        let cache = PermissionCache::hydrate(store as Arc<dyn KvStore>)
            .await
            .expect("hydrate");
        assert_eq!(cache.len(), 1);
        assert!(cache.find_permission(&note_action()).is_some());
    }

    #[tokio::test]
    async fn find_permission_scans_scope() {
        let cache = PermissionCache::new(Arc::new(MemoryStore::new()));
        let root = root();
        cache
            .create_permission(&note_input(true), AuthorityKind::UserRoot, &root)
            .await
            .expect("create");
        assert!(cache.find_permission(&note_action()).is_some());
        let mut other = note_action();
        other.user_id = "user-2".into();
        assert!(cache.find_permission(&other).is_none());
    }
}
