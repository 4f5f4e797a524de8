//! Cache key derivation.
//!
//! ## Key Format
//!
//! `{namespace}:{tenant}:{endpoint}[:{name}={value}&...]`, e.g.
//! `user:1:budgets:limit=10&offset=20`.
//!
//! Parameters are kept in a `BTreeMap`, so they are always rendered in
//! lexicographic order no matter how the caller inserted them. An empty
//! parameter set renders the bare `{namespace}:{tenant}:{endpoint}` form.
//!
//! The tenant segment is mandatory. There is no anonymous key: requests
//! without a tenant identity never reach the deriver.

use std::collections::BTreeMap;
use std::fmt;

/// Default first segment of every key.
pub const DEFAULT_NAMESPACE: &str = "user";

/// Rendered value for a parameter that was named but carries no value.
pub const UNDEFINED_VALUE: &str = "undefined";

/// Characters that would make prefix patterns ambiguous if they appeared
/// in a tenant id or endpoint name.
const FORBIDDEN_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Identity of the authenticated user owning a cache entry.
///
/// Opaque to the cache: only compared for equality and embedded in keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for TenantId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Request parameters that distinguish cache entries of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheParams(BTreeMap<String, String>);

impl CacheParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl fmt::Display) {
        self.0.insert(name.into(), value.to_string());
    }

    /// Insert a parameter whose value may be missing.
    ///
    /// A missing value is rendered as `undefined` rather than dropped, so
    /// "not given" and "given" never collapse onto the same key.
    pub fn insert_opt<V: fmt::Display>(&mut self, name: impl Into<String>, value: Option<V>) {
        match value {
            Some(v) => self.insert(name, v),
            None => self.insert(name, UNDEFINED_VALUE),
        }
    }

    /// Append a value for a repeated parameter (`?tag=a&tag=b` → `tag=a,b`).
    pub fn append(&mut self, name: impl Into<String>, value: &str) {
        self.0
            .entry(name.into())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: fmt::Display> FromIterator<(K, V)> for CacheParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{segment} must not be empty")]
    Empty { segment: &'static str },

    #[error("{segment} '{value}' contains forbidden sequence '{found}'")]
    Forbidden {
        segment: &'static str,
        value: String,
        found: String,
    },
}

/// Derives canonical cache keys and the prefix patterns used to invalidate them.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    namespace: String,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl KeyDeriver {
    pub fn new(namespace: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        validate_segment("namespace", &namespace)?;
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Canonical key for `(tenant, endpoint, params)`.
    pub fn derive(
        &self,
        tenant: &TenantId,
        endpoint: &str,
        params: &CacheParams,
    ) -> Result<String, KeyError> {
        let mut key = self.endpoint_key(tenant, endpoint)?;
        if !params.is_empty() {
            key.push(':');
            let mut first = true;
            for (name, value) in params.iter() {
                if !first {
                    key.push('&');
                }
                first = false;
                key.push_str(name);
                key.push('=');
                key.push_str(value);
            }
        }
        Ok(key)
    }

    /// Key of the parameterless variant of an endpoint.
    pub fn endpoint_key(&self, tenant: &TenantId, endpoint: &str) -> Result<String, KeyError> {
        validate_segment("tenant id", tenant.as_str())?;
        validate_segment("endpoint", endpoint)?;
        Ok(format!("{}:{}:{}", self.namespace, tenant, endpoint))
    }

    /// Pattern matching every parameterised variant of an endpoint.
    ///
    /// The bare key is not covered; see [`KeyDeriver::endpoint_key`].
    pub fn endpoint_pattern(&self, tenant: &TenantId, endpoint: &str) -> Result<String, KeyError> {
        Ok(format!("{}:*", self.endpoint_key(tenant, endpoint)?))
    }

    /// Pattern matching every key owned by a tenant.
    pub fn tenant_pattern(&self, tenant: &TenantId) -> Result<String, KeyError> {
        validate_segment("tenant id", tenant.as_str())?;
        Ok(format!("{}:{}:*", self.namespace, tenant))
    }
}

/// Derive a key in the default namespace.
pub fn derive_key(
    tenant: &TenantId,
    endpoint: &str,
    params: &CacheParams,
) -> Result<String, KeyError> {
    KeyDeriver::default().derive(tenant, endpoint, params)
}

fn validate_segment(segment: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { segment });
    }
    let forbidden = |found: &str| KeyError::Forbidden {
        segment,
        value: value.to_string(),
        found: found.to_string(),
    };
    if let Some(c) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(forbidden(&c.to_string()));
    }
    for seq in ["..", "//"] {
        if value.contains(seq) {
            return Err(forbidden(seq));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> TenantId {
        TenantId::from(id)
    }

    #[test]
    fn test_bare_key_without_params() {
        let key = derive_key(&t(1), "budgets", &CacheParams::new()).unwrap();
        assert_eq!(key, "user:1:budgets");
    }

    #[test]
    fn test_params_are_rendered() {
        let key = derive_key(&t(1), "budgets", &CacheParams::new().with("limit", 10)).unwrap();
        assert_eq!(key, "user:1:budgets:limit=10");

        let other = derive_key(&t(1), "budgets", &CacheParams::new().with("limit", 20)).unwrap();
        assert_ne!(key, other);
    }

    #[test]
    fn test_missing_value_renders_undefined() {
        let mut params = CacheParams::new();
        params.insert_opt::<u32>("limit", None);
        let key = derive_key(&t(1), "budgets", &params).unwrap();
        assert_eq!(key, "user:1:budgets:limit=undefined");

        let empty = derive_key(&t(1), "budgets", &CacheParams::new().with("limit", "")).unwrap();
        assert_ne!(key, empty);
        assert_ne!(empty, "user:1:budgets");
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let a: CacheParams = [("offset", "20"), ("limit", "10"), ("sort", "name")]
            .into_iter()
            .collect();
        let b: CacheParams = [("sort", "name"), ("limit", "10"), ("offset", "20")]
            .into_iter()
            .collect();

        let ka = derive_key(&t(7), "transactions", &a).unwrap();
        let kb = derive_key(&t(7), "transactions", &b).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka, "user:7:transactions:limit=10&offset=20&sort=name");
    }

    #[test]
    fn test_distinct_tenants_never_share_keys() {
        let params = CacheParams::new().with("limit", 10);
        for (a, b) in [(1, 2), (1, 11), (2, 12), (10, 1)] {
            let ka = derive_key(&t(a), "budgets", &params).unwrap();
            let kb = derive_key(&t(b), "budgets", &params).unwrap();
            assert_ne!(ka, kb);
            // A's key must not fall under B's invalidation prefix either.
            assert!(!ka.starts_with(&format!("user:{b}:")));
        }
    }

    #[test]
    fn test_values_pass_through_unescaped() {
        let params = CacheParams::new().with("q", "a&b=c/../d");
        let key = derive_key(&t(1), "search", &params).unwrap();
        assert_eq!(key, "user:1:search:q=a&b=c/../d");
    }

    #[test]
    fn test_append_joins_repeated_values() {
        let mut params = CacheParams::new();
        params.append("tag", "food");
        params.append("tag", "rent");
        assert_eq!(params.get("tag"), Some("food,rent"));
    }

    #[test]
    fn test_rejects_bad_segments() {
        let p = CacheParams::new();
        assert_eq!(
            derive_key(&TenantId::new(""), "budgets", &p),
            Err(KeyError::Empty { segment: "tenant id" })
        );
        assert!(derive_key(&t(1), "", &p).is_err());
        assert!(derive_key(&TenantId::new("1:budgets"), "x", &p).is_err());
        assert!(derive_key(&TenantId::new("*"), "budgets", &p).is_err());
        assert!(derive_key(&t(1), "../budgets", &p).is_err());
        assert!(derive_key(&t(1), "budgets//all", &p).is_err());
        assert!(KeyDeriver::new("").is_err());
    }

    #[test]
    fn test_patterns() {
        let keys = KeyDeriver::new("tenant").unwrap();
        assert_eq!(keys.tenant_pattern(&t(3)).unwrap(), "tenant:3:*");
        assert_eq!(keys.endpoint_key(&t(3), "budgets").unwrap(), "tenant:3:budgets");
        assert_eq!(
            keys.endpoint_pattern(&t(3), "budgets").unwrap(),
            "tenant:3:budgets:*"
        );
    }
}
