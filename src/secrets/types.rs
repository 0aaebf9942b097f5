//! Credential material and the redacting string type that carries it.
//!
//! Every generated value lives in a [`SecretString`]: it is zeroized on drop and
//! never shows up in `Debug`, `Display` or `Serialize` output. Reading the raw
//! value requires an explicit [`SecretString::expose_secret`] call, which only
//! the store client and the template renderer make.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A string wrapper that redacts its contents in Debug, Display, and serialization.
///
/// Deserialization accepts real values (config files, store reads). Memory is
/// zeroed when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SecretString(value))
    }
}

impl SecretString {
    /// Creates a new SecretString from a string value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the underlying secret value. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Returns the length of the secret without exposing the value.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Well-known material field names, as referenced from templates (`{{ secret.<field> }}`).
pub mod fields {
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const BCRYPT_HASH: &str = "bcryptHash";
    pub const HTPASSWD: &str = "htpasswd";
    pub const TOKEN: &str = "token";
    pub const CERTIFICATE: &str = "certificate";
    pub const PRIVATE_KEY: &str = "privateKey";
    pub const CA_CHAIN: &str = "caChain";
    pub const SERIAL_NUMBER: &str = "serialNumber";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const LEASE_ID: &str = "leaseId";
    pub const LEASE_DURATION: &str = "leaseDuration";
}

/// Lease attached to dynamically issued credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Backend lease identifier, when the backend exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    #[serde(default)]
    pub renewable: bool,
}

/// Generated value(s) for one descriptor, keyed by field name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMaterial {
    fields: BTreeMap<String, SecretString>,
    lease: Option<Lease>,
}

impl CredentialMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<SecretString>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<SecretString>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&SecretString> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &SecretString)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Names from `required` that are absent or empty in this material.
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|name| self.get(name).map_or(true, SecretString::is_empty))
            .collect()
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("lease", &self.lease)
            .finish()
    }
}
