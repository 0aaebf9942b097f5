//! Descriptor catalog types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::reload::ServiceSpec;
use crate::secrets::fields;

/// Default mode of rendered artifacts.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Password length when neither the descriptor nor the engine config sets one.
pub const DEFAULT_PASSWORD_LENGTH: usize = 32;

/// What a descriptor rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    Password,
    BcryptAuthPair,
    Token,
    TlsCert,
    DynamicDbCred,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::BcryptAuthPair => "bcrypt-auth-pair",
            Self::Token => "token",
            Self::TlsCert => "tls-cert",
            Self::DynamicDbCred => "dynamic-db-cred",
        }
    }

    /// Material fields a rotation of this kind produces.
    pub fn produced_fields(&self, has_username: bool) -> Vec<&'static str> {
        match self {
            Self::Password if has_username => vec![fields::USERNAME, fields::PASSWORD],
            Self::Password => vec![fields::PASSWORD],
            Self::BcryptAuthPair => vec![fields::USERNAME, fields::PASSWORD, fields::BCRYPT_HASH, fields::HTPASSWD],
            Self::Token => vec![fields::TOKEN],
            Self::TlsCert => vec![
                fields::CERTIFICATE,
                fields::PRIVATE_KEY,
                fields::CA_CHAIN,
                fields::SERIAL_NUMBER,
                fields::EXPIRES_AT,
            ],
            Self::DynamicDbCred => {
                vec![fields::USERNAME, fields::PASSWORD, fields::LEASE_ID, fields::LEASE_DURATION]
            }
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character-set strength for generated passwords and token sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// One template rendered to one destination, followed by one reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactBinding {
    /// Template file name, relative to the templates directory
    pub template: String,
    pub destination: PathBuf,
    /// Service to reload after the destination changes
    pub reload: String,
    #[serde(default = "default_mode", with = "file_mode")]
    pub mode: u32,
}

fn default_mode() -> u32 {
    DEFAULT_FILE_MODE
}

/// Certificate parameters for `tls-cert` descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsParams {
    pub common_name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    /// Certificate lifetime; defaults to `default_ttl + max_ttl`
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Database engine parameters for `dynamic-db-cred` descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseParams {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
}

/// A managed secret. Immutable once the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretDescriptor {
    pub name: String,
    pub kind: SecretKind,
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub consumers: Vec<ArtifactBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SecretDescriptor {
    /// Minimal descriptor, mostly useful in tests.
    pub fn new(name: impl Into<String>, kind: SecretKind, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            default_ttl,
            max_ttl,
            complexity: Complexity::default(),
            consumers: Vec::new(),
            username: None,
            length: None,
            prefix: None,
            tls: None,
            database: None,
            description: None,
        }
    }

    pub fn with_consumer(mut self, binding: ArtifactBinding) -> Self {
        self.consumers.push(binding);
        self
    }

    pub fn produced_fields(&self) -> Vec<&'static str> {
        self.kind.produced_fields(self.username.is_some())
    }

    /// Lifetime requested for issued certificates.
    pub fn certificate_ttl(&self) -> Duration {
        self.tls
            .as_ref()
            .and_then(|tls| tls.ttl)
            .unwrap_or_else(|| self.default_ttl.saturating_add(self.max_ttl))
    }
}

/// The declarative catalog document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    /// Directory holding template files, relative to the catalog file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub secrets: Vec<SecretDescriptor>,
}

/// Parse a file mode written as octal digits, with or without a `0`/`0o` prefix.
pub fn parse_mode(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    let mode = u32::from_str_radix(digits, 8).map_err(|_| format!("invalid file mode '{}'", raw))?;
    if mode > 0o777 {
        return Err(format!("file mode '{}' is out of range", raw));
    }
    Ok(mode)
}

mod file_mode {
    use super::*;

    pub fn serialize<S: Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04o}", mode))
    }

    // Numbers are read by their decimal digits, so `mode: 640` means 0o640.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        let digits = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Number(number) => number.to_string(),
        };
        parse_mode(&digits).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_yaml() {
        let yaml = r#"
name: grafana_admin
kind: bcrypt-auth-pair
default_ttl: 12h
max_ttl: 1d
complexity: high
username: admin
consumers:
  - template: grafana.env.tpl
    destination: /srv/grafana/admin.env
    reload: grafana
    mode: "0640"
"#;
        let descriptor: SecretDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.kind, SecretKind::BcryptAuthPair);
        assert_eq!(descriptor.default_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(descriptor.max_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(descriptor.complexity, Complexity::High);
        assert_eq!(descriptor.consumers[0].mode, 0o640);
        assert_eq!(descriptor.produced_fields(), vec!["username", "password", "bcryptHash", "htpasswd"]);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "name: x\nkind: token\ndefault_ttl: 1h\nmax_ttl: 1h\nttl: 5h\n";
        assert!(serde_yaml::from_str::<SecretDescriptor>(yaml).is_err());
    }

    #[test]
    fn test_mode_forms() {
        assert_eq!(parse_mode("0600"), Ok(0o600));
        assert_eq!(parse_mode("644"), Ok(0o644));
        assert_eq!(parse_mode("0o755"), Ok(0o755));
        assert!(parse_mode("0800").is_err());
        assert!(parse_mode("17777").is_err());

        let binding: ArtifactBinding =
            serde_yaml::from_str("template: t\ndestination: /x\nreload: s\nmode: 640\n").unwrap();
        assert_eq!(binding.mode, 0o640);

        let defaulted: ArtifactBinding = serde_yaml::from_str("template: t\ndestination: /x\nreload: s\n").unwrap();
        assert_eq!(defaulted.mode, DEFAULT_FILE_MODE);
    }

    #[test]
    fn test_certificate_ttl_default() {
        let mut descriptor =
            SecretDescriptor::new("consul_tls", SecretKind::TlsCert, Duration::from_secs(3600), Duration::from_secs(600));
        assert_eq!(descriptor.certificate_ttl(), Duration::from_secs(4200));

        descriptor.tls = Some(TlsParams {
            common_name: "consul.service".into(),
            alt_names: vec![],
            ttl: Some(Duration::from_secs(90)),
            role: None,
        });
        assert_eq!(descriptor.certificate_ttl(), Duration::from_secs(90));
    }

    #[test]
    fn test_password_fields_depend_on_username() {
        assert_eq!(SecretKind::Password.produced_fields(false), vec!["password"]);
        assert_eq!(SecretKind::Password.produced_fields(true), vec!["username", "password"]);
    }
}
