//! # Credential Generator
//!
//! Produces fresh [`CredentialMaterial`] for a descriptor. Local kinds draw
//! from the operating system CSPRNG; certificates and dynamic database
//! credentials are delegated to the secret store.
//!
//! Generation never touches rotation metadata. Any failure other than the
//! store being unreachable surfaces as [`RotationError::Generation`].

pub mod password;

use chrono::SecondsFormat;
use rand::rngs::OsRng;
use std::sync::Arc;
use tracing::debug;

use crate::config::GeneratorConfig;
use crate::errors::{Result, RotationError};
use crate::registry::{SecretDescriptor, SecretKind};
use crate::secrets::{
    fields, CertificateRequest, CredentialMaterial, DynamicCredentialRequest, SecretStore, SecretString,
};

pub use password::{generate_password, generate_token};

/// Creates replacement credentials.
#[derive(Debug, Clone)]
pub struct CredentialGenerator {
    store: Arc<dyn SecretStore>,
    config: GeneratorConfig,
}

impl CredentialGenerator {
    pub fn new(store: Arc<dyn SecretStore>, config: GeneratorConfig) -> Self {
        Self { store, config }
    }

    /// Generate new material for `descriptor`.
    pub async fn generate(&self, descriptor: &SecretDescriptor) -> Result<CredentialMaterial> {
        let material = match descriptor.kind {
            SecretKind::Password => Ok(self.password(descriptor)),
            SecretKind::BcryptAuthPair => self.bcrypt_pair(descriptor).await,
            SecretKind::Token => Ok(self.token(descriptor)),
            SecretKind::TlsCert => self.certificate(descriptor).await,
            SecretKind::DynamicDbCred => self.database(descriptor).await,
        }
        .map_err(|e| match e {
            RotationError::Generation { .. } | RotationError::StoreUnavailable { .. } => e,
            other => RotationError::generation(&descriptor.name, other.to_string()),
        })?;

        debug!(
            descriptor = %descriptor.name,
            kind = %descriptor.kind,
            fields = ?material.field_names().collect::<Vec<_>>(),
            "Generated credential material"
        );
        Ok(material)
    }

    fn new_password(&self, descriptor: &SecretDescriptor) -> SecretString {
        let length = descriptor.length.unwrap_or(self.config.password_length);
        SecretString::new(generate_password(&mut OsRng, length, descriptor.complexity))
    }

    fn password(&self, descriptor: &SecretDescriptor) -> CredentialMaterial {
        let mut material = CredentialMaterial::new().with_field(fields::PASSWORD, self.new_password(descriptor));
        if let Some(username) = &descriptor.username {
            material.insert(fields::USERNAME, username.as_str());
        }
        material
    }

    async fn bcrypt_pair(&self, descriptor: &SecretDescriptor) -> Result<CredentialMaterial> {
        let username = descriptor
            .username
            .clone()
            .ok_or_else(|| RotationError::generation(&descriptor.name, "bcrypt-auth-pair requires a username"))?;
        let password = self.new_password(descriptor);
        let cost = self.config.bcrypt_cost;

        let plain = password.clone();
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(plain.expose_secret(), cost))
            .await
            .map_err(|e| RotationError::internal(format!("bcrypt task failed: {}", e)))?
            .map_err(|e| RotationError::generation(&descriptor.name, format!("bcrypt hashing failed: {}", e)))?;

        let htpasswd = format!("{}:{}", username, hash);
        Ok(CredentialMaterial::new()
            .with_field(fields::USERNAME, username)
            .with_field(fields::PASSWORD, password)
            .with_field(fields::BCRYPT_HASH, hash)
            .with_field(fields::HTPASSWD, htpasswd))
    }

    fn token(&self, descriptor: &SecretDescriptor) -> CredentialMaterial {
        let token = generate_token(&mut OsRng, descriptor.complexity, descriptor.prefix.as_deref());
        CredentialMaterial::new().with_field(fields::TOKEN, token)
    }

    async fn certificate(&self, descriptor: &SecretDescriptor) -> Result<CredentialMaterial> {
        let tls = descriptor
            .tls
            .as_ref()
            .ok_or_else(|| RotationError::generation(&descriptor.name, "tls-cert requires tls parameters"))?;

        let request = CertificateRequest {
            common_name: tls.common_name.clone(),
            alt_names: tls.alt_names.clone(),
            ttl: descriptor.certificate_ttl(),
            role: tls.role.clone(),
        };
        let issued = self.store.issue_certificate(&request).await?;

        let mut missing = Vec::new();
        if issued.certificate.trim().is_empty() {
            missing.push(fields::CERTIFICATE);
        }
        if issued.private_key.expose_secret().trim().is_empty() {
            missing.push(fields::PRIVATE_KEY);
        }
        if issued.ca_chain.trim().is_empty() {
            missing.push(fields::CA_CHAIN);
        }
        if !missing.is_empty() {
            return Err(RotationError::generation(
                &descriptor.name,
                format!("incomplete certificate bundle, missing {}", missing.join(", ")),
            ));
        }

        Ok(CredentialMaterial::new()
            .with_field(fields::CERTIFICATE, issued.certificate)
            .with_field(fields::PRIVATE_KEY, issued.private_key)
            .with_field(fields::CA_CHAIN, issued.ca_chain)
            .with_field(fields::SERIAL_NUMBER, issued.serial_number)
            .with_field(fields::EXPIRES_AT, issued.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)))
    }

    async fn database(&self, descriptor: &SecretDescriptor) -> Result<CredentialMaterial> {
        let params = descriptor
            .database
            .as_ref()
            .ok_or_else(|| RotationError::generation(&descriptor.name, "dynamic-db-cred requires database parameters"))?;

        let credential = self
            .store
            .dynamic_credentials(&DynamicCredentialRequest { role: params.role.clone(), mount: params.mount.clone() })
            .await?;

        if credential.username.is_empty() || credential.password.is_empty() {
            return Err(RotationError::generation(&descriptor.name, "store returned empty database credentials"));
        }

        Ok(CredentialMaterial::new()
            .with_field(fields::USERNAME, credential.username)
            .with_field(fields::PASSWORD, credential.password)
            .with_field(fields::LEASE_ID, credential.lease.lease_id.clone().unwrap_or_default())
            .with_field(fields::LEASE_DURATION, credential.lease.lease_duration.as_secs().to_string())
            .with_lease(credential.lease))
    }
}
