//! Load-time catalog checks.
//!
//! Every problem is collected so one run reports the whole catalog.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use super::descriptor::{Catalog, SecretDescriptor, SecretKind};
use crate::render::Template;
use crate::utils::VALID_NAME_REGEX;

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 512;
/// bcrypt only hashes the first 72 bytes.
const MAX_BCRYPT_PASSWORD_LENGTH: usize = 72;

/// Check `catalog` against the parsed `templates`; returns one message per problem.
pub fn validate_catalog(catalog: &Catalog, templates: &HashMap<String, Template>) -> Vec<String> {
    let mut errors = Vec::new();

    for (name, spec) in &catalog.services {
        if !VALID_NAME_REGEX.is_match(name) {
            errors.push(format!("services.{}: invalid service name", name));
        }
        if let Err(e) = spec.validate() {
            errors.push(format!("services.{}: {}", name, e));
        }
    }

    let mut seen = HashSet::new();
    let mut modes: HashMap<&Path, (u32, &str)> = HashMap::new();

    for descriptor in &catalog.secrets {
        let name = descriptor.name.as_str();
        if !seen.insert(name) {
            errors.push(format!("secrets.{}: duplicate descriptor name", name));
        }
        validate_descriptor(descriptor, &mut errors);

        let produced = descriptor.produced_fields();
        for (index, binding) in descriptor.consumers.iter().enumerate() {
            let at = format!("secrets.{}.consumers[{}]", name, index);

            if !is_relative_name(&binding.template) {
                errors.push(format!("{}: template '{}' must be a relative path", at, binding.template));
            } else {
                match templates.get(&binding.template) {
                    None => errors.push(format!("{}: references nonexistent template '{}'", at, binding.template)),
                    Some(template) => {
                        for field in template.secret_fields() {
                            if !produced.contains(&field) {
                                errors.push(format!(
                                    "{}: template '{}' uses 'secret.{}' which a {} descriptor never produces",
                                    at, binding.template, field, descriptor.kind
                                ));
                            }
                        }
                    }
                }
            }

            if !catalog.services.contains_key(&binding.reload) {
                errors.push(format!("{}: reload service '{}' is not declared", at, binding.reload));
            }

            if binding.destination.as_os_str().is_empty() {
                errors.push(format!("{}: destination cannot be empty", at));
                continue;
            }
            match modes.get(binding.destination.as_path()) {
                Some((mode, owner)) if *mode != binding.mode => errors.push(format!(
                    "{}: destination {} has mode {:04o} here but {:04o} in '{}'",
                    at,
                    binding.destination.display(),
                    binding.mode,
                    mode,
                    owner
                )),
                Some(_) => {}
                None => {
                    modes.insert(binding.destination.as_path(), (binding.mode, name));
                }
            }
        }
    }

    errors
}

fn validate_descriptor(descriptor: &SecretDescriptor, errors: &mut Vec<String>) {
    let name = descriptor.name.as_str();
    if !VALID_NAME_REGEX.is_match(name) {
        errors.push(format!("secrets.{}: invalid descriptor name", name));
    }

    if descriptor.default_ttl.is_zero() {
        errors.push(format!("secrets.{}: default_ttl must be greater than zero", name));
    }
    if descriptor.max_ttl.is_zero() {
        errors.push(format!("secrets.{}: max_ttl must be greater than zero", name));
    }
    if descriptor.max_ttl < descriptor.default_ttl {
        errors.push(format!("secrets.{}: max_ttl must not be smaller than default_ttl", name));
    }

    if let Some(length) = descriptor.length {
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
            errors.push(format!(
                "secrets.{}: length must be between {} and {}",
                name, MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH
            ));
        }
        if descriptor.kind == SecretKind::BcryptAuthPair && length > MAX_BCRYPT_PASSWORD_LENGTH {
            errors.push(format!(
                "secrets.{}: bcrypt-auth-pair length cannot exceed {}",
                name, MAX_BCRYPT_PASSWORD_LENGTH
            ));
        }
    }

    if let Some(prefix) = &descriptor.prefix {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            errors.push(format!("secrets.{}: prefix must be non-empty and alphanumeric", name));
        }
    }

    match descriptor.kind {
        SecretKind::BcryptAuthPair if blank(descriptor.username.as_deref()) => {
            errors.push(format!("secrets.{}: bcrypt-auth-pair requires a username", name));
        }
        SecretKind::TlsCert => match &descriptor.tls {
            Some(tls) if !tls.common_name.trim().is_empty() => {
                if tls.ttl.is_some_and(|ttl| ttl.is_zero()) {
                    errors.push(format!("secrets.{}: tls.ttl must be greater than zero", name));
                }
            }
            _ => errors.push(format!("secrets.{}: tls-cert requires tls.common_name", name)),
        },
        SecretKind::DynamicDbCred if blank(descriptor.database.as_ref().map(|db| db.role.as_str())) => {
            errors.push(format!("secrets.{}: dynamic-db-cred requires database.role", name));
        }
        _ => {}
    }
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn is_relative_name(name: &str) -> bool {
    let path = PathBuf::from(name);
    !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
