//! # Secret Descriptor Registry
//!
//! Loads the descriptor catalog once, parses every referenced template and
//! refuses to start on any inconsistency. After loading, the registry is
//! read-only and can be shared freely.
//!
//! ```yaml
//! templates_dir: templates
//! services:
//!   grafana:
//!     type: command
//!     command: [docker, restart, grafana]
//! secrets:
//!   - name: grafana_admin
//!     kind: bcrypt-auth-pair
//!     username: admin
//!     default_ttl: 12h
//!     max_ttl: 1d
//!     consumers:
//!       - template: grafana.env.tpl
//!         destination: /srv/grafana/admin.env
//!         reload: grafana
//! ```

pub mod descriptor;
pub mod validate;

pub use descriptor::{
    parse_mode, ArtifactBinding, Catalog, Complexity, DatabaseParams, SecretDescriptor, SecretKind, TlsParams,
    DEFAULT_FILE_MODE, DEFAULT_PASSWORD_LENGTH,
};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{Result, RotationError};
use crate::reload::ServiceSpec;
use crate::render::Template;

/// Templates directory used when the catalog does not name one.
pub const DEFAULT_TEMPLATES_DIR: &str = "templates";

/// Loaded, validated descriptor catalog.
#[derive(Debug, Clone)]
pub struct DescriptorRegistry {
    descriptors: Vec<SecretDescriptor>,
    index: HashMap<String, usize>,
    templates: HashMap<String, Template>,
    services: BTreeMap<String, ServiceSpec>,
}

impl DescriptorRegistry {
    /// Load a catalog file. Relative paths inside it (templates directory,
    /// destinations) resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RotationError::config_with_source(format!("Cannot read catalog {}", path.display()), Box::new(e))
        })?;
        let catalog: Catalog = serde_yaml::from_str(&raw).map_err(|e| {
            RotationError::config_with_source(format!("Invalid catalog {}", path.display()), Box::new(e))
        })?;

        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let registry = Self::from_catalog(catalog, base_dir)?;
        info!(
            catalog = %path.display(),
            descriptors = registry.descriptors.len(),
            services = registry.services.len(),
            "Descriptor catalog loaded"
        );
        Ok(registry)
    }

    /// Resolve paths against `base_dir`, read templates from disk and validate.
    pub fn from_catalog(mut catalog: Catalog, base_dir: &Path) -> Result<Self> {
        let templates_dir =
            base_dir.join(catalog.templates_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR)));

        let mut sources = HashMap::new();
        for descriptor in &mut catalog.secrets {
            for binding in &mut descriptor.consumers {
                if binding.destination.is_relative() && !binding.destination.as_os_str().is_empty() {
                    binding.destination = base_dir.join(&binding.destination);
                }
                if sources.contains_key(&binding.template) {
                    continue;
                }
                let path = templates_dir.join(&binding.template);
                match std::fs::read_to_string(&path) {
                    Ok(source) => {
                        debug!(template = %binding.template, path = %path.display(), "Template loaded");
                        sources.insert(binding.template.clone(), source);
                    }
                    // reported by validation as a nonexistent template
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(RotationError::io(e, format!("Failed to read template {}", path.display())));
                    }
                }
            }
        }

        Self::from_sources(catalog, sources)
    }

    /// Build from a catalog and in-memory template sources keyed by template name.
    pub fn from_sources(catalog: Catalog, sources: HashMap<String, String>) -> Result<Self> {
        let mut errors = Vec::new();
        let mut templates = HashMap::new();
        for (name, source) in sources {
            match Template::parse(&name, &source) {
                Ok(template) => {
                    templates.insert(name, template);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        errors.extend(validate::validate_catalog(&catalog, &templates));
        if !errors.is_empty() {
            errors.sort();
            return Err(RotationError::config(format!(
                "Invalid descriptor catalog ({} problem{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            )));
        }

        let index = catalog.secrets.iter().enumerate().map(|(i, d)| (d.name.clone(), i)).collect();
        Ok(Self { descriptors: catalog.secrets, index, templates, services: catalog.services })
    }

    /// All descriptors in declaration order.
    pub fn list(&self) -> &[SecretDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, name: &str) -> Result<&SecretDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| RotationError::not_found("descriptor", name))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceSpec> {
        &self.services
    }

    /// Every artifact destination, in order of first appearance.
    pub fn destinations(&self) -> Vec<&Path> {
        let mut out: Vec<&Path> = Vec::new();
        for binding in self.descriptors.iter().flat_map(|d| &d.consumers) {
            if !out.contains(&binding.destination.as_path()) {
                out.push(&binding.destination);
            }
        }
        out
    }

    /// Bindings writing to `destination`, in declaration order.
    pub fn bindings_for(&self, destination: &Path) -> Vec<(&SecretDescriptor, &ArtifactBinding)> {
        self.descriptors
            .iter()
            .flat_map(|d| d.consumers.iter().map(move |b| (d, b)))
            .filter(|(_, b)| b.destination == destination)
            .collect()
    }

    /// Destinations `name` contributes to, in order of first appearance.
    pub fn destinations_of(&self, name: &str) -> Vec<&Path> {
        let mut out: Vec<&Path> = Vec::new();
        if let Ok(descriptor) = self.get(name) {
            for binding in &descriptor.consumers {
                if !out.contains(&binding.destination.as_path()) {
                    out.push(&binding.destination);
                }
            }
        }
        out
    }
}
