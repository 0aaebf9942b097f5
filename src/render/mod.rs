//! # Template Renderer
//!
//! Turns credential material into configuration artifacts. Rendering is
//! pure; writing goes through [`AtomicWriter`].
//!
//! Several bindings may target the same destination (for example one
//! `.env` file holding the admin password of one descriptor and the API
//! token of another). Such an artifact is always rendered as a whole: every
//! contributing binding is rendered from its own descriptor's latest material
//! and the parts are concatenated in declaration order.

pub mod template;
pub mod writer;

pub use template::{Expr, RenderContext, Template, TemplateError};
pub use writer::{AtomicWriter, StagedArtifact, WriteOutcome};

use std::path::{Path, PathBuf};

use crate::errors::{Result, RotationError};
use crate::utils::sha256_hex;

/// One contribution to an artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactPart<'a> {
    pub template: &'a Template,
    pub context: RenderContext<'a>,
}

/// Fully rendered artifact ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub destination: PathBuf,
    pub content: String,
    /// Hex SHA-256 of `content`
    pub digest: String,
    pub mode: u32,
}

/// Render `parts` in order into the artifact for `destination`.
pub fn render_artifact(destination: &Path, mode: u32, parts: &[ArtifactPart<'_>]) -> Result<RenderedArtifact> {
    let mut content = String::new();
    for part in parts {
        let rendered = part
            .template
            .render(&part.context)
            .map_err(|e| RotationError::render(destination, e.to_string()))?;
        content.push_str(&rendered);
    }

    Ok(RenderedArtifact { destination: destination.to_path_buf(), digest: sha256_hex(&content), content, mode })
}

impl RenderedArtifact {
    /// Write through `writer`.
    pub fn write(&self, writer: &AtomicWriter) -> Result<WriteOutcome> {
        writer.write(&self.destination, self.content.as_bytes(), self.mode)
    }
}
