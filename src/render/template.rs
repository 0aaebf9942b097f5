//! Template language for rendered artifacts.
//!
//! Templates are plain text with `{{ expression }}` placeholders:
//!
//! | expression | value |
//! |---|---|
//! | `secret.<field>` | field of the owning descriptor's current material |
//! | `descriptor.name` | owning descriptor name |
//! | `meta.version` | store version of the material |
//! | `meta.rotated_at` | RFC 3339 timestamp of the last rotation |
//!
//! `{{{{` emits a literal `{{`. Templates are parsed once, when the catalog is
//! loaded, so rendering never fails on syntax.

use chrono::SecondsFormat;
use std::fmt;

use crate::secrets::{CredentialMaterial, RotationMetadata};

/// Template failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template '{template}' line {line}: {message}")]
    Parse { template: String, line: usize, message: String },

    #[error("template '{template}' references missing field 'secret.{field}'")]
    MissingField { template: String, field: String },
}

/// A placeholder expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Secret(String),
    DescriptorName,
    MetaVersion,
    MetaRotatedAt,
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Secret(field) => write!(f, "secret.{}", field),
            Expr::DescriptorName => write!(f, "descriptor.name"),
            Expr::MetaVersion => write!(f, "meta.version"),
            Expr::MetaRotatedAt => write!(f, "meta.rotated_at"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// Values a template is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub descriptor: &'a str,
    pub material: &'a CredentialMaterial,
    pub metadata: &'a RotationMetadata,
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut consumed = 0usize;

        while let Some(start) = rest.find("{{") {
            literal.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];

            if let Some(stripped) = after_open.strip_prefix("{{") {
                literal.push_str("{{");
                consumed += start + 4;
                rest = stripped;
                continue;
            }

            let line = line_of(source, consumed + start);
            let end = after_open.find("}}").ok_or_else(|| TemplateError::Parse {
                template: name.to_string(),
                line,
                message: "unterminated '{{'".to_string(),
            })?;

            let expr = parse_expr(after_open[..end].trim()).map_err(|message| TemplateError::Parse {
                template: name.to_string(),
                line,
                message,
            })?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Expr(expr));

            consumed += start + 2 + end + 2;
            rest = &after_open[end + 2..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { name: name.to_string(), segments })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Material fields referenced through `secret.<field>`.
    pub fn secret_fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Expr(Expr::Secret(field)) => Some(field.as_str()),
            _ => None,
        })
    }

    /// Render against `ctx`. Pure: equal inputs give byte-identical output.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(Expr::Secret(field)) => {
                    let value = ctx.material.get(field).ok_or_else(|| TemplateError::MissingField {
                        template: self.name.clone(),
                        field: field.clone(),
                    })?;
                    out.push_str(value.expose_secret());
                }
                Segment::Expr(Expr::DescriptorName) => out.push_str(ctx.descriptor),
                Segment::Expr(Expr::MetaVersion) => out.push_str(&ctx.metadata.current_version.to_string()),
                Segment::Expr(Expr::MetaRotatedAt) => {
                    out.push_str(&ctx.metadata.last_rotated_at.to_rfc3339_opts(SecondsFormat::Secs, true))
                }
            }
        }
        Ok(out)
    }
}

fn parse_expr(expr: &str) -> Result<Expr, String> {
    match expr {
        "descriptor.name" => return Ok(Expr::DescriptorName),
        "meta.version" => return Ok(Expr::MetaVersion),
        "meta.rotated_at" => return Ok(Expr::MetaRotatedAt),
        _ => {}
    }

    match expr.strip_prefix("secret.") {
        Some(field) if is_identifier(field) => Ok(Expr::Secret(field.to_string())),
        Some(field) => Err(format!("invalid secret field name '{}'", field)),
        None if expr.is_empty() => Err("empty expression".to_string()),
        None => Err(format!("unknown expression '{}'", expr)),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())].matches('\n').count() + 1
}
