//! Query templates for template-driven loads.
//!
//! A template is a SQL `SELECT` over the `payload` table with `{{ name }}`
//! placeholders, plus the table its result is loaded into.

use super::{validate_table_name, SinkError, WriteMode};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named values substituted into a template.
pub type TemplateParams = BTreeMap<String, Value>;

/// A load template: query text, target table and write mode.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTemplate {
    pub sql: String,
    pub target: String,
    pub mode: WriteMode,
}

impl LoadTemplate {
    pub fn new(sql: impl Into<String>, target: impl Into<String>, mode: WriteMode) -> Result<Self, SinkError> {
        let target = target.into();
        validate_table_name(&target)?;
        Ok(Self {
            sql: sql.into(),
            target,
            mode,
        })
    }

    pub fn render(&self, params: &TemplateParams) -> Result<String, SinkError> {
        render(&self.sql, params)
    }
}

/// Replace every `{{ name }}` with its parameter value.
///
/// Strings are inserted verbatim; other JSON values use their JSON text.
/// Unknown or unterminated placeholders are errors.
pub fn render(template: &str, params: &TemplateParams) -> Result<String, SinkError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| SinkError::Template(format!("unterminated placeholder at byte {open}")))?;
        let name = after[..close].trim();
        let value = params
            .get(name)
            .ok_or_else(|| SinkError::Template(format!("no value for placeholder '{name}'")))?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
