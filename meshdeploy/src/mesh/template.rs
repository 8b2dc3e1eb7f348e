//! Minimal `{{ name }}` placeholder templates
//!
//! Used for the sidecar proxy config and the application Dockerfile. There are
//! no loops or conditionals; a template is literal text with named holes.

use std::collections::HashMap;

use regex::Regex;

use crate::errors::DeployError;

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed template
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template. Fails on any `{{` that does not open a well-formed
    /// placeholder.
    pub fn parse(source: &str) -> Result<Self, DeployError> {
        let pattern = Regex::new(PLACEHOLDER).map_err(|e| DeployError::Internal(e.to_string()))?;

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in pattern.captures_iter(source) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_literal(&mut segments, source, last, whole.start())?;
            segments.push(Segment::Variable(name.as_str().to_string()));
            last = whole.end();
        }
        push_literal(&mut segments, source, last, source.len())?;

        Ok(Self { segments })
    }

    /// Names of all placeholders, in order of first appearance
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Variable(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute every placeholder. An unknown placeholder is an error;
    /// unused values are ignored.
    pub fn render(&self, values: &HashMap<&str, String>) -> Result<String, DeployError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = values.get(name.as_str()).ok_or_else(|| {
                        DeployError::Template(format!("no value for placeholder '{}'", name))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn push_literal(
    segments: &mut Vec<Segment>,
    source: &str,
    start: usize,
    end: usize,
) -> Result<(), DeployError> {
    if start == end {
        return Ok(());
    }
    let text = &source[start..end];
    if let Some(offset) = text.find("{{") {
        let line = source[..start + offset].matches('\n').count() + 1;
        return Err(DeployError::Template(format!(
            "malformed placeholder at line {}",
            line
        )));
    }
    segments.push(Segment::Literal(text.to_string()));
    Ok(())
}

/// Parse and render in one step
pub fn render(source: &str, values: &HashMap<&str, String>) -> Result<String, DeployError> {
    Template::parse(source)?.render(values)
}
