use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// One delegation target: a name the model can spawn by, a description for
/// the registry listing, the raw metadata block and the system-prompt body.
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentDescriptor {
    pub name: String,
    pub description: String,
    pub metadata: Map<String, Value>,
    pub prompt: String,
}

impl SubagentDescriptor {
    /// Metadata fields consumed as child configuration overrides. The
    /// identity fields stay out: a child is configured by the descriptor,
    /// not renamed by it.
    pub fn config_overrides(&self) -> Map<String, Value> {
        self.metadata
            .iter()
            .filter(|(key, _)| key.as_str() != "name" && key.as_str() != "description")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Immutable name-to-descriptor mapping, scanned once from a directory of
/// Markdown files with YAML frontmatter at root construction.
#[derive(Debug, Clone, Default)]
pub struct SubagentRegistry {
    entries: BTreeMap<String, SubagentDescriptor>,
}

impl SubagentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan `dir` for `*.md` descriptor files. A missing directory is an
    /// empty registry; a file without frontmatter is skipped with a
    /// warning rather than failing the whole load.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "no subagent directory, registry is empty");
            return Ok(Self { entries });
        }

        let mut paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("failed to read subagent directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|e| e == "md").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read descriptor {}", path.display()))?;
            match parse_descriptor(&path, &content) {
                Some(descriptor) => {
                    entries.insert(descriptor.name.clone(), descriptor);
                }
                None => warn!(file = %path.display(), "descriptor has no frontmatter, skipping"),
            }
        }

        debug!(count = entries.len(), "loaded subagent registry");
        Ok(Self { entries })
    }

    pub fn lookup(&self, name: &str) -> Option<&SubagentDescriptor> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubagentDescriptor> {
        self.entries.values()
    }

    /// Human-readable listing for prompt templates, one line per entry.
    pub fn listing(&self) -> String {
        if self.entries.is_empty() {
            return "No subagents available.".to_string();
        }
        self.entries
            .values()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_descriptor(path: &Path, content: &str) -> Option<SubagentDescriptor> {
    let frontmatter = Regex::new(r"(?s)\A---\n(.*?)\n---\n?(.*)\z").expect("valid regex");
    let captures = frontmatter.captures(content)?;

    let metadata: Map<String, Value> = match serde_yaml::from_str::<Value>(&captures[1]) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(file = %path.display(), "descriptor frontmatter is not a mapping, skipping");
            return None;
        }
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(stem);
    let description = metadata
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("No description provided")
        .to_string();

    Some(SubagentDescriptor {
        name,
        description,
        metadata,
        prompt: captures[2].trim().to_string(),
    })
}
