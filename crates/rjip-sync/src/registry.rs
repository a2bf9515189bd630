//! Source registry: `sources.yaml` loaded once per process into immutable descriptors.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use rjip_core::{ApiMapping, ContentFilter, RemoteType, SourceDescriptor, SourceKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_MAX_ITEMS_PER_SOURCE: usize = 50;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing source registry: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("source `{source_id}` has an invalid filter `{pattern}`: {source}")]
    Filter {
        source_id: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("source id `{0}` is declared more than once")]
    DuplicateId(String),
    #[error("paged api source `{0}` has no `api` mapping")]
    MissingMapping(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_kind")]
    pub kind: SourceKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Why an inactive source is switched off; shown to operators.
    #[serde(default)]
    pub inactive_reason: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items_per_source: usize,
    #[serde(default)]
    pub include_filters: Vec<String>,
    #[serde(default)]
    pub exclude_filters: Vec<String>,
    #[serde(default)]
    pub default_remote_type: RemoteType,
    #[serde(default)]
    pub api: Option<ApiMapping>,
}

fn default_kind() -> SourceKind {
    SourceKind::Feed
}

fn default_active() -> bool {
    true
}

fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS_PER_SOURCE
}

fn compile_filters(source_id: &str, patterns: &[String]) -> Result<Vec<Regex>, RegistryError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| RegistryError::Filter {
                    source_id: source_id.to_string(),
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

impl SourceConfig {
    pub fn to_descriptor(&self) -> Result<SourceDescriptor, RegistryError> {
        if self.kind == SourceKind::PagedApi && self.api.is_none() {
            return Err(RegistryError::MissingMapping(self.id.clone()));
        }
        Ok(SourceDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            kind: self.kind,
            category: self.category.clone(),
            tags: self.tags.clone(),
            active: self.active,
            inactive_reason: self.inactive_reason.clone(),
            max_items_per_source: self.max_items_per_source,
            default_remote_type: self.default_remote_type,
            filters: ContentFilter {
                include: compile_filters(&self.id, &self.include_filters)?,
                exclude: compile_filters(&self.id, &self.exclude_filters)?,
            },
            api: self.api.clone(),
        })
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }

    /// Validates and compiles every entry, active or not, in declaration order.
    pub fn descriptors(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .map(|source| {
                if !seen.insert(source.id.as_str()) {
                    return Err(RegistryError::DuplicateId(source.id.clone()));
                }
                source.to_descriptor()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - id: weworkremotely-dev
    name: We Work Remotely
    endpoint: https://weworkremotely.com/categories/remote-programming-jobs.rss
    category: development
    tags: [remote, dev]
    exclude_filters: ["\\bsales\\b"]
  - id: remoteok
    name: Remote OK
    kind: paged_api
    endpoint: https://remoteok.com/api
    max_items_per_source: 100
    api:
      list_path: "$"
      skip_meta_key: legal
      fields:
        title: position
        link: apply_url
  - id: stackoverflow-remote
    name: Stack Overflow Jobs
    endpoint: https://stackoverflow.com/jobs/feed?r=true
    active: false
    inactive_reason: Stack Overflow Jobs was shut down in March 2022
"#;

    #[test]
    fn registry_parses_into_descriptors_with_defaults() {
        let registry = SourceRegistry::parse(REGISTRY).expect("parse");
        let descriptors = registry.descriptors().expect("descriptors");
        assert_eq!(descriptors.len(), 3);

        let wwr = &descriptors[0];
        assert_eq!(wwr.kind, SourceKind::Feed);
        assert!(wwr.active);
        assert_eq!(wwr.max_items_per_source, DEFAULT_MAX_ITEMS_PER_SOURCE);
        assert!(!wwr.filters.admits("Sales Engineer", ""));
        assert!(wwr.filters.admits("Rust Engineer", ""));

        let remoteok = &descriptors[1];
        assert_eq!(remoteok.kind, SourceKind::PagedApi);
        assert_eq!(remoteok.max_items_per_source, 100);
        let api = remoteok.api.as_ref().expect("mapping");
        assert_eq!(api.list_path, "$");
        assert_eq!(api.fields.title.as_deref(), Some("position"));

        let stackoverflow = &descriptors[2];
        assert!(!stackoverflow.active);
        assert!(stackoverflow
            .inactive_reason
            .as_deref()
            .is_some_and(|r| r.contains("shut down")));
    }

    #[test]
    fn duplicate_ids_and_bad_filters_are_rejected() {
        let dup = r#"
sources:
  - { id: a, name: A, endpoint: "https://a.example/rss" }
  - { id: a, name: A2, endpoint: "https://a2.example/rss" }
"#;
        let err = SourceRegistry::parse(dup).unwrap().descriptors().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "a"));

        let bad = r#"
sources:
  - { id: b, name: B, endpoint: "https://b.example/rss", include_filters: ["(unclosed"] }
"#;
        let err = SourceRegistry::parse(bad).unwrap().descriptors().unwrap_err();
        assert!(matches!(err, RegistryError::Filter { .. }));

        let unmapped = r#"
sources:
  - { id: c, name: C, endpoint: "https://c.example/api", kind: paged_api }
"#;
        let err = SourceRegistry::parse(unmapped).unwrap().descriptors().unwrap_err();
        assert!(matches!(err, RegistryError::MissingMapping(_)));
    }

    #[tokio::test]
    async fn shipped_registry_loads_and_explains_every_inactive_source() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let descriptors = SourceRegistry::load(&path)
            .await
            .expect("load")
            .descriptors()
            .expect("descriptors");

        assert!(descriptors.iter().any(|d| d.active));
        assert!(descriptors
            .iter()
            .filter(|d| !d.active)
            .all(|d| d.inactive_reason.is_some()));
        assert!(descriptors
            .iter()
            .filter(|d| d.kind == SourceKind::PagedApi)
            .all(|d| d.api.is_some()));
    }

    #[tokio::test]
    async fn missing_registry_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        let err = SourceRegistry::load(&path).await.unwrap_err();
        assert!(matches!(&err, RegistryError::Io { path: p, .. } if p == &path));
        assert!(err.to_string().contains("sources.yaml"));
    }
}
