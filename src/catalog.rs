//! In-memory template set.
//!
//! Templates are shared read-only across every concurrent run, so the catalog
//! hands out `Arc<Template>`s. Workflow steps resolve sub-template IDs here.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::enums::TemplateKind;
use crate::error::TemplateError;
use crate::types::Template;

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    templates: Vec<Arc<Template>>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Indexes `templates` by ID. When an ID repeats, the first template wins
    /// and the rest are dropped with a warning.
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Self {
        let mut catalog = Catalog::default();
        for template in templates {
            catalog.insert(template);
        }
        catalog
    }

    /// Loads every YAML document through [`crate::load`]. Documents that fail
    /// to parse or validate are skipped with a warning and returned alongside.
    pub fn from_yaml_documents<'a>(
        documents: impl IntoIterator<Item = &'a str>,
    ) -> (Self, Vec<Vec<TemplateError>>) {
        let mut catalog = Catalog::default();
        let mut failures = Vec::new();
        for (position, document) in documents.into_iter().enumerate() {
            match crate::load(document) {
                Ok(loaded) => {
                    catalog.insert(loaded.template);
                }
                Err(errors) => {
                    for e in &errors {
                        warn!(document = position, error = %e, "could not load template");
                    }
                    failures.push(errors);
                }
            }
        }
        (catalog, failures)
    }

    /// Adds one template. Returns `false` if the ID was already taken.
    pub fn insert(&mut self, template: Template) -> bool {
        if self.index.contains_key(&template.id) {
            warn!(id = %template.id, "duplicate template id; keeping the first");
            return false;
        }
        self.index.insert(template.id.clone(), self.templates.len());
        self.templates.push(Arc::new(template));
        true
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Template>> {
        self.index.get(id).map(|&i| &self.templates[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.iter()
    }

    /// Templates of `kind` whose severity passes `severities`, in insertion
    /// order. An empty filter accepts every severity.
    pub fn select<S: AsRef<str>>(&self, kind: TemplateKind, severities: &[S]) -> Vec<Arc<Template>> {
        match kind {
            TemplateKind::AdvancedWorkflow => info!("Loading advanced workflows..."),
            TemplateKind::Workflow => info!("Loading workflows..."),
            TemplateKind::Template => info!("Loading templates..."),
        }

        let mut selected = Vec::new();
        for template in &self.templates {
            if template.kind() != kind {
                continue;
            }
            let severity = template.info.severity.as_str();
            if severities.is_empty() || has_matching_severity(severity, severities) {
                info!("{}", describe_template(template));
                selected.push(template.clone());
            } else {
                warn!(
                    id = %template.id,
                    severity,
                    "excluding template due to severity filter"
                );
            }
        }
        selected
    }

    /// The `[id] name (@author) [severity]` line for a template.
    pub fn describe(&self, id: &str) -> Option<String> {
        self.get(id).map(|t| describe_template(t))
    }
}

pub fn describe_template(template: &Template) -> String {
    format!(
        "[{}] {} (@{}) [{}]",
        template.id,
        template.info.name.as_deref().unwrap_or(""),
        template.info.author.as_deref().unwrap_or(""),
        template.info.severity
    )
}

/// Whether `severity` passes the filter. Each filter entry may hold several
/// comma-separated severities; entries match case-insensitively by prefix, so
/// `crit` selects `critical`. Empty entries match nothing.
pub fn has_matching_severity<S: AsRef<str>>(severity: &str, allowed: &[S]) -> bool {
    let severity = severity.to_ascii_lowercase();
    allowed
        .iter()
        .flat_map(|entry| entry.as_ref().split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .any(|s| !s.is_empty() && severity.starts_with(&s))
}
