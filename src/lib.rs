//! Template-driven network probing engine.
//!
//! A template declares one or more request blocks (HTTP, DNS or raw TCP/UDP),
//! the matchers that decide whether a response is a finding, and the
//! extractors that capture values for reporting or for later requests.
//! Workflows chain templates into decision trees. The crate covers the whole
//! path from a YAML string to emitted result records:
//!
//! ```text
//! load(yaml) → Template → Catalog ─┐
//!                                  ├→ Scanner::run(targets) → ResultSink
//! ScanConfig → Engine ─────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! let yaml = r#"
//! id: admin-panel
//! info:
//!   name: Admin panel exposed
//!   severity: medium
//! requests:
//!   - protocol: http
//!     path:
//!       - "{{BaseURL}}/admin"
//!     matchers:
//!       - type: status
//!         status: [200]
//!       - type: word
//!         words: ["Dashboard"]
//!     matchers-condition: and
//! "#;
//!
//! let loaded = probekit::load(yaml).expect("valid template");
//! assert_eq!(loaded.template.id, "admin-panel");
//! assert_eq!(loaded.template.requests[0].matchers[0].name.as_deref(), Some("matcher-1"));
//! ```
//!
//! Running templates needs a tokio runtime:
//!
//! ```rust,no_run
//! use probekit::{CancelSignal, Catalog, CollectingSink, Engine, ScanConfig, Scanner};
//!
//! # async fn scan(yaml: &str) -> Result<(), probekit::ExecError> {
//! let config = ScanConfig::default();
//! let (catalog, _failures) = Catalog::from_yaml_documents([yaml]);
//! let scanner = Scanner::new(Engine::from_config(config)?, catalog);
//! let sink = CollectingSink::new();
//! let summary = scanner
//!     .scan_all(&["https://example.com".to_string()], &sink, &CancelSignal::new())
//!     .await;
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! # Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `cel-eval` | yes     | DSL matchers and extractors via the [`cel`] crate. Enables [`evaluate::DefaultCelEvaluator`]. |

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod context;
pub mod enums;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod interact;
pub mod logging;
pub mod normalize;
pub mod parse;
pub mod parts;
pub mod primitives;
pub mod protocols;
pub mod ratelimit;
pub mod response;
pub mod runner;
pub mod scan;
pub mod types;
pub mod validate;
pub mod workflow;

pub use enums::*;
pub use error::*;
pub use types::*;

// Re-export entry points at the crate root for convenience.
pub use cancel::CancelSignal;
pub use catalog::Catalog;
pub use config::ScanConfig;
pub use context::{ExecutionContext, Variables};
pub use normalize::normalize;
pub use parse::parse;
pub use response::ResponseView;
pub use runner::Engine;
pub use scan::{ChannelSink, CollectingSink, ResultSink, ScanSummary, Scanner};
pub use validate::{validate, validate_set};

/// Result of the [`load`] convenience entry point.
#[derive(Clone, Debug)]
pub struct LoadResult {
    /// The normalized template.
    pub template: Template,
    /// Non-fatal warnings produced during validation.
    pub warnings: Vec<Diagnostic>,
}

/// Convenience entry point composing parse → validate → normalize.
///
/// Returns the normalized template and any warnings on success.
/// Returns all errors (parse or validation) on failure.
///
/// # Errors
///
/// Returns `Err(Vec<TemplateError>)` if parsing fails or validation finds errors.
///
/// # Example
///
/// ```rust
/// let yaml = r#"
/// id: resolver-check
/// dns:
///   - name: "{{FQDN}}"
///     type: CNAME
///     matchers:
///       - type: word
///         words: ["IN\tCNAME"]
/// "#;
///
/// match probekit::load(yaml) {
///     Ok(result) => println!("Loaded with {} warnings", result.warnings.len()),
///     Err(errors) => eprintln!("{} errors", errors.len()),
/// }
/// ```
pub fn load(input: &str) -> Result<LoadResult, Vec<TemplateError>> {
    let template = parse::parse(input).map_err(|e| vec![TemplateError::Parse(e)])?;

    let result = validate::validate(&template);
    if !result.errors.is_empty() {
        return Err(result
            .errors
            .into_iter()
            .map(TemplateError::Validation)
            .collect());
    }

    let normalized = normalize::normalize(template);

    Ok(LoadResult {
        template: normalized,
        warnings: result.warnings,
    })
}
