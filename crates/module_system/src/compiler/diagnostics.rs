//! rustc JSON diagnostics (`--error-format json`).

use serde::Deserialize;

/// One diagnostic line emitted by rustc on stderr.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    /// `error`, `warning`, `note`, `help`, `failure-note` or
    /// `error: internal compiler error`.
    pub level: String,
    #[serde(default)]
    pub rendered: Option<String>,
}

impl Diagnostic {
    /// Errors, including warnings promoted by `-D`, which rustc reports as errors.
    pub fn is_error(&self) -> bool {
        self.level.starts_with("error")
    }

    pub fn is_warning(&self) -> bool {
        self.level == "warning"
    }

    /// The human-readable form, falling back to the bare message.
    pub fn text(&self) -> &str {
        self.rendered.as_deref().unwrap_or(&self.message)
    }
}

/// Parses every JSON diagnostic in `stderr`, skipping any other output.
pub fn parse_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Joined rendered text of every error diagnostic, or `None` when there are none.
pub fn collect_errors(diagnostics: &[Diagnostic]) -> Option<String> {
    let errors: Vec<&str> = diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.is_error())
        .map(|diagnostic| diagnostic.text().trim_end())
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("\n"))
    }
}
