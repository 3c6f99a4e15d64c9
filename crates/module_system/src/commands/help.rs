//! Built-in console commands.
//!
//! Built-ins are resolved before module commands and their names can never be
//! registered by a module.

use super::{CommandBinding, CommandSpec};
use std::collections::BTreeMap;

/// `module_help [page]` or `module_help <command>`.
pub const HELP_COMMAND: &str = "module_help";

/// `module_reload` asks the host to hot-reload every module.
pub const RELOAD_COMMAND: &str = "module_reload";

pub const BUILTIN_COMMANDS: [&str; 2] = [HELP_COMMAND, RELOAD_COMMAND];

/// Commands listed per help page.
pub const HELP_PAGE_SIZE: usize = 10;

pub(super) fn is_reserved(key: &str) -> Option<&'static str> {
    BUILTIN_COMMANDS.iter().copied().find(|builtin| {
        key == *builtin || key.starts_with(&format!("{} ", builtin))
    })
}

pub(super) fn help_page(bindings: &BTreeMap<String, CommandBinding>, page: usize) -> Vec<String> {
    if bindings.is_empty() {
        return vec!["No module commands are registered.".to_string()];
    }

    let total_pages = bindings.len().div_ceil(HELP_PAGE_SIZE);
    if page == 0 || page > total_pages {
        return vec![format!(
            "Page {} does not exist; there are {} page(s).",
            page, total_pages
        )];
    }

    let mut lines = vec![format!("Module commands (page {}/{}):", page, total_pages)];
    lines.extend(
        bindings
            .iter()
            .skip((page - 1) * HELP_PAGE_SIZE)
            .take(HELP_PAGE_SIZE)
            .map(|(key, binding)| match &binding.spec.description {
                Some(description) => format!("  {} - {}", key, description),
                None => format!("  {}", key),
            }),
    );
    if page < total_pages {
        lines.push(format!("Type '{} {}' for more.", HELP_COMMAND, page + 1));
    }
    lines
}

pub(super) fn command_usage(key: &str, spec: &CommandSpec) -> Vec<String> {
    let mut usage = format!("Usage: {}", key);
    for param in &spec.params {
        if param.optional {
            usage.push_str(&format!(" [{}]", param.name));
        } else {
            usage.push_str(&format!(" <{}>", param.name));
        }
    }

    let mut lines = vec![usage];
    if let Some(description) = &spec.description {
        lines.push(format!("  {}", description));
    }
    if !spec.params.is_empty() {
        lines.push("Parameters:".to_string());
        for param in &spec.params {
            let mut line = format!("  {}: {}", param.name, param.kind.type_name());
            match (&param.default, param.optional) {
                (Some(default), _) => line.push_str(&format!(" (optional, default: {})", default)),
                (None, true) => line.push_str(" (optional)"),
                (None, false) => {}
            }
            lines.push(line);
        }
    }
    lines
}
