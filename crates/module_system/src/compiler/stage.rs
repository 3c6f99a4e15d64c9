//! Preparation of the source handed to rustc.
//!
//! Marker attributes mean nothing to rustc, so each of their characters is
//! overwritten with a space. Newlines are kept, which leaves every remaining
//! token on its original line and column.

use super::glue::GLUE_FILE_NAME;
use crate::error::ModuleError;
use crate::source;
use proc_macro2::LineColumn;
use std::path::Path;
use syn::visit::Visit;
use syn::Attribute;

/// Returns `source_text` with every marker attribute blanked out.
pub fn blank_markers(source_text: &str, file_path: &Path) -> Result<String, ModuleError> {
    let file = source::parse(source_text, file_path)?;
    let mut collector = MarkerSpans::default();
    collector.visit_file(&file);

    let lines = LineIndex::new(source_text);
    let ranges: Vec<(usize, usize)> = collector
        .spans
        .into_iter()
        .filter_map(|(start, end)| Some((lines.offset(start)?, lines.offset(end)?)))
        .collect();

    Ok(source_text
        .char_indices()
        .map(|(index, c)| {
            let inside = ranges.iter().any(|&(start, end)| (start..end).contains(&index));
            if inside && c != '\n' && c != '\r' {
                ' '
            } else {
                c
            }
        })
        .collect())
}

/// The crate root rustc compiles: blanked source followed by the glue include.
pub fn staged_source(source_text: &str, file_path: &Path) -> Result<String, ModuleError> {
    let mut staged = blank_markers(source_text, file_path)?;
    if !staged.ends_with('\n') {
        staged.push('\n');
    }
    staged.push_str(&format!("include!(\"{}\");\n", GLUE_FILE_NAME));
    Ok(staged)
}

#[derive(Default)]
struct MarkerSpans {
    spans: Vec<(LineColumn, LineColumn)>,
}

impl<'ast> Visit<'ast> for MarkerSpans {
    fn visit_attribute(&mut self, attr: &'ast Attribute) {
        if source::is_marker(attr) {
            let start = attr.pound_token.spans[0].start();
            let end = attr.bracket_token.span.close().end();
            self.spans.push((start, end));
        }
    }
}

/// Converts 1-based lines and character columns to byte offsets.
struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(index, _)| index + 1));
        Self { text, starts }
    }

    fn offset(&self, position: LineColumn) -> Option<usize> {
        let line_start = *self.starts.get(position.line.checked_sub(1)?)?;
        let line = &self.text[line_start..];
        let within = line
            .char_indices()
            .nth(position.column)
            .map(|(index, _)| index)
            .unwrap_or(line.len());
        Some(line_start + within)
    }
}
