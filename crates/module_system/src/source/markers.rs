//! Marker attributes understood by the host.
//!
//! Markers are inert: they only carry information for the extractor and the
//! compiler, which blanks them out of the staged source before rustc sees it.

use syn::ext::IdentExt;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, Ident, Lit, Meta, Token, UnOp};

pub(crate) const REQUIRE_MODULE: &str = "require_module";
pub(crate) const MODULE_REF: &str = "module_ref";
pub(crate) const COMMAND: &str = "command";
pub(crate) const DEFAULT: &str = "default";

/// Parsed `#[command("name", description = "...")]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommandMarker {
    pub(crate) name: Option<String>,
    pub(crate) description: Option<String>,
}

/// True for attributes the compiler must strip before handing source to rustc.
///
/// A bare `#[default]` is the standard `derive(Default)` variant marker and
/// is left alone.
pub(crate) fn is_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident(REQUIRE_MODULE) || path.is_ident(MODULE_REF) || path.is_ident(COMMAND) {
        return true;
    }
    path.is_ident(DEFAULT) && matches!(attr.meta, Meta::List(_))
}

/// Identities named by a `#[require_module(...)]` attribute.
///
/// Entries may be paths or string literals; only the last `::` or `.`
/// separated segment is kept. Anything else is skipped.
pub(crate) fn required_modules(attr: &Attribute) -> Vec<String> {
    if !attr.path().is_ident(REQUIRE_MODULE) {
        return Vec::new();
    }
    let Ok(entries) = attr.parse_args_with(Punctuated::<Expr, Token![,]>::parse_terminated) else {
        return Vec::new();
    };
    entries.iter().filter_map(module_name).collect()
}

/// Identity referenced by a `#[module_ref]` field: the explicit argument if
/// one is given, otherwise the field name.
pub(crate) fn module_ref(attr: &Attribute, field: Option<&Ident>) -> Option<String> {
    if !attr.path().is_ident(MODULE_REF) {
        return None;
    }
    match &attr.meta {
        Meta::Path(_) => field.map(|ident| ident.unraw().to_string()),
        Meta::List(_) => attr.parse_args::<Expr>().ok().as_ref().and_then(module_name),
        Meta::NameValue(_) => None,
    }
}

fn module_name(entry: &Expr) -> Option<String> {
    let raw = match entry {
        Expr::Path(path) if path.qself.is_none() => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.unraw().to_string())?,
        Expr::Lit(ExprLit {
            lit: Lit::Str(text), ..
        }) => text.value(),
        _ => return None,
    };

    let name = raw
        .rsplit(|c: char| c == ':' || c == '.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if syn::parse_str::<Ident>(&name).is_ok() {
        Some(name)
    } else {
        None
    }
}

/// Parses a `#[command(...)]` attribute, or returns `None` for other attributes.
///
/// Accepts a leading string literal or `name = "..."` for the name and
/// `description = "..."` for the help text.
pub(crate) fn command(attr: &Attribute) -> Option<Result<CommandMarker, String>> {
    if !attr.path().is_ident(COMMAND) {
        return None;
    }
    if matches!(attr.meta, Meta::Path(_)) {
        return Some(Ok(CommandMarker {
            name: None,
            description: None,
        }));
    }

    let entries = match attr.parse_args_with(Punctuated::<Expr, Token![,]>::parse_terminated) {
        Ok(entries) => entries,
        Err(e) => return Some(Err(format!("invalid #[command] attribute: {}", e))),
    };

    let mut marker = CommandMarker {
        name: None,
        description: None,
    };
    for entry in entries {
        match entry {
            Expr::Lit(ExprLit {
                lit: Lit::Str(text), ..
            }) if marker.name.is_none() => marker.name = Some(text.value()),
            Expr::Assign(assign) => {
                let key = match &*assign.left {
                    Expr::Path(path) => path.path.get_ident().map(|ident| ident.to_string()),
                    _ => None,
                };
                let value = match &*assign.right {
                    Expr::Lit(ExprLit {
                        lit: Lit::Str(text), ..
                    }) => Some(text.value()),
                    _ => None,
                };
                match (key.as_deref(), value) {
                    (Some("name"), Some(value)) => marker.name = Some(value),
                    (Some("description"), Some(value)) => marker.description = Some(value),
                    _ => {
                        return Some(Err(
                            "#[command] accepts a name and `description = \"...\"`".to_string()
                        ))
                    }
                }
            }
            _ => {
                return Some(Err(
                    "#[command] accepts a name and `description = \"...\"`".to_string()
                ))
            }
        }
    }
    Some(Ok(marker))
}

/// Literal text of a `#[default(...)]` parameter attribute.
pub(crate) fn default_value(attr: &Attribute) -> Option<Result<String, String>> {
    if !attr.path().is_ident(DEFAULT) || !matches!(attr.meta, Meta::List(_)) {
        return None;
    }
    let expr = match attr.parse_args::<Expr>() {
        Ok(expr) => expr,
        Err(e) => return Some(Err(format!("invalid #[default] attribute: {}", e))),
    };
    Some(literal_text(&expr).ok_or_else(|| {
        "#[default] takes a literal or an enum member name".to_string()
    }))
}

fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Lit(ExprLit { lit, .. }) => match lit {
            Lit::Str(text) => Some(text.value()),
            Lit::Int(int) => Some(int.base10_digits().to_string()),
            Lit::Float(float) => Some(float.base10_digits().to_string()),
            Lit::Bool(flag) => Some(flag.value.to_string()),
            Lit::Char(c) => Some(c.value().to_string()),
            _ => None,
        },
        Expr::Unary(unary) if matches!(unary.op, UnOp::Neg(_)) => {
            literal_text(&unary.expr).map(|text| format!("-{}", text))
        }
        Expr::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string()),
        Expr::Group(group) => literal_text(&group.expr),
        Expr::Paren(paren) => literal_text(&paren.expr),
        _ => None,
    }
}
