//! Source descriptor extraction.
//!
//! A module is a single Rust source file. Before anything is compiled the host
//! parses that file with `syn` and derives a [`ModuleDescriptor`]: which public
//! type implements a module contract, which modules it requires and which it
//! can optionally reference. Nothing here expands macros, type-checks or runs
//! module code, so extraction is safe on arbitrary input.

mod analyze;
mod markers;

pub use analyze::{
    analyze, analyze_source, CommandParam, CommandSignature, EnumDecl, ModuleRefField, ModuleSyntax,
    Receiver,
};
pub(crate) use markers::is_marker;

use crate::compiler::CompiledModule;
use crate::error::ModuleError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use syn::visit::Visit;
use syn::{Fields, Item, ItemImpl, Type, Visibility};

/// Traits a module type can implement to be picked up by the host.
pub const MODULE_CONTRACTS: [&str; 2] = ["ServerModule", "ConsoleModule"];

/// Compile-time record of one module source file.
#[derive(Debug)]
pub struct ModuleDescriptor {
    identity: String,
    required_dependencies: Vec<String>,
    optional_dependencies: Vec<String>,
    source_text: Arc<str>,
    file_path: PathBuf,
    compiled: OnceLock<CompiledModule>,
}

impl ModuleDescriptor {
    /// Name of the single public type implementing a module contract.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Identities declared with `#[require_module]`, in declaration order.
    pub fn required_dependencies(&self) -> &[String] {
        &self.required_dependencies
    }

    /// Identities referenced through `#[module_ref]` fields and not already required.
    pub fn optional_dependencies(&self) -> &[String] {
        &self.optional_dependencies
    }

    pub fn source_text(&self) -> &Arc<str> {
        &self.source_text
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// The compiled image, once the compiler has produced one.
    pub fn compiled(&self) -> Option<&CompiledModule> {
        self.compiled.get()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    pub fn requires(&self, identity: &str) -> bool {
        self.required_dependencies.iter().any(|dep| dep == identity)
    }

    /// Stores the compiled image. The first image wins; later calls return it.
    pub(crate) fn store_compiled(&self, compiled: CompiledModule) -> &CompiledModule {
        self.compiled.get_or_init(|| compiled)
    }

    /// True when `other` was extracted from identical input.
    pub fn same_source(&self, other: &ModuleDescriptor) -> bool {
        self.file_path == other.file_path
            && self.identity == other.identity
            && self.source_text == other.source_text
    }

    /// A copy of this descriptor without its compiled image.
    pub fn without_image(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            identity: self.identity.clone(),
            required_dependencies: self.required_dependencies.clone(),
            optional_dependencies: self.optional_dependencies.clone(),
            source_text: self.source_text.clone(),
            file_path: self.file_path.clone(),
            compiled: OnceLock::new(),
        }
    }
}

/// Extracts the descriptor of the module in `source_text`.
///
/// Fails with [`ModuleError::Malformed`] when the text does not parse or when
/// it does not declare exactly one public type implementing a module contract.
pub fn extract(
    source_text: impl Into<Arc<str>>,
    file_path: impl Into<PathBuf>,
) -> Result<ModuleDescriptor, ModuleError> {
    let source_text = source_text.into();
    let file_path = file_path.into();

    let file = parse(&source_text, &file_path)?;
    let module_type = identify(&file, &file_path)?;

    let mut required_dependencies = Vec::new();
    for attr in module_type.attrs {
        for dependency in markers::required_modules(attr) {
            if !required_dependencies.contains(&dependency) {
                required_dependencies.push(dependency);
            }
        }
    }

    let mut optional_dependencies = Vec::new();
    if let Some(fields) = module_type.fields {
        for field in fields.iter().filter(|field| is_public(&field.vis)) {
            let Some(identity) = field
                .attrs
                .iter()
                .find_map(|attr| markers::module_ref(attr, field.ident.as_ref()))
            else {
                continue;
            };
            if !required_dependencies.contains(&identity)
                && !optional_dependencies.contains(&identity)
            {
                optional_dependencies.push(identity);
            }
        }
    }

    Ok(ModuleDescriptor {
        identity: module_type.name,
        required_dependencies,
        optional_dependencies,
        source_text,
        file_path,
        compiled: OnceLock::new(),
    })
}

pub(crate) fn parse(source_text: &str, file_path: &Path) -> Result<syn::File, ModuleError> {
    syn::parse_file(source_text).map_err(|e| {
        let start = e.span().start();
        ModuleError::malformed(
            file_path,
            format!("{} (line {}, column {})", e, start.line, start.column + 1),
        )
    })
}

/// A publicly reachable type declaration.
pub(crate) struct PublicType<'a> {
    pub(crate) name: String,
    /// Enclosing inline modules, outermost first.
    pub(crate) module_path: Vec<String>,
    pub(crate) attrs: &'a [syn::Attribute],
    pub(crate) fields: Option<&'a Fields>,
}

/// Finds the single public type implementing a module contract.
pub(crate) fn identify<'a>(
    file: &'a syn::File,
    file_path: &Path,
) -> Result<PublicType<'a>, ModuleError> {
    let mut module_types = module_types(file);
    match module_types.len() {
        1 => Ok(module_types.remove(0)),
        0 => Err(ModuleError::malformed(
            file_path,
            format!(
                "no public type implements {}",
                MODULE_CONTRACTS.join(" or ")
            ),
        )),
        _ => Err(ModuleError::malformed(
            file_path,
            format!(
                "{} public types implement a module contract: {}",
                module_types.len(),
                module_types
                    .iter()
                    .map(|ty| ty.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )),
    }
}

/// Every public type for which the file implements a module contract.
pub(crate) fn module_types(file: &syn::File) -> Vec<PublicType<'_>> {
    let mut declared = Vec::new();
    collect_public_types(&file.items, &mut Vec::new(), &mut declared);

    let mut impls = ContractImpls::default();
    impls.visit_file(file);

    declared
        .into_iter()
        .filter(|ty| impls.types.iter().any(|(name, _)| name == &ty.name))
        .collect()
}

/// Contract implemented by `type_name`, if any.
pub(crate) fn contract_of(file: &syn::File, type_name: &str) -> Option<String> {
    let mut impls = ContractImpls::default();
    impls.visit_file(file);
    impls
        .types
        .into_iter()
        .find(|(name, _)| name == type_name)
        .map(|(_, contract)| contract)
}

fn collect_public_types<'a>(
    items: &'a [Item],
    module_path: &mut Vec<String>,
    out: &mut Vec<PublicType<'a>>,
) {
    for item in items {
        match item {
            Item::Struct(item) if is_public(&item.vis) => out.push(PublicType {
                name: item.ident.to_string(),
                module_path: module_path.clone(),
                attrs: &item.attrs,
                fields: Some(&item.fields),
            }),
            Item::Enum(item) if is_public(&item.vis) => out.push(PublicType {
                name: item.ident.to_string(),
                module_path: module_path.clone(),
                attrs: &item.attrs,
                fields: None,
            }),
            Item::Union(item) if is_public(&item.vis) => out.push(PublicType {
                name: item.ident.to_string(),
                module_path: module_path.clone(),
                attrs: &item.attrs,
                fields: None,
            }),
            Item::Mod(module) if is_public(&module.vis) => {
                if let Some((_, items)) = &module.content {
                    module_path.push(module.ident.to_string());
                    collect_public_types(items, module_path, out);
                    module_path.pop();
                }
            }
            _ => {}
        }
    }
}

pub(crate) fn is_public(vis: &Visibility) -> bool {
    matches!(vis, Visibility::Public(_))
}

/// Last path segment of a type such as `crate::game::Greeter`.
pub(crate) fn type_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) if path.qself.is_none() => {
            path.path.segments.last().map(|segment| segment.ident.to_string())
        }
        Type::Paren(inner) => type_name(&inner.elem),
        Type::Group(inner) => type_name(&inner.elem),
        _ => None,
    }
}

#[derive(Default)]
struct ContractImpls {
    /// (type name, contract name)
    types: Vec<(String, String)>,
}

impl<'ast> Visit<'ast> for ContractImpls {
    fn visit_item_impl(&mut self, item: &'ast ItemImpl) {
        if let Some((None, trait_path, _)) = &item.trait_ {
            let contract = trait_path
                .segments
                .last()
                .map(|segment| segment.ident.to_string());
            if let (Some(contract), Some(name)) = (contract, type_name(&item.self_ty)) {
                if MODULE_CONTRACTS.contains(&contract.as_str()) {
                    self.types.push((name, contract));
                }
            }
        }
        syn::visit::visit_item_impl(self, item);
    }
}
