//! Command signature analysis.
//!
//! Extraction only answers "who is this module and what does it need". The
//! compiler also has to know which methods are commands, what their
//! parameters look like and which fields receive module references, so it can
//! generate the ABI glue and the embedded manifest.

use super::markers;
use super::{identify, is_public, module_types, parse, type_name, ModuleDescriptor};
use crate::commands::{command_key, ParamKind, ParamSpec};
use crate::error::ModuleError;
use quote::ToTokens;
use std::path::Path;
use syn::ext::IdentExt;
use syn::visit::Visit;
use syn::{FnArg, GenericArgument, ImplItem, ImplItemFn, Item, ItemImpl, Pat, PathArguments, Type};

/// Everything the compiler needs to know about a module's source.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSyntax {
    pub identity: String,
    /// Enclosing inline modules followed by the identity.
    pub type_path: Vec<String>,
    pub contract: String,
    /// Every public type implementing a module contract.
    pub module_types: Vec<String>,
    pub commands: Vec<CommandSignature>,
    pub enums: Vec<EnumDecl>,
    pub module_refs: Vec<ModuleRefField>,
}

impl ModuleSyntax {
    pub fn find_enum(&self, type_name: &str) -> Option<&EnumDecl> {
        self.enums.iter().find(|decl| decl.name == type_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// `&self`
    Shared,
    /// `&mut self`
    Exclusive,
    /// No receiver; an associated function.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSignature {
    pub name: String,
    pub description: Option<String>,
    pub method: String,
    pub receiver: Receiver,
    pub params: Vec<CommandParam>,
}

impl CommandSignature {
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        self.params.iter().map(|param| param.spec.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandParam {
    pub spec: ParamSpec,
    /// Declared as `Option<T>` rather than with a `#[default]`.
    pub option: bool,
}

/// A unit-only enum that commands can take as a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub path: Vec<String>,
    pub members: Vec<String>,
}

/// A `#[module_ref]` field of type `ModuleRef` that the host binds after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRefField {
    pub field: String,
    pub identity: String,
}

pub fn analyze(descriptor: &ModuleDescriptor) -> Result<ModuleSyntax, ModuleError> {
    analyze_source(descriptor.source_text(), descriptor.file_path())
}

pub fn analyze_source(source_text: &str, file_path: &Path) -> Result<ModuleSyntax, ModuleError> {
    let file = parse(source_text, file_path)?;
    let module_type = identify(&file, file_path)?;
    let identity = module_type.name.clone();

    let contract = super::contract_of(&file, &identity).ok_or_else(|| {
        ModuleError::malformed(file_path, format!("{} implements no module contract", identity))
    })?;

    let mut type_path = module_type.module_path.clone();
    type_path.push(identity.clone());

    let mut enums = Vec::new();
    collect_enums(&file.items, &mut Vec::new(), true, &mut enums);

    let mut module_refs = Vec::new();
    if let Some(fields) = module_type.fields {
        for field in fields.iter().filter(|field| is_public(&field.vis)) {
            let Some(ident) = &field.ident else {
                continue;
            };
            let Some(identity) = field
                .attrs
                .iter()
                .find_map(|attr| markers::module_ref(attr, Some(ident)))
            else {
                continue;
            };
            if type_name(&field.ty).as_deref() == Some("ModuleRef") {
                module_refs.push(ModuleRefField {
                    field: ident.to_string(),
                    identity,
                });
            }
        }
    }

    let mut finder = CommandFinder {
        identity: &identity,
        methods: Vec::new(),
    };
    finder.visit_file(&file);

    let mut commands: Vec<CommandSignature> = Vec::new();
    for method in finder.methods {
        let Some(signature) = command_signature(method, &enums)
            .map_err(|reason| ModuleError::malformed(file_path, reason))?
        else {
            continue;
        };
        let key = command_key(&signature.name);
        if commands.iter().any(|other| command_key(&other.name) == key) {
            return Err(ModuleError::malformed(
                file_path,
                format!("command '{}' is declared more than once", key),
            ));
        }
        commands.push(signature);
    }

    Ok(ModuleSyntax {
        module_types: module_types(&file).into_iter().map(|ty| ty.name).collect(),
        identity,
        type_path,
        contract,
        commands,
        enums,
        module_refs,
    })
}

struct CommandFinder<'a, 'ast> {
    identity: &'a str,
    methods: Vec<&'ast ImplItemFn>,
}

impl<'a, 'ast> Visit<'ast> for CommandFinder<'a, 'ast> {
    fn visit_item_impl(&mut self, item: &'ast ItemImpl) {
        if item.trait_.is_none() && type_name(&item.self_ty).as_deref() == Some(self.identity) {
            for impl_item in &item.items {
                if let ImplItem::Fn(method) = impl_item {
                    self.methods.push(method);
                }
            }
        }
        syn::visit::visit_item_impl(self, item);
    }
}

fn command_signature(
    method: &ImplItemFn,
    enums: &[EnumDecl],
) -> Result<Option<CommandSignature>, String> {
    let Some(marker) = method.attrs.iter().find_map(markers::command) else {
        return Ok(None);
    };
    let marker = marker?;
    let sig = &method.sig;
    let method_name = sig.ident.to_string();

    let name = marker
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("command on method `{}` has no name", method_name))?;

    if sig.asyncness.is_some() || !sig.generics.params.is_empty() || sig.variadic.is_some() {
        return Err(format!(
            "command method `{}` must not be async, generic or variadic",
            method_name
        ));
    }

    let mut receiver = Receiver::None;
    let mut params = Vec::new();
    for input in &sig.inputs {
        match input {
            FnArg::Receiver(recv) => {
                receiver = match (&recv.reference, &recv.mutability) {
                    (Some(_), Some(_)) => Receiver::Exclusive,
                    (Some(_), None) => Receiver::Shared,
                    (None, _) => {
                        return Err(format!(
                            "command method `{}` must take &self or &mut self",
                            method_name
                        ))
                    }
                };
            }
            FnArg::Typed(arg) => {
                let param_name = match &*arg.pat {
                    Pat::Ident(ident) if ident.by_ref.is_none() && ident.subpat.is_none() => {
                        ident.ident.unraw().to_string()
                    }
                    _ => {
                        return Err(format!(
                            "parameters of command `{}` must be plain identifiers",
                            name
                        ))
                    }
                };

                let (kind, optional) = param_kind(&arg.ty, enums).map_err(|reason| {
                    format!("parameter `{}` of command `{}`: {}", param_name, name, reason)
                })?;
                let mut param = if optional {
                    ParamSpec::optional(param_name.clone(), kind)
                } else {
                    ParamSpec::required(param_name.clone(), kind)
                };

                if let Some(default) = arg.attrs.iter().find_map(markers::default_value) {
                    let default = default.map_err(|reason| {
                        format!("parameter `{}` of command `{}`: {}", param_name, name, reason)
                    })?;
                    param = param.with_default(default);
                    if let Err(e) = param.default_value() {
                        return Err(format!(
                            "default of parameter `{}` of command `{}`: {}",
                            param_name, name, e
                        ));
                    }
                }

                if !param.optional && params.iter().any(|p: &CommandParam| p.spec.optional) {
                    return Err(format!(
                        "required parameter `{}` of command `{}` follows an optional one",
                        param_name, name
                    ));
                }
                params.push(CommandParam {
                    spec: param,
                    option: optional,
                });
            }
        }
    }

    Ok(Some(CommandSignature {
        name,
        description: marker.description,
        method: method_name,
        receiver,
        params,
    }))
}

/// Maps a parameter type to its kind; the flag is set for `Option<T>`.
fn param_kind(ty: &Type, enums: &[EnumDecl]) -> Result<(ParamKind, bool), String> {
    match ty {
        Type::Reference(_) => return Err("borrowed parameter types are not supported".to_string()),
        Type::Paren(inner) => return param_kind(&inner.elem, enums),
        Type::Group(inner) => return param_kind(&inner.elem, enums),
        _ => {}
    }

    if let Some(inner) = option_inner(ty) {
        let (kind, nested) = param_kind(inner, enums)?;
        if nested {
            return Err("nested Option parameters are not supported".to_string());
        }
        return Ok((kind, true));
    }

    let simple = match ty {
        Type::Path(path) if path.qself.is_none() && path.path.segments.len() == 1 => {
            let segment = &path.path.segments[0];
            matches!(segment.arguments, PathArguments::None).then(|| segment.ident.to_string())
        }
        _ => None,
    };

    let kind = match simple.as_deref() {
        Some("String") => ParamKind::Text,
        Some("bool") => ParamKind::Bool,
        Some("char") => ParamKind::Char,
        Some("f32") => ParamKind::Float { bits: 32 },
        Some("f64") => ParamKind::Float { bits: 64 },
        Some(name) => match integer_kind(name) {
            Some(kind) => kind,
            None => match enums.iter().find(|decl| decl.name == name) {
                Some(decl) => ParamKind::Enum {
                    type_name: decl.name.clone(),
                    members: decl.members.clone(),
                },
                None => ParamKind::Other {
                    type_name: name.to_string(),
                },
            },
        },
        None => ParamKind::Other {
            type_name: ty.to_token_stream().to_string().replace(' ', ""),
        },
    };
    Ok((kind, false))
}

fn integer_kind(name: &str) -> Option<ParamKind> {
    let (signed, bits) = match name {
        "i8" => (true, 8),
        "i16" => (true, 16),
        "i32" => (true, 32),
        "i64" | "isize" => (true, 64),
        "u8" => (false, 8),
        "u16" => (false, 16),
        "u32" => (false, 32),
        "u64" | "usize" => (false, 64),
        _ => return None,
    };
    Some(ParamKind::Integer { signed, bits })
}

fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first() {
        Some(GenericArgument::Type(inner)) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

/// Collects unit-only enums the generated glue can name.
fn collect_enums(items: &[Item], module_path: &mut Vec<String>, reachable: bool, out: &mut Vec<EnumDecl>) {
    for item in items {
        match item {
            Item::Enum(item) => {
                let nameable = module_path.is_empty() || (reachable && is_public(&item.vis));
                let unit_only = item.generics.params.is_empty()
                    && !item.variants.is_empty()
                    && item
                        .variants
                        .iter()
                        .all(|variant| matches!(variant.fields, syn::Fields::Unit));
                if nameable && unit_only && !out.iter().any(|decl| decl.name == item.ident.to_string()) {
                    let mut path = module_path.clone();
                    path.push(item.ident.to_string());
                    out.push(EnumDecl {
                        name: item.ident.to_string(),
                        path,
                        members: item.variants.iter().map(|v| v.ident.to_string()).collect(),
                    });
                }
            }
            Item::Mod(module) => {
                if let Some((_, items)) = &module.content {
                    module_path.push(module.ident.to_string());
                    collect_enums(items, module_path, reachable && is_public(&module.vis), out);
                    module_path.pop();
                }
            }
            _ => {}
        }
    }
}
