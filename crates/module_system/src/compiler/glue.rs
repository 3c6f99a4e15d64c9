//! Generated ABI glue.
//!
//! The glue file is the SDK prelude followed by a private `__horizon_glue`
//! module exporting the `horizon_module_*` functions for the module type. It
//! is included at the end of the staged crate root, so everything it names is
//! reachable through `crate::` paths.

use crate::abi::{symbols, CommandManifest, ModuleManifest, MODULE_ABI_VERSION};
use crate::commands::ParamKind;
use crate::error::ModuleError;
use crate::sdk;
use crate::source::{CommandParam, CommandSignature, ModuleSyntax, Receiver};
use proc_macro2::{Ident, Literal, TokenStream};
use quote::{format_ident, quote};
use std::path::Path;

/// File name of the glue, next to the staged crate root.
pub const GLUE_FILE_NAME: &str = "__horizon_glue.rs";

/// The manifest embedded in the image built from `syntax`.
pub fn manifest_for(syntax: &ModuleSyntax) -> ModuleManifest {
    let mut module_refs: Vec<String> = Vec::new();
    for field in &syntax.module_refs {
        if !module_refs.contains(&field.identity) {
            module_refs.push(field.identity.clone());
        }
    }

    ModuleManifest {
        abi_version: MODULE_ABI_VERSION,
        identity: syntax.identity.clone(),
        contract: syntax.contract.clone(),
        module_types: syntax.module_types.clone(),
        commands: syntax
            .commands
            .iter()
            .map(|command| CommandManifest {
                name: command.name.clone(),
                description: command.description.clone(),
                method: command.method.clone(),
                params: command.param_specs(),
            })
            .collect(),
        module_refs,
    }
}

/// Source text of the glue file for `syntax`.
pub fn generate_glue(syntax: &ModuleSyntax, file_path: &Path) -> Result<String, ModuleError> {
    let ident = |name: &str| -> Result<Ident, ModuleError> {
        syn::parse_str::<Ident>(name).map_err(|_| {
            ModuleError::malformed(file_path, format!("`{}` cannot be named from generated code", name))
        })
    };
    let crate_path = |segments: &[String]| -> Result<TokenStream, ModuleError> {
        let segments = segments
            .iter()
            .map(|segment| ident(segment.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(quote!(crate #(:: #segments)*))
    };

    let manifest = manifest_for(syntax);
    let mut manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|e| ModuleError::malformed(file_path, format!("manifest: {}", e)))?;
    manifest_bytes.push(0);
    let manifest_literal = Literal::byte_string(&manifest_bytes);

    let module_type = crate_path(syntax.type_path.as_slice())?;
    let contract = ident(syntax.contract.as_str())?;
    let abi_version = MODULE_ABI_VERSION;

    let abi_version_fn = format_ident!("{}", symbols::name(symbols::ABI_VERSION));
    let manifest_fn = format_ident!("{}", symbols::name(symbols::MANIFEST));
    let create_fn = format_ident!("{}", symbols::name(symbols::CREATE));
    let destroy_fn = format_ident!("{}", symbols::name(symbols::DESTROY));
    let bind_ref_fn = format_ident!("{}", symbols::name(symbols::BIND_REF));
    let on_loaded_fn = format_ident!("{}", symbols::name(symbols::ON_LOADED));
    let on_unloading_fn = format_ident!("{}", symbols::name(symbols::ON_UNLOADING));
    let on_server_fn = format_ident!("{}", symbols::name(symbols::ON_SERVER));
    let invoke_fn = format_ident!("{}", symbols::name(symbols::INVOKE));
    let free_reply_fn = format_ident!("{}", symbols::name(symbols::FREE_REPLY));

    // Fields bound per referenced identity.
    let mut bind_arms = Vec::new();
    for identity in &manifest.module_refs {
        let fields = syntax
            .module_refs
            .iter()
            .filter(|field| &field.identity == identity)
            .map(|field| ident(field.field.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        bind_arms.push(quote! {
            #identity => {
                #( module.#fields = sdk::module_ref(#identity, loaded); )*
                true
            }
        });
    }

    let mut invoke_arms = Vec::new();
    let mut command_fns = Vec::new();
    for (index, command) in syntax.commands.iter().enumerate() {
        let command_fn = format_ident!("__horizon_command_{}", index);
        let index = index as u32;
        invoke_arms.push(quote!(#index => #command_fn(module, &args),));
        command_fns.push(command_function(&command_fn, command, syntax, &ident)?);
    }

    let mut enum_fns = Vec::new();
    for decl in &syntax.enums {
        let used = syntax.commands.iter().any(|command| {
            command.params.iter().any(|param| enum_name(param) == Some(decl.name.as_str()))
        });
        if !used {
            continue;
        }
        let converter = format_ident!("__horizon_enum_{}", decl.name);
        let enum_type = crate_path(decl.path.as_slice())?;
        let members = decl
            .members
            .iter()
            .map(|member| ident(member.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let member_names = &decl.members;
        let type_name = &decl.name;
        enum_fns.push(quote! {
            fn #converter(value: &str) -> Result<#enum_type, sdk::Failure> {
                match value {
                    #( #member_names => Ok(#enum_type::#members), )*
                    _ => Err(sdk::conversion(value, #type_name)),
                }
            }
        });
    }

    let glue = quote! {
        #[doc(hidden)]
        #[allow(warnings, clippy::all)]
        mod __horizon_glue {
            use crate::__horizon_sdk as sdk;
            use ::std::os::raw::{c_char, c_void};
            use ::std::panic::{catch_unwind, AssertUnwindSafe};

            type Module = #module_type;

            #[no_mangle]
            pub extern "C" fn #abi_version_fn() -> u32 {
                #abi_version
            }

            #[no_mangle]
            pub extern "C" fn #manifest_fn() -> *const c_char {
                #manifest_literal.as_ptr() as *const c_char
            }

            #[no_mangle]
            pub extern "C" fn #create_fn() -> *mut c_void {
                match catch_unwind(|| Box::new(<Module as ::std::default::Default>::default())) {
                    Ok(module) => Box::into_raw(module) as *mut c_void,
                    Err(_) => ::std::ptr::null_mut(),
                }
            }

            #[no_mangle]
            pub unsafe extern "C" fn #destroy_fn(instance: *mut c_void) {
                if !instance.is_null() {
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        drop(Box::from_raw(instance as *mut Module))
                    }));
                }
            }

            #[no_mangle]
            pub unsafe extern "C" fn #bind_ref_fn(
                instance: *mut c_void,
                name: *const c_char,
                loaded: bool,
            ) -> bool {
                if instance.is_null() {
                    return false;
                }
                let module = &mut *(instance as *mut Module);
                match sdk::text(name).as_str() {
                    #(#bind_arms)*
                    _ => false,
                }
            }

            #[no_mangle]
            pub unsafe extern "C" fn #on_loaded_fn(instance: *mut c_void) -> bool {
                if instance.is_null() {
                    return false;
                }
                let module = &mut *(instance as *mut Module);
                catch_unwind(AssertUnwindSafe(|| {
                    <Module as crate::#contract>::on_modules_loaded(module)
                }))
                .is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn #on_unloading_fn(instance: *mut c_void) -> bool {
                if instance.is_null() {
                    return false;
                }
                let module = &mut *(instance as *mut Module);
                catch_unwind(AssertUnwindSafe(|| {
                    <Module as crate::#contract>::on_module_unloading(module)
                }))
                .is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn #on_server_fn(
                instance: *mut c_void,
                name: *const c_char,
                address: *const c_char,
            ) -> bool {
                if instance.is_null() {
                    return false;
                }
                let module = &mut *(instance as *mut Module);
                let handle = sdk::server_handle(name, address);
                catch_unwind(AssertUnwindSafe(|| {
                    <Module as crate::#contract>::on_creating_server_instance(module, &handle)
                }))
                .is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn #invoke_fn(
                instance: *mut c_void,
                index: u32,
                argv: *const *const c_char,
                argc: usize,
            ) -> *mut c_char {
                if instance.is_null() {
                    return ::std::ptr::null_mut();
                }
                let module = &mut *(instance as *mut Module);
                let args = sdk::collect_args(argv, argc);
                let outcome = catch_unwind(AssertUnwindSafe(|| match index {
                    #(#invoke_arms)*
                    _ => Err(sdk::Failure::Handler(format!("unknown command index {}", index))),
                }));
                sdk::encode(outcome)
            }

            #[no_mangle]
            pub unsafe extern "C" fn #free_reply_fn(reply: *mut c_char) {
                sdk::release(reply)
            }

            #(#command_fns)*

            #(#enum_fns)*
        }
    };

    Ok(format!("{}\n{}\n", sdk::PRELUDE, glue))
}

fn enum_name(param: &CommandParam) -> Option<&str> {
    match &param.spec.kind {
        ParamKind::Enum { type_name, .. } => Some(type_name.as_str()),
        _ => None,
    }
}

fn command_function(
    command_fn: &Ident,
    command: &CommandSignature,
    syntax: &ModuleSyntax,
    ident: &dyn Fn(&str) -> Result<Ident, ModuleError>,
) -> Result<TokenStream, ModuleError> {
    let method = ident(command.method.as_str())?;

    let mut bindings = Vec::new();
    let mut arguments = Vec::new();
    for (index, param) in command.params.iter().enumerate() {
        let argument = format_ident!("arg_{}", index);
        let name = &param.spec.name;
        let target = param.spec.kind.type_name();

        let convert = match enum_name(param).and_then(|name| syntax.find_enum(name)) {
            Some(decl) => {
                let converter = format_ident!("__horizon_enum_{}", decl.name);
                quote!(#converter(value)?)
            }
            None => quote!(sdk::parse(value, #target)?),
        };

        bindings.push(if param.option {
            quote! {
                let #argument = match sdk::raw(args, #index) {
                    Some(value) => Some(#convert),
                    None => None,
                };
            }
        } else {
            quote! {
                let #argument = {
                    let value = sdk::required(args, #index, #name)?;
                    #convert
                };
            }
        });
        arguments.push(argument);
    }

    let call = match command.receiver {
        Receiver::Shared | Receiver::Exclusive => quote!(module.#method(#(#arguments),*)),
        Receiver::None => quote!(Module::#method(#(#arguments),*)),
    };

    Ok(quote! {
        fn #command_fn(
            module: &mut Module,
            args: &[Option<String>],
        ) -> Result<Option<String>, sdk::Failure> {
            #(#bindings)*
            sdk::handler(#call)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::analyze_source;

    const SHOP: &str = r#"
        pub enum Tier { Basic, Premium }

        #[derive(Default)]
        pub struct Shop {
            #[module_ref(Bank)]
            pub bank: ModuleRef,
            #[module_ref(Bank)]
            pub vault: ModuleRef,
        }

        impl Shop {
            #[command("buy", description = "Buy an item")]
            fn buy(&mut self, item: String, tier: Option<Tier>, #[default(1)] count: u32) -> String {
                item
            }

            #[command("shop info")]
            fn info() -> &'static str { "open" }
        }

        impl ServerModule for Shop {}
    "#;

    fn glue() -> String {
        let syntax = analyze_source(SHOP, Path::new("shop.rs")).unwrap();
        generate_glue(&syntax, Path::new("shop.rs")).unwrap()
    }

    #[test]
    fn test_glue_starts_with_prelude_and_parses() {
        let glue = glue();
        assert!(glue.starts_with(sdk::PRELUDE));
        syn::parse_file(&glue).unwrap();
    }

    #[test]
    fn test_glue_exports_every_symbol() {
        let glue = glue();
        for symbol in [
            symbols::ABI_VERSION,
            symbols::MANIFEST,
            symbols::CREATE,
            symbols::DESTROY,
            symbols::BIND_REF,
            symbols::ON_LOADED,
            symbols::ON_UNLOADING,
            symbols::ON_SERVER,
            symbols::INVOKE,
            symbols::FREE_REPLY,
        ] {
            assert!(glue.contains(symbols::name(symbol)), "missing {}", symbols::name(symbol));
        }
    }

    #[test]
    fn test_glue_generates_commands_and_converters() {
        let glue = glue();
        assert!(glue.contains("__horizon_command_0"));
        assert!(glue.contains("__horizon_command_1"));
        assert!(glue.contains("__horizon_enum_Tier"));
        assert!(glue.contains("Module :: info"));
    }

    #[test]
    fn test_manifest_lists_commands_in_invoke_order() {
        let syntax = analyze_source(SHOP, Path::new("shop.rs")).unwrap();
        let manifest = manifest_for(&syntax);
        assert_eq!(manifest.identity, "Shop");
        assert_eq!(manifest.module_types, vec!["Shop".to_string()]);
        assert_eq!(manifest.module_refs, vec!["Bank".to_string()]);

        let names: Vec<_> = manifest.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["buy", "shop info"]);
        assert_eq!(manifest.commands[0].params.len(), 3);
        assert_eq!(manifest.commands[0].params[2].default.as_deref(), Some("1"));
    }
}
