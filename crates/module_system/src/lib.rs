//! # Horizon Module System
//!
//! Runtime host for server modules written as single Rust source files. The
//! host reads module sources, compiles each one into a native library with
//! `rustc`, loads the libraries into an unloadable generation and exposes the
//! commands the modules declare on an operator console.
//!
//! ## Core Features
//!
//! - **Source inspection**: identity and dependencies are read from the syntax
//!   tree (`syn`) without compiling or running module code
//! - **Dependency ordering**: required modules first; missing dependencies and
//!   cycles are reported before anything is compiled
//! - **Cached compilation**: each descriptor is compiled at most once and keeps
//!   its image across hot reloads while its source is unchanged
//! - **Generations**: all modules are unloaded together; handles retained from
//!   an old generation fail with a stale-instance error
//! - **Command dispatch**: prefix-free multi-word command keys, quoted
//!   arguments, longest-prefix resolution and typed argument coercion
//!
//! ## Writing a module
//!
//! ```rust,ignore
//! #[require_module(Permissions)]
//! #[derive(Default)]
//! pub struct Greeter {
//!     #[module_ref]
//!     pub Audit: ModuleRef,
//! }
//!
//! impl ServerModule for Greeter {}
//!
//! impl Greeter {
//!     #[command("greet", description = "Greets someone")]
//!     fn greet(&self, #[default("world")] name: String) -> String {
//!         format!("Hello, {}!", name)
//!     }
//! }
//! ```
//!
//! ## Hosting modules
//!
//! ```rust,no_run
//! use module_system::{Dispatched, ModuleManager, RustcCompiler, RustcConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let compiler = Arc::new(RustcCompiler::new(RustcConfig::default()));
//!     let domain = std::env::temp_dir().join("horizon-domain");
//!     let mut manager = ModuleManager::new("modules", domain, compiler)?;
//!
//!     let report = manager.load_all_modules().await?;
//!     println!("{} modules loaded", report.loaded.len());
//!
//!     if let Dispatched::Invoked { reply: Some(text), .. } = manager.dispatch("greet Ada")? {
//!         println!("{}", text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod abi;
pub mod commands;
pub mod compiler;
pub mod domain;
pub mod error;
pub mod manager;
pub mod ordering;
pub mod registry;
pub mod sdk;
pub mod source;

pub use abi::{ModuleManifest, ServerHandle, MODULE_ABI_VERSION};
pub use commands::{
    command_key, tokenize, ArgValue, CommandDispatcher, CommandSpec, Dispatched, HandlerId,
    ParamKind, ParamSpec,
};
pub use compiler::{compile, CompiledModule, ModuleCompiler, RustcCompiler, RustcConfig};
pub use domain::{GenerationState, ModuleDomain, ModuleInstance};
pub use error::{CommandError, ModuleError};
pub use manager::{LoadReport, ModuleManager, ModuleStats};
pub use ordering::{dependency_order, DependencyOrder};
pub use registry::ModuleRegistry;
pub use source::{extract, ModuleDescriptor};
