//! Module loading domain.
//!
//! Compiled images are loaded into a [`Generation`]: a private directory,
//! the libraries opened from it and the module instances created from those
//! libraries. A generation is only ever torn down as a whole. After
//! [`ModuleDomain::unload_all`] every [`ModuleInstance`] handed out by the
//! old generation refuses further calls with a stale-instance error.

use crate::abi::{symbols, ModuleManifest, Reply, ServerHandle, MODULE_ABI_VERSION};
use crate::commands::{command_key, ArgValue, CommandSpec, HandlerId};
use crate::compiler::DebugMap;
use crate::error::{CommandError, ModuleError};
use crate::source::ModuleDescriptor;
use libloading::Library;
use std::cell::Cell;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

// ============================================================================
// Exported symbol signatures
// ============================================================================

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type ManifestFn = unsafe extern "C" fn() -> *const c_char;
type CreateFn = unsafe extern "C" fn() -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type BindRefFn = unsafe extern "C" fn(*mut c_void, *const c_char, bool) -> bool;
type HookFn = unsafe extern "C" fn(*mut c_void) -> bool;
type ServerFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> bool;
type InvokeFn = unsafe extern "C" fn(*mut c_void, u32, *const *const c_char, usize) -> *mut c_char;
type FreeReplyFn = unsafe extern "C" fn(*mut c_char);

/// Entry points of one loaded image.
///
/// Copied out of the library; only valid while the owning generation is alive.
#[derive(Clone, Copy)]
struct ModuleVtable {
    destroy: DestroyFn,
    bind_ref: BindRefFn,
    on_loaded: HookFn,
    on_unloading: HookFn,
    on_server: ServerFn,
    invoke: InvokeFn,
    free_reply: FreeReplyFn,
}

impl ModuleVtable {
    /// # Safety
    /// `library` must export the symbols with the signatures above.
    unsafe fn resolve(library: &Library, identity: &str) -> Result<Self, ModuleError> {
        Ok(Self {
            destroy: symbol(library, identity, symbols::DESTROY)?,
            bind_ref: symbol(library, identity, symbols::BIND_REF)?,
            on_loaded: symbol(library, identity, symbols::ON_LOADED)?,
            on_unloading: symbol(library, identity, symbols::ON_UNLOADING)?,
            on_server: symbol(library, identity, symbols::ON_SERVER)?,
            invoke: symbol(library, identity, symbols::INVOKE)?,
            free_reply: symbol(library, identity, symbols::FREE_REPLY)?,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, identity: &str, name: &[u8]) -> Result<T, ModuleError> {
    library.get::<T>(name).map(|symbol| *symbol).map_err(|e| {
        ModuleError::integrity(identity, format!("missing symbol {}: {}", symbols::name(name), e))
    })
}

// ============================================================================
// Generations
// ============================================================================

/// Lifecycle of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Empty,
    Populated,
    /// Torn down; nothing from it may be used any more.
    Unloading,
}

/// Shared by every instance of a generation; cleared when it is collected.
#[derive(Debug)]
struct GenerationToken {
    id: u64,
    alive: Cell<bool>,
}

struct Generation {
    token: Rc<GenerationToken>,
    directory: Option<TempDir>,
    libraries: Vec<(String, Library)>,
    instances: Vec<Rc<ModuleInstance>>,
}

impl Generation {
    fn create(root: &Path, id: u64) -> Result<Self, ModuleError> {
        let directory = tempfile::Builder::new()
            .prefix(&format!("generation-{}-", id))
            .tempdir_in(root)
            .map_err(|e| ModuleError::io(root, e))?;
        debug!("Created generation {} at {}", id, directory.path().display());

        Ok(Self {
            token: Rc::new(GenerationToken {
                id,
                alive: Cell::new(true),
            }),
            directory: Some(directory),
            libraries: Vec::new(),
            instances: Vec::new(),
        })
    }

    fn state(&self) -> GenerationState {
        if !self.token.alive.get() {
            GenerationState::Unloading
        } else if self.instances.is_empty() {
            GenerationState::Empty
        } else {
            GenerationState::Populated
        }
    }

    fn path(&self) -> Option<&Path> {
        self.directory.as_ref().map(TempDir::path)
    }

    /// Destroys instances, closes libraries and deletes the directory. Idempotent.
    fn collect(&mut self) {
        self.token.alive.set(false);

        for instance in self.instances.drain(..).rev() {
            instance.destroy();
        }
        for (identity, library) in self.libraries.drain(..).rev() {
            if let Err(e) = library.close() {
                warn!("Failed to close library of module {}: {}", identity, e);
            }
        }
        if let Some(directory) = self.directory.take() {
            let path = directory.path().to_path_buf();
            if let Err(e) = directory.close() {
                warn!("Failed to delete generation directory {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.collect();
    }
}

// ============================================================================
// Module instances
// ============================================================================

/// A live module created in one generation.
///
/// Handles are cheap to clone (`Rc`) and may be retained anywhere, but once
/// their generation is unloaded every call fails with a stale-instance error.
pub struct ModuleInstance {
    identity: String,
    manifest: ModuleManifest,
    token: Rc<GenerationToken>,
    handle: Cell<*mut c_void>,
    vtable: ModuleVtable,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("identity", &self.identity)
            .field("generation", &self.token.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ModuleInstance {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.token.id
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn is_alive(&self) -> bool {
        self.token.alive.get() && !self.handle.get().is_null()
    }

    fn live_handle(&self) -> Result<*mut c_void, ModuleError> {
        if self.is_alive() {
            Ok(self.handle.get())
        } else {
            Err(ModuleError::StaleInstance {
                identity: self.identity.clone(),
                generation: self.token.id,
            })
        }
    }

    fn destroy(&self) {
        let handle = self.handle.replace(ptr::null_mut());
        if !handle.is_null() {
            debug!("Destroying instance of module {}", self.identity);
            unsafe { (self.vtable.destroy)(handle) };
        }
    }

    fn hook_result(&self, hook: &'static str, completed: bool) -> Result<(), ModuleError> {
        if completed {
            Ok(())
        } else {
            Err(ModuleError::Hook {
                identity: self.identity.clone(),
                hook,
            })
        }
    }

    /// Fills the module's reference fields for `identity`.
    ///
    /// Returns `false` when the module declares no reference to `identity`.
    pub fn bind_reference(&self, identity: &str, loaded: bool) -> Result<bool, ModuleError> {
        let handle = self.live_handle()?;
        let name = CString::new(identity).map_err(|_| ModuleError::NotFound(identity.to_string()))?;
        Ok(unsafe { (self.vtable.bind_ref)(handle, name.as_ptr(), loaded) })
    }

    pub fn on_modules_loaded(&self) -> Result<(), ModuleError> {
        let handle = self.live_handle()?;
        let completed = unsafe { (self.vtable.on_loaded)(handle) };
        self.hook_result("on_modules_loaded", completed)
    }

    pub fn on_module_unloading(&self) -> Result<(), ModuleError> {
        let handle = self.live_handle()?;
        let completed = unsafe { (self.vtable.on_unloading)(handle) };
        self.hook_result("on_module_unloading", completed)
    }

    pub fn on_creating_server_instance(&self, server: &ServerHandle) -> Result<(), ModuleError> {
        let handle = self.live_handle()?;
        let name = CString::new(server.name.replace('\0', "")).unwrap_or_default();
        let address = CString::new(server.bind_address.replace('\0', "")).unwrap_or_default();
        let completed = unsafe { (self.vtable.on_server)(handle, name.as_ptr(), address.as_ptr()) };
        self.hook_result("on_creating_server_instance", completed)
    }

    /// Runs command `index` of the manifest with already coerced arguments.
    ///
    /// `key` only labels errors.
    pub fn invoke(
        &self,
        key: &str,
        index: u32,
        args: &[Option<ArgValue>],
    ) -> Result<Option<String>, CommandError> {
        let handle = self.live_handle().map_err(|_| CommandError::StaleInstance {
            owner: self.identity.clone(),
            generation: self.token.id,
        })?;

        let wire = args
            .iter()
            .map(|arg| {
                arg.as_ref()
                    .map(|value| {
                        let text = value.to_wire();
                        CString::new(text.clone()).map_err(|_| CommandError::ArgumentConversion {
                            value: text,
                            target: "text without NUL bytes".to_string(),
                        })
                    })
                    .transpose()
            })
            .collect::<Result<Vec<Option<CString>>, _>>()?;
        let argv: Vec<*const c_char> = wire
            .iter()
            .map(|arg| arg.as_ref().map_or(ptr::null(), |arg| arg.as_ptr()))
            .collect();

        let raw = unsafe { (self.vtable.invoke)(handle, index, argv.as_ptr(), argv.len()) };
        if raw.is_null() {
            return Err(CommandError::Handler {
                key: key.to_string(),
                message: format!("module {} returned no reply", self.identity),
            });
        }
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.vtable.free_reply)(raw) };

        match Reply::decode(&text) {
            Reply::Empty => Ok(None),
            Reply::Output(output) => Ok(Some(output)),
            Reply::Failed(message) => Err(CommandError::Handler {
                key: key.to_string(),
                message,
            }),
            Reply::Conversion { value, target } => {
                Err(CommandError::ArgumentConversion { value, target })
            }
            Reply::Panicked(message) => Err(CommandError::Handler {
                key: key.to_string(),
                message: format!("panicked: {}", message),
            }),
        }
    }

    /// One [`CommandSpec`] per manifest command, each invoking this instance.
    pub fn command_specs(self: &Rc<Self>) -> Vec<CommandSpec> {
        self.manifest
            .commands
            .iter()
            .enumerate()
            .map(|(index, command)| {
                let instance = Rc::clone(self);
                let key = command_key(&command.name);
                let index = index as u32;
                CommandSpec {
                    name: command.name.clone(),
                    description: command.description.clone(),
                    params: command.params.clone(),
                    handler: HandlerId::new(&self.identity, &command.method),
                    invoker: Rc::new(move |args: &[Option<ArgValue>]| {
                        instance.invoke(&key, index, args)
                    }),
                }
            })
            .collect()
    }
}

// ============================================================================
// Domain
// ============================================================================

/// Owns the current generation and replaces it on [`unload_all`](Self::unload_all).
pub struct ModuleDomain {
    root: PathBuf,
    generation: Generation,
    last_generation: u64,
}

impl fmt::Debug for ModuleDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDomain")
            .field("root", &self.root)
            .field("generation", &self.generation.token.id)
            .field("state", &self.generation.state())
            .field("instances", &self.generation.instances.len())
            .finish()
    }
}

impl ModuleDomain {
    /// Creates the domain and its first, empty generation under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ModuleError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ModuleError::io(&root, e))?;
        let generation = Generation::create(&root, 1)?;
        Ok(Self {
            root,
            generation,
            last_generation: 1,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation.token.id
    }

    pub fn state(&self) -> GenerationState {
        self.generation.state()
    }

    /// Private directory of the current generation.
    pub fn directory(&self) -> Option<&Path> {
        self.generation.path()
    }

    pub fn instances(&self) -> &[Rc<ModuleInstance>] {
        &self.generation.instances
    }

    pub fn instance(&self, identity: &str) -> Option<&Rc<ModuleInstance>> {
        self.generation
            .instances
            .iter()
            .find(|instance| instance.identity == identity)
    }

    pub fn is_loaded(&self, identity: &str) -> bool {
        self.instance(identity).is_some()
    }

    /// Loads the compiled image of `descriptor` into the current generation.
    pub fn load(&mut self, descriptor: &ModuleDescriptor) -> Result<Rc<ModuleInstance>, ModuleError> {
        let identity = descriptor.identity();
        let compiled = descriptor
            .compiled()
            .ok_or_else(|| ModuleError::NotCompiled(identity.to_string()))?;
        if self.is_loaded(identity) {
            return Err(ModuleError::AlreadyLoaded {
                identity: identity.to_string(),
                generation: self.generation(),
            });
        }

        let debug_map = DebugMap::decode(identity, &compiled.debug_map)?;
        if debug_map.identity != identity {
            return Err(ModuleError::integrity(
                identity,
                format!("debug map belongs to {}", debug_map.identity),
            ));
        }

        let directory = self
            .generation
            .path()
            .ok_or_else(|| ModuleError::integrity(identity, "generation has been collected"))?
            .to_path_buf();
        let image_path = directory.join(format!("{}{}{}", DLL_PREFIX, identity, DLL_SUFFIX));
        let map_path = directory.join(format!("{}.map.gz", identity));
        std::fs::write(&image_path, &compiled.image[..]).map_err(|e| ModuleError::io(&image_path, e))?;
        std::fs::write(&map_path, &compiled.debug_map[..]).map_err(|e| ModuleError::io(&map_path, e))?;

        debug!("Opening {}", image_path.display());
        let library = unsafe { Library::new(&image_path) }
            .map_err(|e| ModuleError::integrity(identity, format!("cannot open image: {}", e)))?;

        let manifest = unsafe { read_manifest(&library, identity)? };
        let module_types = vec![identity.to_string()];
        if manifest.identity != identity || manifest.module_types != module_types {
            return Err(ModuleError::integrity(
                identity,
                format!(
                    "image declares {} with module types [{}]",
                    manifest.identity,
                    manifest.module_types.join(", ")
                ),
            ));
        }

        let vtable = unsafe { ModuleVtable::resolve(&library, identity)? };
        let create: CreateFn = unsafe { symbol(&library, identity, symbols::CREATE)? };
        let handle = unsafe { create() };
        if handle.is_null() {
            return Err(ModuleError::integrity(identity, "constructor panicked"));
        }

        let instance = Rc::new(ModuleInstance {
            identity: identity.to_string(),
            manifest,
            token: Rc::clone(&self.generation.token),
            handle: Cell::new(handle),
            vtable,
        });
        self.generation.libraries.push((identity.to_string(), library));
        self.generation.instances.push(Rc::clone(&instance));

        info!(
            "Loaded module {} into generation {} ({} commands)",
            identity,
            self.generation(),
            instance.manifest.commands.len()
        );
        Ok(instance)
    }

    /// Replaces the current generation with a new, empty one and collects the old one.
    ///
    /// Returns the id of the new generation.
    pub fn unload_all(&mut self) -> Result<u64, ModuleError> {
        let next = Generation::create(&self.root, self.last_generation + 1)?;
        self.last_generation += 1;

        let mut old = std::mem::replace(&mut self.generation, next);
        let unloaded = old.instances.len();
        old.collect();

        info!(
            "Unloaded generation {} ({} modules), generation {} is active",
            old.token.id, unloaded, self.last_generation
        );
        Ok(self.last_generation)
    }
}

/// # Safety
/// `library` must be a module image.
unsafe fn read_manifest(library: &Library, identity: &str) -> Result<ModuleManifest, ModuleError> {
    let abi_version: AbiVersionFn = symbol(library, identity, symbols::ABI_VERSION)?;
    let version = abi_version();
    if version != MODULE_ABI_VERSION {
        return Err(ModuleError::integrity(
            identity,
            format!("ABI version {} (host expects {})", version, MODULE_ABI_VERSION),
        ));
    }

    let manifest_fn: ManifestFn = symbol(library, identity, symbols::MANIFEST)?;
    let raw = manifest_fn();
    if raw.is_null() {
        return Err(ModuleError::integrity(identity, "missing manifest"));
    }
    let manifest: ModuleManifest = serde_json::from_slice(CStr::from_ptr(raw).to_bytes())
        .map_err(|e| ModuleError::integrity(identity, format!("invalid manifest: {}", e)))?;
    if manifest.abi_version != MODULE_ABI_VERSION {
        return Err(ModuleError::integrity(identity, "manifest ABI version mismatch"));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, testing::CountingCompiler, CompiledModule};
    use crate::registry::ModuleRegistry;
    use crate::source::extract;

    fn descriptor(identity: &str) -> ModuleDescriptor {
        extract(
            format!("pub struct {0}; impl ServerModule for {0} {{}}", identity),
            format!("modules/{}.rs", identity),
        )
        .unwrap()
    }

    #[test]
    fn test_new_domain_starts_empty() {
        let root = tempfile::tempdir().unwrap();
        let domain = ModuleDomain::new(root.path().join("domain")).unwrap();

        assert_eq!(domain.generation(), 1);
        assert_eq!(domain.state(), GenerationState::Empty);
        assert!(domain.directory().unwrap().is_dir());
        assert!(domain.instances().is_empty());
    }

    #[test]
    fn test_unload_all_replaces_generation_and_deletes_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut domain = ModuleDomain::new(root.path()).unwrap();
        let first = domain.directory().unwrap().to_path_buf();

        assert_eq!(domain.unload_all().unwrap(), 2);
        assert_eq!(domain.generation(), 2);
        assert_eq!(domain.state(), GenerationState::Empty);
        assert!(!first.exists());
        assert_ne!(domain.directory().unwrap(), first.as_path());
    }

    #[test]
    fn test_load_requires_compiled_image() {
        let root = tempfile::tempdir().unwrap();
        let mut domain = ModuleDomain::new(root.path()).unwrap();

        let error = domain.load(&descriptor("Greeter")).unwrap_err();
        assert!(matches!(error, ModuleError::NotCompiled(ref id) if id == "Greeter"));
    }

    #[tokio::test]
    async fn test_unloadable_image_fails_integrity() {
        let root = tempfile::tempdir().unwrap();
        let mut domain = ModuleDomain::new(root.path()).unwrap();
        let mut registry = ModuleRegistry::new();
        registry.add(descriptor("Greeter")).unwrap();
        let greeter = registry.get("Greeter").unwrap().clone();
        compile(&CountingCompiler::default(), &greeter, &registry)
            .await
            .unwrap();

        let error = domain.load(&greeter).unwrap_err();
        assert!(matches!(error, ModuleError::LoadIntegrity { .. }));
        assert_eq!(domain.state(), GenerationState::Empty);
    }

    #[test]
    fn test_debug_map_of_another_module_fails_integrity() {
        let root = tempfile::tempdir().unwrap();
        let mut domain = ModuleDomain::new(root.path()).unwrap();
        let greeter = descriptor("Greeter");
        let foreign = DebugMap {
            identity: "Bank".to_string(),
            original_path: PathBuf::from("modules/bank.rs"),
            source_text: String::new(),
        };
        greeter.store_compiled(CompiledModule::new(b"image".to_vec(), foreign.encode().unwrap()));

        let error = domain.load(&greeter).unwrap_err();
        assert!(
            matches!(error, ModuleError::LoadIntegrity { ref reason, .. } if reason.contains("Bank"))
        );
    }
}
