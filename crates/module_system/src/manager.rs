//! Module manager: discovery, compilation, loading, commands and hot reload.
//!
//! The manager owns every piece of host state explicitly: the registry, the
//! loading domain, the command dispatcher and the compiler. A load pass runs
//! in fixed phases:
//!
//! 1. Discover `.rs` files in the module directory (sorted by file name)
//! 2. Extract descriptors in parallel and register them
//! 3. Order by required dependencies, reporting missing ones and cycles
//! 4. Compile and load each module in order
//! 5. Register commands, then bind references among the modules still active
//! 6. Run `on_modules_loaded` (and the server hook once a server exists)
//!
//! A failing module is excluded for the rest of the generation; it never
//! aborts the pass.

use crate::abi::ServerHandle;
use crate::commands::{CommandDispatcher, Dispatched};
use crate::compiler::{compile, ModuleCompiler};
use crate::domain::{ModuleDomain, ModuleInstance};
use crate::error::{CommandError, ModuleError};
use crate::ordering::dependency_order;
use crate::registry::ModuleRegistry;
use crate::source::{extract, ModuleDescriptor};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one load pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Identities of the modules that are loaded and active.
    pub loaded: Vec<String>,
    /// Modules (or files, when no identity could be derived) that were excluded.
    pub failed: Vec<(String, ModuleError)>,
}

impl LoadReport {
    fn fail(&mut self, name: impl Into<String>, error: ModuleError) {
        let name = name.into();
        error!("Module {} excluded: {}", name, error);
        self.failed.push((name, error));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleStats {
    pub generation: u64,
    pub registered: usize,
    pub compiled: usize,
    pub loaded: usize,
    pub commands: usize,
    pub excluded: usize,
}

// ============================================================================
// Module Manager
// ============================================================================

/// Owns the module pipeline of a host.
pub struct ModuleManager {
    /// Directory scanned for module sources
    module_directory: PathBuf,
    registry: ModuleRegistry,
    domain: ModuleDomain,
    dispatcher: CommandDispatcher,
    compiler: Arc<dyn ModuleCompiler>,
    /// Excluded modules of the current generation, with the reason
    excluded: BTreeMap<String, String>,
    /// Only these identities are loaded, when set
    whitelist: Option<BTreeSet<String>>,
    /// Set once the host has created its server
    server: Option<ServerHandle>,
}

impl ModuleManager {
    /// Creates a manager; loaded images are kept under `domain_root`.
    pub fn new(
        module_directory: impl AsRef<Path>,
        domain_root: impl Into<PathBuf>,
        compiler: Arc<dyn ModuleCompiler>,
    ) -> Result<Self, ModuleError> {
        Ok(Self {
            module_directory: module_directory.as_ref().to_path_buf(),
            registry: ModuleRegistry::new(),
            domain: ModuleDomain::new(domain_root)?,
            dispatcher: CommandDispatcher::new(),
            compiler,
            excluded: BTreeMap::new(),
            whitelist: None,
            server: None,
        })
    }

    /// Restricts loading to the given identities. An empty list lifts the restriction.
    pub fn with_whitelist(mut self, identities: impl IntoIterator<Item = String>) -> Self {
        let whitelist: BTreeSet<String> = identities.into_iter().collect();
        self.whitelist = if whitelist.is_empty() { None } else { Some(whitelist) };
        self
    }

    pub fn module_directory(&self) -> &Path {
        &self.module_directory
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn domain(&self) -> &ModuleDomain {
        &self.domain
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn excluded(&self) -> &BTreeMap<String, String> {
        &self.excluded
    }

    /// The live instance of `identity`, if it loaded and was not excluded.
    pub fn instance(&self, identity: &str) -> Option<&Rc<ModuleInstance>> {
        if self.excluded.contains_key(identity) {
            return None;
        }
        self.domain.instance(identity)
    }

    pub fn stats(&self) -> ModuleStats {
        ModuleStats {
            generation: self.domain.generation(),
            registered: self.registry.len(),
            compiled: self.registry.all().iter().filter(|d| d.is_compiled()).count(),
            loaded: self.domain.instances().len(),
            commands: self.dispatcher.len(),
            excluded: self.excluded.len(),
        }
    }

    /// Module source files in the module directory, sorted by file name.
    pub async fn discover_modules(&self) -> Result<Vec<PathBuf>, ModuleError> {
        if !tokio::fs::try_exists(&self.module_directory).await.unwrap_or(false) {
            warn!(
                "Module directory does not exist: {}",
                self.module_directory.display()
            );
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.module_directory)
            .await
            .map_err(|e| ModuleError::io(&self.module_directory, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ModuleError::io(&self.module_directory, e))?
        {
            let path = entry.path();
            let is_source = path.extension().is_some_and(|ext| ext == "rs");
            let is_file = entry.file_type().await.is_ok_and(|kind| kind.is_file());
            if is_source && is_file {
                paths.push(path);
            }
        }

        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!(
            "Discovered {} module sources in {}",
            paths.len(),
            self.module_directory.display()
        );
        Ok(paths)
    }

    /// Runs a full load pass over the module directory.
    pub async fn load_all_modules(&mut self) -> Result<LoadReport, ModuleError> {
        self.load_from(HashMap::new()).await
    }

    async fn load_from(
        &mut self,
        mut previous: HashMap<PathBuf, Arc<ModuleDescriptor>>,
    ) -> Result<LoadReport, ModuleError> {
        let mut report = LoadReport::default();
        let paths = self.discover_modules().await?;
        info!(
            "Loading modules from {} ({} sources, generation {})",
            self.module_directory.display(),
            paths.len(),
            self.domain.generation()
        );

        // Phase 1: read and extract
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => sources.push((path, text)),
                Err(e) => report.fail(path.display().to_string(), ModuleError::io(&path, e)),
            }
        }
        let extracted: Vec<(PathBuf, Result<ModuleDescriptor, ModuleError>)> = sources
            .into_par_iter()
            .map(|(path, text)| {
                let descriptor = extract(text, path.clone());
                (path, descriptor)
            })
            .collect();

        // Phase 2: register, reusing unchanged descriptors with their images
        let mut changed = HashSet::new();
        for (path, result) in extracted {
            let descriptor = match result {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    report.fail(path.display().to_string(), e);
                    continue;
                }
            };
            if let Some(whitelist) = &self.whitelist {
                if !whitelist.contains(descriptor.identity()) {
                    debug!("Module {} is not whitelisted, skipping", descriptor.identity());
                    continue;
                }
            }

            let descriptor = match previous.remove(&path) {
                Some(old) if old.same_source(&descriptor) => {
                    debug!("Module {} is unchanged", old.identity());
                    old
                }
                _ => {
                    changed.insert(descriptor.identity().to_string());
                    Arc::new(descriptor)
                }
            };
            let identity = descriptor.identity().to_string();
            if let Err(e) = self.registry.add(descriptor) {
                report.fail(identity, e);
            }
        }
        self.invalidate_dependents(changed)?;

        let identities: Vec<String> = self.registry.identities().map(str::to_string).collect();
        if let Err(e) = self.compiler.prune(&identities).await {
            warn!("Failed to prune stale build state: {}", e);
        }

        // Phase 3: order
        let order = dependency_order(&self.registry);
        for (identity, e) in order.failures {
            self.exclude(&mut report, identity, e);
        }

        // Phase 4: compile and load
        let mut loaded = Vec::new();
        for identity in order.order {
            let Some(descriptor) = self.registry.get(&identity).cloned() else {
                continue;
            };
            let missing = descriptor
                .required_dependencies()
                .iter()
                .find(|dependency| self.excluded.contains_key(dependency.as_str()))
                .cloned();
            if let Some(dependency) = missing {
                let e = ModuleError::MissingDependency {
                    identity: identity.clone(),
                    dependency,
                };
                self.exclude(&mut report, identity, e);
                continue;
            }

            if let Err(e) = compile(self.compiler.as_ref(), &descriptor, &self.registry).await {
                self.exclude(&mut report, identity, e);
                continue;
            }
            match self.domain.load(&descriptor) {
                Ok(instance) => loaded.push(instance),
                Err(e) => self.exclude(&mut report, identity, e),
            }
        }

        // Phase 5: commands, then references among the survivors
        for instance in &loaded {
            let identity = instance.identity().to_string();
            match self.dispatcher.register_commands(&identity, instance.command_specs()) {
                Ok(count) => debug!("Module {} registered {} commands", identity, count),
                Err(e) => {
                    self.dispatcher.unregister_commands(&identity);
                    self.exclude(&mut report, identity, e.into());
                }
            }
        }
        self.exclude_dependents_of_excluded(&mut report, &loaded);

        let active: Vec<Rc<ModuleInstance>> = loaded
            .into_iter()
            .filter(|instance| !self.excluded.contains_key(instance.identity()))
            .collect();
        for instance in &active {
            self.bind_references(instance);
        }

        // Phase 6: lifecycle hooks
        for instance in &active {
            if let Err(e) = instance.on_modules_loaded() {
                error!("{}", e);
            }
        }
        if let Some(server) = &self.server {
            for instance in &active {
                if let Err(e) = instance.on_creating_server_instance(server) {
                    error!("{}", e);
                }
            }
        }

        report.loaded = active
            .iter()
            .map(|instance| instance.identity().to_string())
            .collect();
        info!(
            "Module loading complete: {} loaded, {} excluded, {} commands registered",
            report.loaded.len(),
            report.failed.len(),
            self.dispatcher.len()
        );
        Ok(report)
    }

    fn exclude(&mut self, report: &mut LoadReport, identity: String, error: ModuleError) {
        self.excluded.insert(identity.clone(), error.to_string());
        report.fail(identity, error);
    }

    /// Excludes loaded modules whose required dependency was excluded after
    /// loading, transitively, and removes their commands.
    fn exclude_dependents_of_excluded(
        &mut self,
        report: &mut LoadReport,
        loaded: &[Rc<ModuleInstance>],
    ) {
        loop {
            let dependent = loaded.iter().find_map(|instance| {
                let identity = instance.identity();
                if self.excluded.contains_key(identity) {
                    return None;
                }
                let descriptor = self.registry.get(identity)?;
                descriptor
                    .required_dependencies()
                    .iter()
                    .find(|dependency| self.excluded.contains_key(dependency.as_str()))
                    .map(|dependency| (identity.to_string(), dependency.clone()))
            });
            let Some((identity, dependency)) = dependent else {
                return;
            };
            self.dispatcher.unregister_commands(&identity);
            let e = ModuleError::MissingDependency {
                identity: identity.clone(),
                dependency,
            };
            self.exclude(report, identity, e);
        }
    }

    /// Drops cached images of modules that require a changed module, transitively.
    fn invalidate_dependents(&mut self, mut changed: HashSet<String>) -> Result<(), ModuleError> {
        loop {
            let stale: Vec<Arc<ModuleDescriptor>> = self
                .registry
                .all()
                .iter()
                .filter(|descriptor| {
                    descriptor.is_compiled()
                        && !changed.contains(descriptor.identity())
                        && descriptor
                            .required_dependencies()
                            .iter()
                            .any(|dependency| changed.contains(dependency))
                })
                .cloned()
                .collect();
            if stale.is_empty() {
                return Ok(());
            }
            for descriptor in stale {
                debug!(
                    "Module {} depends on a changed module, recompiling",
                    descriptor.identity()
                );
                changed.insert(descriptor.identity().to_string());
                self.registry.replace(descriptor.without_image())?;
            }
        }
    }

    fn bind_references(&self, instance: &ModuleInstance) {
        for identity in &instance.manifest().module_refs {
            let loaded = self.domain.is_loaded(identity) && !self.excluded.contains_key(identity);
            match instance.bind_reference(identity, loaded) {
                Ok(true) => debug!(
                    "Bound reference {} -> {} (loaded: {})",
                    instance.identity(),
                    identity,
                    loaded
                ),
                Ok(false) => warn!(
                    "Module {} declares no field for reference {}",
                    instance.identity(),
                    identity
                ),
                Err(e) => error!("{}", e),
            }
        }
    }

    /// Parses and runs one line of operator input.
    ///
    /// `module_reload` is reported as [`Dispatched::ReloadRequested`]; the
    /// caller decides when to run [`reload`](Self::reload).
    pub fn dispatch(&self, raw_input: &str) -> Result<Dispatched, CommandError> {
        self.dispatcher.dispatch(raw_input)
    }

    /// Hot reload: unloads the whole generation and loads the directory again.
    ///
    /// Modules whose source is unchanged keep their compiled image, unless
    /// they require a module that changed.
    pub async fn reload(&mut self) -> Result<LoadReport, ModuleError> {
        info!("Reloading modules (generation {})", self.domain.generation());
        self.unload_generation()?;

        let previous: HashMap<PathBuf, Arc<ModuleDescriptor>> = self
            .registry
            .all()
            .iter()
            .map(|descriptor| (descriptor.file_path().to_path_buf(), descriptor.clone()))
            .collect();
        self.registry.reset();
        self.excluded.clear();

        self.load_from(previous).await
    }

    fn unload_generation(&mut self) -> Result<(), ModuleError> {
        for identity in self.registry.identities() {
            self.dispatcher.unregister_commands(identity);
        }
        for instance in self.domain.instances() {
            if self.excluded.contains_key(instance.identity()) {
                continue;
            }
            if let Err(e) = instance.on_module_unloading() {
                error!("{}", e);
            }
        }
        self.domain.unload_all()?;
        Ok(())
    }

    /// Records the host server and passes it to every active module.
    pub fn notify_server_created(&mut self, server: ServerHandle) {
        info!("Server {} created on {}", server.name, server.bind_address);
        for instance in self.domain.instances() {
            if self.excluded.contains_key(instance.identity()) {
                continue;
            }
            if let Err(e) = instance.on_creating_server_instance(&server) {
                error!("{}", e);
            }
        }
        self.server = Some(server);
    }

    /// Unloads every module. The manager can load again afterwards.
    pub fn shutdown(&mut self) -> Result<(), ModuleError> {
        info!("Shutting down {} modules", self.domain.instances().len());
        self.unload_generation()?;
        self.registry.reset();
        self.excluded.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::CountingCompiler;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        modules: TempDir,
        domain: TempDir,
        compiler: Arc<CountingCompiler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                modules: tempfile::tempdir().unwrap(),
                domain: tempfile::tempdir().unwrap(),
                compiler: Arc::new(CountingCompiler::default()),
            }
        }

        fn write(&self, file: &str, text: &str) {
            std::fs::write(self.modules.path().join(file), text).unwrap();
        }

        fn manager(&self) -> ModuleManager {
            ModuleManager::new(self.modules.path(), self.domain.path(), self.compiler.clone()).unwrap()
        }

        fn compile_calls(&self) -> usize {
            self.compiler.calls.load(Ordering::SeqCst)
        }
    }

    fn module(identity: &str, attrs: &str) -> String {
        format!("{} pub struct {1}; impl ServerModule for {1} {{}}", attrs, identity)
    }

    fn failure<'a>(report: &'a LoadReport, name: &str) -> &'a ModuleError {
        &report
            .failed
            .iter()
            .find(|(failed, _)| failed == name)
            .unwrap_or_else(|| panic!("{} did not fail: {:?}", name, report.failed))
            .1
    }

    #[tokio::test]
    async fn test_discovery_is_sorted_and_only_sources() {
        let fixture = Fixture::new();
        fixture.write("b_shop.rs", &module("Shop", ""));
        fixture.write("a_bank.rs", &module("Bank", ""));
        fixture.write("notes.txt", "not a module");
        std::fs::create_dir(fixture.modules.path().join("dir.rs")).unwrap();

        let paths = fixture.manager().discover_modules().await.unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_bank.rs", "b_shop.rs"]);
    }

    #[tokio::test]
    async fn test_missing_directory_discovers_nothing() {
        let fixture = Fixture::new();
        let manager = ModuleManager::new(
            fixture.modules.path().join("missing"),
            fixture.domain.path(),
            fixture.compiler.clone(),
        )
        .unwrap();
        assert!(manager.discover_modules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_exclude_only_the_affected_modules() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("broken.rs", "pub struct Nothing;");
        fixture.write("shop.rs", &module("Shop", "#[require_module(Ghost)]"));
        fixture.write("ping.rs", &module("Ping", "#[require_module(Pong)]"));
        fixture.write("pong.rs", &module("Pong", "#[require_module(Ping)]"));

        let mut manager = fixture.manager();
        let report = manager.load_all_modules().await.unwrap();

        assert!(matches!(
            failure(&report, &fixture.modules.path().join("broken.rs").display().to_string()),
            ModuleError::Malformed { .. }
        ));
        assert!(matches!(
            failure(&report, "Shop"),
            ModuleError::MissingDependency { dependency, .. } if dependency == "Ghost"
        ));
        assert!(matches!(failure(&report, "Ping"), ModuleError::DependencyCycle { .. }));
        assert!(matches!(failure(&report, "Pong"), ModuleError::DependencyCycle { .. }));
        // The fake image compiles but cannot be opened as a library.
        assert!(matches!(failure(&report, "Bank"), ModuleError::LoadIntegrity { .. }));

        assert_eq!(fixture.compile_calls(), 1);
        assert!(report.loaded.is_empty());
        assert_eq!(manager.stats().registered, 4);
        assert!(manager.excluded().contains_key("Shop"));
    }

    #[tokio::test]
    async fn test_dependents_of_failed_modules_are_not_compiled() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("shop.rs", &module("Shop", "#[require_module(Bank)]"));

        let mut manager = fixture.manager();
        let report = manager.load_all_modules().await.unwrap();

        assert!(matches!(failure(&report, "Bank"), ModuleError::LoadIntegrity { .. }));
        assert!(matches!(
            failure(&report, "Shop"),
            ModuleError::MissingDependency { dependency, .. } if dependency == "Bank"
        ));
        assert_eq!(fixture.compile_calls(), 1);
    }

    #[tokio::test]
    async fn test_whitelist_skips_other_modules() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("shop.rs", &module("Shop", ""));

        let mut manager = fixture.manager().with_whitelist(vec!["Shop".to_string()]);
        let report = manager.load_all_modules().await.unwrap();

        assert_eq!(manager.registry().identities().collect::<Vec<_>>(), vec!["Shop"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fixture.compile_calls(), 1);
    }

    #[tokio::test]
    async fn test_reload_keeps_images_of_unchanged_sources() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("shop.rs", &module("Shop", ""));
        fixture.write("audit.rs", &module("Audit", ""));

        let mut manager = fixture.manager();
        manager.load_all_modules().await.unwrap();
        assert_eq!(fixture.compile_calls(), 3);
        assert_eq!(manager.stats().generation, 1);

        manager.reload().await.unwrap();
        assert_eq!(fixture.compile_calls(), 3);
        assert_eq!(manager.stats().generation, 2);
        assert_eq!(manager.stats().compiled, 3);

        fixture.write("audit.rs", &format!("{}\n// changed", module("Audit", "")));
        manager.reload().await.unwrap();
        assert_eq!(fixture.compile_calls(), 4);
    }

    #[tokio::test]
    async fn test_removed_modules_are_pruned_from_build_state() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("shop.rs", &module("Shop", ""));

        let mut manager = fixture.manager();
        manager.load_all_modules().await.unwrap();
        std::fs::remove_file(fixture.modules.path().join("shop.rs")).unwrap();
        manager.reload().await.unwrap();

        let pruned = fixture.compiler.pruned.lock().unwrap().clone();
        assert_eq!(
            pruned,
            vec![
                vec!["Bank".to_string(), "Shop".to_string()],
                vec!["Bank".to_string()]
            ]
        );
    }

    #[tokio::test]
    async fn test_changed_dependency_recompiles_dependents() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        fixture.write("shop.rs", &module("Shop", "#[require_module(Bank)]"));

        let mut manager = fixture.manager();
        manager.load_all_modules().await.unwrap();
        // Bank fails to load, so Shop is never compiled.
        assert_eq!(fixture.compile_calls(), 1);

        let bank = manager.registry().get("Bank").unwrap().clone();
        let shop = Arc::new(extract(module("Shop", "#[require_module(Bank)]"), "shop.rs").unwrap());
        let mut registry = ModuleRegistry::new();
        registry.add(bank).unwrap();
        registry.add(shop.clone()).unwrap();
        compile(fixture.compiler.as_ref(), &shop, &registry).await.unwrap();
        manager.registry.replace(shop).unwrap();

        manager.invalidate_dependents(HashSet::from(["Bank".to_string()])).unwrap();
        assert!(!manager.registry().get("Shop").unwrap().is_compiled());
        assert!(manager.registry().get("Bank").unwrap().is_compiled());
    }

    #[tokio::test]
    async fn test_dispatch_without_modules() {
        let fixture = Fixture::new();
        let mut manager = fixture.manager();
        manager.load_all_modules().await.unwrap();

        assert_eq!(manager.dispatch("unknown command").unwrap(), Dispatched::NoMatch);
        assert_eq!(manager.dispatch("module_reload").unwrap(), Dispatched::ReloadRequested);
        assert!(matches!(manager.dispatch("module_help").unwrap(), Dispatched::Help(_)));
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let fixture = Fixture::new();
        fixture.write("bank.rs", &module("Bank", ""));
        let mut manager = fixture.manager();
        manager.load_all_modules().await.unwrap();
        manager.notify_server_created(ServerHandle {
            name: "test".to_string(),
            bind_address: "127.0.0.1:8080".to_string(),
        });

        manager.shutdown().unwrap();
        let stats = manager.stats();
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.loaded, 0);
        assert_eq!(stats.excluded, 0);
        assert_eq!(stats.generation, 2);
    }
}
