//! The production compiler: `rustc` run as a subprocess.

use super::diagnostics::{collect_errors, parse_diagnostics};
use super::glue::{generate_glue, GLUE_FILE_NAME};
use super::references::host_library_dirs;
use super::stage::staged_source;
use super::{CompileRequest, CompiledModule, DebugMap, ModuleCompiler};
use crate::error::ModuleError;
use crate::source::analyze_source;
use async_trait::async_trait;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// How modules are compiled.
#[derive(Debug, Clone)]
pub struct RustcConfig {
    /// The `rustc` executable.
    pub rustc: PathBuf,
    /// Staging area; one subdirectory per module.
    pub build_directory: PathBuf,
    /// `-C opt-level`
    pub opt_level: String,
    /// `-C debuginfo`
    pub debuginfo: u8,
    /// Lints passed as `-D <lint>`.
    pub deny_lints: Vec<String>,
    /// Appended verbatim before the output arguments.
    pub extra_args: Vec<String>,
}

impl Default for RustcConfig {
    fn default() -> Self {
        Self {
            rustc: PathBuf::from("rustc"),
            build_directory: std::env::temp_dir().join("horizon-modules"),
            opt_level: "1".to_string(),
            debuginfo: 2,
            deny_lints: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

/// Compiles each module into a `cdylib` with `rustc`.
#[derive(Debug, Clone)]
pub struct RustcCompiler {
    config: RustcConfig,
    host_library_dirs: Vec<PathBuf>,
}

impl RustcCompiler {
    pub fn new(config: RustcConfig) -> Self {
        Self {
            host_library_dirs: host_library_dirs(),
            config,
        }
    }

    pub fn config(&self) -> &RustcConfig {
        &self.config
    }

    /// Runs `rustc --version`; used to check the toolchain before loading modules.
    pub async fn version(&self) -> Result<String, ModuleError> {
        let output = Command::new(&self.config.rustc)
            .arg("--version")
            .output()
            .await
            .map_err(|source| ModuleError::Toolchain {
                program: self.config.rustc.clone(),
                source,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn arguments(&self, layout: &BuildLayout, original_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--edition".to_string(),
            "2021".to_string(),
            "--crate-type".to_string(),
            "cdylib".to_string(),
            "--crate-name".to_string(),
            layout.crate_name.clone(),
            "--error-format".to_string(),
            "json".to_string(),
            "-C".to_string(),
            format!("opt-level={}", self.config.opt_level),
            "-C".to_string(),
            format!("debuginfo={}", self.config.debuginfo),
            format!(
                "--remap-path-prefix={}={}",
                layout.source_dir.display(),
                original_dir.display()
            ),
            "-L".to_string(),
            format!("native={}", layout.refs_dir.display()),
        ];
        for dir in &self.host_library_dirs {
            args.push("-L".to_string());
            args.push(format!("native={}", dir.display()));
        }
        for lint in &self.config.deny_lints {
            args.push("-D".to_string());
            args.push(lint.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push("-o".to_string());
        args.push(layout.image_path.display().to_string());
        args.push(layout.staged_path.display().to_string());
        args
    }
}

/// Where one module is staged and built.
struct BuildLayout {
    crate_name: String,
    root: PathBuf,
    source_dir: PathBuf,
    staged_path: PathBuf,
    glue_path: PathBuf,
    refs_dir: PathBuf,
    image_path: PathBuf,
}

impl BuildLayout {
    fn new(build_directory: &Path, identity: &str, file_path: &Path) -> Self {
        let root = build_directory.join(identity);
        let source_dir = root.join("src");
        let file_name = file_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| format!("{}.rs", identity).into());
        let crate_name = format!("horizon_module_{}", identity.to_lowercase());
        Self {
            staged_path: source_dir.join(file_name),
            glue_path: source_dir.join(GLUE_FILE_NAME),
            refs_dir: root.join("refs"),
            image_path: root.join(format!("{}{}{}", DLL_PREFIX, crate_name, DLL_SUFFIX)),
            source_dir,
            crate_name,
            root,
        }
    }
}

async fn write(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), ModuleError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ModuleError::io(path, e))
}

async fn create_dir(path: &Path) -> Result<(), ModuleError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| ModuleError::io(path, e))
}

#[async_trait]
impl ModuleCompiler for RustcCompiler {
    async fn emit(&self, request: CompileRequest) -> Result<CompiledModule, ModuleError> {
        let syntax = analyze_source(&request.source_text, &request.file_path)?;
        if syntax.identity != request.identity {
            return Err(ModuleError::malformed(
                &request.file_path,
                format!(
                    "source now declares {} instead of {}",
                    syntax.identity, request.identity
                ),
            ));
        }
        let staged = staged_source(&request.source_text, &request.file_path)?;
        let glue = generate_glue(&syntax, &request.file_path)?;

        let layout = BuildLayout::new(&self.config.build_directory, &request.identity, &request.file_path);
        // Start from an empty module directory; earlier builds leave nothing behind.
        if tokio::fs::try_exists(&layout.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&layout.root)
                .await
                .map_err(|e| ModuleError::io(&layout.root, e))?;
        }
        create_dir(&layout.source_dir).await?;
        create_dir(&layout.refs_dir).await?;
        write(&layout.staged_path, &staged).await?;
        write(&layout.glue_path, &glue).await?;

        for reference in &request.references {
            let name = format!(
                "{}horizon_module_{}{}",
                DLL_PREFIX,
                reference.identity.to_lowercase(),
                DLL_SUFFIX
            );
            write(&layout.refs_dir.join(name), &reference.image[..]).await?;
        }

        let original_dir = request
            .file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let args = self.arguments(&layout, &original_dir);
        debug!("{} {}", self.config.rustc.display(), args.join(" "));

        let output = Command::new(&self.config.rustc)
            .args(&args)
            .output()
            .await
            .map_err(|source| ModuleError::Toolchain {
                program: self.config.rustc.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = parse_diagnostics(&stderr);
        for diagnostic in diagnostics.iter().filter(|d| d.is_warning()) {
            warn!("Module {}: {}", request.identity, diagnostic.text().trim_end());
        }

        if let Some(errors) = collect_errors(&diagnostics) {
            return Err(ModuleError::Compilation {
                identity: request.identity.clone(),
                diagnostics: errors,
            });
        }
        if !output.status.success() {
            return Err(ModuleError::Compilation {
                identity: request.identity.clone(),
                diagnostics: format!("rustc exited with {}\n{}", output.status, stderr.trim_end()),
            });
        }

        let image = tokio::fs::read(&layout.image_path)
            .await
            .map_err(|e| ModuleError::io(&layout.image_path, e))?;
        let debug_map = DebugMap {
            identity: request.identity.clone(),
            original_path: request.file_path.clone(),
            source_text: request.source_text.to_string(),
        }
        .encode()?;

        Ok(CompiledModule::new(image, debug_map))
    }

    /// Deletes build directories of modules that are no longer registered.
    async fn prune(&self, identities: &[String]) -> Result<(), ModuleError> {
        let build_directory = &self.config.build_directory;
        if !tokio::fs::try_exists(build_directory).await.unwrap_or(false) {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(build_directory)
            .await
            .map_err(|e| ModuleError::io(build_directory, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ModuleError::io(build_directory, e))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.is_ok_and(|kind| kind.is_dir());
            let registered = entry
                .file_name()
                .to_str()
                .is_some_and(|name| identities.iter().any(|identity| identity == name));
            if is_dir && !registered {
                debug!("Removing stale build directory {}", path.display());
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| ModuleError::io(&path, e))?;
            }
        }
        Ok(())
    }
}
