//! Compiler/linker: turns module source into a loadable image.
//!
//! [`compile`] is the entry point used by the manager. It serves cached images,
//! checks that every required dependency already has an image and then hands
//! the work to a [`ModuleCompiler`]. The production implementation is
//! [`RustcCompiler`]; tests substitute their own.

mod diagnostics;
mod glue;
mod references;
mod rustc;
mod stage;

pub use diagnostics::{collect_errors, parse_diagnostics, Diagnostic};
pub use glue::{generate_glue, manifest_for, GLUE_FILE_NAME};
pub use references::host_library_dirs;
pub use rustc::{RustcCompiler, RustcConfig};
pub use stage::{blank_markers, staged_source};

use crate::error::ModuleError;
use crate::registry::ModuleRegistry;
use crate::source::ModuleDescriptor;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A compiled module: the native library image and its debug map.
///
/// Both buffers are shared, so clones of a cached result refer to the same bytes.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub image: Arc<[u8]>,
    pub debug_map: Arc<[u8]>,
}

impl CompiledModule {
    pub fn new(image: impl Into<Arc<[u8]>>, debug_map: impl Into<Arc<[u8]>>) -> Self {
        Self {
            image: image.into(),
            debug_map: debug_map.into(),
        }
    }
}

/// Maps a compiled image back to the source it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugMap {
    pub identity: String,
    pub original_path: PathBuf,
    pub source_text: String,
}

impl DebugMap {
    /// Gzip-compressed JSON.
    pub fn encode(&self) -> Result<Vec<u8>, ModuleError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ModuleError::integrity(&self.identity, format!("debug map: {}", e)))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| ModuleError::integrity(&self.identity, format!("debug map: {}", e)))
    }

    pub fn decode(identity: &str, bytes: &[u8]) -> Result<DebugMap, ModuleError> {
        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| ModuleError::integrity(identity, format!("unreadable debug map: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| ModuleError::integrity(identity, format!("invalid debug map: {}", e)))
    }
}

/// The image of an already compiled module, made available to later compilations.
#[derive(Debug, Clone)]
pub struct ReferencedImage {
    pub identity: String,
    pub image: Arc<[u8]>,
}

/// Everything a compiler needs to build one module.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub identity: String,
    pub file_path: PathBuf,
    pub source_text: Arc<str>,
    pub references: Vec<ReferencedImage>,
}

/// Produces an image and debug map for one module in a single step.
#[async_trait]
pub trait ModuleCompiler: Send + Sync {
    async fn emit(&self, request: CompileRequest) -> Result<CompiledModule, ModuleError>;

    /// Drops build state kept for modules outside `identities`.
    async fn prune(&self, _identities: &[String]) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Compiles `descriptor`, or returns its cached image.
///
/// Every required dependency must already be compiled; otherwise this fails
/// with [`ModuleError::UnresolvedReference`], which means the caller did not
/// follow dependency order.
pub async fn compile(
    compiler: &dyn ModuleCompiler,
    descriptor: &ModuleDescriptor,
    registry: &ModuleRegistry,
) -> Result<CompiledModule, ModuleError> {
    if let Some(compiled) = descriptor.compiled() {
        debug!("Using cached image for module {}", descriptor.identity());
        return Ok(compiled.clone());
    }

    for dependency in descriptor.required_dependencies() {
        let resolved = registry
            .get(dependency)
            .is_some_and(|dep| dep.is_compiled());
        if !resolved {
            return Err(ModuleError::UnresolvedReference {
                identity: descriptor.identity().to_string(),
                dependency: dependency.clone(),
            });
        }
    }

    let references = registry
        .all()
        .iter()
        .filter(|other| other.identity() != descriptor.identity())
        .filter_map(|other| {
            other.compiled().map(|compiled| ReferencedImage {
                identity: other.identity().to_string(),
                image: compiled.image.clone(),
            })
        })
        .collect();

    let request = CompileRequest {
        identity: descriptor.identity().to_string(),
        file_path: descriptor.file_path().to_path_buf(),
        source_text: descriptor.source_text().clone(),
        references,
    };

    info!("Compiling module {}", descriptor.identity());
    let compiled = compiler.emit(request).await?;
    info!(
        "Compiled module {} ({} bytes)",
        descriptor.identity(),
        compiled.image.len()
    );
    Ok(descriptor.store_compiled(compiled).clone())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records requests and returns a fake image without running rustc.
    #[derive(Default)]
    pub(crate) struct CountingCompiler {
        pub(crate) calls: AtomicUsize,
        pub(crate) requests: Mutex<Vec<CompileRequest>>,
        pub(crate) pruned: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ModuleCompiler for CountingCompiler {
        async fn emit(&self, request: CompileRequest) -> Result<CompiledModule, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let debug_map = DebugMap {
                identity: request.identity.clone(),
                original_path: request.file_path.clone(),
                source_text: request.source_text.to_string(),
            }
            .encode()?;
            let image = format!("image:{}", request.identity).into_bytes();
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            Ok(CompiledModule::new(image, debug_map))
        }

        async fn prune(&self, identities: &[String]) -> Result<(), ModuleError> {
            if let Ok(mut pruned) = self.pruned.lock() {
                pruned.push(identities.to_vec());
            }
            Ok(())
        }
    }
}
