//! Main application entry point for the Horizon module host.
//!
//! Loads configuration, sets up logging, compiles and loads every module in
//! the module directory and then serves the operator console until stdin
//! closes or a shutdown signal arrives.

mod cli;
mod config;
mod console;
mod logging;
mod signals;

use anyhow::Context;
use cli::CliArgs;
use config::{AppConfig, ConfigOrigin};
use module_system::{ModuleManager, RustcCompiler};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

// ============================================================================
// Application
// ============================================================================

/// The host: configuration plus the module manager it drives.
pub struct Application {
    config: AppConfig,
    manager: ModuleManager,
    compiler: Arc<RustcCompiler>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and sets up logging.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let (mut config, origin) = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args);

        if let Err(e) = config.validate() {
            anyhow::bail!("Configuration validation failed: {}", e);
        }

        logging::setup_logging(&config.logging)?;
        display_banner();
        if origin == ConfigOrigin::CreatedDefault {
            info!(
                "📝 Created default configuration file: {}",
                args.config_path.display()
            );
        }

        let compiler = Arc::new(RustcCompiler::new(config.to_compiler_config()));
        let manager = ModuleManager::new(
            &config.modules.directory,
            config.domain_directory(),
            compiler.clone(),
        )
        .context("Failed to create the module domain")?
        .with_whitelist(config.modules.whitelist.clone());

        info!(
            "📂 Config: {} | Modules: {}",
            args.config_path.display(),
            config.modules.directory
        );
        Ok(Self {
            config,
            manager,
            compiler,
        })
    }

    /// Loads modules, serves the console and unloads everything on exit.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("🌟 Starting Horizon module host");
        info!("📋 Configuration Summary:");
        info!("  🌐 Server: {} on {}", self.config.server.name, self.config.server.bind_address);
        info!("  🔌 Module directory: {}", self.config.modules.directory);
        info!("  🔨 Build directory: {}", self.config.modules.build_directory);

        match self.compiler.version().await {
            Ok(version) => info!("  🦀 Compiler: {}", version),
            Err(e) => warn!("⚠️ {} - modules cannot be compiled", e),
        }

        if self.config.modules.auto_load {
            let report = self.manager.load_all_modules().await?;
            for line in console::summarize(&report) {
                info!("{}", line);
            }
        } else {
            info!("Auto-load disabled; use 'module_reload' to load modules");
        }
        self.manager.notify_server_created(self.config.server_handle());

        let stats = self.manager.stats();
        info!(
            "📊 Generation {} | {} modules loaded | {} commands",
            stats.generation, stats.loaded, stats.commands
        );
        info!("✅ Horizon is now running! Press Ctrl+C to shut down");

        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        tokio::select! {
            result = console::run(&mut self.manager, stdin, &mut stdout) => {
                if let Err(e) = result {
                    error!("❌ Console error: {}", e);
                }
            }
            result = signals::shutdown_signal() => {
                result?;
                info!("🛑 Shutdown signal received");
            }
        }

        info!("🧹 Unloading modules...");
        self.manager.shutdown()?;
        info!("👋 Horizon shut down cleanly");
        Ok(())
    }
}

/// Displays the application banner.
fn display_banner() {
    println!();
    println!("  ██╗  ██╗ ██████╗ ██████╗ ██╗███████╗ ██████╗ ███╗   ██╗");
    println!("  ██║  ██║██╔═══██╗██╔══██╗██║╚══███╔╝██╔═══██╗████╗  ██║");
    println!("  ███████║██║   ██║██████╔╝██║  ███╔╝ ██║   ██║██╔██╗ ██║");
    println!("  ██╔══██║██║   ██║██╔══██╗██║ ███╔╝  ██║   ██║██║╚██╗██║");
    println!("  ██║  ██║╚██████╔╝██║  ██║██║███████╗╚██████╔╝██║ ╚████║");
    println!("  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝╚══════╝ ╚═════╝ ╚═╝  ╚═══╝");
    println!();
    println!("                   Horizon Module Host v{}", env!("CARGO_PKG_VERSION"));
    println!();
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let app = Application::new(args).await?;
    if let Err(e) = app.run().await {
        error!("❌ Application error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
