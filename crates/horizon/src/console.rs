//! Operator console.
//!
//! Reads one command per line and prints the reply. `module_reload` runs a
//! hot reload in place; everything else is dispatched to the modules.

use module_system::{Dispatched, LoadReport, ModuleManager};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Runs one line of operator input and returns the lines to print.
pub async fn execute(manager: &mut ModuleManager, line: &str) -> Vec<String> {
    match manager.dispatch(line) {
        Ok(Dispatched::Help(lines)) => lines,
        Ok(Dispatched::Invoked { key, reply }) => {
            debug!("Command '{}' completed", key);
            reply.into_iter().collect()
        }
        Ok(Dispatched::NoMatch) => Vec::new(),
        Ok(Dispatched::ReloadRequested) => match manager.reload().await {
            Ok(report) => summarize(&report),
            Err(e) => vec![format!("Reload failed: {}", e)],
        },
        Err(e) => vec![format!("Error: {}", e)],
    }
}

/// Human-readable summary of a load pass.
pub fn summarize(report: &LoadReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Loaded {} modules, {} failed",
        report.loaded.len(),
        report.failed.len()
    )];
    for (name, error) in &report.failed {
        lines.push(format!("  {}: {}", name, error));
    }
    lines
}

/// Reads commands from `input` until it is exhausted.
pub async fn run<R, W>(manager: &mut ModuleManager, input: R, output: &mut W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("⌨️ Console ready - type 'module_help' for commands");
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for reply in execute(manager, line).await {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.flush().await?;
    }
    info!("Console input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use module_system::{ModuleError, RustcCompiler, RustcConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(modules: &TempDir, work: &TempDir) -> ModuleManager {
        let compiler = RustcCompiler::new(RustcConfig {
            build_directory: work.path().join("compile"),
            ..RustcConfig::default()
        });
        ModuleManager::new(modules.path(), work.path().join("loaded"), Arc::new(compiler)).unwrap()
    }

    #[tokio::test]
    async fn test_help_and_unknown_commands() {
        let (modules, work) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let mut manager = manager(&modules, &work);

        let help = execute(&mut manager, "module_help").await;
        assert_eq!(help, vec!["No module commands are registered.".to_string()]);
        assert!(execute(&mut manager, "teleport home").await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_prints_summary() {
        let (modules, work) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        std::fs::write(modules.path().join("broken.rs"), "pub struct NotAModule;").unwrap();
        let mut manager = manager(&modules, &work);

        let lines = execute(&mut manager, "module_reload").await;
        assert_eq!(lines[0], "Loaded 0 modules, 1 failed");
        assert!(lines[1].contains("broken.rs"));
        assert_eq!(manager.domain().generation(), 2);
    }

    #[tokio::test]
    async fn test_run_writes_replies() {
        let (modules, work) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let mut manager = manager(&modules, &work);
        let mut output = Vec::new();

        run(&mut manager, &b"\nmodule_help\n  \n"[..], &mut output).await.unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "No module commands are registered.\n"
        );
    }

    #[test]
    fn test_summary_lists_failures() {
        let report = LoadReport {
            loaded: vec!["Greeter".to_string()],
            failed: vec![("Shop".to_string(), ModuleError::NotFound("Bank".to_string()))],
        };
        assert_eq!(
            summarize(&report),
            vec![
                "Loaded 1 modules, 1 failed".to_string(),
                "  Shop: Module Bank not found".to_string()
            ]
        );
    }
}
