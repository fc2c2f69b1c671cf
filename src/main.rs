//! `arbiter` command line tool
//!
//! マニフェストの検証・ハッシュ計算と、実効設定の表示を行う。

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use capability_arbiter::config::ConfigLoader;
use capability_arbiter::logging::{init_logging, LogConfig};
use capability_arbiter::manifest::{ManifestValidator, PluginManifest};

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(about = "Capability arbiter tooling for plugin manifests and configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ARBITER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest (id, version, integrity hash, signature)
    ValidateManifest {
        /// Manifest file (.json or .toml)
        path: PathBuf,
    },

    /// Print the canonical integrity hash of a manifest
    HashManifest {
        /// Manifest file (.json or .toml)
        path: PathBuf,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

/// 拡張子に応じて JSON または TOML として読み込む
fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("Failed to parse TOML manifest {}", path.display()))?,
        _ => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON manifest {}", path.display()))?,
    };
    Ok(manifest)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().to_string());
    let config = ConfigLoader::new()
        .load_from_file(config_path.as_deref())
        .load_from_env()
        .build()?;

    let log_config = if cli.verbose {
        LogConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        }
    } else {
        config.logging.clone()
    };
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Commands::ValidateManifest { path } => {
            let manifest = load_manifest(&path)?;
            let validator = ManifestValidator::new(config.validator.clone())?;
            match validator.validate_standalone(&manifest) {
                Ok(()) => {
                    info!(plugin_id = %manifest.plugin_id, "Manifest is valid");
                    println!("{}: ok", manifest.plugin_id);
                }
                Err(reason) => {
                    error!(plugin_id = %manifest.plugin_id, %reason, "Manifest rejected");
                    bail!("{}: {}", manifest.plugin_id, reason);
                }
            }
        }
        Commands::HashManifest { path } => {
            let manifest = load_manifest(&path)?;
            println!("{}", manifest.compute_integrity_hash()?);
        }
        Commands::ShowConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to encode configuration")?;
            print!("{}", text);
        }
    }

    Ok(())
}
