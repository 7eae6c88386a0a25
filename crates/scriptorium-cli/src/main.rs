//! Scriptorium CLI
//!
//! Inspect and manage pipeline runs on disk: manifest hashes, checkpoint
//! status, resumability, budget profiles, and publishing or discarding
//! staged output.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use scriptorium_core::{manifest_hash, manifest_hash_bytes, Budget, ExecutionMode};
use scriptorium_runtime::{RuntimeConfig, StreamingBundle};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scriptorium")]
#[command(about = "Inspect and manage Scriptorium pipeline runs", long_about = None)]
struct Cli {
    /// Log more (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the manifest hash of a file
    Hash {
        /// JSON and YAML files are hashed by content, anything else byte for byte
        file: PathBuf,
    },

    /// Show the staged state and checkpoint of a run
    Status {
        /// Output root
        #[arg(long)]
        root: PathBuf,
        /// Run id
        #[arg(long)]
        run: String,
    },

    /// Exit 0 if the run can resume under the given manifest, 1 otherwise
    CanResume {
        /// Output root
        #[arg(long)]
        root: PathBuf,
        /// Run id
        #[arg(long)]
        run: String,
        /// Manifest file the run is started with
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Print budget limits
    Budget {
        /// Print this mode's canned profile
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Runtime config file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Publish a run's staged output
    Finalize {
        /// Output root
        #[arg(long)]
        root: PathBuf,
        /// Run id
        #[arg(long)]
        run: String,
    },

    /// Discard a run's staged output
    Cleanup {
        /// Output root
        #[arg(long)]
        root: PathBuf,
        /// Run id
        #[arg(long)]
        run: String,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Hash { file } => {
            println!("{}", file_manifest_hash(&file)?);
        }
        Commands::Status { root, run } => {
            let bundle = StreamingBundle::new(root, run)?;
            let status = json!({
                "run_id": bundle.run_id(),
                "staged": bundle.staging_dir().is_dir(),
                "finalized": bundle.is_finalized(),
                "artifacts": bundle.artifact_ids()?,
                "checkpoint": bundle.load_checkpoint()?,
            });
            print_json(&status)?;
        }
        Commands::CanResume {
            root,
            run,
            manifest,
        } => {
            let hash = file_manifest_hash(&manifest)?;
            let bundle = StreamingBundle::new(root, run)?;
            if !bundle.can_resume(&hash) {
                println!("not resumable");
                return Ok(ExitCode::FAILURE);
            }
            println!("resumable");
        }
        Commands::Budget { mode, config } => {
            let (mode, budget) = resolve_budget(mode, config.as_deref())?;
            print_json(&json!({ "mode": mode, "budget": budget }))?;
        }
        Commands::Finalize { root, run } => {
            let bundle = StreamingBundle::new(root, run)?;
            let summary = bundle
                .finalize()
                .with_context(|| format!("finalizing run '{}'", bundle.run_id()))?;
            print_json(&summary)?;
        }
        Commands::Cleanup { root, run } => {
            let bundle = StreamingBundle::new(root, run)?;
            bundle.cleanup()?;
            info!(run_id = %bundle.run_id(), "Staging area discarded");
            println!("discarded {}", bundle.staging_dir().display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

/// Hash JSON and YAML by parsed content so formatting and key order do not
/// matter; hash anything else as raw bytes.
fn file_manifest_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let parsed: Option<Value> = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing JSON manifest {}", path.display()))?,
        ),
        Some("yaml" | "yml") => Some(
            serde_yaml::from_slice(&bytes)
                .with_context(|| format!("parsing YAML manifest {}", path.display()))?,
        ),
        _ => None,
    };

    let hash = match parsed {
        Some(value) => manifest_hash(&value)?,
        None => manifest_hash_bytes(&bytes),
    };
    debug!(path = %path.display(), %hash, "Manifest hashed");
    Ok(hash)
}

/// An explicit mode prints its profile; otherwise the config file and
/// environment decide.
fn resolve_budget(mode: Option<ExecutionMode>, config: Option<&Path>) -> Result<(ExecutionMode, Budget)> {
    if let Some(mode) = mode {
        return Ok((mode, Budget::for_mode(mode)));
    }
    let config = match config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    }
    .apply_env()?;
    Ok((config.mode, config.effective_budget()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_can_resume_with_verbosity() {
        let cli = Cli::try_parse_from([
            "scriptorium", "-vv", "can-resume", "--root", "out", "--run", "r1", "--manifest",
            "m.json",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::CanResume { root, run, manifest } => {
                assert_eq!(root, PathBuf::from("out"));
                assert_eq!(run, "r1");
                assert_eq!(manifest, PathBuf::from("m.json"));
            }
            _ => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["scriptorium", "budget", "--mode", "deep"]).is_ok());
        assert!(Cli::try_parse_from(["scriptorium", "budget", "--mode", "thorough"]).is_err());
    }

    #[test]
    fn test_json_manifest_hash_ignores_formatting() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        fs::write(&a, r#"{"topic": "dna repair", "depth": 2}"#).unwrap();
        fs::write(&b, "{\n  \"depth\": 2,\n  \"topic\": \"dna repair\"\n}\n").unwrap();

        assert_eq!(file_manifest_hash(&a).unwrap(), file_manifest_hash(&b).unwrap());
    }

    #[test]
    fn test_yaml_and_json_manifests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("m.json");
        let yaml_path = dir.path().join("m.yaml");
        fs::write(&json_path, r#"{"topic": "dna repair"}"#).unwrap();
        fs::write(&yaml_path, "topic: dna repair\n").unwrap();

        assert_eq!(
            file_manifest_hash(&json_path).unwrap(),
            file_manifest_hash(&yaml_path).unwrap()
        );
    }

    #[test]
    fn test_other_files_hash_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.txt");
        fs::write(&path, "topic = dna repair").unwrap();

        assert_eq!(
            file_manifest_hash(&path).unwrap(),
            manifest_hash_bytes(b"topic = dna repair")
        );
    }

    #[test]
    fn test_invalid_json_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();

        assert!(file_manifest_hash(&path).is_err());
    }

    #[test]
    fn test_explicit_mode_prints_profile() {
        let (mode, budget) = resolve_budget(Some(ExecutionMode::Deep), None).unwrap();
        assert_eq!(mode, ExecutionMode::Deep);
        assert_eq!(budget.max_time, Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_budget_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.yaml");
        fs::write(&path, "budget:\n  max_tokens: 1000\n  max_time: 2m\n  max_api_calls: 3\n  max_chunks: 4\n")
            .unwrap();

        let (_, budget) = resolve_budget(None, Some(&path)).unwrap();
        assert_eq!(budget.max_tokens, 1000);
        assert_eq!(budget.max_time, Duration::from_secs(120));
    }
}
