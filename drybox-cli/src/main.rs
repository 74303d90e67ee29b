mod config;
mod logging;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use std::path::PathBuf;

use drybox_core::adapter::{AdapterInstance, AdapterRegistry};
use drybox_core::builtin_adapters::{EchoByteLink, ToneAudioBlock};
use drybox_core::{Engine, EngineConfig, ScenarioResolved};

use config::LoggingConfig;
use logging::{LogEvent, StructuredLogger};

#[derive(Parser, Debug)]
#[command(author, version, about = "DryBox deterministic link simulator", long_about = None)]
struct Cli {
    /// Path to the scenario YAML document.
    #[arg(long)]
    scenario: PathBuf,

    /// Left-side adapter spec, resolved against the compiled-in registry
    /// (e.g. "echo" or "builtin:echo").
    #[arg(long)]
    left: String,

    /// Right-side adapter spec.
    #[arg(long)]
    right: String,

    /// Output directory for this run (or sweep root).
    #[arg(long)]
    out: PathBuf,

    /// Logical tick period in milliseconds.
    #[arg(long = "tick-ms", default_value_t = 10)]
    tick_ms: u64,

    /// Override the scenario's seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Enable the front-end UI hook (out of scope for this engine: accepted
    /// for command-line compatibility with the scenario/GUI front-end, has
    /// no effect on the run itself). `--no-ui` is the default and explicit
    /// opposite.
    #[arg(long, default_value_t = false, overrides_with = "no_ui")]
    ui: bool,

    #[arg(long = "no-ui", default_value_t = true, overrides_with = "ui")]
    no_ui: bool,
}

fn builtin_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(
        "echo",
        Box::new(|| {
            AdapterInstance::Byte(Box::new(EchoByteLink::new(20, vec![0xDB, 0x08])))
        }),
    );
    registry.register(
        "tone",
        Box::new(|| AdapterInstance::Audio(Box::new(ToneAudioBlock::new(20, 8000, 1000.0)))),
    );
    registry
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let mut logger = StructuredLogger::new(LoggingConfig::default())?;
    if args.ui && !args.no_ui {
        logger.log(LogEvent::Warn {
            message: "--ui has no effect: the GUI front-end is a separate collaborator, not part of this engine".to_string(),
        })?;
    }

    let text = std::fs::read_to_string(&args.scenario)
        .wrap_err_with(|| format!("failed to read scenario file: {}", args.scenario.display()))?;
    let mut base = ScenarioResolved::from_yaml(&text)
        .map_err(|e| color_eyre::eyre::eyre!("invalid scenario: {e}"))?;
    if let Some(seed) = args.seed {
        base.seed = seed;
    }

    let registry = builtin_registry();
    let clones = base.expand_sweep();
    let mut rc = 0;

    for (suffix, scenario) in clones {
        let out_dir = if suffix.is_empty() {
            args.out.clone()
        } else {
            args.out.join(&suffix)
        };
        std::fs::create_dir_all(&out_dir)
            .wrap_err_with(|| format!("failed to create output directory: {}", out_dir.display()))?;

        let resolved_yaml = scenario
            .write_resolved_yaml()
            .map_err(|e| color_eyre::eyre::eyre!("failed to render resolved scenario: {e}"))?;
        std::fs::write(out_dir.join("scenario.resolved.yaml"), resolved_yaml)
            .wrap_err("failed to write scenario.resolved.yaml")?;

        logger.log(LogEvent::RunStarted {
            scenario_path: args.scenario.display().to_string(),
            out_dir: out_dir.display().to_string(),
        })?;

        let engine = Engine::new(
            scenario,
            EngineConfig {
                tick_ms: args.tick_ms,
                out_dir: out_dir.clone(),
            },
            &registry,
            &args.left,
            &args.right,
        );

        let exit_code = match engine {
            Ok(engine) => match engine.run() {
                Ok(code) => code,
                Err(e) => {
                    logger.log(LogEvent::Error {
                        message: "run failed".to_string(),
                        details: Some(e.to_string()),
                    })?;
                    e.exit_code()
                }
            },
            Err(e) => {
                logger.log(LogEvent::Error {
                    message: "failed to start run".to_string(),
                    details: Some(e.to_string()),
                })?;
                e.exit_code()
            }
        };

        logger.log(LogEvent::RunFinished {
            out_dir: out_dir.display().to_string(),
            exit_code,
        })?;
        if exit_code != 0 {
            rc = exit_code;
        }
    }

    std::process::exit(rc);
}
