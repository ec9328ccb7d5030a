//! Epoch worker process
//!
//! - `serve`: host the epoch, slice and review flows, taking JSON-line
//!   commands on stdin and answering on stdout until stdin closes or Ctrl-C
//! - `validate`: check a schema document and list every defect
//! - `simulate`: run one epoch end to end in-process

mod config;
mod simulate;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::{resolve, Overrides, WorkerConfig};
use epoch_schema::{canonical, validate, ProtocolSchema, SchemaDocument};
use epoch_workflow::Worker;
use simulate::SimulationConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("epoch-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Epoch protocol worker")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Worker configuration file (TOML)"),
        )
        .arg(
            Arg::new("schema")
                .long("schema")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Protocol schema (YAML or JSON); the bundled protocol by default"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("serve")
                .about("Host epoch flows, reading JSON-line commands from stdin")
                .arg(
                    Arg::new("namespace")
                        .long("namespace")
                        .env("EPOCH_NAMESPACE")
                        .help("Namespace to serve"),
                )
                .arg(
                    Arg::new("task-queue")
                        .long("task-queue")
                        .env("EPOCH_TASK_QUEUE")
                        .help("Task queue to poll"),
                )
                .arg(
                    Arg::new("address")
                        .long("address")
                        .env("EPOCH_ADDRESS")
                        .help("Orchestration server address"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate a schema document")
                .arg(
                    Arg::new("path")
                        .value_parser(value_parser!(PathBuf))
                        .help("Document to validate; the bundled protocol by default"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run one epoch end to end in-process")
                .arg(
                    Arg::new("slices")
                        .long("slices")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Number of slices in the implementation phase"),
                )
                .arg(
                    Arg::new("revise-plan")
                        .long("revise-plan")
                        .action(ArgAction::SetTrue)
                        .help("Have the first plan review ask for a revision"),
                )
                .arg(
                    Arg::new("slice-ms")
                        .long("slice-ms")
                        .default_value("50")
                        .value_parser(value_parser!(u64))
                        .help("Simulated milliseconds per slice"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command replies
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

fn load_schema(path: Option<&Path>) -> anyhow::Result<Arc<ProtocolSchema>> {
    match path {
        Some(path) => {
            let schema = ProtocolSchema::load(path)
                .with_context(|| format!("failed to load schema {}", path.display()))?;
            tracing::info!(
                "Loaded schema {} v{} from {}",
                schema.name(),
                schema.version(),
                path.display()
            );
            Ok(Arc::new(schema))
        }
        None => canonical::schema().context("bundled protocol schema is invalid"),
    }
}

async fn serve(matches: &ArgMatches, args: &ArgMatches) -> anyhow::Result<()> {
    let file = match matches.get_one::<PathBuf>("config") {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    let resolved = resolve(
        Overrides {
            namespace: args.get_one::<String>("namespace").cloned(),
            task_queue: args.get_one::<String>("task-queue").cloned(),
            address: args.get_one::<String>("address").cloned(),
            schema: matches.get_one::<PathBuf>("schema").cloned(),
        },
        file,
    );

    let schema = load_schema(resolved.schema.as_deref())?;
    let worker = Worker::new(resolved.options, schema).with_retry(resolved.retry);
    tracing::info!(
        "Registered flows {:?} and activities {:?} in namespace {}",
        worker.registered_flows(),
        worker.registered_activities(),
        worker.options().namespace
    );

    let commands = async {
        let stdin = BufReader::new(tokio::io::stdin());
        match worker.serve_lines(stdin, tokio::io::stdout()).await {
            Ok(answered) => tracing::info!("Answered {} command(s)", answered),
            Err(e) => tracing::error!("Command stream failed: {}", e),
        }
    };
    let shutdown = async {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                if let Err(e) = interrupted {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
            }
            () = commands => {}
        }
    };
    let drained = worker.run_until(shutdown).await;
    tracing::info!("Worker stopped; drained {} epoch(s)", drained.len());
    Ok(())
}

fn validate_document(path: Option<&PathBuf>) -> anyhow::Result<bool> {
    let (label, doc) = match path {
        Some(path) => (path.display().to_string(), SchemaDocument::load(path)?),
        None => ("bundled protocol".to_string(), canonical::document()?),
    };

    let errors = validate(&doc);
    if errors.is_empty() {
        println!("{label}: valid");
        return Ok(true);
    }

    println!("{label}: {} defect(s)", errors.len());
    for error in &errors {
        println!("  {error}");
    }
    Ok(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("serve", args)) => serve(&matches, args).await?,
        Some(("validate", args)) => {
            let path = args
                .get_one::<PathBuf>("path")
                .or_else(|| matches.get_one::<PathBuf>("schema"));
            if !validate_document(path)? {
                std::process::exit(1);
            }
        }
        Some(("simulate", args)) => {
            let schema = load_schema(matches.get_one::<PathBuf>("schema").map(PathBuf::as_path))?;
            let config = SimulationConfig {
                slices: args.get_one::<usize>("slices").copied().unwrap_or(3),
                revise_plan: args.get_flag("revise-plan"),
                slice_time: Duration::from_millis(
                    args.get_one::<u64>("slice-ms").copied().unwrap_or(50),
                ),
            };

            let report = simulate::run(schema, config).await?;
            println!("{}", report.generate_text());
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        _ => {
            cli().print_help()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn serve_flags_parse() {
        let matches = cli()
            .try_get_matches_from([
                "epoch-worker",
                "--log-json",
                "serve",
                "--task-queue",
                "epochs",
            ])
            .unwrap();
        assert!(matches.get_flag("log-json"));
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "serve");
        assert_eq!(args.get_one::<String>("task-queue").unwrap(), "epochs");
    }

    #[test]
    fn bundled_protocol_validates() {
        assert!(validate_document(None).unwrap());
    }

    #[test]
    fn defective_document_fails_validation() {
        let mut doc = canonical::document().unwrap();
        doc.phase_mut("intake").unwrap().domain = None;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "{}", doc.to_yaml_string().unwrap()).unwrap();

        assert!(!validate_document(Some(&file.path().to_path_buf())).unwrap());
    }

    #[test]
    fn schema_flag_loads_a_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "{}", canonical::SOURCE).unwrap();

        let schema = load_schema(Some(file.path())).unwrap();
        assert_eq!(schema.name(), "epoch-protocol");
    }
}
