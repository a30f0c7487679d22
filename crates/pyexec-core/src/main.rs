//! `pyexec` command-line harness
//!
//! `pyexec analyze <file>` prints the static analysis; `pyexec run <file>`
//! pushes a script through the pipeline with the static strategy.

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pyexec_analysis::StaticAnalyzer;
use pyexec_core::{ExecutionPipeline, PipelineConfig, PipelineOutcome, StaticCodeGenerator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("pyexec")
        .version(pyexec_core::VERSION)
        .about("Analyze and run generated Python against a facility control system")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Pipeline configuration (.toml, .yaml)"),
        )
        .arg(
            Arg::new("system")
                .long("system")
                .global(true)
                .help("Active control-system kind (epics, mock, ...)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("analyze")
                .about("Print the static analysis of a script as JSON")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run a script through the pipeline")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("max-attempts")
                        .long("max-attempts")
                        .value_parser(value_parser!(u32))
                        .help("Retry budget"),
                )
                .arg(
                    Arg::new("context")
                        .long("context")
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON file exposed to the script as `context`"),
                )
                .arg(
                    Arg::new("approve")
                        .long("approve")
                        .action(ArgAction::SetTrue)
                        .help("Treat the script as human-approved"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<PipelineConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(kind) = matches.get_one::<String>("system") {
        config = config.with_system_kind(kind.clone());
    }
    config.validate()?;
    Ok(config)
}

fn read_script(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn analyze(config: &PipelineConfig, sub: &ArgMatches) -> anyhow::Result<ExitCode> {
    let file = sub.get_one::<PathBuf>("file").context("missing file")?;
    let analyzer = StaticAnalyzer::new(&config.analysis)?;
    let report = analyzer.analyze_full(&read_script(file)?);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.verdict.is_rejected() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run(config: PipelineConfig, sub: &ArgMatches) -> anyhow::Result<ExitCode> {
    let file = sub.get_one::<PathBuf>("file").context("missing file")?;
    let code = read_script(file)?;
    let label = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script")
        .to_string();

    let pipeline = ExecutionPipeline::new(config, Arc::new(StaticCodeGenerator::new(code.clone())))?;
    let mut builder = pipeline
        .request(format!("run {}", file.display()), "execute user-supplied script")
        .with_scope_label(label);
    if let Some(max) = sub.get_one::<u32>("max-attempts") {
        builder = builder.with_max_attempts(*max);
    }
    if let Some(path) = sub.get_one::<PathBuf>("context") {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        builder = builder.with_context(serde_json::from_str(&text).context("context is not valid JSON")?);
    }
    if sub.get_flag("approve") {
        builder = builder.with_approved_code(code);
    }
    let request = builder.build();

    let outcome = pipeline
        .execute_until(&request, async {
            // Ctrl-C cancels; if the handler cannot be installed, never cancel.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(match outcome {
        PipelineOutcome::Succeeded { .. } => ExitCode::SUCCESS,
        PipelineOutcome::Failed { .. } => ExitCode::FAILURE,
        PipelineOutcome::AwaitingApproval { .. } => ExitCode::from(2),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("analyze", sub)) => analyze(&config, sub),
        Some(("run", sub)) => run(config, sub).await,
        _ => Ok(ExitCode::FAILURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let matches = cli()
            .try_get_matches_from(["pyexec", "--system", "epics", "run", "job.py", "--max-attempts", "0", "--approve"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("system").map(String::as_str), Some("epics"));
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(sub.get_one::<u32>("max-attempts"), Some(&0));
        assert!(sub.get_flag("approve"));
    }
}
