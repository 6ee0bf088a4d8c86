mod config;
mod logging;
mod tap;

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use statewalk_deposit::{deposit_graph, SimChain, ROOT};
use statewalk_engine::{Driver, RunReport, Session, StateGraph};

use crate::config::Config;
use crate::tap::Tap;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
    /// TAP version 14, one test per path and per invalid transition
    Tap,
}

/// Exhaustive lifecycle traversal against a simulated deposit chain.
#[derive(Parser)]
#[command(
    name = "statewalk",
    version,
    about = "Exhaustive lifecycle traversal against a simulated deposit chain"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text, json or tap)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Traverse every path of the deposit lifecycle graph
    Run {
        /// State to start from
        #[arg(long, default_value = ROOT)]
        root: String,
        /// Run deadline in seconds, overriding the config file
        #[arg(long)]
        timeout: Option<u64>,
        /// Maximum transitions on one path, overriding the config file
        #[arg(long)]
        max_depth: Option<usize>,
        /// Sibling branches explored at once, overriding the config file
        #[arg(long)]
        concurrency: Option<usize>,
        /// Run every branch against one shared chain instead of forks
        #[arg(long)]
        shared: bool,
    },

    /// Print the lifecycle graph and its structural warnings
    Graph {
        /// State to validate reachability from
        #[arg(long, default_value = ROOT)]
        root: String,
    },
}

/// Overrides for the `[driver]` section given on the command line.
struct RunOverrides {
    timeout: Option<u64>,
    max_depth: Option<usize>,
    concurrency: Option<usize>,
    shared: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e.to_string(), cli.output, cli.quiet);
            process::exit(1);
        }
    };
    logging::init(config.log.filter.as_deref(), cli.quiet);
    tracing::debug!(config = ?cli.config.as_deref().map(Path::display), "configuration loaded");

    match cli.command {
        Commands::Run {
            root,
            timeout,
            max_depth,
            concurrency,
            shared,
        } => {
            let overrides = RunOverrides {
                timeout,
                max_depth,
                concurrency,
                shared,
            };
            cmd_run(&config, &root, overrides, cli.output, cli.quiet);
        }
        Commands::Graph { root } => {
            cmd_graph(&root, cli.output, cli.quiet);
        }
    }
}

fn cmd_run(
    config: &Config,
    root: &str,
    overrides: RunOverrides,
    output: OutputFormat,
    quiet: bool,
) {
    let mut driver_config = config.driver_config();
    if let Some(secs) = overrides.timeout {
        driver_config.run_timeout = Duration::from_secs(secs);
    }
    if let Some(depth) = overrides.max_depth {
        driver_config.max_depth = depth;
    }
    if let Some(n) = overrides.concurrency {
        driver_config.branch_concurrency = n.max(1);
    }
    if overrides.shared {
        driver_config.isolate_branches = false;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };

    let driver = Driver::new(deposit_graph(), driver_config);
    let session = Session::new(SimChain::new(config.chain.clone()));
    let report = match rt.block_on(driver.run(root, session)) {
        Ok(report) => report,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Text => {
            if !quiet {
                print_paths(&report);
            }
            println!("{}", report);
        }
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                report_error(&format!("failed to serialize report: {}", e), output, quiet);
                process::exit(1);
            }
        },
        OutputFormat::Tap => tap_report(&report).finish(),
    }

    if !report.passed() {
        process::exit(1);
    }
}

fn print_paths(report: &RunReport) {
    for path in &report.paths {
        let mark = if path.passed() { "PASS" } else { "FAIL" };
        println!("{} {}", mark, path.trace().join(" -> "));
    }
    for probe in &report.probes {
        let mark = if probe.passed() { "PASS" } else { "FAIL" };
        println!("{} {} rejects '{}'", mark, probe.state, probe.label);
    }
    for warning in &report.warnings {
        println!("WARN {}", warning);
    }
    println!();
}

fn tap_report(report: &RunReport) -> Tap {
    let mut tap = Tap::new();
    for path in &report.paths {
        tap.record(
            format!("path {}", path.trace().join(" -> ")),
            path.failure().map(ToString::to_string),
        );
    }
    for probe in &report.probes {
        tap.record(
            format!("{} rejects '{}'", probe.state, probe.label),
            probe.outcome.failure().map(ToString::to_string),
        );
    }
    tap
}

fn cmd_graph(root: &str, output: OutputFormat, quiet: bool) {
    let graph = deposit_graph();
    let warnings = match graph.validate(root) {
        Ok(warnings) => warnings,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => {
            let value = json!({
                "root": root,
                "states": describe_states(&graph),
                "warnings": warnings,
            });
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    report_error(&format!("failed to serialize graph: {}", e), output, quiet);
                    process::exit(1);
                }
            }
        }
        OutputFormat::Text | OutputFormat::Tap => {
            for node in graph.nodes() {
                println!("{}", node.name());
                let deps: Vec<&str> = node.dependency_names().collect();
                if !deps.is_empty() {
                    println!("  needs {}", deps.join(", "));
                }
                for edge in node.edges() {
                    if edge.label == edge.target {
                        println!("  -> {}", edge.target);
                    } else {
                        println!("  -> {} via '{}'", edge.target, edge.label);
                    }
                }
                for probe in node.probes() {
                    println!("  x  {}", probe.label);
                }
            }
            for warning in &warnings {
                println!("WARN {}", warning);
            }
        }
    }
}

fn describe_states(graph: &StateGraph<SimChain>) -> serde_json::Value {
    graph
        .nodes()
        .iter()
        .map(|node| {
            json!({
                "name": node.name(),
                "dependencies": node.dependency_names().collect::<Vec<_>>(),
                "edges": node
                    .edges()
                    .iter()
                    .map(|e| json!({ "label": e.label, "target": e.target }))
                    .collect::<Vec<_>>(),
                "probes": node.probes().iter().map(|p| p.label.as_str()).collect::<Vec<_>>(),
                "terminal": node.is_terminal(),
            })
        })
        .collect()
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text | OutputFormat::Tap => eprintln!("{}", msg),
        OutputFormat::Json => eprintln!("{}", json!({ "error": msg })),
    }
}
