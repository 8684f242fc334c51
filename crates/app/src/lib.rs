use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use regex::Regex;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use pipenest_core::analyzer::{analyze_execution, search_execution, SearchField, SearchPattern};
use pipenest_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use pipenest_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use pipenest_core::render::{
    format_duration, render_comparison_table, render_debug_report, render_tree, status_glyph,
};
use pipenest_core::tracer::{
    build_execution_tree, generate_performance_summary, load_trace_file, ExecutionTree,
    PerformanceSummary,
};

#[derive(Parser)]
#[command(name = "pipenest", about = "Inspect and analyze nested pipeline execution traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution tree of a trace.
    Tree(TraceArgs),
    /// Print the full debug report of a trace.
    Report(ReportArgs),
    /// Compare two or more traces.
    Compare(CompareArgs),
    /// Find spans by pipeline id, step name or error text.
    Search(SearchArgs),
}

#[derive(Args)]
struct TraceArgs {
    #[arg(help = "Trace file (JSON span list, span map, tree, or JSON lines)")]
    file: PathBuf,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(help = "Trace file (JSON span list, span map, tree, or JSON lines)")]
    file: PathBuf,
    #[arg(long, help = "Emit the analysis as JSON instead of text")]
    json: bool,
}

#[derive(Args)]
struct CompareArgs {
    #[arg(num_args = 2.., required = true, help = "Trace files, oldest first")]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct SearchArgs {
    file: PathBuf,
    pattern: String,
    #[arg(
        long,
        default_value = "all",
        help = "pipeline_ids, step_names, errors or all"
    )]
    field: SearchField,
    #[arg(long, help = "Treat PATTERN as a regular expression")]
    regex: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    let output = execute(&cli.command, &config, &resolved_data_dir)?;
    print!("{output}");
    Ok(())
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&init_options);
    let console_env_filter = parse_env_filter_with_fallback(&filters.console_filter, "console");

    match logging::build_file_sink_plan(&init_options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter = parse_env_filter_with_fallback(&filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn execute(command: &Commands, config: &AppConfig, data_dir: &Path) -> Result<String> {
    let traces_dir = data_dir.join(&config.paths.traces_dir);
    match command {
        Commands::Tree(args) => {
            let tree = load_tree(&args.file, &traces_dir)?;
            Ok(render_tree(&tree))
        }
        Commands::Report(args) => {
            let tree = load_tree(&args.file, &traces_dir)?;
            let analysis = analyze_execution(&tree, &config.analysis);
            if args.json {
                let mut encoded =
                    serde_json::to_string_pretty(&analysis).context("failed to encode analysis")?;
                encoded.push('\n');
                Ok(encoded)
            } else {
                Ok(render_debug_report(&tree, &analysis))
            }
        }
        Commands::Compare(args) => {
            let traces = args
                .files
                .iter()
                .map(|file| -> Result<(String, PerformanceSummary)> {
                    let tree = load_tree(file, &traces_dir)?;
                    Ok((trace_label(file), generate_performance_summary(&tree)))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(render_comparison_table(&traces, &config.analysis)?)
        }
        Commands::Search(args) => {
            let tree = load_tree(&args.file, &traces_dir)?;
            let pattern = if args.regex {
                SearchPattern::Regex(
                    Regex::new(&args.pattern)
                        .with_context(|| format!("invalid regex '{}'", args.pattern))?,
                )
            } else {
                SearchPattern::substring(&args.pattern)
            };
            Ok(format_search_results(&tree, &pattern, args.field))
        }
    }
}

/// Look for `file` as given first, then under the configured traces dir.
fn resolve_trace_path(file: &Path, traces_dir: &Path) -> PathBuf {
    if file.exists() || file.is_absolute() {
        return file.to_path_buf();
    }
    let candidate = traces_dir.join(file);
    if candidate.exists() {
        debug!(path = %candidate.display(), "Resolved trace file under traces dir");
        candidate
    } else {
        file.to_path_buf()
    }
}

fn load_tree(file: &Path, traces_dir: &Path) -> Result<ExecutionTree> {
    let path = resolve_trace_path(file, traces_dir);
    let input = load_trace_file(&path)?;
    let tree = build_execution_tree(input);
    info!(
        path = %path.display(),
        spans = tree.step_count,
        max_depth = tree.max_depth,
        "Loaded trace"
    );
    Ok(tree)
}

fn trace_label(file: &Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

fn format_search_results(tree: &ExecutionTree, pattern: &SearchPattern, field: SearchField) -> String {
    let matches = search_execution(tree, pattern, field);
    if matches.is_empty() {
        return "No matching spans\n".to_string();
    }

    let mut out = format!("{} matching span(s)\n", matches.len());
    for found in matches {
        let duration = found
            .duration_ms
            .map(format_duration)
            .unwrap_or_else(|| "running".to_string());
        out.push_str(&format!(
            "{} {} [{:?}: {}] depth {} ({duration}) parent: {}\n",
            status_glyph(found.status),
            found.pipeline_id,
            found.field,
            found.matched_text,
            found.depth,
            found.parent_pipeline.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    fn write_trace(dir: &Path, name: &str, failed_child: bool) -> PathBuf {
        let child_status = if failed_child { "failed" } else { "completed" };
        let spans = json!([
            {
                "id": "root",
                "pipeline_id": "main",
                "status": "completed",
                "duration_ms": 120,
                "depth": 0,
                "start_time": "2026-01-01T00:00:00Z"
            },
            {
                "id": "child",
                "parent_span_id": "root",
                "pipeline_id": "fetch_data",
                "status": child_status,
                "duration_ms": 80,
                "depth": 1,
                "start_time": "2026-01-01T00:00:00.010Z",
                "error": if failed_child { json!("request timed out") } else { json!(null) }
            }
        ]);
        let path = dir.join(name);
        fs::write(&path, serde_json::to_vec(&spans).expect("encode")).expect("write trace");
        path
    }

    fn run(args: &[&str], data_dir: &Path) -> Result<String> {
        let cli = Cli::try_parse_from(args)?;
        execute(&cli.command, &AppConfig::default(), data_dir)
    }

    #[test]
    fn tree_command_renders_trace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let trace = write_trace(temp.path(), "run.json", false);

        let output = run(&["pipenest", "tree", trace.to_str().expect("path")], temp.path()).expect("tree");
        assert!(output.starts_with("✓ main (120ms)"));
        assert!(output.contains("└─ ✓ fetch_data (80ms)"));
    }

    #[test]
    fn trace_files_resolve_under_traces_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let traces = temp.path().join("traces");
        fs::create_dir_all(&traces).expect("traces dir");
        write_trace(&traces, "stored.json", false);

        let output = run(&["pipenest", "tree", "stored.json"], temp.path()).expect("tree");
        assert!(output.contains("fetch_data"));
    }

    #[test]
    fn report_command_supports_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let trace = write_trace(temp.path(), "run.json", true);
        let path = trace.to_str().expect("path");

        let text = run(&["pipenest", "report", path], temp.path()).expect("report");
        assert!(text.contains("timeout: 1 failure(s)"));

        let encoded = run(&["pipenest", "report", "--json", path], temp.path()).expect("report");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["error_patterns"][0]["category"], "timeout");
    }

    #[test]
    fn compare_command_needs_two_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let before = write_trace(temp.path(), "before.json", true);
        let after = write_trace(temp.path(), "after.json", false);

        let table = run(
            &[
                "pipenest",
                "compare",
                before.to_str().expect("path"),
                after.to_str().expect("path"),
            ],
            temp.path(),
        )
        .expect("compare");
        assert!(table.contains("before"));
        assert!(table.contains("Success rate trend: improving"));

        assert!(Cli::try_parse_from(["pipenest", "compare", "only.json"]).is_err());
    }

    #[test]
    fn search_command_filters_by_field_and_regex() {
        let temp = tempfile::tempdir().expect("tempdir");
        let trace = write_trace(temp.path(), "run.json", true);
        let path = trace.to_str().expect("path");

        let by_id = run(&["pipenest", "search", path, "FETCH", "--field", "pipelines"], temp.path())
            .expect("search");
        assert!(by_id.starts_with("1 matching span(s)"));
        assert!(by_id.contains("parent: main"));

        let by_error = run(&["pipenest", "search", path, "timed\\s+out", "--regex"], temp.path())
            .expect("search");
        assert!(by_error.contains("Errors"));

        let none = run(&["pipenest", "search", path, "nothing", "--field", "errors"], temp.path())
            .expect("search");
        assert_eq!(none, "No matching spans\n");

        assert!(run(&["pipenest", "search", path, "(", "--regex"], temp.path()).is_err());
    }

    #[test]
    fn missing_trace_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(run(&["pipenest", "tree", "missing.json"], temp.path()).is_err());
    }
}
