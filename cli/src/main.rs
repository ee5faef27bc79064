use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rebuild_kernel::config::RebuildConfig;
use rebuild_kernel::rebuild::{check_paths, rebuild, RebuildError, RebuildOptions, TargetPath};

/// Exit status of every failed run; 255 on Unix.
const FAILURE_EXIT_CODE: i32 = -1;

const USAGE: &str = "\
Usage: rebuild-from-logs [-full] <source dir with logs> <target dir for store>
WHERE:   <source dir>  is the path for where transactions to rebuild from are stored
         <target dir>  is the path for where to create the new store
         -full     --  to run a full check over the entire store for each transaction";

/// Rebuild a store from the transaction logs of another one
#[derive(Parser, Debug)]
#[command(name = "rebuild-from-logs")]
#[command(about = "Rebuild a store by replaying committed transactions", long_about = None)]
struct Cli {
    /// Verify every applied transaction and check the rebuilt store
    #[arg(long)]
    full: bool,

    /// Path to rebuild config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// <source dir with logs> <target dir for store>
    #[arg(value_name = "DIR")]
    paths: Vec<PathBuf>,
}

/// Accept the single-dash `-full` spelling alongside `--full`.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| if arg == "-full" { OsString::from("--full") } else { arg })
        .collect()
}

fn parse_args<I>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = OsString>,
{
    Cli::try_parse_from(normalize_args(args))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let [source, target] = <[PathBuf; 2]>::try_from(cli.paths).map_err(|_| {
        RebuildError::InvalidArguments(
            "Exactly two positional arguments expected: \
             <source dir with logs> <target dir for store>"
                .into(),
        )
    })?;

    let config = match &cli.config {
        Some(path) => RebuildConfig::load(path).map_err(RebuildError::from)?,
        None => RebuildConfig::default_config(),
    };

    if check_paths(&source, &target)? == TargetPath::ExistingDirectory {
        eprintln!("WARNING: the directory {} already exists", target.display());
    }

    let options = RebuildOptions {
        full: cli.full,
        config,
    };
    let summary = rebuild(&source, &target, &options)
        .with_context(|| format!("rebuild of {} failed", target.display()))?;

    tracing::info!(
        segments = summary.source_segments,
        applied = summary.stats.transactions_applied,
        "rebuild complete"
    );

    if let Some(report) = summary.report.filter(|report| !report.is_clean()) {
        eprintln!("{}", report.summary());
    }

    Ok(())
}

/// What the operator sees when a run fails.
#[derive(Debug)]
struct Failure {
    message: String,
    show_usage: bool,
}

impl Failure {
    fn from_error(e: &anyhow::Error) -> Self {
        let show_usage = e
            .downcast_ref::<RebuildError>()
            .is_some_and(RebuildError::is_usage_error);
        Self {
            message: format!("{e:#}"),
            show_usage,
        }
    }

    fn report(&self) {
        eprintln!("{}", self.message);
        if self.show_usage {
            eprintln!("{USAGE}");
        }
    }
}

fn main() {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            eprintln!("{e}");
            eprintln!("{USAGE}");
            std::process::exit(FAILURE_EXIT_CODE);
        }
    };

    init_tracing();

    if let Err(e) = run(cli) {
        Failure::from_error(&e).report();
        std::process::exit(FAILURE_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuild_kernel::log::ChainError;
    use rebuild_kernel::store::ApplyError;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn single_dash_full_is_accepted() {
        let cli = parse_args(args(&["rebuild-from-logs", "-full", "src", "dst"])).unwrap();
        assert!(cli.full);
        assert_eq!(cli.paths, vec![PathBuf::from("src"), PathBuf::from("dst")]);
    }

    #[test]
    fn full_is_optional() {
        let cli = parse_args(args(&["rebuild-from-logs", "--config", "c.json", "src", "dst"])).unwrap();
        assert!(!cli.full);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
    }

    #[test]
    fn only_exact_flag_is_rewritten() {
        let normalized = normalize_args(args(&["-full", "-fullx", "full"]));
        assert_eq!(normalized, args(&["--full", "-fullx", "full"]));
    }

    #[test]
    fn wrong_path_count_is_usage_error() {
        for paths in [&["only-one"][..], &["a", "b", "c"][..]] {
            let cli = Cli {
                full: false,
                config: None,
                paths: paths.iter().map(PathBuf::from).collect(),
            };
            let err = run(cli).unwrap_err();
            let rebuild_err = err.downcast_ref::<RebuildError>().unwrap();
            assert!(rebuild_err.is_usage_error());
            assert!(err.to_string().contains("Exactly two positional arguments"));
        }
    }

    #[test]
    fn chain_error_shows_usage_through_context() {
        let err = anyhow::Error::new(RebuildError::IncompleteLogChain(ChainError::Empty {
            dir: PathBuf::from("logs"),
        }))
        .context("rebuild of target failed");

        let failure = Failure::from_error(&err);
        assert!(failure.show_usage);
        assert!(failure.message.starts_with("rebuild of target failed: "));
        assert!(failure.message.contains("inconsistent number of log files"));
    }

    #[test]
    fn replay_error_hides_usage() {
        let err = anyhow::Error::new(RebuildError::Apply(ApplyError::MalformedPayload {
            tx_id: 3,
            reason: "expected value".into(),
        }))
        .context("rebuild of target failed");

        let failure = Failure::from_error(&err);
        assert!(!failure.show_usage);
        assert!(failure.message.contains("transaction 3"));
    }

    #[test]
    fn usage_mentions_full_flag() {
        assert!(USAGE.starts_with("Usage: rebuild-from-logs [-full]"));
        assert!(USAGE.contains("-full     --"));
    }
}
