//! CLI entrypoint for the Dobby L2 test harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use dobby_l2_harness::config::{self, describe_choices};
use dobby_l2_harness::groups;
use dobby_l2_harness::runner::{HarnessContext, TestGroup, TestRunner};
use dobby_l2_harness::structured_log::{self, ArtifactIndex, LogEmitter};
use dobby_l2_harness::{HarnessConfig, Platform, Timings, Verbosity};

/// Runs the Dobby L2 test groups against a real daemon.
#[derive(Debug, Parser)]
#[command(name = "l2-harness")]
#[command(about = "L2 test orchestration for DobbyDaemon, DobbyTool and memcr")]
struct Cli {
    #[command(flatten)]
    options: Options,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Options {
    /// Log verbosity (0 = no_log, 1 = error, 2 = warning, 3 = info, 4 = debug, 5 = log_all).
    #[arg(short = 'v', long, global = true, default_value = "3", value_parser = parse_verbosity)]
    verbosity: Verbosity,
    /// Target platform (0 = no_selection, 1 = vagrant_vm, 2 = xi_6, 3 = github_workflow_vm).
    #[arg(short = 'p', long, global = true, default_value = "0", value_parser = parse_platform)]
    platform: Platform,
    /// Directory holding `<container>.json` specs.
    #[arg(long, global = true, env = "DOBBY_L2_SPEC_DIR", default_value = "dobby_specs")]
    spec_dir: PathBuf,
    /// Directory holding `<container>_bundle.tar.gz` archives.
    #[arg(long, global = true, env = "DOBBY_L2_BUNDLE_DIR", default_value = "bundle")]
    bundle_dir: PathBuf,
    /// Where containers write `<container>.log`.
    #[arg(long, global = true, env = "DOBBY_L2_CONTAINER_LOG_DIR", default_value = "/tmp")]
    container_log_dir: PathBuf,
    /// memcr dump directory.
    #[arg(long, global = true, env = "DOBBY_L2_DUMP_DIR", default_value = "/media/apps/memcr")]
    dump_dir: PathBuf,
    #[arg(long, global = true, env = "DOBBY_L2_DAEMON", default_value = "DobbyDaemon")]
    daemon: String,
    #[arg(long, global = true, env = "DOBBY_L2_TOOL", default_value = "DobbyTool")]
    tool: String,
    #[arg(long, global = true, env = "DOBBY_L2_BUNDLE_GENERATOR", default_value = "DobbyBundleGenerator")]
    bundle_generator: String,
    /// Shell command that starts memcr.
    #[arg(long, global = true, env = "DOBBY_L2_MEMCR_START", default_value = "~/memcr/scripts/start_memcr.sh")]
    memcr_start: String,
    #[arg(long, global = true, env = "DOBBY_L2_LISTENER", default_value = "netcat")]
    listener: String,
    /// Run privileged commands directly instead of through sudo.
    #[arg(long, global = true)]
    no_sudo: bool,
    /// Leave an already running daemon alone instead of stopping it first.
    #[arg(long, global = true)]
    keep_stray_daemon: bool,
    /// Multiply every wait and timeout (e.g. 2.0 on a slow host).
    #[arg(long, global = true, env = "DOBBY_L2_SLOW_FACTOR", default_value_t = 1.0)]
    slow_factor: f64,
    /// Results file.
    #[arg(long, global = true, default_value = "DobbyL2TestResults.json")]
    report: PathBuf,
    /// Also write a markdown rendering of the results.
    #[arg(long, global = true)]
    markdown: Option<PathBuf>,
    /// Write JSONL run events to this file.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every test group.
    RunAll,
    /// Run the named groups in the order given.
    Group {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List groups, their platforms and their cases.
    List,
}

fn parse_verbosity(raw: &str) -> Result<Verbosity, String> {
    raw.parse::<u8>()
        .ok()
        .and_then(Verbosity::from_index)
        .ok_or_else(|| format!("expected one of {}", describe_choices(&Verbosity::ALL, Verbosity::name)))
}

fn parse_platform(raw: &str) -> Result<Platform, String> {
    raw.parse::<u8>()
        .ok()
        .and_then(Platform::from_index)
        .ok_or_else(|| format!("expected one of {}", describe_choices(&Platform::ALL, Platform::name)))
}

impl Options {
    fn into_config(self) -> HarnessConfig {
        let defaults = HarnessConfig::default();
        HarnessConfig {
            verbosity: self.verbosity,
            platform: self.platform,
            daemon_program: self.daemon,
            tool_program: self.tool,
            bundle_generator_program: self.bundle_generator,
            helper_start_command: self.memcr_start,
            listener_program: self.listener,
            privilege_wrapper: if self.no_sudo { None } else { defaults.privilege_wrapper.clone() },
            purge_stray_daemon: !self.keep_stray_daemon,
            spec_dir: self.spec_dir,
            bundle_dir: self.bundle_dir,
            container_log_dir: self.container_log_dir,
            checkpoint_dump_dir: self.dump_dir,
            report_path: self.report,
            event_log: self.event_log,
            timings: Timings::default().scaled(self.slow_factor),
            ..defaults
        }
    }
}

fn list_groups(platform: Platform) {
    for group in groups::all_groups() {
        let platforms: Vec<_> = group.supported_platforms().iter().map(|p| p.name()).collect();
        println!("{} [{}]", group.name(), platforms.join(", "));
        for case in group.cases(platform) {
            println!("  {} ({}): expects {}", case.name, case.subject, case.expected.describe());
        }
    }
}

fn select_groups(command: &Command) -> Result<Vec<Box<dyn TestGroup>>, String> {
    match command {
        Command::Group { names } => names
            .iter()
            .map(|name| {
                groups::find_group(name).ok_or_else(|| {
                    format!("unknown group '{name}', expected one of {}", groups::group_names().join(", "))
                })
            })
            .collect(),
        _ => Ok(groups::all_groups()),
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let markdown = cli.options.markdown.clone();
    let config = cli.options.into_config();
    config::install_console_logging(config.verbosity);

    if matches!(cli.command, Command::List) {
        list_groups(config.platform);
        return Ok(ExitCode::SUCCESS);
    }
    config.validate()?;
    let selected = select_groups(&cli.command)?;

    let run_id = structured_log::new_run_id();
    let mut ctx = HarnessContext::new(&config);
    if let Some(path) = &config.event_log {
        ctx = ctx.with_event_log(LogEmitter::to_file(path, &run_id)?);
    }
    let runner = TestRunner::new(ctx);
    let group_refs: Vec<&dyn TestGroup> = selected.iter().map(|g| g.as_ref()).collect();
    let suite = runner.run(&group_refs);

    suite.write(&config.report_path)?;
    let mut artifacts = ArtifactIndex::new(&run_id);
    artifacts.add_file(&config.report_path, "report")?;
    if let Some(path) = &markdown {
        std::fs::write(path, suite.to_markdown())?;
        artifacts.add_file(path, "report_markdown")?;
    }
    if let Some(path) = &config.event_log {
        artifacts.add_file(path, "event_log")?;
    }
    let index_path = config.report_path.with_extension("artifacts.json");
    std::fs::write(&index_path, artifacts.to_json()?)?;
    tracing::debug!("wrote artifact index to {}", index_path.display());

    Ok(if suite.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
