//! Command-line entry point: parse flags, load the manifest and logs, and
//! drive a build of the requested targets.

use crate::build_log::BuildLog;
use crate::deps_log::DepsLog;
use crate::disk::RealDiskInterface;
use crate::status::{ConsoleStatus, Verbosity};
use crate::work::{BuildConfig, Builder};
use crate::{load, signal, version};
use anyhow::anyhow;
use std::path::Path;

const BUILD_LOG_FILE: &str = ".ninja_log";
const DEPS_LOG_FILE: &str = ".ninja_deps";

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// kunai, a ninja-style build executor
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// do not start new jobs if the load average is greater than N
    #[argh(option, short = 'l')]
    load_average: Option<f64>,

    /// dry run: act like the commands succeeded without running them
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// don't print a status line
    #[argh(switch)]
    quiet: bool,

    /// print version and exit
    #[argh(switch)]
    version: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> anyhow::Result<usize> {
    // The original uses available processors plus a small constant; the
    // difference rarely matters.
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

pub fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if opts.version {
        println!("{}", version::VERSION);
        return Ok(0);
    }

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register_sigint();

    let parallelism = match opts.parallelism {
        Some(p) => p,
        None => default_parallelism()?,
    };
    let config = BuildConfig {
        parallelism,
        failures_allowed: if opts.keep_going == 0 {
            usize::MAX
        } else {
            opts.keep_going
        },
        max_load_average: opts.load_average.unwrap_or(0.0),
        dry_run: opts.dry_run,
    };
    let verbosity = if opts.quiet {
        Verbosity::Quiet
    } else if opts.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    };

    let mut state = load::read(&opts.build_file)?;

    let mut build_log = BuildLog::new();
    build_log.load(Path::new(BUILD_LOG_FILE))?;
    let mut deps_log = DepsLog::new();
    deps_log.load(Path::new(DEPS_LOG_FILE), &mut state)?;

    let status = ConsoleStatus::new(verbosity, parallelism);
    let mut builder = Builder::new(
        state,
        config,
        Box::new(RealDiskInterface::default()),
        build_log,
        deps_log,
        Box::new(status),
    );
    if !opts.dry_run {
        builder.open_logs(Path::new(BUILD_LOG_FILE), Path::new(DEPS_LOG_FILE))?;
    }

    if !opts.targets.is_empty() {
        for name in &opts.targets {
            builder.add_target_by_name(name)?;
        }
    } else {
        for node in builder.state.default_nodes()? {
            builder.add_target(node)?;
        }
    }

    if builder.already_up_to_date() {
        println!("kunai: no work to do");
        return Ok(0);
    }

    let tasks = builder.build()?;
    println!(
        "kunai: ran {} task{}, now up to date",
        tasks,
        if tasks == 1 { "" } else { "s" }
    );
    Ok(0)
}
