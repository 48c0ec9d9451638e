use clap::Args;
use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hpcrun", version, about = "Submit jobs to HPC schedulers or run them locally")]
pub struct Cli {
  /// Explicit config file; skips the normal discovery cascade.
  #[arg(long, global = true, value_name = "PATH")]
  pub config: Option<PathBuf>,

  /// Scheduler to use (sge, slurm, pbs, local). Auto-detected if unset.
  #[arg(long, global = true, env = "HPCRUN_SCHEDULER")]
  pub scheduler: Option<String>,

  /// More detailed progress output.
  #[arg(short, long, global = true)]
  pub verbose: bool,

  #[command(subcommand)]
  pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
  /// Submit a command as a job.
  #[command(visible_alias = "submit")]
  Run(RunArgs),

  /// Show one job, the active-job list, or completed-job history.
  Status(StatusArgs),

  /// Cancel a job.
  Cancel {
    job_id: String,
  },

  /// Inspect or create configuration.
  #[command(subcommand)]
  Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct RunArgs {
  /// Job name. Defaults to `{user}_{tool}`.
  #[arg(long)]
  pub name: Option<String>,

  /// CPU slots / cores.
  #[arg(long)]
  pub cpu: Option<u32>,

  /// Memory request, scheduler units (e.g. 8G).
  #[arg(long)]
  pub mem: Option<String>,

  /// Wall time limit (e.g. 01:30:00).
  #[arg(long)]
  pub time: Option<String>,

  /// Queue / partition name.
  #[arg(long)]
  pub queue: Option<String>,

  #[arg(long)]
  pub nodes: Option<u32>,

  #[arg(long)]
  pub tasks: Option<u32>,

  /// Working directory for the job.
  #[arg(long)]
  pub workdir: Option<PathBuf>,

  /// Use `[types.<name>]` config instead of the tool config.
  #[arg(long)]
  pub job_type: Option<String>,

  /// Environment module to load (repeatable).
  #[arg(long = "module", value_name = "MODULE")]
  pub modules: Vec<String>,

  /// Stdout path. Default is scheduler-chosen.
  #[arg(long)]
  pub stdout: Option<String>,

  /// Stderr path. Unset means merge into stdout.
  #[arg(long)]
  pub stderr: Option<String>,

  /// Array spec: START-END[:STEP][%MAX], e.g. 1-100:2%5.
  #[arg(long)]
  pub array: Option<String>,

  /// Dependency spec, e.g. afterok:12345 or a bare job id.
  #[arg(long)]
  pub depend: Option<String>,

  /// Do not export the submitting environment into the job.
  #[arg(long)]
  pub no_inherit_env: bool,

  /// Run in the foreground and return the job's exit code.
  #[arg(long)]
  pub interactive: bool,

  /// Shorthand for `--scheduler local`.
  #[arg(long)]
  pub local: bool,

  /// Print the submission plan without submitting.
  #[arg(long)]
  pub dry_run: bool,

  /// Block until the job reaches a terminal state.
  #[arg(long)]
  pub wait: bool,

  /// Keep the generated script instead of self-deleting it.
  #[arg(long)]
  pub keep_script: bool,

  /// Raw scheduler args, then `--`, then the command to run.
  #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
  pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
  /// Show details for one job instead of a listing.
  pub job_id: Option<String>,

  /// List completed jobs from accounting instead of active ones.
  #[arg(long)]
  pub history: bool,

  /// With --history: only jobs ending after this point. Relative
  /// (30m, 2h, 1d) or ISO timestamp.
  #[arg(long)]
  pub since: Option<String>,

  /// List every user's jobs, not just mine.
  #[arg(long)]
  pub all: bool,

  /// JSON output instead of the table.
  #[arg(long)]
  pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
  /// Print the effective merged configuration.
  Show,
  /// Write a starter hpcrun.toml.
  Init {
    /// Write to ~/.config/hpcrun/ instead of the current directory.
    #[arg(long)]
    global: bool,
  },
  /// Print the config files the cascade would load.
  Path,
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::CommandFactory;

  #[test]
  fn verify_cli() {
    Cli::command().debug_assert();
  }

  #[test]
  fn run_collects_trailing_command() {
    let cli = Cli::parse_from(["hpcrun", "run", "--cpu", "4", "python", "train.py"]);
    let Commands::Run(args) = cli.command else {
      panic!("expected run");
    };
    assert_eq!(args.cpu, Some(4));
    assert_eq!(args.command, ["python", "train.py"]);
  }

  #[test]
  fn submit_is_an_alias_for_run() {
    let cli = Cli::parse_from(["hpcrun", "submit", "true"]);
    assert!(matches!(cli.command, Commands::Run(_)));
  }

  #[test]
  fn passthrough_args_survive_before_the_separator() {
    let cli = Cli::parse_from(["hpcrun", "run", "-l", "h_vmem=4G", "--", "echo", "hi"]);
    let Commands::Run(args) = cli.command else {
      panic!("expected run");
    };
    assert!(args.command.contains(&"echo".to_string()), "{:?}", args.command);
  }
}
