// Copyright 2025 Chisomo Makombo Sakala
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scheduler adapters and the common [`Scheduler`] trait.
//!
//! Each adapter translates the semantic [`Job`] model into one
//! scheduler's command-line dialect and parses that scheduler's status
//! and accounting output back into the shared types. Submission flow
//! (script generation, writing, id parsing) is shared here; adapters
//! supply the dialect.

pub mod local;
pub mod pbs;
pub mod render;
pub mod sge;
pub mod slurm;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Local;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::config::HpcConfig;
use crate::error::ConfigError;
use crate::error::SchedulerError;
use crate::job::Job;
use crate::job::JobArray;
use crate::result::ArrayJobResult;
use crate::result::JobInfo;
use crate::result::JobResult;
use crate::result::JobStatus;
use render::Attr;
use render::AttrValue;
use render::Rendering;
use render::render_directives;
use render::script_body;

/// Env var naming the scheduler to use, bypassing detection.
pub const SCHEDULER_ENV_VAR: &str = "HPCRUN_SCHEDULER";
/// Env var overriding where generated scripts are written.
pub const SCRIPT_DIR_ENV_VAR: &str = "HPCRUN_SCRIPT_DIR";

/// Which output stream of a finished job to locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
  Stdout,
  Stderr,
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
  /// Run in the foreground and report the real exit code.
  pub interactive: bool,
  /// Keep the generated script instead of self-deleting it.
  pub keep_script: bool,
}

/// Filter for listing active jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
  /// Restrict to this user; `None` means the current user.
  pub user: Option<String>,
  /// List every user's jobs instead.
  pub all_users: bool,
}

/// Filter for listing completed jobs from accounting.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
  pub since: Option<DateTime<Local>>,
  pub user: Option<String>,
}

/// Extra scheduler-native fields from a detail lookup, keyed by the
/// scheduler's own field names.
pub type DetailExtras = BTreeMap<String, String>;

/// One batch scheduler dialect.
///
/// Adapters are cheap handles over external binaries; they hold only
/// configuration (and, for the local adapter, the process table), so a
/// single `Arc` instance is shared by every result it produced.
#[async_trait]
pub trait Scheduler: Send + Sync {
  fn name(&self) -> &'static str;

  /// In-script directive prefix (`#$`, `#SBATCH`, `#PBS`); `None`
  /// when the scheduler takes no directives.
  fn directive_prefix(&self) -> Option<&'static str> {
    None
  }

  /// Renders one semantic attribute into this scheduler's dialect.
  /// `None` skips the attribute.
  fn render_attr(&self, attr: Attr, value: AttrValue<'_>, job: &Job) -> Option<Rendering>;

  /// Renderings that are not tied to a single attribute: merged
  /// output, generic resource requests, and similar. Appended after
  /// the attribute pass.
  fn extra_renderings(&self, job: &Job) -> Vec<Rendering> {
    let _ = job;
    Vec::new()
  }

  /// Command-line args selecting an array range.
  fn array_args(&self, array: &JobArray) -> Vec<String> {
    let _ = array;
    Vec::new()
  }

  /// Command-line args expressing job dependencies.
  fn dependency_args(&self, job: &Job) -> Vec<String> {
    let _ = job;
    Vec::new()
  }

  /// Raw passthrough args for this scheduler (`raw_args` plus the
  /// adapter-specific escape hatch).
  fn passthrough_args(&self, job: &Job) -> Vec<String> {
    job.raw_args.clone()
  }

  /// Full batch submission command line, script path last.
  fn build_submit_command(&self, job: &Job, script: &Path, array: Option<&JobArray>)
  -> Vec<String>;

  /// Foreground (interactive) command line.
  fn build_interactive_command(&self, job: &Job) -> Vec<String>;

  /// Extracts the native job id from the submit binary's stdout.
  fn parse_job_id(&self, stdout: &str) -> Result<String, SchedulerError>;

  /// Full script text for a batch submission. Array ranges go on the
  /// submit command line, not into the script.
  fn generate_script(&self, job: &Job, array: Option<&JobArray>, keep_script: bool) -> String {
    let _ = array;
    let mut lines = vec![format!("#!{}", job.shell)];

    if self.directive_prefix().is_some() {
      lines.extend(render_directives(self, job));
    }

    if !keep_script {
      lines.push("trap 'rm -f -- \"$0\"' EXIT".to_string());
    }
    lines.push(script_body(job));
    lines.push(String::new());
    lines.join("\n")
  }

  /// Submits the written script, returning the native job id.
  async fn submit_script(
    &self,
    job: &Job,
    script: &Path,
    array: Option<&JobArray>,
  ) -> Result<String, SchedulerError> {
    let argv = self.build_submit_command(job, script, array);
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::Submission {
        scheduler: self.name(),
        diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    self.parse_job_id(&String::from_utf8_lossy(&output.stdout))
  }

  /// Runs the job in the foreground, returning its exit code.
  async fn run_interactive(&self, job: &Job) -> Result<Option<i32>, SchedulerError> {
    let argv = self.build_interactive_command(job);
    let status = Command::new(&argv[0])
      .args(&argv[1..])
      .status()
      .await
      .map_err(|source| SchedulerError::Invoke {
        command: argv.join(" "),
        source,
      })?;
    Ok(status.code())
  }

  async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError>;

  /// Exit code of a finished job; `None` when the scheduler cannot
  /// report one.
  async fn exit_code(&self, job_id: &str) -> Result<Option<i32>, SchedulerError>;

  async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;

  /// Whether completed jobs can be queried from an accounting
  /// facility.
  fn has_accounting(&self) -> bool {
    true
  }

  /// Whether job arrays are supported.
  fn supports_arrays(&self) -> bool {
    true
  }

  /// Native id of one array task.
  fn array_task_id(&self, base_job_id: &str, index: u32) -> String {
    format!("{base_job_id}.{index}")
  }

  /// Whether the submit binary spools the script (so the local copy
  /// may be removed right after submission).
  fn spools_script(&self) -> bool {
    true
  }

  async fn list_active_jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError>;

  /// Completed jobs from accounting; typed
  /// [`SchedulerError::AccountingNotAvailable`] when the scheduler has
  /// none, never an empty list.
  async fn list_completed_jobs(
    &self,
    filter: &HistoryFilter,
  ) -> Result<Vec<JobInfo>, SchedulerError>;

  async fn get_job_details(
    &self,
    job_id: &str,
  ) -> Result<(JobInfo, DetailExtras), SchedulerError>;

  /// Where the job's stdout/stderr lands, if the adapter can tell.
  fn output_path(&self, job_id: &str, job_name: &str, stream: OutputStream) -> Option<PathBuf>;
}

/// Submits `job` through `scheduler`, handling script generation and
/// cleanup.
pub async fn submit(
  scheduler: &Arc<dyn Scheduler>,
  job: &Job,
  opts: &SubmitOptions,
) -> Result<JobResult, SchedulerError> {
  if opts.interactive {
    let exit = scheduler.run_interactive(job).await?;
    return Ok(JobResult::interactive(
      job.name.clone(),
      Arc::clone(scheduler),
      exit,
    ));
  }

  let script = scheduler.generate_script(job, None, opts.keep_script);
  let path = write_script(&script)?;
  debug!(script = %path.display(), "wrote submission script");

  let job_id = scheduler.submit_script(job, &path, None).await?;
  cleanup_script(scheduler.as_ref(), &path, opts);
  Ok(JobResult::new(
    job_id,
    job.name.clone(),
    Arc::clone(scheduler),
  ))
}

/// Submits a job array; errors with [`SchedulerError::Unsupported`] on
/// schedulers without array support.
pub async fn submit_array(
  scheduler: &Arc<dyn Scheduler>,
  array: &JobArray,
  opts: &SubmitOptions,
) -> Result<ArrayJobResult, SchedulerError> {
  if !scheduler.supports_arrays() {
    return Err(SchedulerError::Unsupported {
      scheduler: scheduler.name(),
      feature: "job arrays",
    });
  }

  let script = scheduler.generate_script(&array.job, Some(array), opts.keep_script);
  let path = write_script(&script)?;
  debug!(script = %path.display(), "wrote array submission script");

  let job_id = scheduler
    .submit_script(&array.job, &path, Some(array))
    .await?;
  cleanup_script(scheduler.as_ref(), &path, opts);
  Ok(ArrayJobResult::new(
    job_id,
    array.job.name.clone(),
    array.clone(),
    Arc::clone(scheduler),
  ))
}

fn cleanup_script(scheduler: &dyn Scheduler, path: &Path, opts: &SubmitOptions) {
  if opts.keep_script || !scheduler.spools_script() {
    return;
  }
  if let Err(err) = std::fs::remove_file(path) {
    warn!(script = %path.display(), %err, "could not remove submitted script");
  }
}

/// Collects a job's dependency ids and effective dependency type.
///
/// The CLI-form `dependency` string may carry a type prefix
/// (`afterok:123:456`); without one, every `:`-separated token is an
/// id and the job's `dependency_type` applies. Programmatic
/// `dependencies` ids are appended.
pub(crate) fn dependency_spec(job: &Job) -> (crate::pipeline::DependencyType, Vec<String>) {
  use crate::pipeline::DependencyType;

  let mut dep_type = job.dependency_type;
  let mut ids = Vec::new();

  if let Some(spec) = &job.dependency {
    let mut tokens = spec.split(':').filter(|t| !t.is_empty());
    if let Some(first) = tokens.next() {
      match DependencyType::parse(first) {
        Some(parsed) => dep_type = parsed,
        None => ids.push(first.to_string()),
      }
    }
    ids.extend(tokens.map(str::to_string));
  }
  ids.extend(job.dependencies.iter().cloned());
  (dep_type, ids)
}

/// Runs `argv` capturing stdout/stderr.
pub async fn run_capture(argv: &[String]) -> Result<Output, SchedulerError> {
  debug!(command = %argv.join(" "), "invoking scheduler binary");
  Command::new(&argv[0])
    .args(&argv[1..])
    .output()
    .await
    .map_err(|source| SchedulerError::Invoke {
      command: argv.join(" "),
      source,
    })
}

/// Directory generated scripts are written to.
pub fn script_dir() -> PathBuf {
  if let Ok(dir) = env::var(SCRIPT_DIR_ENV_VAR) {
    if !dir.is_empty() {
      return PathBuf::from(dir);
    }
  }
  home::home_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join(".cache")
    .join("hpcrun")
    .join("scripts")
}

/// Writes `content` to a fresh executable script in [`script_dir`].
pub fn write_script(content: &str) -> Result<PathBuf, SchedulerError> {
  let dir = script_dir();
  std::fs::create_dir_all(&dir).map_err(|source| SchedulerError::WriteScript {
    path: dir.clone(),
    source,
  })?;

  let suffix: String = rand::rng()
    .sample_iter(&Alphanumeric)
    .take(8)
    .map(char::from)
    .collect();
  let path = dir.join(format!("hpcrun_{suffix}.sh"));

  std::fs::write(&path, content).map_err(|source| SchedulerError::WriteScript {
    path: path.clone(),
    source,
  })?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).map_err(
      |source| SchedulerError::WriteScript {
        path: path.clone(),
        source,
      },
    )?;
  }

  Ok(path)
}

/// Checks whether `binary` resolves on `$PATH`.
pub fn binary_on_path(binary: &str) -> bool {
  let Some(path) = env::var_os("PATH") else {
    return false;
  };
  env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

/// Picks a scheduler name from the environment.
///
/// Order: `$HPCRUN_SCHEDULER`, then SGE (`qsub` + `$SGE_ROOT`), then
/// Slurm (`sbatch` + `squeue`), then PBS (`qsub` + `$PBS_CONF_FILE`),
/// falling back to `local`.
pub fn detect_scheduler() -> String {
  if let Ok(name) = env::var(SCHEDULER_ENV_VAR) {
    if !name.is_empty() {
      return name;
    }
  }
  if binary_on_path("qsub") && env::var_os("SGE_ROOT").is_some() {
    return "sge".to_string();
  }
  if binary_on_path("sbatch") && binary_on_path("squeue") {
    return "slurm".to_string();
  }
  if binary_on_path("qsub") && env::var_os("PBS_CONF_FILE").is_some() {
    return "pbs".to_string();
  }
  "local".to_string()
}

type SchedulerFactory = fn(&HpcConfig) -> Arc<dyn Scheduler>;

/// Explicit name → constructor map for scheduler adapters.
pub struct SchedulerRegistry {
  entries: Vec<(String, SchedulerFactory)>,
}

impl SchedulerRegistry {
  pub fn new() -> Self {
    SchedulerRegistry {
      entries: Vec::new(),
    }
  }

  /// Registry with the four built-in adapters.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register("sge", |config| Arc::new(sge::SgeScheduler::new(config)));
    registry.register("slurm", |config| {
      Arc::new(slurm::SlurmScheduler::new(config))
    });
    registry.register("pbs", |config| Arc::new(pbs::PbsScheduler::new(config)));
    registry.register("local", |_| Arc::new(local::LocalScheduler::new()));
    registry
  }

  /// Registers (or replaces) an adapter under `name`.
  pub fn register(&mut self, name: impl Into<String>, factory: SchedulerFactory) {
    let name = name.into();
    self.entries.retain(|(existing, _)| *existing != name);
    self.entries.push((name, factory));
  }

  pub fn names(&self) -> Vec<&str> {
    self.entries.iter().map(|(name, _)| name.as_str()).collect()
  }

  /// Instantiates the named adapter, or the detected one when `name`
  /// is `None`.
  pub fn get(
    &self,
    name: Option<&str>,
    config: &HpcConfig,
  ) -> Result<Arc<dyn Scheduler>, ConfigError> {
    let name = match name {
      Some(name) => name.to_string(),
      None => detect_scheduler(),
    };
    self
      .entries
      .iter()
      .find(|(entry, _)| *entry == name)
      .map(|(_, factory)| factory(config))
      .ok_or_else(|| ConfigError::UnknownScheduler {
        name,
        available: self.names().iter().map(|s| s.to_string()).collect(),
      })
  }
}

impl Default for SchedulerRegistry {
  fn default() -> Self {
    Self::with_defaults()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn registry_knows_builtins() {
    let registry = SchedulerRegistry::with_defaults();
    assert_eq!(registry.names(), ["sge", "slurm", "pbs", "local"]);

    let config = HpcConfig::default();
    let local = registry.get(Some("local"), &config).unwrap();
    assert_eq!(local.name(), "local");
  }

  #[test]
  fn unknown_scheduler_is_a_config_error() {
    let registry = SchedulerRegistry::with_defaults();
    let Err(err) = registry.get(Some("lsf"), &HpcConfig::default()) else {
      panic!("expected an error for an unknown scheduler");
    };
    let message = err.to_string();
    assert!(message.contains("lsf"), "{message}");
    assert!(message.contains("slurm"), "{message}");
  }

  #[test]
  fn register_replaces_existing_entry() {
    let mut registry = SchedulerRegistry::with_defaults();
    registry.register("local", |config| Arc::new(sge::SgeScheduler::new(config)));
    assert_eq!(registry.names().len(), 4);
    let swapped = registry.get(Some("local"), &HpcConfig::default()).unwrap();
    assert_eq!(swapped.name(), "sge");
  }

  #[test]
  fn script_dir_honors_env_override() {
    // Read-only check against the fallback; the env-var path is
    // exercised end to end by the CLI tests.
    let dir = script_dir();
    assert!(dir.ends_with("scripts") || dir.is_absolute());
  }
}
