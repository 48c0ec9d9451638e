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

//! Scheduler-agnostic job model.
//!
//! A [`Job`] carries only semantic attributes (plus raw-passthrough
//! escape hatches); it never encodes scheduler syntax. Rendering to a
//! scheduler's flags and directives happens in [`crate::schedulers`].

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use toml::Table;
use toml::Value;

use crate::config::HpcConfig;
use crate::error::ValidationError;
use crate::pipeline::DependencyType;
use crate::resources::ResourceSet;

/// Default shell for generated scripts.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// One unit of work, described independently of any scheduler.
///
/// Built by [`Job::builder`], which merges resolved configuration with
/// explicit overrides (explicit wins). Attributes may still be adjusted
/// before submission.
#[derive(Debug, Clone)]
pub struct Job {
  /// Command line to execute, already shell-quoted.
  pub command: String,
  pub name: String,

  // Resource requests
  pub cpu: Option<u32>,
  pub mem: Option<String>,
  pub time: Option<String>,
  pub queue: Option<String>,
  pub priority: Option<i64>,
  pub nodes: Option<u32>,
  pub tasks: Option<u32>,

  // Output handling. `stderr == None` means "merge into stdout".
  pub stdout: Option<String>,
  pub stderr: Option<String>,

  // Environment
  pub inherit_env: bool,
  pub env_vars: BTreeMap<String, String>,
  pub env_prepend: BTreeMap<String, String>,
  pub env_append: BTreeMap<String, String>,
  pub modules: Vec<String>,
  pub modules_path: Vec<String>,
  pub venv: Option<String>,

  // Working directory
  pub workdir: Option<PathBuf>,
  pub use_cwd: bool,

  pub shell: String,
  pub resources: ResourceSet,

  // Raw passthrough, per-invocation only (never from config).
  pub raw_args: Vec<String>,
  pub sge_args: Vec<String>,
  pub slurm_args: Vec<String>,
  pub pbs_args: Vec<String>,

  /// CLI-form dependency spec (e.g. `"afterok:12345"` or `"12345"`).
  pub dependency: Option<String>,
  /// Programmatic dependencies: job ids this job waits on.
  pub dependencies: Vec<String>,
  pub dependency_type: DependencyType,
}

impl Job {
  pub fn builder(command: impl Into<String>) -> JobBuilder {
    JobBuilder::new(command)
  }

  /// Whether stderr should be merged into stdout.
  pub fn merge_output(&self) -> bool {
    self.stderr.is_none()
  }
}

/// Staged parameters for a [`Job`], overlaid onto resolved config by
/// [`JobBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
  command: String,
  job_type: Option<String>,
  name: Option<String>,
  cpu: Option<u32>,
  mem: Option<String>,
  time: Option<String>,
  queue: Option<String>,
  priority: Option<i64>,
  nodes: Option<u32>,
  tasks: Option<u32>,
  stdout: Option<String>,
  stderr: Option<String>,
  inherit_env: Option<bool>,
  env_vars: Option<BTreeMap<String, String>>,
  env_prepend: Option<BTreeMap<String, String>>,
  env_append: Option<BTreeMap<String, String>>,
  modules: Option<Vec<String>>,
  modules_path: Option<Vec<String>>,
  venv: Option<String>,
  workdir: Option<PathBuf>,
  use_cwd: Option<bool>,
  shell: Option<String>,
  resources: Option<ResourceSet>,
  raw_args: Vec<String>,
  sge_args: Vec<String>,
  slurm_args: Vec<String>,
  pbs_args: Vec<String>,
  dependency: Option<String>,
}

impl JobBuilder {
  pub fn new(command: impl Into<String>) -> Self {
    JobBuilder {
      command: command.into(),
      ..Default::default()
    }
  }

  /// Look up `[types.<name>]` config instead of the tool config.
  pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
    self.job_type = Some(job_type.into());
    self
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn cpu(mut self, cpu: u32) -> Self {
    self.cpu = Some(cpu);
    self
  }

  pub fn mem(mut self, mem: impl Into<String>) -> Self {
    self.mem = Some(mem.into());
    self
  }

  pub fn time(mut self, time: impl Into<String>) -> Self {
    self.time = Some(time.into());
    self
  }

  pub fn queue(mut self, queue: impl Into<String>) -> Self {
    self.queue = Some(queue.into());
    self
  }

  pub fn priority(mut self, priority: i64) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn nodes(mut self, nodes: u32) -> Self {
    self.nodes = Some(nodes);
    self
  }

  pub fn tasks(mut self, tasks: u32) -> Self {
    self.tasks = Some(tasks);
    self
  }

  pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
    self.stdout = Some(stdout.into());
    self
  }

  pub fn stderr(mut self, stderr: impl Into<String>) -> Self {
    self.stderr = Some(stderr.into());
    self
  }

  pub fn inherit_env(mut self, inherit: bool) -> Self {
    self.inherit_env = Some(inherit);
    self
  }

  pub fn env_vars(mut self, vars: BTreeMap<String, String>) -> Self {
    self.env_vars = Some(vars);
    self
  }

  pub fn modules(mut self, modules: Vec<String>) -> Self {
    self.modules = Some(modules);
    self
  }

  pub fn modules_path(mut self, paths: Vec<String>) -> Self {
    self.modules_path = Some(paths);
    self
  }

  pub fn venv(mut self, venv: impl Into<String>) -> Self {
    self.venv = Some(venv.into());
    self
  }

  pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
    self.workdir = Some(workdir.into());
    self
  }

  pub fn use_cwd(mut self, use_cwd: bool) -> Self {
    self.use_cwd = Some(use_cwd);
    self
  }

  pub fn shell(mut self, shell: impl Into<String>) -> Self {
    self.shell = Some(shell.into());
    self
  }

  pub fn resources(mut self, resources: ResourceSet) -> Self {
    self.resources = Some(resources);
    self
  }

  pub fn raw_args(mut self, args: Vec<String>) -> Self {
    self.raw_args = args;
    self
  }

  pub fn sge_args(mut self, args: Vec<String>) -> Self {
    self.sge_args = args;
    self
  }

  pub fn slurm_args(mut self, args: Vec<String>) -> Self {
    self.slurm_args = args;
    self
  }

  pub fn pbs_args(mut self, args: Vec<String>) -> Self {
    self.pbs_args = args;
    self
  }

  pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
    self.dependency = Some(dependency.into());
    self
  }

  /// Merges resolved config with the staged overrides into a [`Job`].
  ///
  /// With a `job_type`, `[types.<name>]` config is used; otherwise the
  /// tool config matching the command. A `command` key in config is
  /// always discarded — the command comes from the caller, never from
  /// config. Per-invocation fields (raw args, string dependency) are
  /// taken only from the builder.
  pub fn build(self, config: &HpcConfig) -> Job {
    let mut merged: Table = match &self.job_type {
      Some(job_type) => config.get_type_config(job_type),
      None => config.get_tool_config(&self.command),
    };
    merged.remove("command");

    let name = self
      .name
      .or_else(|| get_string(&merged, "name"))
      .unwrap_or_else(|| generate_name(&current_user(), &self.command));

    let venv = self
      .venv
      .or_else(|| get_string(&merged, "venv"))
      .or_else(|| env::var("VIRTUAL_ENV").ok());

    let resources = self
      .resources
      .or_else(|| resources_from_config(&merged))
      .unwrap_or_default();

    Job {
      name,
      venv,
      resources,
      cpu: self.cpu.or_else(|| get_u32(&merged, "cpu")),
      mem: self.mem.or_else(|| get_string(&merged, "mem")),
      time: self.time.or_else(|| get_string(&merged, "time")),
      queue: self.queue.or_else(|| get_string(&merged, "queue")),
      priority: self.priority.or_else(|| get_i64(&merged, "priority")),
      nodes: self.nodes.or_else(|| get_u32(&merged, "nodes")),
      tasks: self.tasks.or_else(|| get_u32(&merged, "tasks")),
      stdout: self.stdout.or_else(|| get_string(&merged, "stdout")),
      stderr: self.stderr.or_else(|| get_string(&merged, "stderr")),
      inherit_env: self
        .inherit_env
        .or_else(|| get_bool(&merged, "inherit_env"))
        .unwrap_or(true),
      env_vars: self
        .env_vars
        .or_else(|| get_string_map(&merged, "env_vars"))
        .unwrap_or_default(),
      env_prepend: self
        .env_prepend
        .or_else(|| get_string_map(&merged, "env_prepend"))
        .unwrap_or_default(),
      env_append: self
        .env_append
        .or_else(|| get_string_map(&merged, "env_append"))
        .unwrap_or_default(),
      modules: self
        .modules
        .or_else(|| get_string_list(&merged, "modules"))
        .unwrap_or_default(),
      modules_path: self
        .modules_path
        .or_else(|| get_string_list(&merged, "modules_path"))
        .unwrap_or_default(),
      workdir: self
        .workdir
        .or_else(|| get_string(&merged, "workdir").map(PathBuf::from)),
      use_cwd: self
        .use_cwd
        .or_else(|| get_bool(&merged, "use_cwd"))
        .unwrap_or(true),
      shell: self
        .shell
        .or_else(|| get_string(&merged, "shell"))
        .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
      raw_args: self.raw_args,
      sge_args: self.sge_args,
      slurm_args: self.slurm_args,
      pbs_args: self.pbs_args,
      dependency: self.dependency,
      dependencies: Vec::new(),
      dependency_type: DependencyType::AfterOk,
      command: self.command,
    }
  }
}

/// Current username for job naming and status filters.
pub fn current_user() -> String {
  env::var("USER")
    .or_else(|_| env::var("USERNAME"))
    .unwrap_or_else(|_| "user".to_string())
}

/// `{user}_{first '='-free command token, path-stripped}`.
fn generate_name(user: &str, command: &str) -> String {
  for part in command.split_whitespace() {
    if !part.contains('=') {
      let cmd_name = part.rsplit('/').next().unwrap_or(part);
      return format!("{user}_{cmd_name}");
    }
  }
  format!("{user}_job")
}

fn get_string(table: &Table, key: &str) -> Option<String> {
  table.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_i64(table: &Table, key: &str) -> Option<i64> {
  table.get(key).and_then(Value::as_integer)
}

fn get_u32(table: &Table, key: &str) -> Option<u32> {
  get_i64(table, key).and_then(|n| u32::try_from(n).ok())
}

fn get_bool(table: &Table, key: &str) -> Option<bool> {
  table.get(key).and_then(Value::as_bool)
}

fn get_string_list(table: &Table, key: &str) -> Option<Vec<String>> {
  let array = table.get(key)?.as_array()?;
  Some(
    array
      .iter()
      .filter_map(Value::as_str)
      .map(str::to_string)
      .collect(),
  )
}

fn get_string_map(table: &Table, key: &str) -> Option<BTreeMap<String, String>> {
  let map = table.get(key)?.as_table()?;
  Some(
    map
      .iter()
      .filter_map(|(k, v)| Some((k.clone(), value_to_string(v)?)))
      .collect(),
  )
}

fn value_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Integer(n) => Some(n.to_string()),
    Value::Float(f) => Some(f.to_string()),
    Value::Boolean(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Converts a config `resources = [{name = "gpu", value = 1}, ...]`
/// array into a [`ResourceSet`].
fn resources_from_config(table: &Table) -> Option<ResourceSet> {
  let array = table.get("resources")?.as_array()?;
  let mut set = ResourceSet::new();
  for entry in array {
    let entry = entry.as_table()?;
    let name = entry.get("name").and_then(Value::as_str)?;
    match entry.get("value")? {
      Value::Integer(n) => set.add(name, *n),
      Value::String(s) => set.add(name, s.as_str()),
      _ => continue,
    };
  }
  Some(set)
}

/// One submission expanding into many indexed tasks sharing one script.
#[derive(Debug, Clone)]
pub struct JobArray {
  pub job: Job,
  pub start: u32,
  pub end: u32,
  pub step: u32,
  /// Max simultaneous tasks (throttling), if the scheduler supports it.
  pub max_concurrent: Option<u32>,
}

impl JobArray {
  pub fn new(job: Job, start: u32, end: u32) -> Self {
    JobArray {
      job,
      start,
      end,
      step: 1,
      max_concurrent: None,
    }
  }

  /// Parses `START-END[:STEP][%MAX]` (e.g. `1-100:2%5`).
  pub fn parse_spec(job: Job, spec: &str) -> Result<Self, ValidationError> {
    let bad = || ValidationError::BadArraySpec(spec.to_string());

    let (range, rest) = match spec.split_once(':') {
      Some((range, rest)) => (range, Some(rest)),
      None => (spec, None),
    };

    // `%MAX` may follow the range directly or the step.
    let (range, mut max_concurrent) = split_max(range).ok_or_else(bad)?;
    let mut step = 1;
    if let Some(rest) = rest {
      let (step_str, max) = split_max(rest).ok_or_else(bad)?;
      step = step_str.parse().map_err(|_| bad())?;
      if max.is_some() {
        max_concurrent = max;
      }
    }

    let (start, end) = match range.split_once('-') {
      Some((s, e)) => (
        s.parse().map_err(|_| bad())?,
        e.parse().map_err(|_| bad())?,
      ),
      None => {
        let single = range.parse().map_err(|_| bad())?;
        (single, single)
      }
    };

    if step == 0 || end < start {
      return Err(bad());
    }

    Ok(JobArray {
      job,
      start,
      end,
      step,
      max_concurrent,
    })
  }

  /// Scheduler range string, e.g. `1-100:2%5`.
  pub fn range_str(&self) -> String {
    let mut s = format!("{}-{}", self.start, self.end);
    if self.step != 1 {
      s.push_str(&format!(":{}", self.step));
    }
    if let Some(max) = self.max_concurrent {
      s.push_str(&format!("%{max}"));
    }
    s
  }

  pub fn indices(&self) -> impl Iterator<Item = u32> {
    (self.start..=self.end).step_by(self.step as usize)
  }

  pub fn count(&self) -> usize {
    self.indices().count()
  }
}

fn split_max(part: &str) -> Option<(&str, Option<u32>)> {
  match part.split_once('%') {
    Some((head, max)) => Some((head, Some(max.parse().ok()?))),
    None => Some((part, None)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::load_config;
  use std::fs;
  use tempfile::tempdir;

  fn config_from(content: &str) -> HpcConfig {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hpcrun.toml");
    fs::write(&path, content).unwrap();
    load_config(Some(&path)).unwrap()
  }

  #[test]
  fn builtin_defaults_apply() {
    let config = HpcConfig::default();
    let job = Job::builder("echo hi").build(&config);
    assert!(job.inherit_env);
    assert!(job.use_cwd);
    assert_eq!(job.shell, "/bin/bash");
    assert!(job.cpu.is_none());
    assert!(job.merge_output());
  }

  #[test]
  fn explicit_overrides_beat_config() {
    let config = config_from("[tools.python]\ncpu = 4\nmem = \"8G\"\n");
    let job = Job::builder("python train.py")
      .cpu(16)
      .build(&config);
    assert_eq!(job.cpu, Some(16));
    assert_eq!(job.mem.as_deref(), Some("8G"));
  }

  #[test]
  fn command_never_comes_from_config() {
    let config = config_from("[tools.python]\ncommand = \"rm -rf /\"\ncpu = 2\n");
    let job = Job::builder("python train.py").build(&config);
    assert_eq!(job.command, "python train.py");
    assert_eq!(job.cpu, Some(2));
  }

  #[test]
  fn job_type_uses_types_section() {
    let config = config_from("[types.gpu]\nqueue = \"gpu.q\"\n[tools.python]\nqueue = \"cpu.q\"\n");
    let job = Job::builder("python train.py")
      .job_type("gpu")
      .build(&config);
    assert_eq!(job.queue.as_deref(), Some("gpu.q"));
  }

  #[test]
  fn generated_name_skips_env_assignments() {
    assert_eq!(generate_name("alice", "FOO=1 python train.py"), "alice_python");
    assert_eq!(
      generate_name("alice", "/usr/local/bin/samtools sort"),
      "alice_samtools"
    );
    assert_eq!(generate_name("alice", "A=1 B=2"), "alice_job");
  }

  #[test]
  fn resources_converted_from_config() {
    let config = config_from(
      "[types.fpga]\nresources = [{name = \"xilinx\", value = 1}, {name = \"mem\", value = \"16G\"}]\n",
    );
    let job = Job::builder("synth design.v").job_type("fpga").build(&config);
    assert_eq!(job.resources.len(), 2);
    assert_eq!(job.resources.get("xilinx").unwrap().value.to_string(), "1");
  }

  #[test]
  fn explicit_resources_replace_config_entirely() {
    let config = config_from("[types.fpga]\nresources = [{name = \"xilinx\", value = 1}]\n");
    let mut set = ResourceSet::new();
    set.add("gpu", 2);
    let job = Job::builder("x")
      .job_type("fpga")
      .resources(set)
      .build(&config);
    assert_eq!(job.resources.len(), 1);
    assert!(job.resources.get("gpu").is_some());
    assert!(job.resources.get("xilinx").is_none());
  }

  #[test]
  fn modules_come_from_tool_config() {
    let config = config_from("[tools.python]\nmodules = [\"python/3.11\"]\n");
    let job = Job::builder("python train.py").build(&config);
    assert_eq!(job.modules, ["python/3.11"]);
  }

  #[test]
  fn array_spec_parsing() {
    let job = Job::builder("x").build(&HpcConfig::default());

    let plain = JobArray::parse_spec(job.clone(), "1-100").unwrap();
    assert_eq!(plain.range_str(), "1-100");
    assert_eq!(plain.count(), 100);

    let stepped = JobArray::parse_spec(job.clone(), "1-10:2").unwrap();
    assert_eq!(stepped.range_str(), "1-10:2");
    assert_eq!(stepped.count(), 5);

    let throttled = JobArray::parse_spec(job.clone(), "1-100%5").unwrap();
    assert_eq!(throttled.range_str(), "1-100%5");

    let both = JobArray::parse_spec(job.clone(), "1-100:2%5").unwrap();
    assert_eq!(both.range_str(), "1-100:2%5");

    let single = JobArray::parse_spec(job.clone(), "7").unwrap();
    assert_eq!(single.count(), 1);

    for bad in ["", "a-b", "10-1", "1-10:0", "1-10%x"] {
      assert!(JobArray::parse_spec(job.clone(), bad).is_err(), "accepted {bad:?}");
    }
  }
}
