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

//! Attribute rendering: turning semantic [`Job`] fields into
//! scheduler-specific flags and script directives.
//!
//! Each adapter implements `render_attr` for the attributes it
//! understands; the driver loops here walk [`RENDER_ORDER`] so every
//! scheduler emits directives in the same stable order.

use crate::job::Job;
use crate::schedulers::Scheduler;

/// Semantic job attributes that schedulers can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
  Shell,
  UseCwd,
  InheritEnv,
  Name,
  Cpu,
  Mem,
  Time,
  Queue,
  Priority,
  Nodes,
  Tasks,
  Stdout,
  Stderr,
}

/// Stable rendering order shared by all schedulers.
pub const RENDER_ORDER: [Attr; 13] = [
  Attr::Shell,
  Attr::UseCwd,
  Attr::InheritEnv,
  Attr::Name,
  Attr::Cpu,
  Attr::Mem,
  Attr::Time,
  Attr::Queue,
  Attr::Priority,
  Attr::Nodes,
  Attr::Tasks,
  Attr::Stdout,
  Attr::Stderr,
];

/// Value of one attribute, borrowed from a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrValue<'a> {
  Int(i64),
  Str(&'a str),
  Bool(bool),
}

impl AttrValue<'_> {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttrValue::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl std::fmt::Display for AttrValue<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      AttrValue::Int(n) => write!(f, "{n}"),
      AttrValue::Str(s) => write!(f, "{s}"),
      AttrValue::Bool(b) => write!(f, "{b}"),
    }
  }
}

impl Job {
  /// Looks up one renderable attribute, `None` when unset.
  ///
  /// `UseCwd` is suppressed when an explicit workdir is set; the
  /// generated script will `cd` there instead.
  pub fn attr(&self, attr: Attr) -> Option<AttrValue<'_>> {
    match attr {
      Attr::Shell => Some(AttrValue::Str(&self.shell)),
      Attr::UseCwd => {
        if self.workdir.is_some() {
          None
        } else {
          Some(AttrValue::Bool(self.use_cwd))
        }
      }
      Attr::InheritEnv => Some(AttrValue::Bool(self.inherit_env)),
      Attr::Name => Some(AttrValue::Str(&self.name)),
      Attr::Cpu => self.cpu.map(|n| AttrValue::Int(n as i64)),
      Attr::Mem => self.mem.as_deref().map(AttrValue::Str),
      Attr::Time => self.time.as_deref().map(AttrValue::Str),
      Attr::Queue => self.queue.as_deref().map(AttrValue::Str),
      Attr::Priority => self.priority.map(AttrValue::Int),
      Attr::Nodes => self.nodes.map(|n| AttrValue::Int(n as i64)),
      Attr::Tasks => self.tasks.map(|n| AttrValue::Int(n as i64)),
      Attr::Stdout => self.stdout.as_deref().map(AttrValue::Str),
      Attr::Stderr => self.stderr.as_deref().map(AttrValue::Str),
    }
  }
}

/// Rendered form of one attribute.
///
/// `args` feed the command line of a direct submission; `directive` is
/// the full in-script line (prefix included) for batch scripts. Some
/// attributes render to only one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendering {
  pub args: Vec<String>,
  pub directive: Option<String>,
}

impl Rendering {
  /// Command-line args with the matching directive line.
  pub fn with_directive(prefix: &str, args: Vec<String>) -> Self {
    let directive = Some(format!("{prefix} {}", args.join(" ")));
    Rendering { args, directive }
  }

  /// Command-line args only, no script directive.
  pub fn args_only(args: Vec<String>) -> Self {
    Rendering {
      args,
      directive: None,
    }
  }
}

/// Renders all set attributes of `job` to directive lines, in
/// [`RENDER_ORDER`].
pub fn render_directives<S: Scheduler + ?Sized>(scheduler: &S, job: &Job) -> Vec<String> {
  rendered(scheduler, job)
    .into_iter()
    .filter_map(|r| r.directive)
    .collect()
}

/// Renders all set attributes of `job` to command-line args, in
/// [`RENDER_ORDER`].
pub fn render_args<S: Scheduler + ?Sized>(scheduler: &S, job: &Job) -> Vec<String> {
  rendered(scheduler, job)
    .into_iter()
    .flat_map(|r| r.args)
    .collect()
}

fn rendered<S: Scheduler + ?Sized>(scheduler: &S, job: &Job) -> Vec<Rendering> {
  let mut out: Vec<Rendering> = RENDER_ORDER
    .iter()
    .filter_map(|&attr| {
      let value = job.attr(attr)?;
      scheduler.render_attr(attr, value, job)
    })
    .collect();
  out.extend(scheduler.extra_renderings(job));
  out
}

/// Environment and command portion of a generated script: module
/// setup, venv activation, env var exports, workdir change, then the
/// command itself.
pub fn script_body(job: &Job) -> String {
  let mut lines = Vec::new();

  for path in &job.modules_path {
    lines.push(format!("module use {path}"));
  }
  for module in &job.modules {
    lines.push(format!("module load {module}"));
  }

  if let Some(venv) = &job.venv {
    lines.push(format!("source \"{venv}/bin/activate\""));
  }

  // Prepend/append keep any existing value, colon-separated.
  for (key, value) in &job.env_prepend {
    lines.push(format!("export {key}=\"{value}${{{key}:+:${{{key}}}}}\""));
  }
  for (key, value) in &job.env_append {
    lines.push(format!("export {key}=\"${{{key}:+${{{key}}}:}}{value}\""));
  }
  for (key, value) in &job.env_vars {
    lines.push(format!("export {key}=\"{value}\""));
  }

  if let Some(workdir) = &job.workdir {
    lines.push(format!("cd \"{}\"", workdir.display()));
  }

  lines.push(job.command.clone());
  lines.join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::HpcConfig;

  #[test]
  fn unset_attrs_are_none() {
    let job = Job::builder("echo hi").build(&HpcConfig::default());
    assert!(job.attr(Attr::Cpu).is_none());
    assert!(job.attr(Attr::Queue).is_none());
    assert_eq!(job.attr(Attr::Shell).unwrap().as_str(), Some("/bin/bash"));
  }

  #[test]
  fn workdir_suppresses_use_cwd() {
    let config = HpcConfig::default();
    let plain = Job::builder("x").build(&config);
    assert_eq!(plain.attr(Attr::UseCwd), Some(AttrValue::Bool(true)));

    let with_dir = Job::builder("x").workdir("/scratch/run1").build(&config);
    assert!(with_dir.attr(Attr::UseCwd).is_none());
  }

  #[test]
  fn script_body_order_and_exports() {
    let config = HpcConfig::default();
    let mut job = Job::builder("python train.py")
      .modules(vec!["python/3.11".into()])
      .modules_path(vec!["/opt/modules".into()])
      .venv("/home/alice/venv")
      .workdir("/scratch/run1")
      .build(&config);
    job.env_prepend.insert("PATH".into(), "/opt/bin".into());
    job.env_append.insert("LD_LIBRARY_PATH".into(), "/opt/lib".into());
    job.env_vars.insert("OMP_NUM_THREADS".into(), "4".into());

    let body = script_body(&job);
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(
      lines,
      [
        "module use /opt/modules",
        "module load python/3.11",
        "source \"/home/alice/venv/bin/activate\"",
        "export PATH=\"/opt/bin${PATH:+:${PATH}}\"",
        "export LD_LIBRARY_PATH=\"${LD_LIBRARY_PATH:+${LD_LIBRARY_PATH}:}/opt/lib\"",
        "export OMP_NUM_THREADS=\"4\"",
        "cd \"/scratch/run1\"",
        "python train.py",
      ]
    );
  }

  #[test]
  fn rendering_with_directive_joins_args() {
    let r = Rendering::with_directive("#$", vec!["-pe".into(), "smp".into(), "4".into()]);
    assert_eq!(r.directive.as_deref(), Some("#$ -pe smp 4"));
    assert_eq!(r.args, ["-pe", "smp", "4"]);
  }
}
