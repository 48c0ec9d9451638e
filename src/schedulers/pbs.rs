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

//! PBS adapter (`qsub`/`qstat`/`qdel`).
//!
//! PBS ships no accounting query tool, so history queries return the
//! typed accounting-not-available error.

use async_trait::async_trait;
use std::path::Path;
use std::path::PathBuf;

use crate::config::HpcConfig;
use crate::error::SchedulerError;
use crate::job::Job;
use crate::job::JobArray;
use crate::job::current_user;
use crate::result::JobInfo;
use crate::result::JobStatus;
use crate::schedulers::DetailExtras;
use crate::schedulers::HistoryFilter;
use crate::schedulers::JobFilter;
use crate::schedulers::OutputStream;
use crate::schedulers::Scheduler;
use crate::schedulers::dependency_spec;
use crate::schedulers::render::Attr;
use crate::schedulers::render::AttrValue;
use crate::schedulers::render::Rendering;
use crate::schedulers::render::render_directives;
use crate::schedulers::render::script_body;
use crate::schedulers::run_capture;

const DIRECTIVE_PREFIX: &str = "#PBS";

#[derive(Debug, Clone, Default)]
pub struct PbsScheduler;

impl PbsScheduler {
  pub fn new(_config: &HpcConfig) -> Self {
    PbsScheduler
  }
}

#[async_trait]
impl Scheduler for PbsScheduler {
  fn name(&self) -> &'static str {
    "pbs"
  }

  fn directive_prefix(&self) -> Option<&'static str> {
    Some(DIRECTIVE_PREFIX)
  }

  fn render_attr(&self, attr: Attr, value: AttrValue<'_>, _job: &Job) -> Option<Rendering> {
    let args = match (attr, value) {
      (Attr::Shell, AttrValue::Str(shell)) => vec!["-S".into(), shell.into()],
      (Attr::InheritEnv, AttrValue::Bool(true)) => vec!["-V".into()],
      (Attr::Name, AttrValue::Str(name)) => vec!["-N".into(), name.into()],
      (Attr::Cpu, AttrValue::Int(n)) => vec!["-l".into(), format!("ncpus={n}")],
      (Attr::Mem, AttrValue::Str(mem)) => vec!["-l".into(), format!("mem={mem}")],
      (Attr::Time, AttrValue::Str(time)) => vec!["-l".into(), format!("walltime={time}")],
      (Attr::Queue, AttrValue::Str(queue)) => vec!["-q".into(), queue.into()],
      (Attr::Priority, AttrValue::Int(p)) => vec!["-p".into(), p.to_string()],
      (Attr::Nodes, AttrValue::Int(n)) => vec!["-l".into(), format!("nodes={n}")],
      (Attr::Stdout, AttrValue::Str(path)) => vec!["-o".into(), path.into()],
      (Attr::Stderr, AttrValue::Str(path)) => vec!["-e".into(), path.into()],
      _ => return None,
    };
    Some(Rendering::with_directive(DIRECTIVE_PREFIX, args))
  }

  fn extra_renderings(&self, job: &Job) -> Vec<Rendering> {
    let mut out = Vec::new();
    if job.merge_output() {
      out.push(Rendering::with_directive(
        DIRECTIVE_PREFIX,
        vec!["-j".into(), "oe".into()],
      ));
    }
    for resource in &job.resources {
      out.push(Rendering::with_directive(
        DIRECTIVE_PREFIX,
        vec!["-l".into(), format!("{}={}", resource.name, resource.value)],
      ));
    }
    out
  }

  fn array_args(&self, array: &JobArray) -> Vec<String> {
    let mut range = format!("{}-{}", array.start, array.end);
    if array.step != 1 {
      range.push_str(&format!(":{}", array.step));
    }
    vec!["-J".into(), range]
  }

  fn dependency_args(&self, job: &Job) -> Vec<String> {
    let (dep_type, ids) = dependency_spec(job);
    if ids.is_empty() {
      return Vec::new();
    }
    vec![
      "-W".into(),
      format!("depend={}:{}", dep_type.keyword(), ids.join(":")),
    ]
  }

  fn passthrough_args(&self, job: &Job) -> Vec<String> {
    let mut args = job.raw_args.clone();
    args.extend(job.pbs_args.iter().cloned());
    args
  }

  // PBS jobs start in $HOME; honoring use_cwd needs an in-script cd.
  fn generate_script(&self, job: &Job, _array: Option<&JobArray>, keep_script: bool) -> String {
    let mut lines = vec![format!("#!{}", job.shell)];
    lines.extend(render_directives(self, job));
    if !keep_script {
      lines.push("trap 'rm -f -- \"$0\"' EXIT".to_string());
    }
    if job.use_cwd && job.workdir.is_none() {
      lines.push("cd \"$PBS_O_WORKDIR\"".to_string());
    }
    lines.push(script_body(job));
    lines.push(String::new());
    lines.join("\n")
  }

  fn build_submit_command(
    &self,
    job: &Job,
    script: &Path,
    array: Option<&JobArray>,
  ) -> Vec<String> {
    let mut argv = vec!["qsub".to_string()];
    argv.extend(self.dependency_args(job));
    if let Some(array) = array {
      argv.extend(self.array_args(array));
    }
    argv.extend(self.passthrough_args(job));
    argv.push(script.display().to_string());
    argv
  }

  fn build_interactive_command(&self, job: &Job) -> Vec<String> {
    let mut argv = vec!["qsub".to_string(), "-I".to_string()];
    argv.extend(crate::schedulers::render::render_args(self, job));
    argv.extend(self.dependency_args(job));
    argv.extend(self.passthrough_args(job));
    argv
  }

  // qsub prints the bare job id, e.g. `1234.pbsserver`.
  fn parse_job_id(&self, stdout: &str) -> Result<String, SchedulerError> {
    stdout
      .lines()
      .map(str::trim)
      .find(|line| !line.is_empty() && line.starts_with(|c: char| c.is_ascii_digit()))
      .map(str::to_string)
      .ok_or_else(|| SchedulerError::ParseJobId {
        scheduler: "pbs",
        output: stdout.trim().to_string(),
      })
  }

  async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
    match self.full_status(job_id).await? {
      Some(fields) => Ok(state_from_fields(&fields)),
      None => Ok(JobStatus::Unknown),
    }
  }

  async fn exit_code(&self, job_id: &str) -> Result<Option<i32>, SchedulerError> {
    Ok(
      self
        .full_status(job_id)
        .await?
        .and_then(|fields| fields.get("Exit_status").and_then(|v| v.parse().ok())),
    )
  }

  async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
    let argv = vec!["qdel".to_string(), job_id.to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(())
  }

  fn has_accounting(&self) -> bool {
    false
  }

  async fn list_active_jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError> {
    let argv = vec!["qstat".to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    let mut jobs = parse_qstat(&String::from_utf8_lossy(&output.stdout));
    if !filter.all_users {
      let user = filter.user.clone().unwrap_or_else(current_user);
      jobs.retain(|job| job.user == user);
    }
    Ok(jobs)
  }

  async fn list_completed_jobs(
    &self,
    _filter: &HistoryFilter,
  ) -> Result<Vec<JobInfo>, SchedulerError> {
    Err(SchedulerError::AccountingNotAvailable("pbs".to_string()))
  }

  async fn get_job_details(
    &self,
    job_id: &str,
  ) -> Result<(JobInfo, DetailExtras), SchedulerError> {
    let fields = self
      .full_status(job_id)
      .await?
      .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

    let mut info = JobInfo::new(
      job_id,
      fields.get("Job_Name").cloned().unwrap_or_default(),
      state_from_fields(&fields),
    );
    // Job_Owner prints as `alice@headnode`.
    info.user = fields
      .get("Job_Owner")
      .map(|u| u.split('@').next().unwrap_or(u).to_string())
      .unwrap_or_default();
    info.queue = fields.get("queue").cloned();
    info.exit_code = fields.get("Exit_status").and_then(|v| v.parse().ok());
    Ok((info, fields))
  }

  fn output_path(&self, job_id: &str, job_name: &str, stream: OutputStream) -> Option<PathBuf> {
    let marker = match stream {
      OutputStream::Stdout => 'o',
      OutputStream::Stderr => 'e',
    };
    let seq = job_id.split('.').next().unwrap_or(job_id);
    Some(PathBuf::from(format!("{job_name}.{marker}{seq}")))
  }

  fn array_task_id(&self, base_job_id: &str, index: u32) -> String {
    match base_job_id.split_once('.') {
      Some((seq, server)) => {
        let seq = seq.trim_end_matches("[]");
        format!("{seq}[{index}].{server}")
      }
      None => format!("{}[{index}]", base_job_id.trim_end_matches("[]")),
    }
  }
}

impl PbsScheduler {
  async fn full_status(&self, job_id: &str) -> Result<Option<DetailExtras>, SchedulerError> {
    let argv = vec!["qstat".to_string(), "-f".to_string(), job_id.to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Ok(None);
    }
    Ok(Some(parse_qstat_full(&String::from_utf8_lossy(
      &output.stdout,
    ))))
  }
}

/// Maps a PBS `job_state` letter onto the shared model; a finished
/// job's outcome comes from `Exit_status`.
fn state_from_fields(fields: &DetailExtras) -> JobStatus {
  let state = fields.get("job_state").map(String::as_str).unwrap_or("");
  match state {
    "Q" | "H" | "W" | "T" | "S" => JobStatus::Pending,
    "R" | "E" => JobStatus::Running,
    "F" => match fields.get("Exit_status").and_then(|v| v.parse::<i32>().ok()) {
      Some(0) => JobStatus::Completed,
      Some(_) => JobStatus::Failed,
      None => JobStatus::Completed,
    },
    _ => JobStatus::Unknown,
  }
}

/// Parses `qstat -f` `key = value` output, folding the indented
/// continuation lines PBS wraps long values onto.
fn parse_qstat_full(stdout: &str) -> DetailExtras {
  let mut fields = DetailExtras::new();
  let mut current: Option<String> = None;

  for line in stdout.lines() {
    if line.starts_with(char::is_whitespace) && !line.contains(" = ") {
      if let Some(key) = &current {
        if let Some(value) = fields.get_mut(key) {
          value.push_str(line.trim());
        }
      }
      continue;
    }
    if let Some((key, value)) = line.trim().split_once(" = ") {
      let key = key.trim().to_string();
      fields.insert(key.clone(), value.trim().to_string());
      current = Some(key);
    }
  }
  fields
}

/// Parses the default `qstat` table:
/// `Job id  Name  User  Time Use  S  Queue`.
fn parse_qstat(stdout: &str) -> Vec<JobInfo> {
  stdout
    .lines()
    .filter_map(|line| {
      let fields: Vec<&str> = line.split_whitespace().collect();
      if fields.len() < 6 || !fields[0].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
      }
      let state = match fields[4] {
        "Q" | "H" | "W" | "T" | "S" => JobStatus::Pending,
        "R" | "E" => JobStatus::Running,
        "F" => JobStatus::Completed,
        _ => JobStatus::Unknown,
      };
      let mut info = JobInfo::new(fields[0], fields[1], state);
      info.user = fields[2].to_string();
      info.queue = Some(fields[5].to_string());
      Some(info)
    })
    .collect()
}
