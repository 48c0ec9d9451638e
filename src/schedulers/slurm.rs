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

//! Slurm adapter (`sbatch`/`squeue`/`sacct`/`scancel`/`srun`/`scontrol`).

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Local;
use chrono::NaiveDateTime;
use chrono::TimeZone;
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
use crate::schedulers::run_capture;

const DIRECTIVE_PREFIX: &str = "#SBATCH";
const SACCT_FIELDS: &str = "JobID,JobName,User,State,Partition,Submit,Start,End,ExitCode";

#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

impl SlurmScheduler {
  pub fn new(_config: &HpcConfig) -> Self {
    SlurmScheduler
  }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
  fn name(&self) -> &'static str {
    "slurm"
  }

  fn directive_prefix(&self) -> Option<&'static str> {
    Some(DIRECTIVE_PREFIX)
  }

  fn render_attr(&self, attr: Attr, value: AttrValue<'_>, _job: &Job) -> Option<Rendering> {
    let arg = match (attr, value) {
      (Attr::InheritEnv, AttrValue::Bool(true)) => "--export=ALL".to_string(),
      (Attr::InheritEnv, AttrValue::Bool(false)) => "--export=NONE".to_string(),
      (Attr::Name, AttrValue::Str(name)) => format!("--job-name={name}"),
      (Attr::Cpu, AttrValue::Int(n)) => format!("--cpus-per-task={n}"),
      (Attr::Mem, AttrValue::Str(mem)) => format!("--mem={mem}"),
      (Attr::Time, AttrValue::Str(time)) => format!("--time={time}"),
      (Attr::Queue, AttrValue::Str(partition)) => format!("--partition={partition}"),
      (Attr::Priority, AttrValue::Int(p)) => format!("--priority={p}"),
      (Attr::Nodes, AttrValue::Int(n)) => format!("--nodes={n}"),
      (Attr::Tasks, AttrValue::Int(n)) => format!("--ntasks={n}"),
      (Attr::Stdout, AttrValue::Str(path)) => format!("--output={path}"),
      (Attr::Stderr, AttrValue::Str(path)) => format!("--error={path}"),
      // Shell comes from the shebang; Slurm starts in the submit dir
      // already, so UseCwd needs no flag.
      _ => return None,
    };
    Some(Rendering::with_directive(DIRECTIVE_PREFIX, vec![arg]))
  }

  fn extra_renderings(&self, job: &Job) -> Vec<Rendering> {
    job
      .resources
      .iter()
      .map(|r| {
        Rendering::with_directive(
          DIRECTIVE_PREFIX,
          vec![format!("--gres={}:{}", r.name, r.value)],
        )
      })
      .collect()
  }

  fn array_args(&self, array: &JobArray) -> Vec<String> {
    vec![format!("--array={}", array.range_str())]
  }

  fn dependency_args(&self, job: &Job) -> Vec<String> {
    let (dep_type, ids) = dependency_spec(job);
    if ids.is_empty() {
      return Vec::new();
    }
    vec![format!(
      "--dependency={}:{}",
      dep_type.keyword(),
      ids.join(":")
    )]
  }

  fn passthrough_args(&self, job: &Job) -> Vec<String> {
    let mut args = job.raw_args.clone();
    args.extend(job.slurm_args.iter().cloned());
    args
  }

  fn build_submit_command(
    &self,
    job: &Job,
    script: &Path,
    array: Option<&JobArray>,
  ) -> Vec<String> {
    let mut argv = vec!["sbatch".to_string()];
    argv.extend(self.dependency_args(job));
    if let Some(array) = array {
      argv.extend(self.array_args(array));
    }
    argv.extend(self.passthrough_args(job));
    argv.push(script.display().to_string());
    argv
  }

  fn build_interactive_command(&self, job: &Job) -> Vec<String> {
    let mut argv = vec!["srun".to_string()];
    argv.extend(crate::schedulers::render::render_args(self, job));
    argv.extend(self.dependency_args(job));
    argv.extend(self.passthrough_args(job));
    argv.push(job.shell.clone());
    argv.push("-c".to_string());
    argv.push(job.command.clone());
    argv
  }

  fn parse_job_id(&self, stdout: &str) -> Result<String, SchedulerError> {
    parse_sbatch_output(stdout).ok_or_else(|| SchedulerError::ParseJobId {
      scheduler: "slurm",
      output: stdout.trim().to_string(),
    })
  }

  async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
    let argv = vec![
      "squeue".to_string(),
      "-h".to_string(),
      "-j".to_string(),
      job_id.to_string(),
      "-o".to_string(),
      "%T".to_string(),
    ];
    if let Ok(output) = run_capture(&argv).await {
      if output.status.success() {
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !state.is_empty() {
          return Ok(map_state(&state));
        }
      }
    }
    // Gone from the queue; ask accounting.
    match self.sacct_row(job_id).await? {
      Some(row) => Ok(row.state),
      None => Ok(JobStatus::Unknown),
    }
  }

  async fn exit_code(&self, job_id: &str) -> Result<Option<i32>, SchedulerError> {
    Ok(self.sacct_row(job_id).await?.and_then(|row| row.exit_code))
  }

  async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
    let argv = vec!["scancel".to_string(), job_id.to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(())
  }

  async fn list_active_jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError> {
    let mut argv = vec![
      "squeue".to_string(),
      "-h".to_string(),
      "-o".to_string(),
      "%i|%j|%u|%T|%P|%V".to_string(),
    ];
    if !filter.all_users {
      argv.push("-u".to_string());
      argv.push(filter.user.clone().unwrap_or_else(current_user));
    }
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(parse_squeue(&String::from_utf8_lossy(&output.stdout)))
  }

  async fn list_completed_jobs(
    &self,
    filter: &HistoryFilter,
  ) -> Result<Vec<JobInfo>, SchedulerError> {
    let mut argv = vec![
      "sacct".to_string(),
      "-nPX".to_string(),
      "-o".to_string(),
      SACCT_FIELDS.to_string(),
    ];
    if let Some(since) = filter.since {
      argv.push("-S".to_string());
      argv.push(since.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    argv.push("-u".to_string());
    argv.push(filter.user.clone().unwrap_or_else(current_user));

    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(
      parse_sacct(&String::from_utf8_lossy(&output.stdout))
        .into_iter()
        .filter(|row| row.state.is_terminal())
        .collect(),
    )
  }

  async fn get_job_details(
    &self,
    job_id: &str,
  ) -> Result<(JobInfo, DetailExtras), SchedulerError> {
    let argv = vec![
      "scontrol".to_string(),
      "show".to_string(),
      "job".to_string(),
      job_id.to_string(),
    ];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::JobNotFound(job_id.to_string()));
    }

    let mut extras = DetailExtras::new();
    for token in String::from_utf8_lossy(&output.stdout).split_whitespace() {
      if let Some((key, value)) = token.split_once('=') {
        extras.insert(key.to_string(), value.to_string());
      }
    }

    let state = extras
      .get("JobState")
      .map(|s| map_state(s))
      .unwrap_or(JobStatus::Unknown);
    let mut info = JobInfo::new(
      extras.get("JobId").cloned().unwrap_or_else(|| job_id.to_string()),
      extras.get("JobName").cloned().unwrap_or_default(),
      state,
    );
    // UserId prints as `alice(1000)`.
    info.user = extras
      .get("UserId")
      .map(|u| u.split('(').next().unwrap_or(u).to_string())
      .unwrap_or_default();
    info.queue = extras.get("Partition").cloned();
    info.submit_time = extras.get("SubmitTime").and_then(|t| parse_slurm_time(t));
    info.start_time = extras.get("StartTime").and_then(|t| parse_slurm_time(t));
    info.end_time = extras.get("EndTime").and_then(|t| parse_slurm_time(t));
    Ok((info, extras))
  }

  fn output_path(&self, job_id: &str, _job_name: &str, _stream: OutputStream) -> Option<PathBuf> {
    // Default capture file; both streams land there unless redirected.
    Some(PathBuf::from(format!("slurm-{job_id}.out")))
  }

  fn array_task_id(&self, base_job_id: &str, index: u32) -> String {
    format!("{base_job_id}_{index}")
  }
}

impl SlurmScheduler {
  async fn sacct_row(&self, job_id: &str) -> Result<Option<JobInfo>, SchedulerError> {
    let argv = vec![
      "sacct".to_string(),
      "-nPX".to_string(),
      "-j".to_string(),
      job_id.to_string(),
      "-o".to_string(),
      SACCT_FIELDS.to_string(),
    ];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Ok(None);
    }
    Ok(
      parse_sacct(&String::from_utf8_lossy(&output.stdout))
        .into_iter()
        .next(),
    )
  }
}

/// Maps a Slurm state word onto the shared status model.
pub fn map_state(state: &str) -> JobStatus {
  let state = state.to_uppercase();
  if state.starts_with("CANCELLED") {
    return JobStatus::Cancelled;
  }
  match state.as_str() {
    "PENDING" | "SUSPENDED" | "REQUEUED" => JobStatus::Pending,
    "RUNNING" | "COMPLETING" | "CONFIGURING" => JobStatus::Running,
    "COMPLETED" => JobStatus::Completed,
    "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" => JobStatus::Failed,
    "TIMEOUT" | "DEADLINE" => JobStatus::Timeout,
    _ => JobStatus::Unknown,
  }
}

/// `Submitted batch job 12345`, or a bare id from `sbatch --parsable`.
fn parse_sbatch_output(stdout: &str) -> Option<String> {
  for line in stdout.lines() {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("Submitted batch job ") {
      let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
      if !id.is_empty() {
        return Some(id);
      }
    }
    if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) {
      return Some(line.to_string());
    }
  }
  None
}

fn parse_squeue(stdout: &str) -> Vec<JobInfo> {
  stdout
    .lines()
    .filter_map(|line| {
      let fields: Vec<&str> = line.trim().split('|').collect();
      if fields.len() < 6 {
        return None;
      }
      let mut info = JobInfo::new(fields[0], fields[1], map_state(fields[3]));
      info.user = fields[2].to_string();
      info.queue = Some(fields[4].to_string());
      info.submit_time = parse_slurm_time(fields[5]);
      Some(info)
    })
    .collect()
}

fn parse_sacct(stdout: &str) -> Vec<JobInfo> {
  stdout
    .lines()
    .filter_map(|line| {
      let fields: Vec<&str> = line.trim().split('|').collect();
      if fields.len() < 9 {
        return None;
      }
      let mut info = JobInfo::new(fields[0], fields[1], map_state(fields[3]));
      info.user = fields[2].to_string();
      info.queue = Some(fields[4].to_string());
      info.submit_time = parse_slurm_time(fields[5]);
      info.start_time = parse_slurm_time(fields[6]);
      info.end_time = parse_slurm_time(fields[7]);
      info.exit_code = parse_exit_code(fields[8]);
      Some(info)
    })
    .collect()
}

/// sacct's `ExitCode` column is `code:signal`.
fn parse_exit_code(field: &str) -> Option<i32> {
  field.split(':').next()?.parse().ok()
}

fn parse_slurm_time(value: &str) -> Option<DateTime<Local>> {
  let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S").ok()?;
  Local.from_local_datetime(&naive).single()
}
