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

//! Local adapter: runs jobs as child processes on this machine.
//!
//! Useful on workstations and in tests; the same submission flow as
//! the batch adapters, with an in-process table instead of a queue.

use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Child;
use tokio::process::Command;

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
use crate::schedulers::render::Attr;
use crate::schedulers::render::AttrValue;
use crate::schedulers::render::Rendering;

struct LocalJob {
  name: String,
  child: Child,
  /// Cached after the first observed terminal state.
  exit_code: Option<i32>,
  cancelled: bool,
  stdout: Option<PathBuf>,
  stderr: Option<PathBuf>,
}

/// Process table adapter. The table is mutex-guarded so one instance
/// may be shared across tasks.
#[derive(Default)]
pub struct LocalScheduler {
  state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalState {
  next_id: u64,
  jobs: HashMap<String, LocalJob>,
}

impl LocalScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  fn poll_job(job: &mut LocalJob) -> Result<JobStatus, SchedulerError> {
    if let Some(code) = job.exit_code {
      return Ok(finished_status(code, job.cancelled));
    }
    match job.child.try_wait() {
      Ok(Some(status)) => {
        // Signal deaths have no code; -1 stands in for them.
        let code = status.code().unwrap_or(-1);
        job.exit_code = Some(code);
        Ok(finished_status(code, job.cancelled))
      }
      Ok(None) => Ok(JobStatus::Running),
      Err(source) => Err(SchedulerError::Invoke {
        command: "wait".to_string(),
        source,
      }),
    }
  }
}

fn finished_status(code: i32, cancelled: bool) -> JobStatus {
  if cancelled {
    JobStatus::Cancelled
  } else if code == 0 {
    JobStatus::Completed
  } else {
    JobStatus::Failed
  }
}

#[async_trait]
impl Scheduler for LocalScheduler {
  fn name(&self) -> &'static str {
    "local"
  }

  // No directives and no flags; everything lives in the script body.
  fn render_attr(&self, _attr: Attr, _value: AttrValue<'_>, _job: &Job) -> Option<Rendering> {
    None
  }

  fn build_submit_command(&self, job: &Job, script: &Path, _: Option<&JobArray>) -> Vec<String> {
    vec![job.shell.clone(), script.display().to_string()]
  }

  fn build_interactive_command(&self, job: &Job) -> Vec<String> {
    vec![job.shell.clone(), "-c".to_string(), job.command.clone()]
  }

  fn parse_job_id(&self, stdout: &str) -> Result<String, SchedulerError> {
    Ok(stdout.trim().to_string())
  }

  async fn submit_script(
    &self,
    job: &Job,
    script: &Path,
    _array: Option<&JobArray>,
  ) -> Result<String, SchedulerError> {
    let stdout_path = job.stdout.as_ref().map(PathBuf::from);
    let stderr_path = if job.merge_output() {
      stdout_path.clone()
    } else {
      job.stderr.as_ref().map(PathBuf::from)
    };

    let mut command = Command::new(&job.shell);
    command.arg(script);
    if let Some(dir) = &job.workdir {
      command.current_dir(dir);
    }
    if !job.inherit_env {
      command.env_clear();
    }
    command.stdin(Stdio::null());
    command.stdout(stdio_for(stdout_path.as_deref())?);
    command.stderr(stdio_for(stderr_path.as_deref())?);

    let child = command.spawn().map_err(|source| SchedulerError::Invoke {
      command: format!("{} {}", job.shell, script.display()),
      source,
    })?;

    let mut state = self.state.lock().unwrap();
    state.next_id += 1;
    let job_id = format!("local_{}_{}", state.next_id, Local::now().timestamp());
    state.jobs.insert(
      job_id.clone(),
      LocalJob {
        name: job.name.clone(),
        child,
        exit_code: None,
        cancelled: false,
        stdout: stdout_path,
        stderr: stderr_path,
      },
    );
    Ok(job_id)
  }

  async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
    let mut state = self.state.lock().unwrap();
    let job = state
      .jobs
      .get_mut(job_id)
      .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
    Self::poll_job(job)
  }

  async fn exit_code(&self, job_id: &str) -> Result<Option<i32>, SchedulerError> {
    let mut state = self.state.lock().unwrap();
    let job = state
      .jobs
      .get_mut(job_id)
      .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
    Self::poll_job(job)?;
    Ok(job.exit_code)
  }

  async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
    let mut state = self.state.lock().unwrap();
    let job = state
      .jobs
      .get_mut(job_id)
      .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
    if job.exit_code.is_none() {
      job.cancelled = true;
      job
        .child
        .start_kill()
        .map_err(|source| SchedulerError::Invoke {
          command: "kill".to_string(),
          source,
        })?;
    }
    Ok(())
  }

  fn has_accounting(&self) -> bool {
    false
  }

  fn supports_arrays(&self) -> bool {
    false
  }

  // The running child reads the script in place.
  fn spools_script(&self) -> bool {
    false
  }

  async fn list_active_jobs(&self, _filter: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError> {
    let mut state = self.state.lock().unwrap();
    let user = current_user();
    let mut jobs = Vec::new();
    for (job_id, job) in state.jobs.iter_mut() {
      if Self::poll_job(job)? == JobStatus::Running {
        let mut info = JobInfo::new(job_id.clone(), job.name.clone(), JobStatus::Running);
        info.user = user.clone();
        jobs.push(info);
      }
    }
    jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(jobs)
  }

  async fn list_completed_jobs(
    &self,
    _filter: &HistoryFilter,
  ) -> Result<Vec<JobInfo>, SchedulerError> {
    Err(SchedulerError::AccountingNotAvailable("local".to_string()))
  }

  async fn get_job_details(
    &self,
    job_id: &str,
  ) -> Result<(JobInfo, DetailExtras), SchedulerError> {
    let mut state = self.state.lock().unwrap();
    let job = state
      .jobs
      .get_mut(job_id)
      .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
    let status = Self::poll_job(job)?;

    let mut info = JobInfo::new(job_id, job.name.clone(), status);
    info.user = current_user();
    info.exit_code = job.exit_code;

    let mut extras = DetailExtras::new();
    if let Some(path) = &job.stdout {
      extras.insert("stdout".to_string(), path.display().to_string());
    }
    if let Some(path) = &job.stderr {
      extras.insert("stderr".to_string(), path.display().to_string());
    }
    Ok((info, extras))
  }

  fn output_path(&self, job_id: &str, _job_name: &str, stream: OutputStream) -> Option<PathBuf> {
    let state = self.state.lock().unwrap();
    let job = state.jobs.get(job_id)?;
    match stream {
      OutputStream::Stdout => job.stdout.clone(),
      OutputStream::Stderr => job.stderr.clone(),
    }
  }
}

fn stdio_for(path: Option<&Path>) -> Result<Stdio, SchedulerError> {
  match path {
    Some(path) => {
      let file = std::fs::File::create(path).map_err(|source| SchedulerError::WriteScript {
        path: path.to_path_buf(),
        source,
      })?;
      Ok(Stdio::from(file))
    }
    None => Ok(Stdio::null()),
  }
}
