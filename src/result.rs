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

//! Handles to submitted jobs: status polling, waiting, cancellation,
//! and output retrieval.

use chrono::DateTime;
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SchedulerError;
use crate::job::JobArray;
use crate::schedulers::OutputStream;
use crate::schedulers::Scheduler;

/// Scheduler-agnostic job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Timeout,
  Cancelled,
  Unknown,
}

impl JobStatus {
  /// Whether the job will make no further progress.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
    )
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      JobStatus::Pending => "PENDING",
      JobStatus::Running => "RUNNING",
      JobStatus::Completed => "COMPLETED",
      JobStatus::Failed => "FAILED",
      JobStatus::Timeout => "TIMEOUT",
      JobStatus::Cancelled => "CANCELLED",
      JobStatus::Unknown => "UNKNOWN",
    };
    f.write_str(s)
  }
}

/// One job row, as reported by a scheduler's listing or accounting.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
  pub job_id: String,
  pub name: String,
  pub user: String,
  pub state: JobStatus,
  pub queue: Option<String>,
  pub submit_time: Option<DateTime<Local>>,
  pub start_time: Option<DateTime<Local>>,
  pub end_time: Option<DateTime<Local>>,
  pub exit_code: Option<i32>,
}

impl JobInfo {
  pub fn new(job_id: impl Into<String>, name: impl Into<String>, state: JobStatus) -> Self {
    JobInfo {
      job_id: job_id.into(),
      name: name.into(),
      user: String::new(),
      state,
      queue: None,
      submit_time: None,
      start_time: None,
      end_time: None,
      exit_code: None,
    }
  }
}

/// Handle to a submitted job.
///
/// Holds the scheduler it was submitted through, so polling keeps
/// working even when the handle outlives the submission site.
#[derive(Clone)]
pub struct JobResult {
  pub job_id: String,
  pub job_name: String,
  scheduler: Arc<dyn Scheduler>,
  /// Exit code of an interactive run; such a result is already
  /// terminal and is never polled.
  interactive_exit: Option<i32>,
}

impl fmt::Debug for JobResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobResult")
      .field("job_id", &self.job_id)
      .field("job_name", &self.job_name)
      .field("scheduler", &self.scheduler.name())
      .field("interactive_exit", &self.interactive_exit)
      .finish()
  }
}

impl JobResult {
  pub fn new(
    job_id: impl Into<String>,
    job_name: impl Into<String>,
    scheduler: Arc<dyn Scheduler>,
  ) -> Self {
    JobResult {
      job_id: job_id.into(),
      job_name: job_name.into(),
      scheduler,
      interactive_exit: None,
    }
  }

  /// Result of an interactive (foreground) run.
  pub fn interactive(
    job_name: impl Into<String>,
    scheduler: Arc<dyn Scheduler>,
    exit: Option<i32>,
  ) -> Self {
    JobResult {
      job_id: "interactive".to_string(),
      job_name: job_name.into(),
      scheduler,
      interactive_exit: exit,
    }
  }

  pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
    &self.scheduler
  }

  pub async fn status(&self) -> Result<JobStatus, SchedulerError> {
    if let Some(exit) = self.interactive_exit {
      return Ok(if exit == 0 {
        JobStatus::Completed
      } else {
        JobStatus::Failed
      });
    }
    self.scheduler.status(&self.job_id).await
  }

  pub async fn is_complete(&self) -> Result<bool, SchedulerError> {
    Ok(self.status().await?.is_terminal())
  }

  pub async fn exit_code(&self) -> Result<Option<i32>, SchedulerError> {
    if self.interactive_exit.is_some() {
      return Ok(self.interactive_exit);
    }
    self.scheduler.exit_code(&self.job_id).await
  }

  pub async fn cancel(&self) -> Result<(), SchedulerError> {
    self.scheduler.cancel(&self.job_id).await
  }

  /// Polls until the job reaches a terminal state.
  ///
  /// An `Unknown` status is polled through rather than returned: a job
  /// can transiently vanish from the queue listing before accounting
  /// catches up. A `timeout` bounds the wait; hitting it returns
  /// [`SchedulerError::WaitTimeout`] and leaves the job running.
  pub async fn wait(
    &self,
    poll_interval: Duration,
    timeout: Option<Duration>,
  ) -> Result<JobStatus, SchedulerError> {
    let started = std::time::Instant::now();
    loop {
      let status = self.status().await?;
      if status.is_terminal() {
        return Ok(status);
      }
      if let Some(limit) = timeout {
        if started.elapsed() >= limit {
          return Err(SchedulerError::WaitTimeout {
            job_id: self.job_id.clone(),
            timeout_secs: limit.as_secs(),
          });
        }
      }
      tokio::time::sleep(poll_interval).await;
    }
  }

  pub fn stdout_path(&self) -> Option<PathBuf> {
    self
      .scheduler
      .output_path(&self.job_id, &self.job_name, OutputStream::Stdout)
  }

  pub fn stderr_path(&self) -> Option<PathBuf> {
    self
      .scheduler
      .output_path(&self.job_id, &self.job_name, OutputStream::Stderr)
  }

  /// Reads captured stdout, optionally only the last `tail` lines.
  /// `Ok(None)` when the output location is unknown.
  pub fn read_stdout(&self, tail: Option<usize>) -> std::io::Result<Option<String>> {
    read_output(self.stdout_path(), tail)
  }

  pub fn read_stderr(&self, tail: Option<usize>) -> std::io::Result<Option<String>> {
    read_output(self.stderr_path(), tail)
  }
}

fn read_output(path: Option<PathBuf>, tail: Option<usize>) -> std::io::Result<Option<String>> {
  let Some(path) = path else {
    return Ok(None);
  };
  let content = std::fs::read_to_string(path)?;
  Ok(Some(match tail {
    Some(n) => tail_lines(&content, n),
    None => content,
  }))
}

fn tail_lines(content: &str, n: usize) -> String {
  let lines: Vec<&str> = content.lines().collect();
  let start = lines.len().saturating_sub(n);
  lines[start..].join("\n")
}

/// Handle to a submitted job array.
#[derive(Clone)]
pub struct ArrayJobResult {
  pub base_job_id: String,
  pub job_name: String,
  array: JobArray,
  scheduler: Arc<dyn Scheduler>,
}

impl fmt::Debug for ArrayJobResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ArrayJobResult")
      .field("base_job_id", &self.base_job_id)
      .field("job_name", &self.job_name)
      .field("range", &self.array.range_str())
      .field("scheduler", &self.scheduler.name())
      .finish()
  }
}

impl ArrayJobResult {
  pub fn new(
    base_job_id: impl Into<String>,
    job_name: impl Into<String>,
    array: JobArray,
    scheduler: Arc<dyn Scheduler>,
  ) -> Self {
    ArrayJobResult {
      base_job_id: base_job_id.into(),
      job_name: job_name.into(),
      array,
      scheduler,
    }
  }

  pub fn indices(&self) -> Vec<u32> {
    self.array.indices().collect()
  }

  /// Native id of one task of the array.
  pub fn task_id(&self, index: u32) -> String {
    self.scheduler.array_task_id(&self.base_job_id, index)
  }

  pub async fn task_status(&self, index: u32) -> Result<JobStatus, SchedulerError> {
    self.scheduler.status(&self.task_id(index)).await
  }

  /// Polls until every task is terminal, returning the final state of
  /// each index.
  pub async fn wait_all(
    &self,
    poll_interval: Duration,
  ) -> Result<BTreeMap<u32, JobStatus>, SchedulerError> {
    let mut done: BTreeMap<u32, JobStatus> = BTreeMap::new();
    loop {
      for index in self.array.indices() {
        if done.contains_key(&index) {
          continue;
        }
        let status = self.task_status(index).await?;
        if status.is_terminal() {
          done.insert(index, status);
        }
      }
      if done.len() == self.array.count() {
        return Ok(done);
      }
      tokio::time::sleep(poll_interval).await;
    }
  }

  /// Cancels the whole array.
  pub async fn cancel(&self) -> Result<(), SchedulerError> {
    self.scheduler.cancel(&self.base_job_id).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::Job;
  use crate::schedulers::DetailExtras;
  use crate::schedulers::HistoryFilter;
  use crate::schedulers::JobFilter;
  use crate::schedulers::render::Attr;
  use crate::schedulers::render::AttrValue;
  use crate::schedulers::render::Rendering;
  use async_trait::async_trait;
  use std::path::Path;
  use std::sync::Mutex;

  /// Replays a scripted sequence of statuses.
  struct ScriptedScheduler {
    statuses: Mutex<Vec<JobStatus>>,
  }

  impl ScriptedScheduler {
    fn new(statuses: Vec<JobStatus>) -> Arc<dyn Scheduler> {
      Arc::new(ScriptedScheduler {
        statuses: Mutex::new(statuses),
      })
    }
  }

  #[async_trait]
  impl Scheduler for ScriptedScheduler {
    fn name(&self) -> &'static str {
      "scripted"
    }

    fn render_attr(&self, _: Attr, _: AttrValue<'_>, _: &Job) -> Option<Rendering> {
      None
    }

    fn build_submit_command(&self, _: &Job, _: &Path, _: Option<&JobArray>) -> Vec<String> {
      Vec::new()
    }

    fn build_interactive_command(&self, _: &Job) -> Vec<String> {
      Vec::new()
    }

    fn parse_job_id(&self, _: &str) -> Result<String, SchedulerError> {
      Ok("1".to_string())
    }

    async fn status(&self, _: &str) -> Result<JobStatus, SchedulerError> {
      let mut statuses = self.statuses.lock().unwrap();
      Ok(if statuses.len() > 1 {
        statuses.remove(0)
      } else {
        statuses[0]
      })
    }

    async fn exit_code(&self, _: &str) -> Result<Option<i32>, SchedulerError> {
      Ok(Some(0))
    }

    async fn cancel(&self, _: &str) -> Result<(), SchedulerError> {
      Ok(())
    }

    async fn list_active_jobs(&self, _: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError> {
      Ok(Vec::new())
    }

    async fn list_completed_jobs(
      &self,
      _: &HistoryFilter,
    ) -> Result<Vec<JobInfo>, SchedulerError> {
      Err(SchedulerError::AccountingNotAvailable("scripted".into()))
    }

    async fn get_job_details(&self, id: &str) -> Result<(JobInfo, DetailExtras), SchedulerError> {
      Ok((JobInfo::new(id, "job", JobStatus::Running), DetailExtras::new()))
    }

    fn output_path(&self, _: &str, _: &str, _: OutputStream) -> Option<PathBuf> {
      None
    }
  }

  #[test]
  fn terminal_states() {
    for status in [
      JobStatus::Completed,
      JobStatus::Failed,
      JobStatus::Timeout,
      JobStatus::Cancelled,
    ] {
      assert!(status.is_terminal(), "{status} should be terminal");
    }
    for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Unknown] {
      assert!(!status.is_terminal(), "{status} should not be terminal");
    }
  }

  #[test]
  fn status_serializes_screaming() {
    let json = serde_json::to_string(&JobStatus::Completed).unwrap();
    assert_eq!(json, "\"COMPLETED\"");
  }

  #[tokio::test]
  async fn interactive_result_maps_exit_code() {
    let scheduler = ScriptedScheduler::new(vec![JobStatus::Running]);
    let ok = JobResult::interactive("job", Arc::clone(&scheduler), Some(0));
    assert_eq!(ok.status().await.unwrap(), JobStatus::Completed);
    assert_eq!(ok.exit_code().await.unwrap(), Some(0));

    let failed = JobResult::interactive("job", scheduler, Some(2));
    assert_eq!(failed.status().await.unwrap(), JobStatus::Failed);
    assert_eq!(failed.exit_code().await.unwrap(), Some(2));
  }

  #[tokio::test]
  async fn wait_polls_until_terminal() {
    let scheduler = ScriptedScheduler::new(vec![
      JobStatus::Pending,
      JobStatus::Running,
      JobStatus::Completed,
    ]);
    let result = JobResult::new("42", "job", scheduler);
    let status = result.wait(Duration::from_millis(1), None).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
  }

  #[tokio::test]
  async fn wait_polls_through_transient_unknown() {
    // A just-submitted job can vanish from the queue listing before
    // accounting knows about it; that must not end the wait.
    let scheduler = ScriptedScheduler::new(vec![
      JobStatus::Unknown,
      JobStatus::Running,
      JobStatus::Completed,
    ]);
    let result = JobResult::new("42", "job", scheduler);
    let status = result.wait(Duration::from_millis(1), None).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
  }

  #[tokio::test]
  async fn wait_times_out_without_cancelling() {
    let scheduler = ScriptedScheduler::new(vec![JobStatus::Running]);
    let result = JobResult::new("42", "job", scheduler);
    let err = result
      .wait(Duration::from_millis(1), Some(Duration::from_millis(5)))
      .await
      .unwrap_err();
    assert!(matches!(err, SchedulerError::WaitTimeout { .. }), "{err}");
  }

  #[test]
  fn tail_keeps_last_lines() {
    assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
    assert_eq!(tail_lines("a\nb", 10), "a\nb");
    assert_eq!(tail_lines("", 3), "");
  }
}
