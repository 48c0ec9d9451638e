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

//! DAG workflows: named jobs with named dependencies, submitted in
//! topological order with safe partial-failure retry.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;
use crate::job::Job;
use crate::result::JobResult;
use crate::result::JobStatus;
use crate::schedulers::Scheduler;
use crate::schedulers::SubmitOptions;

/// How a dependent job reacts to its dependency's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyType {
  /// Start only after successful completion.
  #[default]
  AfterOk,
  /// Start after completion, regardless of outcome.
  AfterAny,
  /// Start once the dependency has started.
  After,
  /// Start only after failure.
  AfterNotOk,
}

impl DependencyType {
  /// The scheduler-side keyword (Slurm and PBS share the vocabulary;
  /// SGE collapses every type to a plain hold).
  pub fn keyword(&self) -> &'static str {
    match self {
      DependencyType::AfterOk => "afterok",
      DependencyType::AfterAny => "afterany",
      DependencyType::After => "after",
      DependencyType::AfterNotOk => "afternotok",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.to_lowercase().as_str() {
      "afterok" => Some(DependencyType::AfterOk),
      "afterany" => Some(DependencyType::AfterAny),
      "after" => Some(DependencyType::After),
      "afternotok" => Some(DependencyType::AfterNotOk),
      _ => None,
    }
  }
}

/// One node of a pipeline.
#[derive(Debug)]
pub struct PipelineJob {
  /// Step name, unique within the pipeline.
  pub name: String,
  pub job: Job,
  pub depends_on: Vec<String>,
  pub dependency_type: DependencyType,
  /// Present once this node has been submitted.
  pub result: Option<JobResult>,
}

/// A named DAG of jobs.
///
/// Dependencies may reference steps added later; the graph is
/// validated (names resolve, no cycles) at submission, before touching
/// the scheduler.
#[derive(Debug, Default)]
pub struct Pipeline {
  name: String,
  jobs: Vec<PipelineJob>,
}

impl Pipeline {
  pub fn new(name: impl Into<String>) -> Self {
    Pipeline {
      name: name.into(),
      jobs: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&PipelineJob> {
    self.jobs.iter().find(|j| j.name == name)
  }

  /// Adds a step. The job's display name becomes
  /// `{pipeline}_{step}`; `depends_on` names are resolved at
  /// submission, so they may reference steps not added yet.
  pub fn add(
    &mut self,
    mut job: Job,
    name: impl Into<String>,
    depends_on: &[&str],
    dependency_type: DependencyType,
  ) -> Result<&PipelineJob, PipelineError> {
    let name = name.into();
    if self.get(&name).is_some() {
      return Err(PipelineError::DuplicateName(name));
    }

    job.name = format!("{}_{name}", self.name);
    self.jobs.push(PipelineJob {
      name,
      job,
      depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
      dependency_type,
      result: None,
    });
    Ok(self.jobs.last().unwrap())
  }

  /// Kahn's algorithm, FIFO among ties, so submission order is the
  /// insertion order refined by the dependency edges. Rejects
  /// dependency names that resolve to no step, and cycles.
  fn topo_order(&self) -> Result<Vec<usize>, PipelineError> {
    let index_of = |name: &str| self.jobs.iter().position(|j| j.name == name);

    let mut in_degree: Vec<usize> = vec![0; self.jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.jobs.len()];
    for (i, job) in self.jobs.iter().enumerate() {
      for dep in &job.depends_on {
        let d = index_of(dep)
          .ok_or_else(|| PipelineError::UnknownDependency(dep.clone()))?;
        dependents[d].push(i);
        in_degree[i] += 1;
      }
    }

    let mut queue: VecDeque<usize> = (0..self.jobs.len())
      .filter(|&i| in_degree[i] == 0)
      .collect();
    let mut order = Vec::with_capacity(self.jobs.len());
    while let Some(i) = queue.pop_front() {
      order.push(i);
      for &dependent in &dependents[i] {
        in_degree[dependent] -= 1;
        if in_degree[dependent] == 0 {
          queue.push_back(dependent);
        }
      }
    }

    if order.len() < self.jobs.len() {
      return Err(PipelineError::Cycle);
    }
    Ok(order)
  }

  /// Submits every step that does not yet have a result, in
  /// dependency order.
  ///
  /// On a submission failure the error propagates immediately;
  /// already-obtained results are kept, so calling `submit` again
  /// retries only the remaining steps.
  pub async fn submit(
    &mut self,
    scheduler: &Arc<dyn Scheduler>,
  ) -> Result<BTreeMap<String, JobResult>, PipelineError> {
    if self.jobs.is_empty() {
      return Err(PipelineError::Empty);
    }
    if self.jobs.iter().all(|j| j.result.is_some()) {
      return Err(PipelineError::AlreadySubmitted);
    }
    let order = self.topo_order()?;

    for i in order {
      if self.jobs[i].result.is_some() {
        continue;
      }

      let mut dependency_ids = Vec::new();
      for dep in self.jobs[i].depends_on.clone() {
        if let Some(result) = self.get(&dep).and_then(|j| j.result.as_ref()) {
          dependency_ids.push(result.job_id.clone());
        }
      }
      {
        let node = &mut self.jobs[i];
        node.job.dependencies = dependency_ids;
        node.job.dependency_type = node.dependency_type;
      }

      info!(pipeline = %self.name, step = %self.jobs[i].name, "submitting pipeline step");
      let result =
        crate::schedulers::submit(scheduler, &self.jobs[i].job, &SubmitOptions::default())
          .await?;
      self.jobs[i].result = Some(result);
    }

    Ok(self.results())
  }

  /// Results of all submitted steps, keyed by step name.
  pub fn results(&self) -> BTreeMap<String, JobResult> {
    self
      .jobs
      .iter()
      .filter_map(|j| j.result.clone().map(|r| (j.name.clone(), r)))
      .collect()
  }

  /// Waits for every step to reach a terminal state.
  ///
  /// Refuses to wait on a partially submitted pipeline, naming the
  /// unsubmitted steps, and distinguishes that from a pipeline that
  /// was never submitted at all.
  pub async fn wait(
    &self,
    poll_interval: Duration,
  ) -> Result<BTreeMap<String, JobStatus>, PipelineError> {
    if self.jobs.iter().all(|j| j.result.is_none()) {
      return Err(PipelineError::NotSubmitted);
    }
    let missing: Vec<&str> = self
      .jobs
      .iter()
      .filter(|j| j.result.is_none())
      .map(|j| j.name.as_str())
      .collect();
    if !missing.is_empty() {
      return Err(PipelineError::PartialSubmission(missing.join(", ")));
    }

    let mut statuses = BTreeMap::new();
    for job in &self.jobs {
      if let Some(result) = &job.result {
        let status = result.wait(poll_interval, None).await?;
        statuses.insert(job.name.clone(), status);
      }
    }
    Ok(statuses)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::HpcConfig;
  use crate::error::SchedulerError;
  use crate::job::JobArray;
  use crate::result::JobInfo;
  use crate::schedulers::DetailExtras;
  use crate::schedulers::HistoryFilter;
  use crate::schedulers::JobFilter;
  use crate::schedulers::OutputStream;
  use crate::schedulers::render::Attr;
  use crate::schedulers::render::AttrValue;
  use crate::schedulers::render::Rendering;
  use async_trait::async_trait;
  use std::path::Path;
  use std::path::PathBuf;
  use std::sync::Mutex;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  /// Records submissions and fails the nth one when asked to.
  struct FlakyScheduler {
    counter: AtomicUsize,
    fail_on: Option<usize>,
    submitted: Mutex<Vec<(String, Vec<String>)>>,
  }

  impl FlakyScheduler {
    fn new(fail_on: Option<usize>) -> Arc<FlakyScheduler> {
      Arc::new(FlakyScheduler {
        counter: AtomicUsize::new(0),
        fail_on,
        submitted: Mutex::new(Vec::new()),
      })
    }

    fn submissions(&self) -> Vec<(String, Vec<String>)> {
      self.submitted.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Scheduler for FlakyScheduler {
    fn name(&self) -> &'static str {
      "flaky"
    }

    fn render_attr(&self, _: Attr, _: AttrValue<'_>, _: &Job) -> Option<Rendering> {
      None
    }

    fn build_submit_command(&self, _: &Job, script: &Path, _: Option<&JobArray>) -> Vec<String> {
      vec!["true".to_string(), script.display().to_string()]
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
      _script: &Path,
      _array: Option<&JobArray>,
    ) -> Result<String, SchedulerError> {
      let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
      if self.fail_on == Some(n) {
        return Err(SchedulerError::Submission {
          scheduler: "flaky",
          diagnostic: format!("scripted failure on submission {n}"),
        });
      }
      self
        .submitted
        .lock()
        .unwrap()
        .push((job.name.clone(), job.dependencies.clone()));
      Ok(format!("mock_{n}"))
    }

    async fn status(&self, _: &str) -> Result<JobStatus, SchedulerError> {
      Ok(JobStatus::Completed)
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
      Err(SchedulerError::AccountingNotAvailable("flaky".into()))
    }

    async fn get_job_details(&self, id: &str) -> Result<(JobInfo, DetailExtras), SchedulerError> {
      Ok((JobInfo::new(id, "x", JobStatus::Completed), DetailExtras::new()))
    }

    fn output_path(&self, _: &str, _: &str, _: OutputStream) -> Option<PathBuf> {
      None
    }
  }

  fn job(command: &str) -> Job {
    Job::builder(command).build(&HpcConfig::default())
  }

  fn three_step_pipeline() -> Pipeline {
    let mut p = Pipeline::new("etl");
    p.add(job("extract"), "extract", &[], DependencyType::AfterOk)
      .unwrap();
    p.add(job("transform"), "transform", &["extract"], DependencyType::AfterOk)
      .unwrap();
    p.add(job("load"), "load", &["transform"], DependencyType::AfterOk)
      .unwrap();
    p
  }

  #[test]
  fn duplicate_names_rejected() {
    let mut p = Pipeline::new("etl");
    p.add(job("a"), "a", &[], DependencyType::AfterOk).unwrap();
    assert!(matches!(
      p.add(job("a"), "a", &[], DependencyType::AfterOk),
      Err(PipelineError::DuplicateName(_))
    ));
  }

  #[tokio::test]
  async fn unknown_dependency_rejected_at_submission() {
    let scheduler: Arc<dyn Scheduler> = FlakyScheduler::new(None);
    let mut p = Pipeline::new("etl");
    p.add(job("a"), "a", &["missing"], DependencyType::AfterOk)
      .unwrap();
    assert!(matches!(
      p.submit(&scheduler).await,
      Err(PipelineError::UnknownDependency(_))
    ));
  }

  #[tokio::test]
  async fn forward_references_resolve_at_submission() {
    let flaky = FlakyScheduler::new(None);
    let scheduler: Arc<dyn Scheduler> = flaky.clone();
    let mut p = Pipeline::new("w");
    p.add(job("late"), "late", &["early"], DependencyType::AfterOk)
      .unwrap();
    p.add(job("early"), "early", &[], DependencyType::AfterOk)
      .unwrap();

    p.submit(&scheduler).await.unwrap();
    let names: Vec<String> = flaky.submissions().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, ["w_early", "w_late"]);
  }

  #[tokio::test]
  async fn cyclic_pipeline_is_rejected() {
    let scheduler: Arc<dyn Scheduler> = FlakyScheduler::new(None);
    let mut p = Pipeline::new("loop");
    p.add(job("a"), "a", &["b"], DependencyType::AfterOk).unwrap();
    p.add(job("b"), "b", &["a"], DependencyType::AfterOk).unwrap();
    assert!(matches!(
      p.submit(&scheduler).await,
      Err(PipelineError::Cycle)
    ));
  }

  #[test]
  fn display_names_carry_the_pipeline_name() {
    let p = three_step_pipeline();
    assert_eq!(p.get("extract").unwrap().job.name, "etl_extract");
  }

  #[test]
  fn topo_order_is_insertion_order_refined_by_edges() {
    let mut p = Pipeline::new("w");
    p.add(job("b"), "b", &[], DependencyType::AfterOk).unwrap();
    p.add(job("a"), "a", &[], DependencyType::AfterOk).unwrap();
    p.add(job("c"), "c", &["a", "b"], DependencyType::AfterOk).unwrap();
    let order = p.topo_order().unwrap();
    assert_eq!(order, [0, 1, 2]);
  }

  #[tokio::test]
  async fn empty_pipeline_cannot_submit() {
    let scheduler: Arc<dyn Scheduler> = FlakyScheduler::new(None);
    let mut p = Pipeline::new("empty");
    assert!(matches!(
      p.submit(&scheduler).await,
      Err(PipelineError::Empty)
    ));
  }

  #[tokio::test]
  async fn submits_in_dependency_order_and_wires_ids() {
    let flaky = FlakyScheduler::new(None);
    let scheduler: Arc<dyn Scheduler> = flaky.clone();
    let mut p = three_step_pipeline();

    let results = p.submit(&scheduler).await.unwrap();
    assert_eq!(results.len(), 3);

    let submissions = flaky.submissions();
    assert_eq!(submissions[0].0, "etl_extract");
    assert_eq!(submissions[1].0, "etl_transform");
    assert_eq!(submissions[1].1, ["mock_1"]);
    assert_eq!(submissions[2].1, ["mock_2"]);
  }

  #[tokio::test]
  async fn partial_failure_retries_only_missing_steps() {
    let flaky = FlakyScheduler::new(Some(2));
    let scheduler: Arc<dyn Scheduler> = flaky.clone();
    let mut p = three_step_pipeline();

    let err = p.submit(&scheduler).await.unwrap_err();
    assert!(matches!(err, PipelineError::Submission(_)), "{err}");
    assert!(p.get("extract").unwrap().result.is_some());
    assert!(p.get("transform").unwrap().result.is_none());
    assert!(p.get("load").unwrap().result.is_none());

    // Waiting on a partially submitted pipeline names the holes.
    let wait_err = p.wait(Duration::from_millis(1)).await.unwrap_err();
    match wait_err {
      PipelineError::PartialSubmission(names) => {
        assert_eq!(names, "transform, load");
      }
      other => panic!("unexpected error: {other}"),
    }

    // The retry skips the step that already has a result.
    p.submit(&scheduler).await.unwrap();
    let names: Vec<String> = flaky.submissions().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, ["etl_extract", "etl_transform", "etl_load"]);

    let statuses = p.wait(Duration::from_millis(1)).await.unwrap();
    assert!(statuses.values().all(|s| *s == JobStatus::Completed));
  }

  #[tokio::test]
  async fn wait_before_submit_is_distinct() {
    let p = three_step_pipeline();
    assert!(matches!(
      p.wait(Duration::from_millis(1)).await,
      Err(PipelineError::NotSubmitted)
    ));
  }

  #[tokio::test]
  async fn fully_submitted_pipeline_rejects_resubmission() {
    let scheduler: Arc<dyn Scheduler> = FlakyScheduler::new(None);
    let mut p = three_step_pipeline();
    p.submit(&scheduler).await.unwrap();
    assert!(matches!(
      p.submit(&scheduler).await,
      Err(PipelineError::AlreadySubmitted)
    ));
  }

  #[test]
  fn dependency_type_parsing() {
    assert_eq!(DependencyType::parse("afterok"), Some(DependencyType::AfterOk));
    assert_eq!(DependencyType::parse("AFTERANY"), Some(DependencyType::AfterAny));
    assert_eq!(DependencyType::parse("after"), Some(DependencyType::After));
    assert_eq!(DependencyType::parse("afternotok"), Some(DependencyType::AfterNotOk));
    assert_eq!(DependencyType::parse("12345"), None);
  }
}
