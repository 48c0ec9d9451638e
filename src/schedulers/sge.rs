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

//! Sun Grid Engine adapter (`qsub`/`qstat`/`qacct`/`qdel`/`qrsh`).

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Local;
use chrono::NaiveDateTime;
use chrono::TimeZone;
use std::path::Path;
use std::path::PathBuf;
use toml::Value;

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

const DIRECTIVE_PREFIX: &str = "#$";

/// SGE site knobs, from `[schedulers.sge]` config.
#[derive(Debug, Clone)]
pub struct SgeScheduler {
  parallel_environment: String,
  memory_resource: String,
  time_resource: String,
}

impl SgeScheduler {
  pub fn new(config: &HpcConfig) -> Self {
    let section = config.get_scheduler_config("sge");
    let get = |key: &str, default: &str| {
      section
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
    };
    SgeScheduler {
      parallel_environment: get("parallel_environment", "smp"),
      memory_resource: get("memory_resource", "h_vmem"),
      time_resource: get("time_resource", "h_rt"),
    }
  }
}

#[async_trait]
impl Scheduler for SgeScheduler {
  fn name(&self) -> &'static str {
    "sge"
  }

  fn directive_prefix(&self) -> Option<&'static str> {
    Some(DIRECTIVE_PREFIX)
  }

  fn render_attr(&self, attr: Attr, value: AttrValue<'_>, _job: &Job) -> Option<Rendering> {
    let args = match (attr, value) {
      (Attr::Shell, AttrValue::Str(shell)) => vec!["-S".into(), shell.into()],
      (Attr::UseCwd, AttrValue::Bool(true)) => vec!["-cwd".into()],
      (Attr::InheritEnv, AttrValue::Bool(true)) => vec!["-V".into()],
      (Attr::Name, AttrValue::Str(name)) => vec!["-N".into(), name.into()],
      (Attr::Cpu, AttrValue::Int(n)) => {
        vec!["-pe".into(), self.parallel_environment.clone(), n.to_string()]
      }
      (Attr::Mem, AttrValue::Str(mem)) => {
        vec!["-l".into(), format!("{}={mem}", self.memory_resource)]
      }
      (Attr::Time, AttrValue::Str(time)) => {
        vec!["-l".into(), format!("{}={time}", self.time_resource)]
      }
      (Attr::Queue, AttrValue::Str(queue)) => vec!["-q".into(), queue.into()],
      (Attr::Priority, AttrValue::Int(p)) => vec!["-p".into(), p.to_string()],
      (Attr::Stdout, AttrValue::Str(path)) => vec!["-o".into(), path.into()],
      (Attr::Stderr, AttrValue::Str(path)) => vec!["-e".into(), path.into()],
      // SGE has no node/task concepts.
      _ => return None,
    };
    Some(Rendering::with_directive(DIRECTIVE_PREFIX, args))
  }

  fn extra_renderings(&self, job: &Job) -> Vec<Rendering> {
    let mut out = Vec::new();
    if job.merge_output() {
      out.push(Rendering::with_directive(
        DIRECTIVE_PREFIX,
        vec!["-j".into(), "y".into()],
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
    let mut args = vec!["-t".into(), range];
    if let Some(max) = array.max_concurrent {
      args.push("-tc".into());
      args.push(max.to_string());
    }
    args
  }

  // SGE has one hold mechanism; every dependency type collapses to it.
  fn dependency_args(&self, job: &Job) -> Vec<String> {
    let (_, ids) = dependency_spec(job);
    if ids.is_empty() {
      return Vec::new();
    }
    vec!["-hold_jid".into(), ids.join(",")]
  }

  fn passthrough_args(&self, job: &Job) -> Vec<String> {
    let mut args = job.raw_args.clone();
    args.extend(job.sge_args.iter().cloned());
    args
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
    let mut argv = vec!["qrsh".to_string()];
    argv.extend(crate::schedulers::render::render_args(self, job));
    argv.extend(self.dependency_args(job));
    argv.extend(self.passthrough_args(job));
    argv.push(job.shell.clone());
    argv.push("-c".to_string());
    argv.push(job.command.clone());
    argv
  }

  fn parse_job_id(&self, stdout: &str) -> Result<String, SchedulerError> {
    parse_qsub_output(stdout).ok_or_else(|| SchedulerError::ParseJobId {
      scheduler: "sge",
      output: stdout.trim().to_string(),
    })
  }

  async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
    let output = run_capture(&["qstat".to_string()]).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    for row in parse_qstat(&stdout) {
      if row.job_id == base_id(job_id) {
        return Ok(row.state);
      }
    }
    // Not queued or running; accounting decides the terminal state.
    match self.qacct_field(job_id, "exit_status").await {
      Ok(Some(code)) if code == 0 => Ok(JobStatus::Completed),
      Ok(Some(_)) => Ok(JobStatus::Failed),
      _ => Ok(JobStatus::Unknown),
    }
  }

  async fn exit_code(&self, job_id: &str) -> Result<Option<i32>, SchedulerError> {
    self.qacct_field(job_id, "exit_status").await
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

  async fn list_active_jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, SchedulerError> {
    let mut argv = vec!["qstat".to_string(), "-u".to_string()];
    if filter.all_users {
      argv.push("*".to_string());
    } else {
      argv.push(filter.user.clone().unwrap_or_else(current_user));
    }
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(parse_qstat(&String::from_utf8_lossy(&output.stdout)))
  }

  async fn list_completed_jobs(
    &self,
    filter: &HistoryFilter,
  ) -> Result<Vec<JobInfo>, SchedulerError> {
    let user = filter.user.clone().unwrap_or_else(current_user);
    let argv = vec!["qacct".to_string(), "-o".to_string(), user, "-j".to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::CommandFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    let mut jobs = parse_qacct(&String::from_utf8_lossy(&output.stdout));
    if let Some(since) = filter.since {
      jobs.retain(|job| job.end_time.map(|end| end >= since).unwrap_or(true));
    }
    Ok(jobs)
  }

  async fn get_job_details(
    &self,
    job_id: &str,
  ) -> Result<(JobInfo, DetailExtras), SchedulerError> {
    let argv = vec!["qstat".to_string(), "-j".to_string(), job_id.to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Err(SchedulerError::JobNotFound(job_id.to_string()));
    }

    let mut extras = DetailExtras::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
      if let Some((key, value)) = line.split_once(':') {
        let key = key.trim();
        if !key.is_empty() && !key.starts_with('=') {
          extras.insert(key.to_string(), value.trim().to_string());
        }
      }
    }

    let state = self.status(job_id).await.unwrap_or(JobStatus::Unknown);
    let mut info = JobInfo::new(
      extras.get("job_number").cloned().unwrap_or_else(|| job_id.to_string()),
      extras.get("job_name").cloned().unwrap_or_default(),
      state,
    );
    info.user = extras.get("owner").cloned().unwrap_or_default();
    info.submit_time = extras.get("submission_time").and_then(|t| parse_sge_time(t));
    Ok((info, extras))
  }

  fn output_path(&self, job_id: &str, job_name: &str, stream: OutputStream) -> Option<PathBuf> {
    let marker = match stream {
      OutputStream::Stdout => 'o',
      OutputStream::Stderr => 'e',
    };
    Some(PathBuf::from(format!("{job_name}.{marker}{}", base_id(job_id))))
  }
}

impl SgeScheduler {
  async fn qacct_field(&self, job_id: &str, field: &str) -> Result<Option<i32>, SchedulerError> {
    let argv = vec!["qacct".to_string(), "-j".to_string(), base_id(job_id).to_string()];
    let output = run_capture(&argv).await?;
    if !output.status.success() {
      return Ok(None);
    }
    for line in String::from_utf8_lossy(&output.stdout).lines() {
      let mut parts = line.split_whitespace();
      if parts.next() == Some(field) {
        return Ok(parts.next().and_then(|v| v.parse().ok()));
      }
    }
    Ok(None)
  }
}

/// Maps SGE state letters onto the shared status model.
///
/// Deletion and error flags dominate the base state letter.
pub fn map_state(letters: &str) -> JobStatus {
  let letters = letters.to_lowercase();
  if letters.contains('d') {
    JobStatus::Cancelled
  } else if letters.contains('e') {
    JobStatus::Failed
  } else if letters.contains('r') || letters.contains('t') {
    JobStatus::Running
  } else if letters.contains('q') || letters.contains('h') || letters.contains('s') {
    JobStatus::Pending
  } else {
    JobStatus::Unknown
  }
}

/// Extracts the job id from qsub's confirmation line:
/// `Your job 12345 ("name") has been submitted` or
/// `Your job-array 12345.1-10:1 ("name") has been submitted`.
fn parse_qsub_output(stdout: &str) -> Option<String> {
  for line in stdout.lines() {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
      if token == "Your" {
        match tokens.next() {
          Some("job") | Some("job-array") => {
            let id = tokens.next()?;
            let digits: String = id.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
              return Some(digits);
            }
          }
          _ => {}
        }
      }
    }
  }
  None
}

/// Base job id without an array task suffix.
fn base_id(job_id: &str) -> &str {
  job_id.split('.').next().unwrap_or(job_id)
}

/// Parses default `qstat` tabular output into normalized rows.
fn parse_qstat(stdout: &str) -> Vec<JobInfo> {
  let mut jobs = Vec::new();
  for line in stdout.lines() {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 7 || !fields[0].chars().all(|c| c.is_ascii_digit()) {
      continue;
    }
    let mut info = JobInfo::new(fields[0], fields[2], map_state(fields[4]));
    info.user = fields[3].to_string();
    info.submit_time = parse_sge_time(&format!("{} {}", fields[5], fields[6]));
    // Pending rows have no queue column; a queue name is non-numeric.
    if let Some(extra) = fields.get(7) {
      if !extra.chars().all(|c| c.is_ascii_digit()) {
        info.queue = Some(extra.to_string());
      }
    }
    jobs.push(info);
  }
  jobs
}

/// Parses `qacct -j` block output (one `====`-separated record per
/// job) into normalized rows.
fn parse_qacct(stdout: &str) -> Vec<JobInfo> {
  let mut jobs = Vec::new();
  let mut record: DetailExtras = DetailExtras::new();

  let flush = |record: &mut DetailExtras, jobs: &mut Vec<JobInfo>| {
    if record.is_empty() {
      return;
    }
    let exit_code: Option<i32> = record.get("exit_status").and_then(|v| v.parse().ok());
    let failed = record.get("failed").map(|v| v != "0").unwrap_or(false);
    let state = if failed || exit_code.map(|c| c != 0).unwrap_or(false) {
      JobStatus::Failed
    } else {
      JobStatus::Completed
    };
    let mut info = JobInfo::new(
      record.get("jobnumber").cloned().unwrap_or_default(),
      record.get("jobname").cloned().unwrap_or_default(),
      state,
    );
    info.user = record.get("owner").cloned().unwrap_or_default();
    info.queue = record.get("qname").cloned();
    info.exit_code = exit_code;
    info.submit_time = record.get("qsub_time").and_then(|t| parse_sge_time(t));
    info.start_time = record.get("start_time").and_then(|t| parse_sge_time(t));
    info.end_time = record.get("end_time").and_then(|t| parse_sge_time(t));
    jobs.push(info);
    record.clear();
  };

  for line in stdout.lines() {
    if line.starts_with("====") {
      flush(&mut record, &mut jobs);
      continue;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
      record.insert(key.to_string(), value.trim().to_string());
    }
  }
  flush(&mut record, &mut jobs);
  jobs
}

/// SGE prints timestamps in either `MM/DD/YYYY HH:MM:SS` (qstat) or
/// `Sat Aug 29 10:23:45 2026` (qacct, qstat -j) form.
fn parse_sge_time(value: &str) -> Option<DateTime<Local>> {
  const FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%a %b %e %H:%M:%S %Y",
    "%Y-%m-%dT%H:%M:%S",
  ];
  for fmt in FORMATS {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value.trim(), fmt) {
      return Local.from_local_datetime(&naive).single();
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schedulers::render::render_directives;

  fn scheduler() -> SgeScheduler {
    SgeScheduler::new(&HpcConfig::default())
  }

  #[test]
  fn state_letters_map_to_shared_model() {
    assert_eq!(map_state("r"), JobStatus::Running);
    assert_eq!(map_state("t"), JobStatus::Running);
    assert_eq!(map_state("qw"), JobStatus::Pending);
    assert_eq!(map_state("hqw"), JobStatus::Pending);
    assert_eq!(map_state("s"), JobStatus::Pending);
    assert_eq!(map_state("Eqw"), JobStatus::Failed);
    assert_eq!(map_state("dr"), JobStatus::Cancelled);
    assert_eq!(map_state("dt"), JobStatus::Cancelled);
    assert_eq!(map_state("z"), JobStatus::Unknown);
  }

  #[test]
  fn qsub_output_parsing() {
    assert_eq!(
      parse_qsub_output("Your job 12345 (\"alice_python\") has been submitted\n").as_deref(),
      Some("12345")
    );
    assert_eq!(
      parse_qsub_output("Your job-array 12345.1-10:1 (\"x\") has been submitted").as_deref(),
      Some("12345")
    );
    assert!(parse_qsub_output("qsub: error").is_none());
  }

  #[test]
  fn qstat_rows_parse_with_and_without_queue() {
    let out = "\
job-ID  prior   name       user    state submit/start at     queue                     slots
--------------------------------------------------------------------------------------------
 100001 0.55500 train      alice   r     08/29/2026 10:23:45 all.q@node01              4
 100002 0.00000 prep       alice   qw    08/29/2026 10:24:00 1
";
    let jobs = parse_qstat(out);
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, "100001");
    assert_eq!(jobs[0].state, JobStatus::Running);
    assert_eq!(jobs[0].queue.as_deref(), Some("all.q@node01"));
    assert!(jobs[0].submit_time.is_some());
    assert_eq!(jobs[1].state, JobStatus::Pending);
    assert!(jobs[1].queue.is_none());
  }

  #[test]
  fn qacct_blocks_parse() {
    let out = "\
==============================================================
qname        all.q
jobname      train
jobnumber    100001
owner        alice
qsub_time    Sat Aug 29 10:23:45 2026
start_time   Sat Aug 29 10:24:00 2026
end_time     Sat Aug 29 11:00:00 2026
failed       0
exit_status  0
==============================================================
jobname      broken
jobnumber    100002
owner        alice
failed       0
exit_status  1
";
    let jobs = parse_qacct(out);
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, JobStatus::Completed);
    assert_eq!(jobs[0].exit_code, Some(0));
    assert!(jobs[0].end_time.is_some());
    assert_eq!(jobs[1].state, JobStatus::Failed);
    assert_eq!(jobs[1].exit_code, Some(1));
  }

  #[test]
  fn directives_use_site_config() {
    let mut config = HpcConfig::default();
    let site: toml::Table = toml::from_str("parallel_environment = \"mpi\"").unwrap();
    config.schedulers.insert("sge".into(), toml::Value::Table(site));
    let sge = SgeScheduler::new(&config);
    let job = Job::builder("python train.py").cpu(8).build(&HpcConfig::default());
    let directives = render_directives(&sge, &job);
    assert!(directives.contains(&"#$ -pe mpi 8".to_string()), "{directives:?}");
  }

  #[test]
  fn script_and_command_end_to_end() {
    let sge = scheduler();
    let job = Job::builder("python train.py")
      .name("alice_python")
      .cpu(4)
      .mem("8G")
      .modules(vec!["python/3.11".into()])
      .build(&HpcConfig::default());

    let script = sge.generate_script(&job, None, true);
    assert!(script.starts_with("#!/bin/bash\n"), "{script}");
    assert!(script.contains("#$ -pe smp 4"), "{script}");
    assert!(script.contains("#$ -l h_vmem=8G"), "{script}");
    assert!(script.contains("#$ -N alice_python"), "{script}");
    assert!(script.contains("#$ -j y"), "{script}");
    assert!(script.contains("module load python/3.11"), "{script}");
    assert!(script.ends_with("python train.py\n"), "{script}");
    assert!(!script.contains("trap"), "{script}");

    let argv = sge.build_submit_command(&job, Path::new("/tmp/job.sh"), None);
    assert_eq!(argv[0], "qsub");
    assert_eq!(argv.last().map(String::as_str), Some("/tmp/job.sh"));
  }

  #[test]
  fn self_delete_trap_unless_kept() {
    let sge = scheduler();
    let job = Job::builder("true").build(&HpcConfig::default());
    let script = sge.generate_script(&job, None, false);
    assert!(script.contains("trap 'rm -f -- \"$0\"' EXIT"), "{script}");
  }

  #[test]
  fn dependencies_collapse_to_hold_jid() {
    let job = Job::builder("x")
      .dependency("afterok:100:200")
      .build(&HpcConfig::default());
    assert_eq!(scheduler().dependency_args(&job), ["-hold_jid", "100,200"]);

    let mut job = Job::builder("x").build(&HpcConfig::default());
    job.dependencies = vec!["300".into(), "400".into()];
    assert_eq!(scheduler().dependency_args(&job), ["-hold_jid", "300,400"]);
  }

  #[test]
  fn array_args_with_step_and_throttle() {
    let job = Job::builder("x").build(&HpcConfig::default());
    let array = JobArray::parse_spec(job, "1-100:2%5").unwrap();
    assert_eq!(scheduler().array_args(&array), ["-t", "1-100:2", "-tc", "5"]);
  }

  #[test]
  fn resources_render_as_l_flags() {
    let mut job = Job::builder("x").build(&HpcConfig::default());
    job.resources.add("gpu", 2);
    let directives = render_directives(&scheduler(), &job);
    assert!(directives.contains(&"#$ -l gpu=2".to_string()), "{directives:?}");
  }

  #[test]
  fn output_paths_follow_sge_naming() {
    let sge = scheduler();
    assert_eq!(
      sge.output_path("123", "alice_python", OutputStream::Stdout),
      Some(PathBuf::from("alice_python.o123"))
    );
    assert_eq!(
      sge.output_path("123.4", "alice_python", OutputStream::Stderr),
      Some(PathBuf::from("alice_python.e123"))
    );
  }
}
