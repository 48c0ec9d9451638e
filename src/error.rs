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
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error enum for the hpcrun library.
#[derive(Error, Debug)]
pub enum HpcError {
  #[error("Configuration error")]
  Config(#[from] ConfigError),

  #[error("Scheduler operation failed")]
  Scheduler(#[from] SchedulerError),

  #[error("Invalid job parameters")]
  Validation(#[from] ValidationError),

  #[error("Pipeline error")]
  Pipeline(#[from] PipelineError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors from configuration discovery and merging (src/config.rs).
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file: {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config file: {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("Circular extends detected: {0}")]
  CircularExtends(PathBuf),

  #[error("Unknown scheduler: {name}. Available: {available:?}")]
  UnknownScheduler {
    name: String,
    available: Vec<String>,
  },
}

/// Errors from scheduler adapters (src/schedulers/).
#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error("Submission rejected by {scheduler}: {diagnostic}")]
  Submission {
    scheduler: &'static str,
    diagnostic: String,
  },

  #[error("Failed to invoke {command}")]
  Invoke {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{command} failed: {stderr}")]
  CommandFailed { command: String, stderr: String },

  #[error("Failed to parse job ID from {scheduler} output: {output}")]
  ParseJobId {
    scheduler: &'static str,
    output: String,
  },

  #[error("Job {0} not found")]
  JobNotFound(String),

  #[error("Job accounting is not available: {0}")]
  AccountingNotAvailable(String),

  #[error("Job {job_id} did not complete within {timeout_secs}s")]
  WaitTimeout { job_id: String, timeout_secs: u64 },

  #[error("{feature} is not supported by the {scheduler} scheduler")]
  Unsupported {
    scheduler: &'static str,
    feature: &'static str,
  },

  #[error("Failed to write job script to {path}")]
  WriteScript {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Validation errors for user-supplied job parameters.
#[derive(Error, Debug)]
pub enum ValidationError {
  #[error(
    "Invalid --since value: {0:?}. Use a relative duration (e.g. 30m, 2h, 1d) or an ISO timestamp."
  )]
  BadSince(String),

  #[error("Invalid array specification: {0:?}. Expected START-END[:STEP][%MAX] (e.g. 1-100:2%5).")]
  BadArraySpec(String),

  #[error("Command is required")]
  MissingCommand,
}

/// Errors from the pipeline / DAG engine (src/pipeline.rs).
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("Job name '{0}' already exists in pipeline")]
  DuplicateName(String),

  #[error("Unknown dependency: {0} (no pipeline step has that name)")]
  UnknownDependency(String),

  #[error("Circular dependency detected in pipeline")]
  Cycle,

  #[error("Pipeline has no jobs to submit")]
  Empty,

  #[error("Pipeline has already been submitted")]
  AlreadySubmitted,

  #[error("Pipeline has not been submitted")]
  NotSubmitted,

  #[error("Jobs never submitted (partial failure): {0}. Call submit() again to retry.")]
  PartialSubmission(String),

  #[error(transparent)]
  Submission(#[from] SchedulerError),
}
