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

//! # hpcrun
//!
//! `hpcrun` describes a computation once (command, resources,
//! environment) and submits it, unchanged, to any of several batch
//! schedulers (SGE, Slurm, PBS) or runs it locally. It also supports
//! DAG workflows of dependent jobs with safe partial-failure retry.
//!
//! This crate contains the library behind the `hpcrun` CLI; the core
//! modules are usable on their own.
//!
//! ## Core Modules
//!
//! * [`config`]: The cascading configuration resolver. Merges
//!   per-tool and per-type defaults from a chain of TOML files
//!   (env var, user config, git root, working directory), with
//!   `extends` chains and list reset markers.
//! * [`job`]: The scheduler-agnostic [`job::Job`] model and its
//!   builder, which merges resolved configuration with explicit
//!   overrides.
//! * [`schedulers`]: The [`schedulers::Scheduler`] trait, the four
//!   adapters (sge, slurm, pbs, local), attribute rendering, and the
//!   registry with auto-detection.
//! * [`result`]: Handles to submitted jobs: polling, waiting,
//!   cancellation, output retrieval.
//! * [`pipeline`]: DAG workflows submitted in dependency order.
//! * [`cli`] and [`commands`]: The `clap`-based CLI surface.
//! * [`error`]: The error taxonomy.
//! * [`logging`]: Provides the `setup_tracing` utility.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod result;
pub mod schedulers;
pub mod timeutil;
