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
use anyhow::Result;
use clap::Parser;
use hpcrun::cli::Cli;
use hpcrun::cli::Commands;
use hpcrun::commands;
use hpcrun::config::load_config;
use hpcrun::logging::setup_tracing;
use hpcrun::schedulers::SchedulerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  setup_tracing(cli.verbose)?;

  let config = load_config(cli.config.as_deref())?;
  let registry = SchedulerRegistry::with_defaults();

  match cli.command {
    Commands::Run(args) => commands::run::execute(args, cli.scheduler, &config, &registry).await,
    Commands::Status(args) => {
      let scheduler = registry.get(cli.scheduler.as_deref(), &config)?;
      commands::status::execute(args, &scheduler).await
    }
    Commands::Cancel { job_id } => {
      let scheduler = registry.get(cli.scheduler.as_deref(), &config)?;
      commands::cancel::execute(&job_id, &scheduler).await
    }
    Commands::Config(command) => commands::config::execute(command, &config),
  }
}
