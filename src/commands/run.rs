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

//! The `run` (alias `submit`) verb.

use anyhow::Result;
use anyhow::bail;
use std::path::Path;
use std::time::Duration;

use crate::cli::RunArgs;
use crate::config::HpcConfig;
use crate::error::ValidationError;
use crate::job::Job;
use crate::job::JobArray;
use crate::result::JobStatus;
use crate::schedulers::SchedulerRegistry;
use crate::schedulers::SubmitOptions;
use crate::schedulers::submit;
use crate::schedulers::submit_array;

const WAIT_POLL: Duration = Duration::from_secs(5);

pub async fn execute(
  args: RunArgs,
  cli_scheduler: Option<String>,
  config: &HpcConfig,
  registry: &SchedulerRegistry,
) -> Result<()> {
  let (raw_args, command_tokens) = split_command(&args.command);
  if command_tokens.is_empty() {
    return Err(ValidationError::MissingCommand.into());
  }
  let command = shell_join(command_tokens);

  let scheduler_name = if args.local {
    Some("local".to_string())
  } else {
    cli_scheduler
  };
  let scheduler = registry.get(scheduler_name.as_deref(), config)?;

  let mut builder = Job::builder(command).raw_args(raw_args.to_vec());
  if let Some(name) = args.name {
    builder = builder.name(name);
  }
  if let Some(cpu) = args.cpu {
    builder = builder.cpu(cpu);
  }
  if let Some(mem) = args.mem {
    builder = builder.mem(mem);
  }
  if let Some(time) = args.time {
    builder = builder.time(time);
  }
  if let Some(queue) = args.queue {
    builder = builder.queue(queue);
  }
  if let Some(nodes) = args.nodes {
    builder = builder.nodes(nodes);
  }
  if let Some(tasks) = args.tasks {
    builder = builder.tasks(tasks);
  }
  if let Some(workdir) = args.workdir {
    builder = builder.workdir(workdir);
  }
  if let Some(job_type) = args.job_type {
    builder = builder.job_type(job_type);
  }
  if !args.modules.is_empty() {
    builder = builder.modules(args.modules);
  }
  if let Some(stdout) = args.stdout {
    builder = builder.stdout(stdout);
  }
  if let Some(stderr) = args.stderr {
    builder = builder.stderr(stderr);
  }
  if let Some(depend) = args.depend {
    builder = builder.dependency(depend);
  }
  if args.no_inherit_env {
    builder = builder.inherit_env(false);
  }
  let job = builder.build(config);

  let array = match &args.array {
    Some(spec) => Some(JobArray::parse_spec(job.clone(), spec)?),
    None => None,
  };
  if args.interactive && array.is_some() {
    bail!("interactive array jobs are not supported");
  }

  if args.dry_run {
    print_plan(
      scheduler.as_ref(),
      &job,
      array.as_ref(),
      args.interactive,
      args.keep_script,
    );
    return Ok(());
  }

  let opts = SubmitOptions {
    interactive: args.interactive,
    keep_script: args.keep_script,
  };

  if let Some(array) = array {
    let result = submit_array(&scheduler, &array, &opts).await?;
    println!(
      "Submitted array job {} ({} tasks, {})",
      result.base_job_id,
      array.count(),
      array.range_str()
    );
    if args.wait {
      let statuses = result.wait_all(WAIT_POLL).await?;
      let failed = statuses.values().filter(|s| **s != JobStatus::Completed).count();
      println!("Array job {} finished, {failed} task(s) not completed", result.base_job_id);
      if failed > 0 {
        bail!("array job {} had failing tasks", result.base_job_id);
      }
    }
    return Ok(());
  }

  let result = submit(&scheduler, &job, &opts).await?;
  if args.interactive {
    let code = result.exit_code().await?.unwrap_or(1);
    if code != 0 {
      std::process::exit(code);
    }
    return Ok(());
  }

  println!("Submitted job {}", result.job_id);
  if args.wait {
    let status = result.wait(WAIT_POLL, None).await?;
    println!("Job {} finished: {status}", result.job_id);
    if status != JobStatus::Completed {
      bail!("job {} ended in state {status}", result.job_id);
    }
  }
  Ok(())
}

fn print_plan(
  scheduler: &dyn crate::schedulers::Scheduler,
  job: &Job,
  array: Option<&JobArray>,
  interactive: bool,
  keep_script: bool,
) {
  println!("Dry run; nothing will be submitted.");
  println!("scheduler: {}", scheduler.name());
  println!("job name:  {}", job.name);
  println!("command:   {}", job.command);
  if let Some(array) = array {
    println!("array:     {}", array.range_str());
  }

  if interactive {
    let argv = scheduler.build_interactive_command(job);
    println!("interactive command: {}", shell_join(&argv));
    return;
  }

  let argv = scheduler.build_submit_command(job, Path::new("<script>"), array);
  println!("submit command: {}", shell_join(&argv));
  println!("--- script ---");
  print!("{}", scheduler.generate_script(job, array, keep_script));
}

/// Splits the trailing tokens at a literal `--`: raw scheduler args
/// before it, the command after. Without a separator everything is
/// the command.
fn split_command(tokens: &[String]) -> (&[String], &[String]) {
  match tokens.iter().position(|t| t == "--") {
    Some(i) => (&tokens[..i], &tokens[i + 1..]),
    None => (&[], tokens),
  }
}

/// Joins argv tokens into one shell command string, quoting where
/// needed.
pub fn shell_join(tokens: &[String]) -> String {
  tokens
    .iter()
    .map(|t| shell_quote(t))
    .collect::<Vec<_>>()
    .join(" ")
}

fn shell_quote(token: &str) -> String {
  let safe = !token.is_empty()
    && token
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
  if safe {
    token.to_string()
  } else {
    format!("'{}'", token.replace('\'', "'\\''"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn v(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
  }

  #[test]
  fn splits_on_double_dash() {
    let tokens = v(&["-l", "h_vmem=4G", "--", "echo", "hi"]);
    let (raw, cmd) = split_command(&tokens);
    assert_eq!(raw, ["-l", "h_vmem=4G"]);
    assert_eq!(cmd, ["echo", "hi"]);
  }

  #[test]
  fn no_separator_means_everything_is_the_command() {
    let tokens = v(&["python", "train.py"]);
    let (raw, cmd) = split_command(&tokens);
    assert!(raw.is_empty());
    assert_eq!(cmd, ["python", "train.py"]);
  }

  #[test]
  fn quoting_only_where_needed() {
    assert_eq!(shell_join(&v(&["echo", "hi"])), "echo hi");
    assert_eq!(shell_join(&v(&["echo", "two words"])), "echo 'two words'");
    assert_eq!(shell_join(&v(&["echo", "it's"])), r#"echo 'it'\''s'"#);
    assert_eq!(shell_join(&v(&["FOO=bar", "cmd"])), "FOO=bar cmd");
  }
}
