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

//! The `status` verb: one job, the active list, or history.

use anyhow::Result;
use anyhow::bail;
use std::sync::Arc;

use crate::cli::StatusArgs;
use crate::result::JobInfo;
use crate::schedulers::HistoryFilter;
use crate::schedulers::JobFilter;
use crate::schedulers::Scheduler;
use crate::timeutil::parse_since;

pub async fn execute(args: StatusArgs, scheduler: &Arc<dyn Scheduler>) -> Result<()> {
  if args.since.is_some() && !args.history {
    bail!("--since only applies to --history");
  }

  if let Some(job_id) = &args.job_id {
    let (info, extras) = scheduler.get_job_details(job_id).await?;
    if args.json {
      let doc = serde_json::json!({ "job": info, "details": extras });
      println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
      print_details(&info);
    }
    return Ok(());
  }

  let jobs = if args.history {
    let since = args.since.as_deref().map(parse_since).transpose()?;
    scheduler
      .list_completed_jobs(&HistoryFilter { since, user: None })
      .await?
  } else {
    scheduler
      .list_active_jobs(&JobFilter {
        user: None,
        all_users: args.all,
      })
      .await?
  };

  if args.json {
    println!("{}", serde_json::to_string_pretty(&jobs)?);
  } else {
    print_table(&jobs);
  }
  Ok(())
}

fn print_details(info: &JobInfo) {
  println!("Job ID:    {}", info.job_id);
  println!("Name:      {}", info.name);
  if !info.user.is_empty() {
    println!("User:      {}", info.user);
  }
  println!("State:     {}", info.state);
  if let Some(queue) = &info.queue {
    println!("Queue:     {queue}");
  }
  if let Some(t) = info.submit_time {
    println!("Submitted: {}", t.format("%Y-%m-%d %H:%M:%S"));
  }
  if let Some(t) = info.start_time {
    println!("Started:   {}", t.format("%Y-%m-%d %H:%M:%S"));
  }
  if let Some(t) = info.end_time {
    println!("Ended:     {}", t.format("%Y-%m-%d %H:%M:%S"));
  }
  if let Some(code) = info.exit_code {
    println!("Exit code: {code}");
  }
}

fn print_table(jobs: &[JobInfo]) {
  if jobs.is_empty() {
    println!("No jobs found.");
    return;
  }
  println!(
    "{:<14} {:<20} {:<10} {:<10} {:<16} {}",
    "JOB ID", "NAME", "USER", "STATE", "QUEUE", "SUBMITTED"
  );
  for job in jobs {
    println!(
      "{:<14} {:<20} {:<10} {:<10} {:<16} {}",
      job.job_id,
      job.name,
      job.user,
      job.state.to_string(),
      job.queue.as_deref().unwrap_or("-"),
      job
        .submit_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string()),
    );
  }
}
