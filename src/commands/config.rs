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

//! The `config show|init|path` verbs.

use anyhow::Result;
use anyhow::bail;
use std::path::PathBuf;
use toml::Table;
use toml::Value;

use crate::cli::ConfigCommand;
use crate::config::CONFIG_FILE_NAME;
use crate::config::HpcConfig;
use crate::config::find_config_files;

const TEMPLATE: &str = r#"# hpcrun configuration.
#
# Files later in the cascade override earlier ones; tables merge
# recursively and lists concatenate (prefix an override list with "-"
# to replace instead). A file may extend others via
#   extends = ["../shared.toml"]

[defaults]
# queue = "all.q"
# modules_path = ["/opt/modules"]

[schedulers.sge]
parallel_environment = "smp"
memory_resource = "h_vmem"
time_resource = "h_rt"

[tools.python]
# cpu = 4
# mem = "8G"
# modules = ["python/3.11"]

[types.gpu]
# queue = "gpu.q"
# resources = [{ name = "gpu", value = 1 }]
"#;

pub fn execute(command: ConfigCommand, config: &HpcConfig) -> Result<()> {
  match command {
    ConfigCommand::Show => show(config),
    ConfigCommand::Init { global } => init(global),
    ConfigCommand::Path => path(),
  }
}

fn show(config: &HpcConfig) -> Result<()> {
  for source in &config.sources {
    println!("# loaded: {}", source.display());
  }

  let mut doc = Table::new();
  for (key, section) in [
    ("defaults", &config.defaults),
    ("tools", &config.tools),
    ("types", &config.types),
    ("schedulers", &config.schedulers),
  ] {
    if !section.is_empty() {
      doc.insert(key.to_string(), Value::Table(section.clone()));
    }
  }

  if doc.is_empty() {
    println!("# empty configuration");
  } else {
    print!("{}", toml::to_string_pretty(&doc)?);
  }
  Ok(())
}

fn init(global: bool) -> Result<()> {
  let target = if global {
    let Some(home) = home::home_dir() else {
      bail!("cannot determine home directory");
    };
    let dir = home.join(".config").join("hpcrun");
    std::fs::create_dir_all(&dir)?;
    dir.join("config.toml")
  } else {
    PathBuf::from(CONFIG_FILE_NAME)
  };

  if target.exists() {
    bail!("{} already exists, not overwriting", target.display());
  }
  std::fs::write(&target, TEMPLATE)?;
  println!("Wrote {}", target.display());
  Ok(())
}

fn path() -> Result<()> {
  let files = find_config_files()?;
  if files.is_empty() {
    println!("No configuration files found.");
    return Ok(());
  }
  for file in files {
    println!("{}", file.display());
  }
  Ok(())
}
