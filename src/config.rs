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

//! Configuration discovery and merging.
//!
//! Config files are TOML with four sections (`[defaults]`, `[tools.*]`,
//! `[types.*]`, `[schedulers.*]`) plus an optional top-level `extends`
//! key. Files discovered later override files discovered earlier; each
//! file's `extends` chain is merged before the file itself.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use toml::Table;
use toml::Value;

use crate::error::ConfigError;

/// Environment variable naming the site/system config file.
pub const CONFIG_ENV_VAR: &str = "HPCRUN_CONFIG";

/// Config file name looked for in the git root and current directory.
pub const CONFIG_FILE_NAME: &str = "hpcrun.toml";

/// First array element that makes an override list replace the base list
/// instead of merging into it.
const LIST_RESET_MARKER: &str = "-";

/// Merged configuration from all discovered sources.
#[derive(Debug, Clone, Default)]
pub struct HpcConfig {
  pub defaults: Table,
  pub tools: Table,
  pub types: Table,
  pub schedulers: Table,

  /// Files that contributed to the merge, lowest priority first.
  pub sources: Vec<PathBuf>,
}

impl HpcConfig {
  /// Returns `defaults` merged with the matching `[types.<name>]` entry,
  /// or a copy of `defaults` if the type is unknown.
  pub fn get_type_config(&self, job_type: &str) -> Table {
    self.section_config(job_type, &self.types)
  }

  /// Returns config matching a command line.
  ///
  /// The tool name is the first token of `command` with any path prefix
  /// stripped. If the tool entry has an `options` table, each option key
  /// is token-normalized and matched as a contiguous subsequence of the
  /// remaining command tokens; the first match (in file order) has its
  /// sub-config merged on top.
  pub fn get_tool_config(&self, command: &str) -> Table {
    let mut parts = command.split_whitespace();
    let Some(first) = parts.next() else {
      return self.defaults.clone();
    };
    let tool = strip_path(first);

    let mut config = self.section_config(&tool, &self.tools);

    let options = self
      .tools
      .get(&tool)
      .and_then(Value::as_table)
      .and_then(|t| t.get("options"))
      .and_then(Value::as_table);

    if let Some(options) = options {
      let cmd_tokens = normalize_tokens(parts.map(str::to_string));
      if !cmd_tokens.is_empty() {
        for (option_key, option_config) in options {
          let key_tokens = normalize_tokens(option_key.split_whitespace().map(str::to_string));
          if match_contiguous(&cmd_tokens, &key_tokens) {
            if let Some(t) = option_config.as_table() {
              config = merge_table(&config, t);
            }
            break; // First match wins
          }
        }
      }
    }

    config
  }

  /// Returns the `[schedulers.<name>]` entry, or an empty table.
  pub fn get_scheduler_config(&self, scheduler: &str) -> Table {
    self
      .schedulers
      .get(scheduler)
      .and_then(Value::as_table)
      .cloned()
      .unwrap_or_default()
  }

  fn section_config(&self, name: &str, section: &Table) -> Table {
    let mut config = self.defaults.clone();
    if let Some(entry) = section.get(name).and_then(Value::as_table) {
      let mut entry = entry.clone();
      // Handled separately by get_tool_config.
      entry.remove("options");
      config = merge_table(&config, &entry);
    }
    config
  }
}

/// Strips any path prefix from a command token.
fn strip_path(token: &str) -> String {
  Path::new(token)
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| token.to_string())
}

/// Splits `--flag=value` tokens into `--flag value`. Short options and
/// combined flags are left alone.
fn normalize_tokens(tokens: impl Iterator<Item = String>) -> Vec<String> {
  let mut normalized = Vec::new();
  for token in tokens {
    if token.starts_with("--") && token.contains('=') {
      let (flag, value) = token.split_once('=').expect("checked contains '='");
      normalized.push(flag.to_string());
      normalized.push(value.to_string());
    } else {
      normalized.push(token);
    }
  }
  normalized
}

/// Checks whether `needle` appears as a contiguous run within `haystack`.
fn match_contiguous(haystack: &[String], needle: &[String]) -> bool {
  !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Deep merge with `over` taking precedence.
///
/// Tables merge key-by-key recursively. Arrays concatenate with order
/// preserved and duplicates removed (first occurrence keeps its
/// position), unless the override's first element is the `"-"` reset
/// marker, in which case the override (minus the marker) replaces the
/// base. Scalars are replaced.
pub fn merge_value(base: &Value, over: &Value) -> Value {
  match (base, over) {
    (Value::Table(b), Value::Table(o)) => Value::Table(merge_table(b, o)),
    (Value::Array(b), Value::Array(o)) => Value::Array(merge_array(b, o)),
    (_, o) => o.clone(),
  }
}

pub fn merge_table(base: &Table, over: &Table) -> Table {
  let mut result = base.clone();
  for (key, value) in over {
    let merged = match result.get(key) {
      Some(existing) => merge_value(existing, value),
      None => value.clone(),
    };
    result.insert(key.clone(), merged);
  }
  result
}

fn merge_array(base: &[Value], over: &[Value]) -> Vec<Value> {
  if over.first().and_then(Value::as_str) == Some(LIST_RESET_MARKER) {
    return over[1..].to_vec();
  }

  let mut merged: Vec<Value> = Vec::with_capacity(base.len() + over.len());
  for item in base.iter().chain(over) {
    if !merged.contains(item) {
      merged.push(item.clone());
    }
  }
  merged
}

/// Expands `${VAR}` and `$VAR` references against the process environment.
/// Unset variables are left verbatim.
fn expand_env_vars(input: &str) -> String {
  let bytes = input.as_bytes();
  let mut out = String::with_capacity(input.len());
  let mut i = 0;

  while i < bytes.len() {
    if bytes[i] == b'$' && i + 1 < bytes.len() {
      if bytes[i + 1] == b'{' {
        if let Some(end) = input[i + 2..].find('}') {
          let name = &input[i + 2..i + 2 + end];
          match env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => out.push_str(&input[i..i + end + 3]),
          }
          i += end + 3;
          continue;
        }
      } else if bytes[i + 1].is_ascii_alphabetic() || bytes[i + 1] == b'_' {
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
          end += 1;
        }
        let name = &input[start..end];
        match env::var(name) {
          Ok(val) => out.push_str(&val),
          Err(_) => out.push_str(&input[i..end]),
        }
        i = end;
        continue;
      }
    }

    let ch = input[i..].chars().next().expect("in-bounds index");
    out.push(ch);
    i += ch.len_utf8();
  }

  out
}

/// Resolves the `extends` chain for one config file.
///
/// Returns paths in merge order, base first. A target that does not
/// exist is skipped with a warning (the site config may not be deployed
/// yet); a cycle is a hard error, detected before anything is merged.
fn resolve_extends(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Vec<PathBuf>, ConfigError> {
  let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

  if !visited.insert(resolved.clone()) {
    return Err(ConfigError::CircularExtends(resolved));
  }

  let Ok(content) = fs::read_to_string(&resolved) else {
    return Ok(vec![resolved]);
  };
  let Ok(data) = content.parse::<Table>() else {
    return Ok(vec![resolved]);
  };
  let Some(extends) = data.get("extends").and_then(Value::as_str) else {
    return Ok(vec![resolved]);
  };

  let expanded = expand_env_vars(extends);
  let mut target = PathBuf::from(expanded);
  if target.is_relative() {
    if let Some(parent) = resolved.parent() {
      target = parent.join(target);
    }
  }

  if !target.exists() {
    tracing::warn!(
      "extends target {} (from {}) does not exist; skipping",
      target.display(),
      resolved.display()
    );
    return Ok(vec![resolved]);
  }

  let mut chain = resolve_extends(&target, visited)?;
  chain.push(resolved);
  Ok(chain)
}

/// Finds all configuration files to merge, lowest priority first.
///
/// Order: `$HPCRUN_CONFIG`, then the user config under
/// `~/.config/hpcrun/`, then `<git root>/hpcrun.toml`, then
/// `./hpcrun.toml` (or `./pyproject.toml` with a `[tool.hpcrun]` table).
/// Each file contributes its extends chain first.
pub fn find_config_files() -> Result<Vec<PathBuf>, ConfigError> {
  let mut configs: Vec<PathBuf> = Vec::new();
  let mut seen: HashSet<PathBuf> = HashSet::new();

  let add_config = |path: &Path, configs: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>| {
    let mut visited = HashSet::new();
    let chain = resolve_extends(path, &mut visited)?;
    for p in chain {
      if seen.insert(p.clone()) {
        configs.push(p);
      }
    }
    Ok::<(), ConfigError>(())
  };

  // 1. Site/system config from the environment.
  if let Ok(env_config) = env::var(CONFIG_ENV_VAR) {
    if !env_config.is_empty() {
      let env_path = PathBuf::from(expand_env_vars(&env_config));
      if env_path.exists() {
        add_config(&env_path, &mut configs, &mut seen)?;
      }
    }
  }

  // 2. User config (first name found wins).
  if let Some(user_dir) = home::home_dir().map(|h| h.join(".config").join("hpcrun")) {
    for name in ["config.toml", CONFIG_FILE_NAME] {
      let user_config = user_dir.join(name);
      if user_config.exists() {
        add_config(&user_config, &mut configs, &mut seen)?;
        break;
      }
    }
  }

  let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

  // 3. Git root config.
  if let Some(git_root) = find_git_root(&cwd) {
    let git_config = git_root.join(CONFIG_FILE_NAME);
    if git_config.exists() {
      add_config(&git_config, &mut configs, &mut seen)?;
    }
  }

  // 4. Current directory config (or a manifest-embedded section).
  let cwd_config = cwd.join(CONFIG_FILE_NAME);
  let pyproject = cwd.join("pyproject.toml");
  if cwd_config.exists() {
    add_config(&cwd_config, &mut configs, &mut seen)?;
  } else if pyproject.exists() && has_embedded_section(&pyproject) {
    add_config(&pyproject, &mut configs, &mut seen)?;
  }

  Ok(configs)
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
  let start = start.canonicalize().ok()?;
  start
    .ancestors()
    .find(|dir| dir.join(".git").exists())
    .map(Path::to_path_buf)
}

fn has_embedded_section(pyproject: &Path) -> bool {
  let Ok(content) = fs::read_to_string(pyproject) else {
    return false;
  };
  let Ok(data) = content.parse::<Table>() else {
    return false;
  };
  data
    .get("tool")
    .and_then(Value::as_table)
    .is_some_and(|tool| tool.get("hpcrun").is_some())
}

/// Loads one file's config data, extracting the embedded section for
/// manifest files and dropping the `extends` metadata key.
fn load_single(path: &Path) -> Result<Table, ConfigError> {
  let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let mut data: Table = content.parse().map_err(|source| ConfigError::Parse {
    path: path.to_path_buf(),
    source,
  })?;

  if path.file_name().is_some_and(|n| n == "pyproject.toml") {
    data = data
      .get("tool")
      .and_then(Value::as_table)
      .and_then(|tool| tool.get("hpcrun"))
      .and_then(Value::as_table)
      .cloned()
      .unwrap_or_default();
  }

  data.remove("extends");
  Ok(data)
}

/// Loads and merges configuration.
///
/// With an explicit `path`, only that file (plus its extends chain) is
/// loaded; otherwise all discovered files are merged. Files that fail to
/// read or parse are skipped with a warning. A circular extends chain
/// fails before anything is merged.
pub fn load_config(path: Option<&Path>) -> Result<HpcConfig, ConfigError> {
  let config_files = match path {
    Some(p) => {
      if !p.exists() {
        return Err(ConfigError::Read {
          path: p.to_path_buf(),
          source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        });
      }
      let mut visited = HashSet::new();
      resolve_extends(p, &mut visited)?
    }
    None => find_config_files()?,
  };

  let mut config = HpcConfig::default();

  for config_path in &config_files {
    let data = match load_single(config_path) {
      Ok(data) => data,
      Err(err) => {
        tracing::warn!("skipping config {}: {err}", config_path.display());
        continue;
      }
    };

    for (key, target) in [
      ("defaults", &mut config.defaults),
      ("tools", &mut config.tools),
      ("types", &mut config.types),
      ("schedulers", &mut config.schedulers),
    ] {
      if let Some(section) = data.get(key).and_then(Value::as_table) {
        *target = merge_table(target, section);
      }
    }
  }

  config.sources = config_files;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn toml_value(s: &str) -> Value {
    let table: Table = s.parse().unwrap();
    Value::Table(table)
  }

  #[test]
  fn scalars_are_replaced() {
    let base = toml_value("cpu = 1\nmem = \"4G\"");
    let over = toml_value("cpu = 8");
    let merged = merge_value(&base, &over);
    assert_eq!(merged.get("cpu").unwrap().as_integer(), Some(8));
    assert_eq!(merged.get("mem").unwrap().as_str(), Some("4G"));
  }

  #[test]
  fn tables_merge_recursively() {
    let base = toml_value("[env_vars]\nA = \"1\"\nB = \"2\"");
    let over = toml_value("[env_vars]\nB = \"3\"\nC = \"4\"");
    let merged = merge_value(&base, &over);
    let env_vars = merged.get("env_vars").unwrap();
    assert_eq!(env_vars.get("A").unwrap().as_str(), Some("1"));
    assert_eq!(env_vars.get("B").unwrap().as_str(), Some("3"));
    assert_eq!(env_vars.get("C").unwrap().as_str(), Some("4"));
  }

  #[test]
  fn lists_concat_dedup_first_position_wins() {
    let base = toml_value("modules = [\"gcc\", \"python/3.11\"]");
    let over = toml_value("modules = [\"python/3.11\", \"cuda\"]");
    let merged = merge_value(&base, &over);
    let modules: Vec<&str> = merged
      .get("modules")
      .unwrap()
      .as_array()
      .unwrap()
      .iter()
      .map(|v| v.as_str().unwrap())
      .collect();
    assert_eq!(modules, ["gcc", "python/3.11", "cuda"]);
  }

  #[test]
  fn list_reset_marker_replaces_base() {
    let base = toml_value("modules = [\"gcc\", \"python/3.11\"]");
    let over = toml_value("modules = [\"-\", \"cuda\"]");
    let merged = merge_value(&base, &over);
    let modules: Vec<&str> = merged
      .get("modules")
      .unwrap()
      .as_array()
      .unwrap()
      .iter()
      .map(|v| v.as_str().unwrap())
      .collect();
    assert_eq!(modules, ["cuda"]);
  }

  #[test]
  fn normalize_splits_long_flag_assignments() {
    let tokens = normalize_tokens(
      ["--mode=fast", "-x=1", "plain"]
        .iter()
        .map(|s| s.to_string()),
    );
    assert_eq!(tokens, ["--mode", "fast", "-x=1", "plain"]);
  }

  #[test]
  fn contiguous_match() {
    let hay: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let hit: Vec<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
    let miss: Vec<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
    assert!(match_contiguous(&hay, &hit));
    assert!(!match_contiguous(&hay, &miss));
    assert!(!match_contiguous(&hay, &[]));
  }

  #[test]
  fn unknown_tool_returns_defaults_unchanged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hpcrun.toml");
    fs::write(&path, "[defaults]\ncpu = 2\n\n[tools.python]\ncpu = 8\n").unwrap();
    let config = load_config(Some(&path)).unwrap();

    let tool = config.get_tool_config("nonexistent-tool input.txt");
    assert_eq!(tool, config.defaults);
    assert_eq!(tool.get("cpu").unwrap().as_integer(), Some(2));

    let ty = config.get_type_config("nonexistent-type");
    assert_eq!(ty, config.defaults);
  }

  #[test]
  fn tool_lookup_strips_path_and_merges_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hpcrun.toml");
    fs::write(
      &path,
      "[defaults]\ncpu = 1\nmem = \"4G\"\n\n[tools.python]\ncpu = 4\n",
    )
    .unwrap();
    let config = load_config(Some(&path)).unwrap();

    let tool = config.get_tool_config("/usr/bin/python train.py");
    assert_eq!(tool.get("cpu").unwrap().as_integer(), Some(4));
    assert_eq!(tool.get("mem").unwrap().as_str(), Some("4G"));
  }

  #[test]
  fn option_specialisation_first_contiguous_match_wins() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hpcrun.toml");
    fs::write(
      &path,
      r#"
[tools.samtools]
cpu = 2

[tools.samtools.options."sort"]
cpu = 8

[tools.samtools.options."view -b"]
cpu = 4
"#,
    )
    .unwrap();
    let config = load_config(Some(&path)).unwrap();

    let sort = config.get_tool_config("samtools sort -o out.bam in.bam");
    assert_eq!(sort.get("cpu").unwrap().as_integer(), Some(8));

    let view = config.get_tool_config("samtools view -b in.bam");
    assert_eq!(view.get("cpu").unwrap().as_integer(), Some(4));

    // "view" then later "-b" is not contiguous with anything else in between.
    let split = config.get_tool_config("samtools view -h -b in.bam");
    assert_eq!(split.get("cpu").unwrap().as_integer(), Some(2));
  }

  #[test]
  fn option_value_assignment_is_normalized() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hpcrun.toml");
    fs::write(
      &path,
      r#"
[tools.train]
[tools.train.options."--mode fast"]
cpu = 16
"#,
    )
    .unwrap();
    let config = load_config(Some(&path)).unwrap();

    let merged = config.get_tool_config("train --mode=fast data/");
    assert_eq!(merged.get("cpu").unwrap().as_integer(), Some(16));
  }

  #[test]
  fn extends_chain_merges_base_first() {
    let dir = tempdir().unwrap();
    let c = dir.path().join("c.toml");
    let b = dir.path().join("b.toml");
    let a = dir.path().join("a.toml");
    fs::write(&c, "[defaults]\ncpu = 1\nmem = \"1G\"\ntime = \"1:00:00\"\n").unwrap();
    fs::write(&b, "extends = \"c.toml\"\n[defaults]\nmem = \"8G\"\n").unwrap();
    fs::write(&a, "extends = \"b.toml\"\n[defaults]\ncpu = 16\n").unwrap();

    let config = load_config(Some(&a)).unwrap();
    assert_eq!(config.sources.len(), 3);
    assert!(config.sources[0].ends_with("c.toml"));
    assert!(config.sources[2].ends_with("a.toml"));
    assert_eq!(config.defaults.get("cpu").unwrap().as_integer(), Some(16));
    assert_eq!(config.defaults.get("mem").unwrap().as_str(), Some("8G"));
    assert_eq!(
      config.defaults.get("time").unwrap().as_str(),
      Some("1:00:00")
    );
  }

  #[test]
  fn missing_extends_target_is_skipped() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.toml");
    fs::write(&a, "extends = \"missing.toml\"\n[defaults]\ncpu = 2\n").unwrap();

    let config = load_config(Some(&a)).unwrap();
    assert_eq!(config.sources.len(), 1);
    assert_eq!(config.defaults.get("cpu").unwrap().as_integer(), Some(2));
  }

  #[test]
  fn circular_extends_fails_loudly() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.toml");
    let b = dir.path().join("b.toml");
    fs::write(&a, "extends = \"b.toml\"\n").unwrap();
    fs::write(&b, "extends = \"a.toml\"\n").unwrap();

    let err = load_config(Some(&a)).unwrap_err();
    assert!(matches!(err, ConfigError::CircularExtends(_)));
  }

  #[test]
  fn self_extends_is_a_cycle() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.toml");
    fs::write(&a, "extends = \"a.toml\"\n").unwrap();

    let err = load_config(Some(&a)).unwrap_err();
    assert!(matches!(err, ConfigError::CircularExtends(_)));
  }

  #[test]
  fn pyproject_embedded_section_is_extracted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pyproject.toml");
    fs::write(
      &path,
      "[project]\nname = \"x\"\n\n[tool.hpcrun.defaults]\ncpu = 6\n",
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.defaults.get("cpu").unwrap().as_integer(), Some(6));
  }

  #[test]
  fn explicit_missing_path_is_an_error() {
    let err = load_config(Some(Path::new("/nonexistent/hpcrun.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }
}
