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
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Value of a scheduler resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
  Int(i64),
  Str(String),
}

impl fmt::Display for ResourceValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResourceValue::Int(n) => write!(f, "{n}"),
      ResourceValue::Str(s) => write!(f, "{s}"),
    }
  }
}

impl From<i64> for ResourceValue {
  fn from(n: i64) -> Self {
    ResourceValue::Int(n)
  }
}

impl From<&str> for ResourceValue {
  fn from(s: &str) -> Self {
    ResourceValue::Str(s.to_string())
  }
}

/// A named scheduler resource request.
///
/// Examples: `Resource::new("gpu", 2)`, `Resource::new("xilinx", 1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
  pub name: String,
  pub value: ResourceValue,
}

impl Resource {
  pub fn new(name: impl Into<String>, value: impl Into<ResourceValue>) -> Self {
    Resource {
      name: name.into(),
      value: value.into(),
    }
  }
}

/// Ordered collection of resources for a job.
///
/// Duplicate names are allowed; `get` returns the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
  resources: Vec<Resource>,
}

impl ResourceSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, name: impl Into<String>, value: impl Into<ResourceValue>) -> &mut Self {
    self.resources.push(Resource::new(name, value));
    self
  }

  pub fn get(&self, name: &str) -> Option<&Resource> {
    self.resources.iter().find(|r| r.name == name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Resource> {
    self.resources.iter()
  }

  pub fn len(&self) -> usize {
    self.resources.len()
  }

  pub fn is_empty(&self) -> bool {
    self.resources.is_empty()
  }
}

impl<'a> IntoIterator for &'a ResourceSet {
  type Item = &'a Resource;
  type IntoIter = std::slice::Iter<'a, Resource>;

  fn into_iter(self) -> Self::IntoIter {
    self.resources.iter()
  }
}
