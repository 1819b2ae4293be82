// Copyright 2023 Red Hat, Inc.
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

//! The probe table as data: boot layout families, name refinement rules
//! and netboot tarball URLs, loaded from YAML.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr};
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use url::Url;

const BUILTIN: &str = include_str!("builtin.yaml");

#[serde_as]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Rules {
    pub families: Vec<Family>,
    pub names: Vec<NameRule>,
    #[serde_as(as = "BTreeMap<_, DisplayFromStr>")]
    pub netboot_urls: BTreeMap<String, Url>,
}

#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Family {
    pub name: String,
    /// defaults to the family name
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub boot_params: String,
    /// Set for layouts that can only be booted with an upstream installer
    /// tarball.
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub netboot_url: Option<Url>,
    pub layout: Layout,
}

impl Family {
    pub fn distro(&self) -> &str {
        self.distro.as_deref().unwrap_or(&self.name)
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Layout {
    Exact {
        kernel: String,
        initrd: String,
        #[serde(default)]
        squashfs: Option<String>,
    },
    Prefix {
        /// case-insensitive glob matched against root directory names
        dir: String,
        kernel: Vec<String>,
        initrd: Vec<String>,
        #[serde(default)]
        squashfs: Option<String>,
        /// kernel parameter naming the directory when it isn't the
        /// pattern's base name
        #[serde(default, rename = "media-path-param")]
        media_path_param: Option<String>,
    },
    Windows,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NameRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub distro: String,
}

impl Rules {
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN).context("parsing built-in rules")
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_str(yaml)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_reader(
            OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("opening rules file {path}"))?,
        )
        .with_context(|| format!("parsing rules file {path}"))?;
        rules
            .validate()
            .with_context(|| format!("checking rules file {path}"))?;
        Ok(rules)
    }

    /// The built-in rules preceded by the given rules files.  Earlier files
    /// take precedence.
    pub fn load(paths: &[String]) -> Result<Self> {
        let mut rules = Self::default();
        for path in paths {
            rules = rules.then(Self::from_file(path)?)?;
        }
        rules.then(Self::builtin()?)
    }

    /// Appends `other`: its families and names are tried after ours, and
    /// our netboot URLs win.
    pub fn then(mut self, other: Self) -> Result<Self> {
        // a family can be overridden by name
        let ours: HashSet<String> = self.families.iter().map(|f| f.name.clone()).collect();
        self.families.extend(
            other
                .families
                .into_iter()
                .filter(|f| !ours.contains(&f.name)),
        );
        self.names.extend(other.names);
        for (distro, url) in other.netboot_urls {
            self.netboot_urls.entry(distro).or_insert(url);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for family in &self.families {
            if !seen.insert(family.name.as_str()) {
                bail!("duplicate family {}", family.name);
            }
            if let Layout::Prefix {
                dir, kernel, initrd, ..
            } = &family.layout
            {
                glob::Pattern::new(dir)
                    .with_context(|| format!("family {}: bad directory pattern", family.name))?;
                if kernel.is_empty() || initrd.is_empty() {
                    bail!("family {}: no kernel or initrd names", family.name);
                }
            }
        }
        for rule in &self.names {
            if rule.pattern.is_empty() {
                bail!("empty name match for distro {}", rule.distro);
            }
        }
        Ok(())
    }
}
