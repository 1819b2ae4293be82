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

//! The result of detection and extraction, and its `metadata.txt` form in
//! the cache.
//!
//! Paths in a [`BootFiles`] returned by the detector are absolute paths
//! inside the image.  After extraction they are relative to the cache
//! directory, e.g. `ubuntu-22.04/vmlinuz`.

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr};
use std::fmt::Write;
use std::str::FromStr;
use url::Url;

pub const METADATA_FILE: &str = "metadata.txt";

const BOOT_METHOD_WINDOWS: &str = "windows";
const BOOT_METHOD_KERNEL: &str = "kernel";

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BootFiles {
    pub distro: String,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    /// Empty, or a kernel command line fragment ending in a space.
    pub boot_params: String,
    /// Image-relative after detection, e.g. `casper/filesystem.squashfs`.
    /// After extraction it points into `extracted_dir`, and is unset if
    /// the tree wasn't mirrored.
    pub squashfs_path: Option<String>,
    pub windows: Option<WindowsFiles>,
    pub install_wim: Option<String>,
    pub extracted_dir: Option<String>,
    pub netboot: Netboot,
}

impl BootFiles {
    pub fn is_windows(&self) -> bool {
        self.windows.is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct WindowsFiles {
    pub bcd: String,
    pub boot_sdi: String,
    pub boot_wim: String,
}

/// Whether booting needs an installer tarball from upstream.  `available`
/// is owned by whoever downloads it; extraction always reports false.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Netboot {
    pub required: bool,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub url: Option<Url>,
    pub available: bool,
}

/// Contents of `metadata.txt`: one `key=value` per line.  Everything else
/// about a cache entry is implied by which files exist.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub distro: String,
    pub boot_params: String,
    /// booted through wimboot rather than a kernel and initrd; written as
    /// `boot_method=windows`
    pub windows: bool,
    pub squashfs: Option<String>,
    /// file name of the install image within the cache entry
    pub install: Option<String>,
    pub netboot_required: bool,
    pub netboot_url: Option<Url>,
}

impl Metadata {
    pub fn from_boot_files(files: &BootFiles) -> Self {
        Self {
            distro: files.distro.clone(),
            boot_params: files.boot_params.clone(),
            windows: files.is_windows(),
            squashfs: files.squashfs_path.clone(),
            install: files
                .install_wim
                .as_ref()
                .map(|p| p.rsplit('/').next().unwrap_or(p).to_string()),
            netboot_required: files.netboot.required,
            netboot_url: files.netboot.url.clone(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        let mut out = String::new();
        let mut put = |key: &str, value: &str| -> Result<()> {
            if value.contains('\n') || value.contains('\r') {
                bail!("metadata value for {} contains a line break", key);
            }
            writeln!(out, "{}={}", key, value).context("formatting metadata")
        };
        put("distro", &self.distro)?;
        put("boot_params", &self.boot_params)?;
        if self.windows {
            put("boot_method", BOOT_METHOD_WINDOWS)?;
        }
        if let Some(squashfs) = &self.squashfs {
            put("squashfs", squashfs)?;
        }
        if let Some(install) = &self.install {
            put("install", install)?;
        }
        if self.netboot_required {
            put("netboot_required", "true")?;
        }
        if let Some(url) = &self.netboot_url {
            put("netboot_url", url.as_str())?;
        }
        Ok(out)
    }
}

impl FromStr for Metadata {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut ret = Self::default();
        let mut have_distro = false;
        for (i, line) in s.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => bail!("line {}: expected key=value, found {:?}", i + 1, line),
            };
            match key {
                "distro" => {
                    ret.distro = value.to_string();
                    have_distro = true;
                }
                // values keep their trailing space
                "boot_params" => ret.boot_params = value.to_string(),
                "boot_method" => {
                    ret.windows = match value {
                        BOOT_METHOD_WINDOWS => true,
                        BOOT_METHOD_KERNEL => false,
                        _ => bail!("line {}: unknown boot_method {:?}", i + 1, value),
                    }
                }
                "squashfs" => ret.squashfs = Some(value.to_string()),
                "install" => ret.install = Some(value.to_string()),
                "netboot_required" => {
                    ret.netboot_required = value
                        .parse()
                        .with_context(|| format!("line {}: parsing netboot_required", i + 1))?
                }
                "netboot_url" => {
                    ret.netboot_url = Some(
                        Url::parse(value)
                            .with_context(|| format!("line {}: parsing netboot_url", i + 1))?,
                    )
                }
                _ => debug!("ignoring unknown metadata key {}", key),
            }
        }
        if !have_distro {
            bail!("no distro in metadata");
        }
        Ok(ret)
    }
}

/// Normalizes boot params to be empty or end in exactly one space.
pub fn normalize_boot_params(params: &str) -> String {
    let trimmed = params.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{} ", trimmed)
    }
}
