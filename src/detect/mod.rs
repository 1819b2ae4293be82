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

//! Works out how to boot an image from its directory layout.
//!
//! Each family in the [`Rules`] table is a probe over a
//! [`FilesystemReader`]; the first one that finds a complete set of boot
//! files wins.  Independently of the layout, the image's file name and
//! `.disk/info` can relabel the distro, e.g. Pop!_OS ships a plain casper
//! layout.

use anyhow::{bail, Result};
use glob::{MatchOptions, Pattern};
use log::{debug, info};
use serde::Serialize;

use crate::bootfiles::{normalize_boot_params, BootFiles, Netboot, WindowsFiles};
use crate::errors::{NotFound, UnknownLayout};
use crate::fsreader::{path_components, FilesystemReader};

pub mod rules;

pub use self::rules::{Family, Layout, NameRule, Rules};

pub const WINDOWS: &str = "windows";

const DISK_INFO: &str = "/.disk/info";

const BCD_PATHS: [&str; 2] = ["/boot/bcd", UEFI_BCD_PATH];
const UEFI_BCD_PATH: &str = "/efi/microsoft/boot/bcd";
/// Taken as evidence of the UEFI BCD when the hive itself isn't listed.
const UEFI_BOOTLOADER_PATH: &str = "/efi/boot/bootx64.efi";
const BOOT_SDI_PATH: &str = "/boot/boot.sdi";
const BOOT_WIM_PATH: &str = "/sources/boot.wim";
const INSTALL_IMAGE_PATHS: [&str; 2] = ["/sources/install.wim", "/sources/install.esd"];

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Detection {
    /// name of the matching family
    pub family: String,
    /// paths are absolute within the image
    pub files: BootFiles,
}

#[derive(Debug, Clone)]
pub struct Detector {
    rules: Rules,
}

impl Detector {
    pub fn new(rules: Rules) -> Self {
        Self { rules }
    }

    pub fn builtin() -> Result<Self> {
        Ok(Self::new(Rules::builtin()?))
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    /// Tries every family in order.  If none matches, the error is an
    /// [`UnknownLayout`] with each family's reason.
    pub fn detect(&self, fs: &mut dyn FilesystemReader) -> Result<Detection> {
        let mut attempts = Vec::new();
        for family in &self.rules.families {
            match probe(family, fs) {
                Ok(files) => {
                    info!("Detected {} layout", family.name);
                    return Ok(Detection {
                        family: family.name.clone(),
                        files,
                    });
                }
                Err(e) => {
                    debug!("{} layout rejected: {:#}", family.name, e);
                    attempts.push((family.name.clone(), format!("{:#}", e)));
                }
            }
        }
        Err(UnknownLayout { attempts }.into())
    }

    /// Relabels the distro from the image file name or `.disk/info`, and
    /// picks the netboot tarball for the resulting distro.
    pub fn refine(&self, files: &mut BootFiles, iso_name: &str, fs: &mut dyn FilesystemReader) {
        let label = match self.match_name(iso_name) {
            Some(distro) => Some(distro),
            None => match fs.read_file_content(DISK_INFO) {
                Ok(info) => self.match_name(&info),
                Err(e) => {
                    if !e.is::<NotFound>() {
                        debug!("reading {}: {:#}", DISK_INFO, e);
                    }
                    None
                }
            },
        };
        if let Some(distro) = label {
            if (distro == WINDOWS) != files.is_windows() {
                debug!("not relabeling {} image as {}", files.distro, distro);
            } else if distro != files.distro {
                info!("Distro refined from {} to {}", files.distro, distro);
                files.distro = distro.to_string();
            }
        }
        if files.netboot.required {
            if let Some(url) = self.rules.netboot_urls.get(&files.distro) {
                files.netboot.url = Some(url.clone());
            }
        }
    }

    /// First name rule whose text occurs in `text`, ignoring case.
    pub fn match_name(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.rules
            .names
            .iter()
            .find(|r| text.contains(&r.pattern.to_lowercase()))
            .map(|r| r.distro.as_str())
    }
}

fn probe(family: &Family, fs: &mut dyn FilesystemReader) -> Result<BootFiles> {
    let mut files = match &family.layout {
        Layout::Exact {
            kernel,
            initrd,
            squashfs,
        } => probe_exact(fs, kernel, initrd, squashfs.as_deref())?,
        Layout::Prefix {
            dir,
            kernel,
            initrd,
            squashfs,
            media_path_param,
        } => probe_prefix(
            fs,
            dir,
            kernel,
            initrd,
            squashfs.as_deref(),
            media_path_param.as_deref(),
        )?,
        Layout::Windows => probe_windows(fs)?,
    };
    files.distro = family.distro().to_string();
    // the probe may have added parameters of its own
    files.boot_params = normalize_boot_params(&format!(
        "{} {}",
        family.boot_params, files.boot_params
    ));
    if let Some(url) = &family.netboot_url {
        files.netboot = Netboot {
            required: true,
            url: Some(url.clone()),
            available: false,
        };
    }
    Ok(files)
}

fn probe_exact(
    fs: &mut dyn FilesystemReader,
    kernel: &str,
    initrd: &str,
    squashfs: Option<&str>,
) -> Result<BootFiles> {
    let found: Vec<Option<String>> = [kernel, initrd]
        .into_iter()
        .map(|p| if fs.file_exists(p) { on_disc_path(fs, p) } else { None })
        .collect();
    let (kernel_path, initrd_path) = match (&found[0], &found[1]) {
        (Some(k), Some(i)) => (k.clone(), i.clone()),
        _ => {
            let missing: Vec<&str> = [kernel, initrd]
                .into_iter()
                .zip(&found)
                .filter(|(_, f)| f.is_none())
                .map(|(p, _)| p)
                .collect();
            bail!("missing {}", missing.join(", "));
        }
    };
    let squashfs_path = match squashfs {
        Some(p) if fs.file_exists(p) => on_disc_path(fs, p),
        _ => None,
    };
    Ok(BootFiles {
        kernel: Some(kernel_path),
        initrd: Some(initrd_path),
        squashfs_path: squashfs_path.map(|p| p.trim_start_matches('/').to_string()),
        ..Default::default()
    })
}

/// Spells `path` the way the image does, preferring an exact component
/// match over a case-folded one.
fn on_disc_path(fs: &mut dyn FilesystemReader, path: &str) -> Option<String> {
    let mut resolved = String::new();
    for c in path_components(path) {
        let parent = if resolved.is_empty() { "/" } else { resolved.as_str() };
        let names: Vec<String> = fs
            .read_dir(parent)
            .ok()?
            .into_iter()
            .map(|e| e.name)
            .collect();
        let name = names
            .iter()
            .find(|n| *n == c)
            .or_else(|| names.iter().find(|n| n.eq_ignore_ascii_case(c)))?;
        resolved.push('/');
        resolved.push_str(name);
    }
    Some(resolved)
}

fn probe_prefix(
    fs: &mut dyn FilesystemReader,
    dir_glob: &str,
    kernel_names: &[String],
    initrd_names: &[String],
    squashfs: Option<&str>,
    media_path_param: Option<&str>,
) -> Result<BootFiles> {
    let pattern = Pattern::new(dir_glob)?;
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };
    let base = dir_glob.trim_end_matches('*');

    let mut dirs: Vec<String> = fs
        .read_dir("/")?
        .into_iter()
        .filter(|e| e.is_dir && pattern.matches_with(&e.name, options))
        .map(|e| e.name)
        .collect();
    if dirs.is_empty() {
        bail!("no directory matching {}", dir_glob);
    }
    // the plain name first, then variants in name order
    dirs.sort_by_key(|d| (!d.eq_ignore_ascii_case(base), d.to_lowercase()));

    let mut reasons = Vec::new();
    for dir in &dirs {
        let mut names: Vec<String> = match fs.read_dir(&format!("/{}", dir)) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.name)
                .collect(),
            Err(e) => {
                reasons.push(format!("{}: {:#}", dir, e));
                continue;
            }
        };
        names.sort();
        let kernel = pick(&names, kernel_names, None);
        let initrd = pick(&names, initrd_names, kernel);
        let (kernel, initrd) = match (kernel, initrd) {
            (Some(k), Some(i)) => (k, i),
            (k, _) => {
                let missing = if k.is_none() { "kernel" } else { "initrd" };
                reasons.push(format!("{}: no {}", dir, missing));
                continue;
            }
        };
        let squashfs_path = squashfs
            .and_then(|s| names.iter().find(|n| n.eq_ignore_ascii_case(s)))
            .map(|n| format!("{}/{}", dir, n));
        let boot_params = match media_path_param {
            Some(param) if !dir.eq_ignore_ascii_case(base) => format!("{}={}", param, dir),
            _ => String::new(),
        };
        return Ok(BootFiles {
            kernel: Some(format!("/{}/{}", dir, kernel)),
            initrd: Some(format!("/{}/{}", dir, initrd)),
            boot_params,
            squashfs_path,
            ..Default::default()
        });
    }
    bail!("{}", reasons.join("; "))
}

/// Picks a file by fragment: for each fragment in turn, an exact name,
/// then a name starting with it, then one containing it.
fn pick<'a>(names: &'a [String], fragments: &[String], exclude: Option<&str>) -> Option<&'a str> {
    let candidates: Vec<(&'a str, String)> = names
        .iter()
        .filter(|n| Some(n.as_str()) != exclude)
        .map(|n| (n.as_str(), n.to_lowercase()))
        .collect();
    for fragment in fragments {
        let fragment = fragment.to_lowercase();
        let found = candidates
            .iter()
            .find(|(_, lower)| *lower == fragment)
            .or_else(|| candidates.iter().find(|(_, lower)| lower.starts_with(&fragment)))
            .or_else(|| candidates.iter().find(|(_, lower)| lower.contains(&fragment)));
        if let Some((name, _)) = found {
            return Some(*name);
        }
    }
    None
}

fn probe_windows(fs: &mut dyn FilesystemReader) -> Result<BootFiles> {
    let bcd = BCD_PATHS
        .into_iter()
        .find(|p| fs.file_exists(p))
        .or_else(|| fs.file_exists(UEFI_BOOTLOADER_PATH).then_some(UEFI_BCD_PATH));
    let boot_sdi = fs.file_exists(BOOT_SDI_PATH);
    let boot_wim = fs.file_exists(BOOT_WIM_PATH);
    let mut missing = Vec::new();
    if bcd.is_none() {
        missing.push("bcd");
    }
    if !boot_sdi {
        missing.push("boot.sdi");
    }
    if !boot_wim {
        missing.push("boot.wim");
    }
    let bcd = match bcd {
        Some(bcd) if missing.is_empty() => bcd,
        _ => bail!("missing {}", missing.join(", ")),
    };
    Ok(BootFiles {
        windows: Some(WindowsFiles {
            bcd: bcd.to_string(),
            boot_sdi: BOOT_SDI_PATH.to_string(),
            boot_wim: BOOT_WIM_PATH.to_string(),
        }),
        install_wim: INSTALL_IMAGE_PATHS
            .into_iter()
            .find(|p| fs.file_exists(p))
            .map(String::from),
        ..Default::default()
    })
}
