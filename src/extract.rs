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

//! Copies an image's boot files into a per-image cache directory.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::bootfiles::{BootFiles, Metadata, Netboot, WindowsFiles, METADATA_FILE};
use crate::detect::Detector;
use crate::fsreader::{sanitize_filename, FilesystemReader};
use crate::iso9660::IsoFs;
use crate::udf::UdfFs;

/// Directory holding the mirrored image tree within a cache entry.
pub const TREE_DIR: &str = "iso";

const KERNEL_FILE: &str = "vmlinuz";
const INITRD_FILE: &str = "initrd";
const BCD_FILE: &str = "bcd";
const BOOT_SDI_FILE: &str = "boot.sdi";
const BOOT_WIM_FILE: &str = "boot.wim";

#[derive(Debug)]
pub struct Extractor {
    cache_dir: PathBuf,
    detector: Detector,
    extract_tree: bool,
}

impl Extractor {
    pub fn new(cache_dir: impl Into<PathBuf>, detector: Detector) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            detector,
            extract_tree: true,
        }
    }

    /// Whether non-Windows images are also mirrored into `iso/`.
    pub fn extract_tree(mut self, enabled: bool) -> Self {
        self.extract_tree = enabled;
        self
    }

    /// Detects the image's layout and copies its boot files into
    /// `<cache-dir>/<name>/`, where `<name>` is the image's file name
    /// without extension.  Returned paths are relative to the cache
    /// directory.
    pub fn extract(&self, iso_path: &Path) -> Result<BootFiles> {
        let file_name = iso_file_name(iso_path)?;
        let mut image = open_image(iso_path)?;
        self.extract_from(image.as_mut(), &file_name)
            .with_context(|| format!("extracting {}", iso_path.display()))
    }

    /// Like [`extract`](Self::extract) for an already opened image.
    /// `iso_name` is the image's file name.
    pub fn extract_from(
        &self,
        image: &mut dyn FilesystemReader,
        iso_name: &str,
    ) -> Result<BootFiles> {
        let detection = self.detector.detect(image)?;
        let mut files = detection.files;
        self.detector
            .refine(&mut files, &iso_name.to_lowercase(), image);

        let name = cache_name(iso_name)?;
        let dir = self.cache_dir.join(&name);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut metadata = Metadata::from_boot_files(&files);
        if let Some(windows) = &files.windows {
            copy_artifact(image, &windows.bcd, &dir, BCD_FILE)?;
            copy_artifact(image, &windows.boot_sdi, &dir, BOOT_SDI_FILE)?;
            copy_artifact(image, &windows.boot_wim, &dir, BOOT_WIM_FILE)?;
            metadata.install = None;
            if let Some(install) = &files.install_wim {
                let dest = install_file_name(install);
                match copy_artifact(image, install, &dir, &dest) {
                    Ok(()) => metadata.install = Some(dest),
                    Err(e) => warn!("skipping install image: {:#}", e),
                }
            }
        } else {
            let (kernel, initrd) = match (&files.kernel, &files.initrd) {
                (Some(kernel), Some(initrd)) => (kernel, initrd),
                _ => bail!("{} layout found no kernel and initrd", detection.family),
            };
            copy_artifact(image, kernel, &dir, KERNEL_FILE)?;
            copy_artifact(image, initrd, &dir, INITRD_FILE)?;
            if self.extract_tree {
                extract_tree(image, &dir.join(TREE_DIR))?;
            }
        }

        let path = dir.join(METADATA_FILE);
        fs::write(&path, metadata.to_text()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Extracted {} boot files to {}", metadata.distro, dir.display());
        Ok(self.entry_files(&name, &metadata))
    }

    /// Reconstructs the result of an earlier extraction from the cache
    /// alone.  Returns `None` if `name` was never extracted.
    pub fn cached(&self, name: &str) -> Result<Option<BootFiles>> {
        let path = self.cache_dir.join(name).join(METADATA_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let metadata: Metadata = text
            .parse()
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(self.entry_files(name, &metadata)))
    }

    /// Names of all cache entries, sorted.
    pub fn cached_images(&self) -> Result<Vec<String>> {
        if !self.cache_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.cache_dir).min_depth(1).max_depth(1) {
            let entry = entry
                .with_context(|| format!("listing {}", self.cache_dir.display()))?;
            if !entry.file_type().is_dir() || !entry.path().join(METADATA_FILE).is_file() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => names.push(name.to_string()),
                None => debug!("ignoring non-UTF-8 entry {}", entry.path().display()),
            }
        }
        names.sort();
        Ok(names)
    }

    fn entry_files(&self, name: &str, metadata: &Metadata) -> BootFiles {
        let dir = self.cache_dir.join(name);
        let rel = |file: &str| format!("{}/{}", name, file);
        let netboot = Netboot {
            required: metadata.netboot_required,
            url: metadata.netboot_url.clone(),
            available: false,
        };
        if metadata.windows {
            return BootFiles {
                distro: metadata.distro.clone(),
                boot_params: metadata.boot_params.clone(),
                windows: Some(WindowsFiles {
                    bcd: rel(BCD_FILE),
                    boot_sdi: rel(BOOT_SDI_FILE),
                    boot_wim: rel(BOOT_WIM_FILE),
                }),
                install_wim: metadata.install.as_deref().map(rel),
                netboot,
                ..Default::default()
            };
        }
        let tree = dir.join(TREE_DIR);
        let has_tree = tree.is_dir();
        BootFiles {
            distro: metadata.distro.clone(),
            kernel: Some(rel(KERNEL_FILE)),
            initrd: Some(rel(INITRD_FILE)),
            boot_params: metadata.boot_params.clone(),
            squashfs_path: metadata
                .squashfs
                .as_ref()
                .filter(|s| has_tree && tree.join(s).is_file())
                .map(|s| format!("{}/{}/{}", name, TREE_DIR, s)),
            extracted_dir: has_tree.then(|| rel(TREE_DIR)),
            netboot,
            ..Default::default()
        }
    }
}

/// Opens an image as UDF, falling back to ISO 9660.
pub fn open_image(path: &Path) -> Result<Box<dyn FilesystemReader>> {
    let open = || File::open(path).with_context(|| format!("opening {}", path.display()));
    let udf_err = match UdfFs::new(open()?) {
        Ok(udf) => {
            debug!("{}: UDF volume {:?}", path.display(), udf.volume_id());
            return Ok(Box::new(udf));
        }
        Err(e) => e,
    };
    debug!("{}: {:#}", path.display(), udf_err);
    match IsoFs::new(open()?) {
        Ok(iso) => {
            debug!("{}: ISO 9660 volume {:?}", path.display(), iso.volume_id());
            Ok(Box::new(iso))
        }
        Err(iso_err) => bail!(
            "couldn't read {} as UDF ({:#}) or as ISO 9660 ({:#})",
            path.display(),
            udf_err,
            iso_err
        ),
    }
}

fn iso_file_name(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned())
}

/// Cache entry name for an image file name.
pub fn cache_name(iso_name: &str) -> Result<String> {
    let stem = Path::new(iso_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_filename(&stem)
        .with_context(|| format!("no usable cache name for {:?}", iso_name))
}

fn install_file_name(iso_path: &str) -> String {
    match iso_path.rsplit_once('.') {
        Some((_, ext)) if ext.eq_ignore_ascii_case("esd") => "install.esd".into(),
        _ => "install.wim".into(),
    }
}

/// Copies one file out of the image.  The data lands in a temporary file
/// first, so `dest` is either complete or untouched.
fn copy_artifact(
    image: &mut dyn FilesystemReader,
    iso_path: &str,
    dir: &Path,
    dest: &str,
) -> Result<()> {
    let tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".partial")
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    let n = image.extract_file(iso_path, tmp.path())?;
    let path = dir.join(dest);
    tmp.persist(&path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    info!("Copied {} ({} bytes) to {}", iso_path, n, path.display());
    Ok(())
}

fn extract_tree(image: &mut dyn FilesystemReader, tree: &Path) -> Result<()> {
    if tree.exists() {
        fs::remove_dir_all(tree).with_context(|| format!("removing {}", tree.display()))?;
    }
    let summary = image.extract_all(tree)?;
    info!(
        "Mirrored {} files and {} directories ({} bytes) to {}",
        summary.files,
        summary.directories,
        summary.bytes,
        tree.display()
    );
    if !summary.skipped.is_empty() {
        warn!(
            "{} entries couldn't be mirrored to {}",
            summary.skipped.len(),
            tree.display()
        );
    }
    Ok(())
}
