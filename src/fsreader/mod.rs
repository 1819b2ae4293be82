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

//! The capability shared by every container format: look up paths, read
//! small files, and copy files or whole trees out of an image.
//!
//! A format only has to implement [`Volume`]; path resolution and
//! extraction are provided for all volumes through [`FilesystemReader`].

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::NotFound;
use crate::io::{copy_exactly_n, BUFFER_SIZE};

#[cfg(test)]
pub mod memory;

/// Text probes like `.disk/info` are tiny; don't slurp anything large.
const MAX_CONTENT_SIZE: u64 = 1024 * 1024;

/// Guards against directory loops in malformed images.
const MAX_DEPTH: usize = 64;

/// Recording time of a directory entry, as stored on disc.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<Timestamp>,
}

/// Counts from a full-tree extraction.  Entries in `skipped` were logged
/// and left out; they don't fail the extraction.
#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub skipped: Vec<String>,
}

/// A container format's view of its directory tree.
pub trait Volume {
    /// Handle to a file or directory.
    type Node: Clone;

    /// Short format name, e.g. "udf".
    const FORMAT: &'static str;

    /// Volume identifier recorded in the descriptors.
    fn label(&self) -> &str {
        ""
    }

    fn root(&mut self) -> Result<Self::Node>;

    fn entry(&self, node: &Self::Node) -> DirEntry;

    fn children(&mut self, dir: &Self::Node) -> Result<Vec<Self::Node>>;

    /// Returns a reader producing exactly the file's content.
    fn open(&mut self, file: &Self::Node) -> Result<Box<dyn Read + '_>>;

    /// A stable identity for directories, used to detect loops.
    fn node_key(&self, _node: &Self::Node) -> Option<u64> {
        None
    }
}

/// Format-independent read access to an image.  Paths are `/`-separated
/// and matched case-insensitively one component at a time.
pub trait FilesystemReader {
    fn format(&self) -> &'static str;

    fn volume_id(&self) -> String;

    fn stat(&mut self, path: &str) -> Result<DirEntry>;

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>>;

    fn file_exists(&mut self, path: &str) -> bool;

    /// Reads a small text file, replacing invalid UTF-8.
    fn read_file_content(&mut self, path: &str) -> Result<String>;

    /// Streams one file to `dest_path`, returning the number of bytes.
    fn extract_file(&mut self, iso_path: &str, dest_path: &Path) -> Result<u64>;

    /// Recursively copies the whole tree below `dest_dir`, continuing past
    /// entries that can't be read or written.
    fn extract_all(&mut self, dest_dir: &Path) -> Result<ExtractSummary>;

    /// Lists every path in the image, depth first.
    fn walk(&mut self) -> Result<Vec<(String, DirEntry)>>;
}

impl<V: Volume> FilesystemReader for V {
    fn format(&self) -> &'static str {
        V::FORMAT
    }

    fn volume_id(&self) -> String {
        self.label().to_string()
    }

    fn stat(&mut self, path: &str) -> Result<DirEntry> {
        let node = resolve(self, path)?;
        Ok(self.entry(&node))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let node = resolve(self, path)?;
        if !self.entry(&node).is_dir {
            bail!("{} is not a directory", path);
        }
        let children = self
            .children(&node)
            .with_context(|| format!("listing directory {}", path))?;
        Ok(children.iter().map(|c| self.entry(c)).collect())
    }

    fn file_exists(&mut self, path: &str) -> bool {
        match self.stat(path) {
            Ok(entry) => !entry.is_dir,
            Err(e) => {
                if !e.is::<NotFound>() {
                    debug!("looking up {}: {:#}", path, e);
                }
                false
            }
        }
    }

    fn read_file_content(&mut self, path: &str) -> Result<String> {
        let node = resolve_file(self, path)?;
        let mut data = Vec::new();
        self.open(&node)?
            .take(MAX_CONTENT_SIZE)
            .read_to_end(&mut data)
            .with_context(|| format!("reading {}", path))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn extract_file(&mut self, iso_path: &str, dest_path: &Path) -> Result<u64> {
        let node = resolve_file(self, iso_path)?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        copy_node(self, &node, dest_path, &mut buf)
            .with_context(|| format!("extracting {} to {}", iso_path, dest_path.display()))
    }

    fn extract_all(&mut self, dest_dir: &Path) -> Result<ExtractSummary> {
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut summary = ExtractSummary::default();
        let mut seen = HashSet::new();
        let root = self.root()?;
        if let Some(key) = self.node_key(&root) {
            seen.insert(key);
        }
        let mut pending: Vec<(V::Node, PathBuf, String, usize)> =
            vec![(root, dest_dir.to_path_buf(), String::new(), 0)];

        while let Some((dir, out_dir, iso_dir, depth)) = pending.pop() {
            let children = match self.children(&dir) {
                Ok(c) => c,
                Err(e) => {
                    let shown = if iso_dir.is_empty() { "/" } else { iso_dir.as_str() };
                    warn!("skipping directory {}: {:#}", shown, e);
                    summary.skipped.push(shown.to_string());
                    continue;
                }
            };
            for child in children {
                let entry = self.entry(&child);
                let iso_path = format!("{}/{}", iso_dir, entry.name);
                let name = match sanitize_filename(&entry.name) {
                    Some(n) => n,
                    None => {
                        warn!("skipping {:?}: no usable filename", iso_path);
                        summary.skipped.push(iso_path);
                        continue;
                    }
                };
                if name != entry.name {
                    warn!("renaming {:?} to {:?}", iso_path, name);
                }
                let target = out_dir.join(&name);
                if entry.is_dir {
                    if depth + 1 >= MAX_DEPTH {
                        warn!("skipping {:?}: directory nesting too deep", iso_path);
                        summary.skipped.push(iso_path);
                        continue;
                    }
                    if let Some(key) = self.node_key(&child) {
                        if !seen.insert(key) {
                            warn!("skipping {:?}: directory loop", iso_path);
                            summary.skipped.push(iso_path);
                            continue;
                        }
                    }
                    if let Err(e) = fs::create_dir_all(&target) {
                        warn!("skipping {:?}: creating {}: {}", iso_path, target.display(), e);
                        summary.skipped.push(iso_path);
                        continue;
                    }
                    summary.directories += 1;
                    pending.push((child, target, iso_path, depth + 1));
                } else {
                    match copy_node(self, &child, &target, &mut buf) {
                        Ok(n) => {
                            summary.files += 1;
                            summary.bytes += n;
                        }
                        Err(e) => {
                            warn!("skipping {:?}: {:#}", iso_path, e);
                            summary.skipped.push(iso_path);
                        }
                    }
                }
            }
        }
        Ok(summary)
    }

    fn walk(&mut self) -> Result<Vec<(String, DirEntry)>> {
        let mut ret = Vec::new();
        let mut seen = HashSet::new();
        let root = self.root()?;
        let mut pending = vec![(root, String::new(), 0)];
        while let Some((dir, dir_path, depth)) = pending.pop() {
            let children = self
                .children(&dir)
                .with_context(|| format!("listing directory /{}", dir_path))?;
            for child in children {
                let entry = self.entry(&child);
                let path = format!("{}/{}", dir_path, entry.name);
                if entry.is_dir && depth + 1 < MAX_DEPTH {
                    let fresh = match self.node_key(&child) {
                        Some(key) => seen.insert(key),
                        None => true,
                    };
                    if fresh {
                        pending.push((child, path.clone(), depth + 1));
                    }
                }
                ret.push((path, entry));
            }
        }
        ret.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ret)
    }
}

/// Returns the node for `path`, matching each component case-insensitively
/// against its directory's children.
fn resolve<V: Volume + ?Sized>(vol: &mut V, path: &str) -> Result<V::Node> {
    let components = path_components(path);
    let mut node = vol.root()?;
    for (i, c) in components.iter().enumerate() {
        if !vol.entry(&node).is_dir {
            bail!(NotFound(format!(
                "component {:?} in path {} is not a directory",
                components[i - 1],
                path
            )));
        }
        let children = vol
            .children(&node)
            .with_context(|| format!("listing directory /{}", components[..i].join("/")))?;
        node = find_child(vol, children, c).ok_or_else(|| {
            anyhow!(NotFound(format!(
                "no record for {} in directory /{}",
                c,
                components[..i].join("/")
            )))
        })?;
    }
    Ok(node)
}

fn resolve_file<V: Volume + ?Sized>(vol: &mut V, path: &str) -> Result<V::Node> {
    let node = resolve(vol, path)?;
    if vol.entry(&node).is_dir {
        bail!("entry {} is a directory", path);
    }
    Ok(node)
}

/// Exact match wins over a case-insensitive one.
fn find_child<V: Volume + ?Sized>(vol: &V, children: Vec<V::Node>, name: &str) -> Option<V::Node> {
    let lower = name.to_lowercase();
    let mut folded = None;
    for child in children {
        let entry = vol.entry(&child);
        if entry.name == name {
            return Some(child);
        }
        if folded.is_none() && entry.name.to_lowercase() == lower {
            folded = Some(child);
        }
    }
    folded
}

fn copy_node<V: Volume + ?Sized>(
    vol: &mut V,
    node: &V::Node,
    dest_path: &Path,
    buf: &mut [u8],
) -> Result<u64> {
    let size = vol.entry(node).size;
    let mut outf = File::create(dest_path)
        .with_context(|| format!("creating {}", dest_path.display()))?;
    let result = (|| -> Result<u64> {
        let mut bufw = BufWriter::with_capacity(BUFFER_SIZE, &mut outf);
        let n = copy_exactly_n(&mut vol.open(node)?, &mut bufw, size, buf)?;
        bufw.flush().context("flushing buffer")?;
        Ok(n)
    })();
    if result.is_err() {
        drop(outf);
        // don't leave a truncated copy behind
        if let Err(e) = fs::remove_file(dest_path) {
            debug!("removing {}: {}", dest_path.display(), e);
        }
    }
    result
}

/// Makes an on-disc name safe to create on the host.  Returns `None` if
/// nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    const FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];
    let clean: String = name
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();
    match clean.as_str() {
        "" | "." | ".." => None,
        _ => Some(clean),
    }
}

/// Parse path into a Vec<&str> with zero or more components.  Convert path
/// to relative and resolve all "." and ".." components.
pub fn path_components(s: &str) -> Vec<&str> {
    // empty paths are treated the same as "/" to allow round-tripping
    let mut ret = Vec::new();
    for c in s.split('/') {
        match c {
            "" | "." => (),
            ".." => {
                ret.pop();
            }
            c => ret.push(c),
        }
    }
    ret
}
