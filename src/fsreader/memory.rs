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

//! In-memory volume for exercising probes and extraction without building
//! disc images.

use anyhow::{bail, Result};
use std::io::Read;

use super::{DirEntry, Volume};

#[derive(Debug)]
struct Node {
    name: String,
    // None for directories
    data: Option<Vec<u8>>,
    size: u64,
    children: Vec<usize>,
}

#[derive(Debug)]
pub struct MemoryVolume {
    nodes: Vec<Node>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                data: None,
                size: 0,
                children: Vec::new(),
            }],
        }
    }

    /// Adds a file, creating parent directories as needed.  Existing
    /// directories are matched case-insensitively.
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> &mut Self {
        let (parent, name) = self.parent_of(path);
        self.push(parent, name, Some(data.to_vec()));
        self
    }

    pub fn add_dir(&mut self, path: &str) -> &mut Self {
        let (parent, name) = self.parent_of(path);
        self.dir(parent, &name);
        self
    }

    /// Drops the tail of a file's data while keeping its recorded size, so
    /// that reading it comes up short.
    pub fn truncate_data(&mut self, path: &str, len: usize) {
        let idx = self
            .lookup(path)
            .unwrap_or_else(|| panic!("no such file {}", path));
        if let Some(data) = self.nodes[idx].data.as_mut() {
            data.truncate(len);
        }
    }

    fn lookup(&self, path: &str) -> Option<usize> {
        let mut idx = 0;
        for c in path.split('/').filter(|c| !c.is_empty()) {
            idx = *self.nodes[idx]
                .children
                .iter()
                .find(|i| self.nodes[**i].name.eq_ignore_ascii_case(c))?;
        }
        Some(idx)
    }

    fn parent_of(&mut self, path: &str) -> (usize, String) {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let name = components.pop().expect("empty path").to_string();
        let mut idx = 0;
        for c in components {
            idx = self.dir(idx, c);
        }
        (idx, name)
    }

    fn dir(&mut self, parent: usize, name: &str) -> usize {
        let existing = self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|i| self.nodes[*i].data.is_none() && self.nodes[*i].name.eq_ignore_ascii_case(name));
        match existing {
            Some(i) => i,
            None => self.push(parent, name.to_string(), None),
        }
    }

    fn push(&mut self, parent: usize, name: String, data: Option<Vec<u8>>) -> usize {
        let size = data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        self.nodes.push(Node {
            name,
            data,
            size,
            children: Vec::new(),
        });
        let idx = self.nodes.len() - 1;
        self.nodes[parent].children.push(idx);
        idx
    }
}

impl Volume for MemoryVolume {
    type Node = usize;
    const FORMAT: &'static str = "memory";

    fn root(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn entry(&self, node: &usize) -> DirEntry {
        let n = &self.nodes[*node];
        DirEntry {
            name: n.name.clone(),
            size: n.size,
            is_dir: n.data.is_none(),
            modified: None,
        }
    }

    fn children(&mut self, dir: &usize) -> Result<Vec<usize>> {
        Ok(self.nodes[*dir].children.clone())
    }

    fn open(&mut self, file: &usize) -> Result<Box<dyn Read + '_>> {
        match &self.nodes[*file].data {
            Some(data) => Ok(Box::new(&data[..])),
            None => bail!("{} is a directory", self.nodes[*file].name),
        }
    }

    fn node_key(&self, node: &usize) -> Option<u64> {
        Some(*node as u64)
    }
}
