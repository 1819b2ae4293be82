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

//! Builds small ISO 9660 images in memory for tests, optionally with a
//! Joliet tree or Rock Ridge names.  There are no path tables; the parser
//! doesn't use them.

use std::collections::BTreeMap;

use crate::io::SECTOR_SIZE;

const FIRST_DATA_SECTOR: u32 = 20;

#[derive(Clone)]
enum Node {
    Dir(BTreeMap<String, Node>),
    /// data and the size of each extent but the last
    File(Vec<u8>, Option<usize>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tree {
    Primary,
    Joliet,
}

pub struct IsoBuilder {
    volume_id: String,
    joliet: bool,
    rock_ridge: bool,
    root: BTreeMap<String, Node>,
}

impl IsoBuilder {
    pub fn new(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            joliet: false,
            rock_ridge: false,
            root: BTreeMap::new(),
        }
    }

    pub fn joliet(mut self) -> Self {
        self.joliet = true;
        self
    }

    pub fn rock_ridge(mut self) -> Self {
        self.rock_ridge = true;
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.add(path, Node::File(data.to_vec(), None))
    }

    /// Records the file as several directory records of `chunk` bytes
    /// each, the way files over 4 GiB are stored.
    pub fn multi_extent_file(self, path: &str, data: &[u8], chunk: usize) -> Self {
        self.add(path, Node::File(data.to_vec(), Some(chunk)))
    }

    pub fn dir(self, path: &str) -> Self {
        self.add(path, Node::Dir(BTreeMap::new()))
    }

    fn add(mut self, path: &str, node: Node) -> Self {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let name = components.pop().expect("empty path");
        let mut dir = &mut self.root;
        for c in components {
            let child = dir
                .entry(c.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match child {
                Node::Dir(d) => d,
                Node::File(..) => panic!("{} is a file", c),
            };
        }
        dir.insert(name.to_string(), node);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = Image {
            data: vec![0; FIRST_DATA_SECTOR as usize * SECTOR_SIZE],
            next: FIRST_DATA_SECTOR,
            rock_ridge: self.rock_ridge,
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        };
        image.place_files(&self.root, "");
        let mut trees = vec![Tree::Primary];
        if self.joliet {
            trees.push(Tree::Joliet);
        }
        for tree in &trees {
            image.place_dirs(&self.root, "", *tree);
        }
        for tree in &trees {
            image.write_dir(&self.root, "", "", *tree);
        }
        let total = image.next;
        image.data.resize(total as usize * SECTOR_SIZE, 0);

        let mut sector = 16;
        for tree in &trees {
            let mut vd = vec![0u8; SECTOR_SIZE];
            vd[0] = if *tree == Tree::Primary { 1 } else { 2 };
            vd[1..6].copy_from_slice(b"CD001");
            vd[6] = 1;
            pad_str(&mut vd[8..40], "LINUX");
            pad_str(&mut vd[40..72], &self.volume_id);
            both_u32(&mut vd[80..88], total);
            if *tree == Tree::Joliet {
                vd[88..91].copy_from_slice(b"%/E");
            }
            vd[128..130].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
            vd[130..132].copy_from_slice(&(SECTOR_SIZE as u16).to_be_bytes());
            let (start, len) = image.dirs[&("".to_string(), *tree)];
            let root = record(&[0], start, len, true, &[]);
            vd[156..156 + root.len()].copy_from_slice(&root);
            image.put(sector, &vd);
            sector += 1;
        }
        let mut terminator = vec![0u8; SECTOR_SIZE];
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(b"CD001");
        terminator[6] = 1;
        image.put(sector, &terminator);

        image.data
    }
}

struct Image {
    data: Vec<u8>,
    next: u32,
    rock_ridge: bool,
    /// path -> extents
    files: BTreeMap<String, Vec<(u32, u32)>>,
    /// (path, tree) -> (sector, length)
    dirs: BTreeMap<(String, Tree), (u32, u32)>,
}

impl PartialOrd for Tree {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tree {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl Image {
    fn put(&mut self, sector: u32, buf: &[u8]) {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
    }

    fn allocate(&mut self, len: usize) -> u32 {
        let sector = self.next;
        self.next += ((len + SECTOR_SIZE - 1) / SECTOR_SIZE).max(1) as u32;
        sector
    }

    fn place_files(&mut self, children: &BTreeMap<String, Node>, path: &str) {
        for (name, node) in children {
            let child_path = format!("{}/{}", path, name);
            match node {
                Node::Dir(d) => self.place_files(d, &child_path),
                Node::File(data, chunk) => {
                    let chunk = chunk.unwrap_or(data.len()).max(1);
                    let mut extents = Vec::new();
                    for part in data.chunks(chunk) {
                        let sector = self.allocate(part.len());
                        self.put(sector, part);
                        extents.push((sector, part.len() as u32));
                    }
                    if extents.is_empty() {
                        extents.push((self.allocate(0), 0));
                    }
                    self.files.insert(child_path, extents);
                }
            }
        }
    }

    fn place_dirs(&mut self, children: &BTreeMap<String, Node>, path: &str, tree: Tree) {
        let len = self.dir_data(children, path, path, tree).len();
        let sector = self.allocate(len);
        self.dirs
            .insert((path.to_string(), tree), (sector, len as u32));
        for (name, node) in children {
            if let Node::Dir(d) = node {
                self.place_dirs(d, &format!("{}/{}", path, name), tree);
            }
        }
    }

    fn write_dir(&mut self, children: &BTreeMap<String, Node>, path: &str, parent: &str, tree: Tree) {
        let data = self.dir_data(children, path, parent, tree);
        let (sector, _) = self.dirs[&(path.to_string(), tree)];
        self.put(sector, &data);
        for (name, node) in children {
            if let Node::Dir(d) = node {
                self.write_dir(d, &format!("{}/{}", path, name), path, tree);
            }
        }
    }

    /// Directory records, padded so none crosses a sector boundary.
    /// Locations are zero until the directories have been placed.
    fn dir_data(
        &self,
        children: &BTreeMap<String, Node>,
        path: &str,
        parent: &str,
        tree: Tree,
    ) -> Vec<u8> {
        let lookup = |p: &str| {
            self.dirs
                .get(&(p.to_string(), tree))
                .copied()
                .unwrap_or((0, 0))
        };
        let (self_sector, self_len) = lookup(path);
        let (parent_sector, parent_len) = lookup(parent);
        let rock_ridge = self.rock_ridge && tree == Tree::Primary;
        let dot_su: &[u8] = if rock_ridge && path.is_empty() {
            b"SP\x07\x01\xbe\xef\x00"
        } else {
            &[]
        };
        let mut records = vec![
            record(&[0], self_sector, self_len, true, dot_su),
            record(&[1], parent_sector, parent_len, true, &[]),
        ];

        let mut named: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (name, node) in children {
            let child_path = format!("{}/{}", path, name);
            let is_dir = matches!(node, Node::Dir(_));
            let encoded = match tree {
                Tree::Primary if is_dir => name.to_uppercase().into_bytes(),
                Tree::Primary => format!("{};1", name.to_uppercase()).into_bytes(),
                Tree::Joliet => {
                    let n = if is_dir {
                        name.clone()
                    } else {
                        format!("{};1", name)
                    };
                    n.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
                }
            };
            let su = if rock_ridge {
                let mut su = vec![b'N', b'M', 5 + name.len() as u8, 1, 0];
                su.extend_from_slice(name.as_bytes());
                su
            } else {
                Vec::new()
            };
            let extents = if is_dir {
                vec![lookup(&child_path)]
            } else {
                self.files[&child_path].clone()
            };
            let count = extents.len();
            for (i, (sector, len)) in extents.into_iter().enumerate() {
                let mut r = record(&encoded, sector, len, is_dir, &su);
                if i + 1 < count {
                    r[25] |= 0x80;
                }
                named.push((encoded.clone(), r));
            }
        }
        // stable, so multi-extent parts stay in order
        named.sort_by(|a, b| a.0.cmp(&b.0));
        records.extend(named.into_iter().map(|(_, r)| r));

        let mut data = Vec::new();
        for r in records {
            let used = data.len() % SECTOR_SIZE;
            if used + r.len() > SECTOR_SIZE {
                data.resize(data.len() + SECTOR_SIZE - used, 0);
            }
            data.extend_from_slice(&r);
        }
        let len = (data.len() + SECTOR_SIZE - 1) / SECTOR_SIZE * SECTOR_SIZE;
        data.resize(len, 0);
        data
    }
}

fn record(name: &[u8], sector: u32, len: u32, is_dir: bool, system_use: &[u8]) -> Vec<u8> {
    let pad = if name.len() % 2 == 0 { 1 } else { 0 };
    let mut total = 33 + name.len() + pad + system_use.len();
    total += total % 2;
    let mut r = vec![0u8; total];
    r[0] = total as u8;
    both_u32(&mut r[2..10], sector);
    both_u32(&mut r[10..18], len);
    r[18..25].copy_from_slice(&[123, 4, 5, 6, 7, 8, 0]);
    r[25] = if is_dir { 2 } else { 0 };
    r[28..30].copy_from_slice(&1u16.to_le_bytes());
    r[30..32].copy_from_slice(&1u16.to_be_bytes());
    r[32] = name.len() as u8;
    r[33..33 + name.len()].copy_from_slice(name);
    let su = 33 + name.len() + pad;
    r[su..su + system_use.len()].copy_from_slice(system_use);
    r
}

fn both_u32(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
    buf[4..8].copy_from_slice(&v.to_be_bytes());
}

fn pad_str(buf: &mut [u8], s: &str) {
    buf.fill(b' ');
    buf[..s.len()].copy_from_slice(s.as_bytes());
}
