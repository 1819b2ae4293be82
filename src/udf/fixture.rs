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

//! Builds small UDF images in memory for tests.
//!
//! Layout: anchor at 256, main sequence at 257, reserve at 270 (pointer
//! targets at 290 and 295), partition from sector 300 with the file set
//! descriptor in block 0 and the root directory's file entry in block 1.

use bytes::BufMut;
use std::collections::BTreeMap;

use super::descriptor::tag_checksum;
use super::extent::{Extent, ExtentLong, ExtentSmall};
use crate::io::SECTOR_SIZE;

pub const PARTITION_START: u64 = 300;
pub const MAIN_SEQUENCE: u64 = 257;
pub const RESERVE_SEQUENCE: u64 = 270;
const MAIN_POINTER_TARGET: u64 = 290;
const RESERVE_POINTER_TARGET: u64 = 295;

/// Writes a valid tag at the start of `buf`.
pub fn write_tag(buf: &mut [u8], id: u16, location: u32) {
    buf[0..2].copy_from_slice(&id.to_le_bytes());
    buf[2..4].copy_from_slice(&2u16.to_le_bytes());
    buf[6..8].copy_from_slice(&1u16.to_le_bytes());
    buf[12..16].copy_from_slice(&location.to_le_bytes());
    buf[4] = tag_checksum(buf);
}

/// Overwrites a sector with an otherwise empty descriptor.
pub fn replace_descriptor(image: &mut [u8], sector: u64, id: u16) {
    let start = sector as usize * SECTOR_SIZE;
    let buf = &mut image[start..start + SECTOR_SIZE];
    buf.fill(0);
    write_tag(buf, id, sector as u32);
}

/// OSTA compressed Unicode, 8-bit when possible.
pub fn osta(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return Vec::new();
    }
    if s.chars().all(|c| (c as u32) < 0x100) {
        let mut ret = vec![8];
        ret.extend(s.chars().map(|c| c as u8));
        ret
    } else {
        let mut ret = vec![16];
        for unit in s.encode_utf16() {
            ret.extend_from_slice(&unit.to_be_bytes());
        }
        ret
    }
}

fn dstring(buf: &mut [u8], s: &str) {
    let data = osta(s);
    buf[..data.len()].copy_from_slice(&data);
    let last = buf.len() - 1;
    buf[last] = data.len() as u8;
}

fn timestamp(buf: &mut [u8]) {
    let b = &mut &mut buf[..12];
    b.put_u16_le(0x1000);
    b.put_i16_le(2023);
    b.put_slice(&[4, 5, 6, 7, 8, 0, 0, 0]);
}

/// A File Identifier Descriptor.
pub struct Fid {
    pub name: String,
    pub is_dir: bool,
    pub is_parent: bool,
    pub block: u32,
    pub impl_use: u16,
}

impl Fid {
    pub fn to_bytes(&self) -> Vec<u8> {
        let ident = osta(&self.name);
        let len = super::descriptor::directory_record_length(self.impl_use, ident.len() as u8);
        let mut buf = vec![0u8; len];
        buf[16..18].copy_from_slice(&1u16.to_le_bytes());
        buf[18] = (self.is_dir as u8) << 1 | (self.is_parent as u8) << 3;
        buf[19] = ident.len() as u8;
        ExtentLong::new(SECTOR_SIZE as u32, self.block).write(&mut &mut buf[20..36]);
        buf[36..38].copy_from_slice(&self.impl_use.to_le_bytes());
        let start = 38 + self.impl_use as usize;
        buf[start..start + ident.len()].copy_from_slice(&ident);
        write_tag(&mut buf, 257, 0);
        buf
    }
}

#[derive(Clone)]
enum Layout {
    Contiguous,
    /// two extents with a gap between them
    Split(usize),
    Embedded,
}

#[derive(Clone)]
enum Node {
    Dir(BTreeMap<String, Node>),
    File(Vec<u8>, Layout),
}

pub struct UdfBuilder {
    volume_id: String,
    extended: bool,
    pointer: bool,
    root: BTreeMap<String, Node>,
}

impl UdfBuilder {
    pub fn new(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            extended: false,
            pointer: false,
            root: BTreeMap::new(),
        }
    }

    /// Use Extended File Entries and long allocation descriptors.
    pub fn extended_entries(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Split each descriptor sequence with a Volume Descriptor Pointer.
    pub fn with_volume_pointer(mut self) -> Self {
        self.pointer = true;
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.add(path, Node::File(data.to_vec(), Layout::Contiguous))
    }

    pub fn split_file(self, path: &str, data: &[u8], at: usize) -> Self {
        self.add(path, Node::File(data.to_vec(), Layout::Split(at)))
    }

    pub fn embedded_file(self, path: &str, data: &[u8]) -> Self {
        self.add(path, Node::File(data.to_vec(), Layout::Embedded))
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
            data: vec![0; PARTITION_START as usize * SECTOR_SIZE],
            extended: self.extended,
            next_block: 2,
        };

        // volume recognition sequence
        for (i, id) in [b"BEA01", b"NSR02", b"TEA01"].iter().enumerate() {
            let mut buf = vec![0u8; SECTOR_SIZE];
            buf[1..6].copy_from_slice(*id);
            buf[6] = 1;
            image.put(16 + i as u64, &buf);
        }

        image.write_dir(&self.root, 1, 1);
        let partition_length = image.next_block;

        let mut fsd = vec![0u8; SECTOR_SIZE];
        timestamp(&mut fsd[16..]);
        dstring(&mut fsd[304..336], "fileset");
        ExtentLong::new(SECTOR_SIZE as u32, 1).write(&mut &mut fsd[400..416]);
        write_tag(&mut fsd, 256, 0);
        image.put(PARTITION_START, &fsd);

        for (start, target) in [
            (MAIN_SEQUENCE, MAIN_POINTER_TARGET),
            (RESERVE_SEQUENCE, RESERVE_POINTER_TARGET),
        ] {
            let descriptors = self.sequence(partition_length as u32);
            if self.pointer {
                // PVD, pointer, then the rest at the target
                image.put_descriptor(start, &descriptors[0]);
                let mut vdp = vec![0u8; SECTOR_SIZE];
                vdp[16..20].copy_from_slice(&2u32.to_le_bytes());
                Extent {
                    length: 16 * SECTOR_SIZE as u32,
                    location: target as u32,
                }
                .write(&mut &mut vdp[20..28]);
                image.put_descriptor(start + 1, &(3, vdp));
                for (i, d) in descriptors[2..].iter().enumerate() {
                    image.put_descriptor(target + i as u64, d);
                }
            } else {
                for (i, d) in descriptors.iter().enumerate() {
                    image.put_descriptor(start + i as u64, d);
                }
            }
        }

        let mut anchor = vec![0u8; SECTOR_SIZE];
        for (offset, location) in [(16, MAIN_SEQUENCE), (24, RESERVE_SEQUENCE)] {
            Extent {
                length: 16 * SECTOR_SIZE as u32,
                location: location as u32,
            }
            .write(&mut &mut anchor[offset..offset + 8]);
        }
        image.put_descriptor(256, &(2, anchor));

        image.data
    }

    /// PVD, IUVD, PD, LVD, USD, TD as (tag, body) pairs.
    fn sequence(&self, partition_length: u32) -> Vec<(u16, Vec<u8>)> {
        let mut pvd = vec![0u8; SECTOR_SIZE];
        pvd[16..20].copy_from_slice(&1u32.to_le_bytes());
        dstring(&mut pvd[24..56], &self.volume_id);

        let iuvd = vec![0u8; SECTOR_SIZE];

        let mut pd = vec![0u8; SECTOR_SIZE];
        pd[16..20].copy_from_slice(&3u32.to_le_bytes());
        pd[184..188].copy_from_slice(&1u32.to_le_bytes());
        pd[188..192].copy_from_slice(&(PARTITION_START as u32).to_le_bytes());
        pd[192..196].copy_from_slice(&partition_length.to_le_bytes());

        let mut lvd = vec![0u8; SECTOR_SIZE];
        lvd[16..20].copy_from_slice(&4u32.to_le_bytes());
        dstring(&mut lvd[84..212], &self.volume_id);
        lvd[212..216].copy_from_slice(&(SECTOR_SIZE as u32).to_le_bytes());
        ExtentLong::new(SECTOR_SIZE as u32, 0).write(&mut &mut lvd[248..264]);

        vec![
            (1, pvd),
            (4, iuvd),
            (5, pd),
            (6, lvd),
            (7, vec![0u8; SECTOR_SIZE]),
            (8, vec![0u8; SECTOR_SIZE]),
        ]
    }
}

struct Image {
    data: Vec<u8>,
    extended: bool,
    next_block: u32,
}

impl Image {
    fn put(&mut self, sector: u64, buf: &[u8]) {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if self.data.len() < end {
            // keep the image a whole number of sectors
            self.data.resize((end + SECTOR_SIZE - 1) / SECTOR_SIZE * SECTOR_SIZE, 0);
        }
        self.data[start..end].copy_from_slice(buf);
    }

    fn put_descriptor(&mut self, sector: u64, (id, body): &(u16, Vec<u8>)) {
        let mut buf = body.clone();
        write_tag(&mut buf, *id, sector as u32);
        self.put(sector, &buf);
    }

    fn put_block(&mut self, block: u32, buf: &[u8]) {
        self.put(PARTITION_START + block as u64, buf);
    }

    fn allocate(&mut self, len: usize) -> u32 {
        let block = self.next_block;
        self.next_block += ((len + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
        block
    }

    /// Writes a directory's data and file entry, then its children.
    fn write_dir(&mut self, children: &BTreeMap<String, Node>, block: u32, parent: u32) {
        let child_blocks: Vec<u32> = children.iter().map(|_| self.allocate(1)).collect();
        let mut data = Fid {
            name: String::new(),
            is_dir: true,
            is_parent: true,
            block: parent,
            impl_use: 0,
        }
        .to_bytes();
        for ((name, node), child) in children.iter().zip(&child_blocks) {
            data.extend(
                Fid {
                    name: name.clone(),
                    is_dir: matches!(node, Node::Dir(_)),
                    is_parent: false,
                    block: *child,
                    impl_use: 0,
                }
                .to_bytes(),
            );
        }
        let start = self.allocate(data.len());
        self.put_block(start, &data);
        self.write_entry(block, true, data.len(), &[(start, data.len())]);

        for ((_, node), child) in children.iter().zip(child_blocks) {
            match node {
                Node::Dir(d) => self.write_dir(d, child, block),
                Node::File(data, layout) => self.write_file(data, layout, child),
            }
        }
    }

    fn write_file(&mut self, data: &[u8], layout: &Layout, block: u32) {
        match layout {
            Layout::Contiguous => {
                let start = self.allocate(data.len());
                self.put_block(start, data);
                self.write_entry(block, false, data.len(), &[(start, data.len())]);
            }
            Layout::Split(at) => {
                let (a, b) = data.split_at(*at);
                let first = self.allocate(a.len());
                self.allocate(1);
                let second = self.allocate(b.len());
                self.put_block(first, a);
                self.put_block(second, b);
                self.write_entry(
                    block,
                    false,
                    data.len(),
                    &[(first, a.len()), (second, b.len())],
                );
            }
            Layout::Embedded => {
                let mut buf = self.entry_header(false, data.len(), 3, data.len());
                let base = if self.extended { 216 } else { 176 };
                buf[base..base + data.len()].copy_from_slice(data);
                write_tag(&mut buf, self.entry_tag(), block);
                self.put_block(block, &buf);
            }
        }
    }

    fn write_entry(&mut self, block: u32, is_dir: bool, len: usize, extents: &[(u32, usize)]) {
        let mut ads = Vec::new();
        for (start, len) in extents {
            if self.extended {
                ExtentLong::new(*len as u32, *start).write(&mut ads);
            } else {
                ExtentSmall {
                    length: *len as u32,
                    location: *start,
                }
                .write(&mut ads);
            }
        }
        let ad_type = if self.extended { 1 } else { 0 };
        let mut buf = self.entry_header(is_dir, len, ad_type, ads.len());
        let base = if self.extended { 216 } else { 176 };
        buf[base..base + ads.len()].copy_from_slice(&ads);
        write_tag(&mut buf, self.entry_tag(), block);
        self.put_block(block, &buf);
    }

    fn entry_tag(&self) -> u16 {
        if self.extended {
            266
        } else {
            261
        }
    }

    fn entry_header(&self, is_dir: bool, len: usize, ad_type: u16, ad_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        // ICB tag: strategy 4, one entry
        buf[20..22].copy_from_slice(&4u16.to_le_bytes());
        buf[24..26].copy_from_slice(&1u16.to_le_bytes());
        buf[27] = if is_dir { 4 } else { 5 };
        buf[34..36].copy_from_slice(&ad_type.to_le_bytes());
        buf[44..48].copy_from_slice(&0x14a5u32.to_le_bytes());
        buf[56..64].copy_from_slice(&(len as u64).to_le_bytes());
        let (mtime, lengths) = if self.extended { (92, 208) } else { (84, 168) };
        timestamp(&mut buf[mtime..]);
        buf[lengths + 4..lengths + 8].copy_from_slice(&(ad_len as u32).to_le_bytes());
        buf
    }
}
