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

//! Extent descriptors: `extent_ad`, `long_ad` and `short_ad` in ECMA-167
//! terms.  Callers must check that enough bytes remain before parsing.

use bytes::{Buf, BufMut};
use serde::Serialize;

const LENGTH_MASK: u32 = 0x3fff_ffff;

/// Recording state stored in the top two bits of an allocation
/// descriptor's length.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    Recorded,
    AllocatedNotRecorded,
    NotAllocated,
    /// points at a further run of allocation descriptors
    Continuation,
}

/// A run of whole sectors at an absolute location.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub length: u32,
    pub location: u32,
}

impl Extent {
    pub const SIZE: usize = 8;

    pub fn parse(buf: &mut impl Buf) -> Self {
        Self {
            length: buf.get_u32_le(),
            location: buf.get_u32_le(),
        }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.location);
    }
}

/// Allocation descriptor naming a partition.  The location is six bytes:
/// the logical block number followed by the partition reference number.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ExtentLong {
    pub length: u32,
    pub location: u64,
    pub implementation_use: [u8; 6],
}

impl ExtentLong {
    pub const SIZE: usize = 16;

    pub fn new(length: u32, block: u32) -> Self {
        Self {
            length,
            location: block as u64,
            implementation_use: [0; 6],
        }
    }

    pub fn parse(buf: &mut impl Buf) -> Self {
        let length = buf.get_u32_le();
        let location = buf.get_uint_le(6);
        let mut implementation_use = [0; 6];
        buf.copy_to_slice(&mut implementation_use);
        Self {
            length,
            location,
            implementation_use,
        }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.length);
        buf.put_uint_le(self.location, 6);
        buf.put_slice(&self.implementation_use);
    }

    pub fn byte_length(&self) -> u32 {
        self.length & LENGTH_MASK
    }

    pub fn kind(&self) -> ExtentKind {
        kind(self.length)
    }

    pub fn block(&self) -> u32 {
        self.location as u32
    }

    pub fn partition(&self) -> u16 {
        (self.location >> 32) as u16
    }
}

/// Allocation descriptor within the partition of the owning file entry.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ExtentSmall {
    pub length: u32,
    pub location: u32,
}

impl ExtentSmall {
    pub const SIZE: usize = 8;

    pub fn parse(buf: &mut impl Buf) -> Self {
        Self {
            length: buf.get_u32_le(),
            location: buf.get_u32_le(),
        }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.location);
    }

    pub fn byte_length(&self) -> u32 {
        self.length & LENGTH_MASK
    }

    pub fn kind(&self) -> ExtentKind {
        kind(self.length)
    }
}

impl From<ExtentSmall> for ExtentLong {
    fn from(e: ExtentSmall) -> Self {
        Self::new(e.length, e.location)
    }
}

fn kind(length: u32) -> ExtentKind {
    match length >> 30 {
        0 => ExtentKind::Recorded,
        1 => ExtentKind::AllocatedNotRecorded,
        2 => ExtentKind::NotAllocated,
        _ => ExtentKind::Continuation,
    }
}
