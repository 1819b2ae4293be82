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

//! Decoding of tagged UDF descriptors.  Only the fields needed to find and
//! read files are parsed.
//!
//! References: ECMA-167 3rd edition (parts 3 and 4) and OSTA UDF 2.60.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, Bytes};
use serde::Serialize;

use super::extent::{Extent, ExtentLong, ExtentSmall};
use crate::errors::FormatError;
use crate::fsreader::Timestamp;

pub const TAG_SIZE: usize = 16;

/// Fixed part of a File Identifier Descriptor, before the implementation
/// use and identifier fields.
const FID_HEADER_SIZE: usize = 38;

const FILE_TYPE_DIRECTORY: u8 = 4;

const CHARACTERISTIC_DIRECTORY: u8 = 1 << 1;
const CHARACTERISTIC_DELETED: u8 = 1 << 2;
const CHARACTERISTIC_PARENT: u8 = 1 << 3;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TagIdentifier {
    PrimaryVolume,
    Anchor,
    VolumePointer,
    ImplementationUse,
    Partition,
    LogicalVolume,
    UnallocatedSpace,
    Terminating,
    FileSet,
    FileIdentifier,
    FileEntry,
    ExtendedFileEntry,
}

impl TagIdentifier {
    pub fn from_u16(id: u16) -> Result<Self> {
        use TagIdentifier::*;
        Ok(match id {
            1 => PrimaryVolume,
            2 => Anchor,
            3 => VolumePointer,
            4 => ImplementationUse,
            5 => Partition,
            6 => LogicalVolume,
            7 => UnallocatedSpace,
            8 => Terminating,
            256 => FileSet,
            257 => FileIdentifier,
            261 => FileEntry,
            266 => ExtendedFileEntry,
            id => bail!(FormatError(format!("unknown descriptor tag {}", id))),
        })
    }

    pub fn as_u16(&self) -> u16 {
        use TagIdentifier::*;
        match self {
            PrimaryVolume => 1,
            Anchor => 2,
            VolumePointer => 3,
            ImplementationUse => 4,
            Partition => 5,
            LogicalVolume => 6,
            UnallocatedSpace => 7,
            Terminating => 8,
            FileSet => 256,
            FileIdentifier => 257,
            FileEntry => 261,
            ExtendedFileEntry => 266,
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub identifier: TagIdentifier,
    pub version: u16,
    pub serial: u16,
    pub location: u32,
}

impl Tag {
    /// Parses and checksums the tag at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < TAG_SIZE {
            bail!(FormatError(format!(
                "descriptor tag truncated to {} bytes",
                buf.len()
            )));
        }
        let expected = tag_checksum(&buf[..TAG_SIZE]);
        if buf[4] != expected {
            bail!(FormatError(format!(
                "descriptor tag checksum {:#04x} doesn't match computed {:#04x}",
                buf[4], expected
            )));
        }
        let b = &mut &buf[..TAG_SIZE];
        let identifier = TagIdentifier::from_u16(b.get_u16_le())?;
        let version = b.get_u16_le();
        b.advance(2); // checksum, reserved
        let serial = b.get_u16_le();
        b.advance(4); // descriptor CRC, CRC length
        let location = b.get_u32_le();
        Ok(Self {
            identifier,
            version,
            serial,
            location,
        })
    }
}

/// Sum of the tag bytes, skipping the checksum byte itself.
pub fn tag_checksum(tag: &[u8]) -> u8 {
    tag[..TAG_SIZE]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .fold(0u8, |sum, (_, b)| sum.wrapping_add(*b))
}

#[derive(Debug, Serialize, Clone)]
pub enum Descriptor {
    PrimaryVolume(PrimaryVolumeDescriptor),
    Anchor(AnchorVolumeDescriptor),
    VolumePointer(VolumeDescriptorPointer),
    ImplementationUse,
    Partition(PartitionDescriptor),
    LogicalVolume(LogicalVolumeDescriptor),
    UnallocatedSpace,
    Terminating,
    FileSet(FileSetDescriptor),
    FileEntry(FileEntry),
}

impl Descriptor {
    /// Decodes a descriptor occupying one logical block.  File Identifier
    /// Descriptors are variable-length records inside directory data and
    /// are handled by [`FileIdentifier::parse`] instead.
    pub fn parse(buf: Bytes) -> Result<Self> {
        let tag = Tag::parse(&buf)?;
        Ok(match tag.identifier {
            TagIdentifier::PrimaryVolume => {
                Self::PrimaryVolume(PrimaryVolumeDescriptor::parse(&buf)?)
            }
            TagIdentifier::Anchor => Self::Anchor(AnchorVolumeDescriptor::parse(&buf)?),
            TagIdentifier::VolumePointer => {
                Self::VolumePointer(VolumeDescriptorPointer::parse(&buf)?)
            }
            TagIdentifier::ImplementationUse => Self::ImplementationUse,
            TagIdentifier::Partition => Self::Partition(PartitionDescriptor::parse(&buf)?),
            TagIdentifier::LogicalVolume => {
                Self::LogicalVolume(LogicalVolumeDescriptor::parse(&buf)?)
            }
            TagIdentifier::UnallocatedSpace => Self::UnallocatedSpace,
            TagIdentifier::Terminating => Self::Terminating,
            TagIdentifier::FileSet => Self::FileSet(FileSetDescriptor::parse(&buf)?),
            TagIdentifier::FileEntry | TagIdentifier::ExtendedFileEntry => {
                Self::FileEntry(FileEntry::parse(buf, tag)?)
            }
            TagIdentifier::FileIdentifier => bail!(FormatError(
                "file identifier descriptor outside of a directory".into()
            )),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrimaryVolume(_) => "primary volume",
            Self::Anchor(_) => "anchor volume pointer",
            Self::VolumePointer(_) => "volume pointer",
            Self::ImplementationUse => "implementation use volume",
            Self::Partition(_) => "partition",
            Self::LogicalVolume(_) => "logical volume",
            Self::UnallocatedSpace => "unallocated space",
            Self::Terminating => "terminating",
            Self::FileSet(_) => "file set",
            Self::FileEntry(_) => "file entry",
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct AnchorVolumeDescriptor {
    pub main: Extent,
    pub reserve: Extent,
}

impl AnchorVolumeDescriptor {
    fn parse(buf: &[u8]) -> Result<Self> {
        let b = &mut field(buf, 16, 2 * Extent::SIZE)?;
        Ok(Self {
            main: Extent::parse(b),
            reserve: Extent::parse(b),
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct VolumeDescriptorPointer {
    pub sequence_number: u32,
    pub next: Extent,
}

impl VolumeDescriptorPointer {
    fn parse(buf: &[u8]) -> Result<Self> {
        let b = &mut field(buf, 16, 4 + Extent::SIZE)?;
        Ok(Self {
            sequence_number: b.get_u32_le(),
            next: Extent::parse(b),
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PrimaryVolumeDescriptor {
    pub sequence_number: u32,
    pub volume_id: String,
}

impl PrimaryVolumeDescriptor {
    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            sequence_number: field(buf, 16, 4)?.get_u32_le(),
            volume_id: decode_dstring(field(buf, 24, 32)?)?,
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub sequence_number: u32,
    pub number: u16,
    pub access_type: u32,
    pub starting_location: u32,
    pub length: u32,
}

impl PartitionDescriptor {
    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            sequence_number: field(buf, 16, 4)?.get_u32_le(),
            number: field(buf, 22, 2)?.get_u16_le(),
            access_type: field(buf, 184, 4)?.get_u32_le(),
            starting_location: field(buf, 188, 4)?.get_u32_le(),
            length: field(buf, 192, 4)?.get_u32_le(),
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogicalVolumeDescriptor {
    pub sequence_number: u32,
    pub volume_id: String,
    pub block_size: u32,
    /// location of the File Set Descriptor
    pub file_set: ExtentLong,
}

impl LogicalVolumeDescriptor {
    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            sequence_number: field(buf, 16, 4)?.get_u32_le(),
            volume_id: decode_dstring(field(buf, 84, 128)?)?,
            block_size: field(buf, 212, 4)?.get_u32_le(),
            file_set: ExtentLong::parse(&mut field(buf, 248, ExtentLong::SIZE)?),
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileSetDescriptor {
    pub file_set_id: String,
    pub root: ExtentLong,
}

impl FileSetDescriptor {
    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            file_set_id: decode_dstring(field(buf, 304, 32)?)?,
            root: ExtentLong::parse(&mut field(buf, 400, ExtentLong::SIZE)?),
        })
    }
}

/// Where a file's data lives.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum Allocation {
    Short(Vec<ExtentSmall>),
    Long(Vec<ExtentLong>),
    /// data stored inside the file entry itself
    #[serde(skip)]
    Embedded(Bytes),
}

/// File Entry or Extended File Entry; the two differ only in field
/// offsets as far as we're concerned.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_type: u8,
    pub permissions: u32,
    pub information_length: u64,
    pub modified: Timestamp,
    pub allocation: Allocation,
}

impl FileEntry {
    fn parse(buf: Bytes, tag: Tag) -> Result<Self> {
        // (modification time, extended attribute length, base of EA area)
        let (mtime, ea_len_at, base) = match tag.identifier {
            TagIdentifier::ExtendedFileEntry => (92, 208, 216),
            _ => (84, 168, 176),
        };
        let file_type = field(&buf, 27, 1)?.get_u8();
        let flags = field(&buf, 34, 2)?.get_u16_le();
        let permissions = field(&buf, 44, 4)?.get_u32_le();
        let information_length = field(&buf, 56, 8)?.get_u64_le();
        let modified = parse_timestamp(field(&buf, mtime, 12)?);
        let b = &mut field(&buf, ea_len_at, 8)?;
        let ea_len = b.get_u32_le() as usize;
        let ad_len = b.get_u32_le() as usize;
        let ad_start = base + ea_len;
        let ads = field(&buf, ad_start, ad_len)
            .map_err(|_| {
                anyhow!(FormatError(format!(
                    "allocation descriptors ({} bytes at offset {}) overrun file entry",
                    ad_len, ad_start
                )))
            })?;

        let allocation = match flags & 7 {
            0 => Allocation::Short(parse_ads(ads, ExtentSmall::SIZE, |b| ExtentSmall::parse(b))?),
            1 => Allocation::Long(parse_ads(ads, ExtentLong::SIZE, |b| ExtentLong::parse(b))?),
            3 => Allocation::Embedded(buf.slice(ad_start..ad_start + ad_len)),
            t => bail!(FormatError(format!(
                "unsupported allocation descriptor type {}",
                t
            ))),
        };
        Ok(Self {
            file_type,
            permissions,
            information_length,
            modified,
            allocation,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FILE_TYPE_DIRECTORY
    }
}

fn parse_ads<T>(
    mut ads: &[u8],
    size: usize,
    parse: impl Fn(&mut &[u8]) -> T,
) -> Result<Vec<T>>
where
    T: AllocationExtent,
{
    let mut ret = Vec::new();
    while ads.len() >= size {
        let ad = parse(&mut ads);
        if ad.raw_length() == 0 {
            break;
        }
        if ad.is_continuation() {
            bail!(FormatError(
                "continued allocation descriptor lists are not supported".into()
            ));
        }
        ret.push(ad);
    }
    Ok(ret)
}

trait AllocationExtent {
    fn raw_length(&self) -> u32;
    fn is_continuation(&self) -> bool;
}

impl AllocationExtent for ExtentSmall {
    fn raw_length(&self) -> u32 {
        self.byte_length()
    }
    fn is_continuation(&self) -> bool {
        self.kind() == super::extent::ExtentKind::Continuation
    }
}

impl AllocationExtent for ExtentLong {
    fn raw_length(&self) -> u32 {
        self.byte_length()
    }
    fn is_continuation(&self) -> bool {
        self.kind() == super::extent::ExtentKind::Continuation
    }
}

/// One directory entry.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileIdentifier {
    pub characteristics: u8,
    pub name: String,
    pub icb: ExtentLong,
    /// bytes this record occupies in the directory, including padding
    pub record_length: usize,
}

impl FileIdentifier {
    /// Parses the record at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let tag = Tag::parse(buf)?;
        if tag.identifier != TagIdentifier::FileIdentifier {
            bail!(FormatError(format!(
                "expected file identifier descriptor, found {:?}",
                tag.identifier
            )));
        }
        let b = &mut field(buf, 18, FID_HEADER_SIZE - 18)?;
        let characteristics = b.get_u8();
        let ident_len = b.get_u8();
        let icb = ExtentLong::parse(b);
        let impl_len = b.get_u16_le();
        let ident_start = FID_HEADER_SIZE + impl_len as usize;
        let ident = field(buf, ident_start, ident_len as usize).map_err(|_| {
            anyhow!(FormatError(format!(
                "file identifier ({} bytes) runs past end of directory",
                ident_len
            )))
        })?;
        let record_length = directory_record_length(impl_len, ident_len).min(buf.len());
        Ok(Self {
            characteristics,
            name: decode_identifier(ident)?,
            icb,
            record_length,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.characteristics & CHARACTERISTIC_DIRECTORY != 0
    }

    pub fn is_parent(&self) -> bool {
        self.characteristics & CHARACTERISTIC_PARENT != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.characteristics & CHARACTERISTIC_DELETED != 0
    }
}

/// Length of a File Identifier Descriptor, padded to a multiple of four.
pub fn directory_record_length(impl_len: u16, ident_len: u8) -> usize {
    4 * ((FID_HEADER_SIZE + impl_len as usize + ident_len as usize + 3) / 4)
}

/// Decodes an OSTA compressed Unicode identifier.
pub fn decode_identifier(buf: &[u8]) -> Result<String> {
    let (comp, data) = match buf.split_first() {
        Some(v) => v,
        None => return Ok(String::new()),
    };
    match comp {
        8 => Ok(data.iter().map(|b| char::from(*b)).collect()),
        16 => {
            if data.len() % 2 != 0 {
                bail!(FormatError("odd-length UCS-2 identifier".into()));
            }
            Ok(char::decode_utf16(
                data.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]])),
            )
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
        }
        c => bail!(FormatError(format!(
            "unknown identifier compression {}",
            c
        ))),
    }
}

/// Decodes a fixed-size dstring, whose last byte holds the used length.
pub fn decode_dstring(buf: &[u8]) -> Result<String> {
    let used = match buf.last() {
        Some(n) => *n as usize,
        None => return Ok(String::new()),
    };
    if used == 0 {
        return Ok(String::new());
    }
    if used >= buf.len() {
        bail!(FormatError(format!("dstring length {} overruns field", used)));
    }
    decode_identifier(&buf[..used])
}

fn parse_timestamp(mut b: &[u8]) -> Timestamp {
    b.advance(2); // type and timezone
    Timestamp {
        year: b.get_i16_le(),
        month: b.get_u8(),
        day: b.get_u8(),
        hour: b.get_u8(),
        minute: b.get_u8(),
        second: b.get_u8(),
    }
}

/// Returns `len` bytes at `offset`, or a FormatError if the record is too
/// short.
fn field(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            anyhow!(FormatError(format!(
                "descriptor too short: need {} bytes at offset {}, have {}",
                len,
                offset,
                buf.len()
            )))
        })
}
