// Copyright 2021 Red Hat, Inc.
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

//! Minimal ISO 9660 parser. This is not a comprehensive parser; we only
//! parse out the fields we care about. Joliet and Rock Ridge names are
//! recognized; other extensions are ignored.
//!
//! The official specification is not free. The primary references used
//! for this module are https://wiki.osdev.org/ISO_9660 and IEEE P1282
//! (Rock Ridge).

// Many magic numbers corresponding to offsets and lengths have not been const-ified. It should be
// straightforward to see to what they correspond using the referenced linked above.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, Bytes};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::FormatError;
use crate::fsreader::{DirEntry, Timestamp, Volume};
use crate::io::*;

#[cfg(test)]
pub(crate) mod fixture;

/// Descriptors past this many are assumed to be garbage.
const MAX_VOLUME_DESCRIPTORS: usize = 64;

/// Directories larger than this are assumed corrupt.
const MAX_DIRECTORY_SIZE: u32 = 16 * 1024 * 1024;

const FLAG_DIRECTORY: u8 = 1 << 1;
const FLAG_MULTI_EXTENT: u8 = 1 << 7;

pub struct IsoFs<R: Read + Seek> {
    descriptors: Vec<VolumeDescriptor>,
    reader: SectorReader<R>,
    names: Names,
    root: Record,
}

/// Which set of names a directory tree is read with.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Names {
    Plain,
    Joliet,
    /// Rock Ridge `NM` entries, found after skipping `skip` bytes of each
    /// record's system use area
    RockRidge { skip: u8 },
}

impl<R: Read + Seek> IsoFs<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let length = reader
            .seek(SeekFrom::End(0))
            .context("getting image length")?;
        let mut reader = SectorReader::new(reader);
        let descriptors = get_volume_descriptors(&mut reader)?;
        let primary = get_primary_volume_descriptor(&descriptors)?;
        if primary.volume_space_size * SECTOR_SIZE as u64 > length {
            bail!(FormatError("ISO image is incomplete".into()));
        }
        let primary_root = primary.root.clone();

        let mut iso_fs = Self {
            descriptors,
            reader,
            names: Names::Plain,
            root: primary_root.clone(),
        };
        if let Some(skip) = iso_fs
            .rock_ridge_skip(&primary_root)
            .context("checking for Rock Ridge")?
        {
            iso_fs.names = Names::RockRidge { skip };
        } else if let Some(root) = iso_fs.joliet_root() {
            iso_fs.names = Names::Joliet;
            iso_fs.root = root;
        }
        debug!("ISO 9660 names: {:?}", iso_fs.names);
        Ok(iso_fs)
    }

    pub fn names(&self) -> Names {
        self.names
    }

    pub fn volume_id(&self) -> &str {
        get_primary_volume_descriptor(&self.descriptors)
            .map(|p| p.volume_id.as_str())
            .unwrap_or_default()
    }

    pub fn get_root_directory(&self) -> &Record {
        &self.root
    }

    /// Returns the records of a directory, without "." and "..".
    pub fn list_dir(&mut self, dir: &Record) -> Result<Vec<Record>> {
        let extent = match dir.extents.first() {
            Some(e) if dir.is_dir => *e,
            _ => bail!("{} is not a directory", dir.name),
        };
        if extent.length > MAX_DIRECTORY_SIZE {
            bail!(FormatError(format!(
                "directory {} is implausibly large ({} bytes)",
                dir.name, extent.length
            )));
        }
        let data = self
            .reader
            .read_bytes(extent.address.as_sector() as u64, extent.length as u64)
            .with_context(|| format!("reading directory {}", dir.name))?;
        get_directory_records(data, self.names)
            .with_context(|| format!("parsing directory {}", dir.name))
    }

    /// Returns a reader for a file record.
    pub fn read_file(&mut self, file: &Record) -> Result<impl Read + '_> {
        if file.is_dir {
            bail!("{} is a directory", file.name);
        }
        let segments = file.extents.iter().map(|e| Segment {
            offset: Some(e.address.as_offset()),
            length: e.length as u64,
        });
        Ok(ExtentReader::new(self.reader.get_mut(), segments))
    }

    /// The SP entry of the root's "." record announces Rock Ridge.
    fn rock_ridge_skip(&mut self, root: &Record) -> Result<Option<u8>> {
        let extent = match root.extents.first() {
            Some(e) => *e,
            None => return Ok(None),
        };
        let data = self
            .reader
            .read_bytes(extent.address.as_sector() as u64, extent.length.min(255) as u64)
            .context("reading root directory")?;
        let len = *data.first().unwrap_or(&0) as usize;
        if len < 34 || len > data.len() {
            return Ok(None);
        }
        // "." has a one-byte name, so there's no padding
        let system_use = &data[34..len];
        let skip = system_use_entries(system_use)
            .find(|(sig, body)| sig == b"SP" && body.len() >= 3 && body[..2] == [0xbe, 0xef])
            .map(|(_, body)| body[2]);
        Ok(skip)
    }

    fn joliet_root(&self) -> Option<Record> {
        self.descriptors.iter().find_map(|d| match d {
            VolumeDescriptor::Supplementary(s) if s.is_joliet() => Some(s.root.clone()),
            _ => None,
        })
    }
}

impl<R: Read + Seek> Volume for IsoFs<R> {
    type Node = Record;

    const FORMAT: &'static str = "iso9660";

    fn label(&self) -> &str {
        self.volume_id()
    }

    fn root(&mut self) -> Result<Record> {
        Ok(self.root.clone())
    }

    fn entry(&self, node: &Record) -> DirEntry {
        DirEntry {
            name: node.name.clone(),
            size: node.size(),
            is_dir: node.is_dir,
            modified: node.modified,
        }
    }

    fn children(&mut self, dir: &Record) -> Result<Vec<Record>> {
        self.list_dir(dir)
    }

    fn open(&mut self, file: &Record) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.read_file(file)?))
    }

    fn node_key(&self, node: &Record) -> Option<u64> {
        node.extents.first().map(|e| e.address.as_sector() as u64)
    }
}

fn get_primary_volume_descriptor(
    descriptors: &[VolumeDescriptor],
) -> Result<&PrimaryVolumeDescriptor> {
    for d in descriptors {
        if let VolumeDescriptor::Primary(p) = d {
            return Ok(p);
        }
    }
    Err(anyhow!(FormatError(
        "no primary volume descriptor found in ISO".into()
    )))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum VolumeDescriptor {
    Boot(BootVolumeDescriptor),
    Primary(PrimaryVolumeDescriptor),
    Supplementary(SupplementaryVolumeDescriptor),
    Unknown { type_id: u8 },
}

#[derive(Debug, Serialize)]
struct BootVolumeDescriptor {
    boot_system_id: String,
    boot_id: String,
}

#[derive(Debug, Serialize)]
struct PrimaryVolumeDescriptor {
    system_id: String,
    volume_id: String,
    volume_space_size: u64,
    root: Record,
}

#[derive(Debug, Serialize)]
struct SupplementaryVolumeDescriptor {
    escape_sequences: Vec<u8>,
    root: Record,
}

impl SupplementaryVolumeDescriptor {
    /// UCS-2 levels 1 to 3.
    fn is_joliet(&self) -> bool {
        matches!(
            self.escape_sequences.get(..3),
            Some(b"%/@") | Some(b"%/C") | Some(b"%/E")
        )
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct Record {
    pub name: String,
    pub extents: Vec<Extent>,
    pub is_dir: bool,
    pub modified: Option<Timestamp>,
}

impl Record {
    /// Total size; files over 4 GiB span several extents.
    pub fn size(&self) -> u64 {
        self.extents.iter().map(|e| e.length as u64).sum()
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub address: Address,
    pub length: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Address(u32);

impl Address {
    pub fn as_offset(&self) -> u64 {
        sector_offset(self.0 as u64)
    }

    pub fn as_sector(&self) -> u32 {
        self.0
    }
}

/// Reads all the volume descriptors.
fn get_volume_descriptors<R: Read + Seek>(
    reader: &mut SectorReader<R>,
) -> Result<Vec<VolumeDescriptor>> {
    const ISO9660_VOLUME_DESCRIPTORS: u64 = 0x10;

    let mut descriptors: Vec<VolumeDescriptor> = Vec::new();
    loop {
        if descriptors.len() >= MAX_VOLUME_DESCRIPTORS {
            bail!(FormatError(format!(
                "no volume descriptor set terminator in {} sectors",
                MAX_VOLUME_DESCRIPTORS
            )));
        }
        let sector = ISO9660_VOLUME_DESCRIPTORS + descriptors.len() as u64;
        match get_volume_descriptor(reader, sector)
            .with_context(|| format!("getting volume descriptor #{}", descriptors.len() + 1))?
        {
            Some(d) => descriptors.push(d),
            None => break,
        }
    }
    Ok(descriptors)
}

/// Reads the volume descriptor in the given sector.  Returns None for the
/// set terminator.
fn get_volume_descriptor<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    sector: u64,
) -> Result<Option<VolumeDescriptor>> {
    const TYPE_BOOT: u8 = 0;
    const TYPE_PRIMARY: u8 = 1;
    const TYPE_SUPPLEMENTARY: u8 = 2;
    const TYPE_TERMINATOR: u8 = 255;

    let buf = &mut reader
        .read_sector(sector)
        .context("reading volume descriptor")?;

    Ok(match buf.get_u8() {
        TYPE_BOOT => Some(VolumeDescriptor::Boot(BootVolumeDescriptor::parse(buf)?)),
        TYPE_PRIMARY => Some(VolumeDescriptor::Primary(PrimaryVolumeDescriptor::parse(
            buf,
        )?)),
        TYPE_SUPPLEMENTARY => Some(VolumeDescriptor::Supplementary(
            SupplementaryVolumeDescriptor::parse(buf)?,
        )),
        TYPE_TERMINATOR => {
            verify_descriptor_header(buf).context("parsing terminator")?;
            None
        }
        t => Some(VolumeDescriptor::Unknown { type_id: t }),
    })
}

impl BootVolumeDescriptor {
    /// Parses boot descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing boot descriptor")?;
        Ok(Self {
            boot_system_id: parse_iso9660_string(buf, 32, IsoString::StrA)
                .context("parsing boot system ID")?,
            boot_id: parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing boot ID")?,
        })
    }
}

impl PrimaryVolumeDescriptor {
    /// Parses primary descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing primary descriptor")?;
        let system_id =
            parse_iso9660_string(eat(buf, 1), 32, IsoString::StrA).context("parsing system id")?;
        let volume_id = // technically should be StrD, but non-compliance is common
            parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing volume id")?;
        eat(buf, 8); // Unused field always 0x00
        let volume_space_size = buf.get_u32_le() as u64;
        let root = parse_root_record(eat(buf, 156 - 84))?;
        Ok(Self {
            system_id,
            volume_id,
            volume_space_size,
            root,
        })
    }
}

impl SupplementaryVolumeDescriptor {
    /// Parses supplementary descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing supplementary descriptor")?;
        let escape_sequences = eat(buf, 88 - 7).copy_to_bytes(32).to_vec();
        let root = parse_root_record(eat(buf, 156 - 120))?;
        Ok(Self {
            escape_sequences,
            root,
        })
    }
}

fn parse_root_record(buf: &mut Bytes) -> Result<Record> {
    const ROOT_RECORD_SIZE: usize = 34;

    if buf.remaining() < ROOT_RECORD_SIZE {
        bail!(FormatError("volume descriptor too short for root record".into()));
    }
    let mut record = buf.split_to(ROOT_RECORD_SIZE);
    match get_next_directory_record(&mut record, ROOT_RECORD_SIZE as u32, Names::Plain)? {
        Some(RawRecord {
            name: None,
            extent,
            flags,
            modified,
        }) if flags & FLAG_DIRECTORY != 0 => Ok(Record {
            name: String::new(),
            extents: vec![extent],
            is_dir: true,
            modified,
        }),
        _ => bail!(FormatError(
            "failed to parse root directory record from volume descriptor".into()
        )),
    }
}

/// Verifies descriptor header at cursor.
fn verify_descriptor_header(buf: &mut Bytes) -> Result<()> {
    const VOLUME_DESCRIPTOR_ID: &[u8] = b"CD001";
    const VOLUME_DESCRIPTOR_VERSION: u8 = 1;

    let id = buf.copy_to_bytes(5);
    if id != VOLUME_DESCRIPTOR_ID {
        bail!(FormatError(format!("unknown descriptor ID: {:?}", id)));
    }

    let version = buf.get_u8();
    if version != VOLUME_DESCRIPTOR_VERSION {
        bail!(FormatError(format!(
            "unknown descriptor version: {}",
            version
        )));
    }

    Ok(())
}

/// Collects the records of a directory, joining the parts of multi-extent
/// files.
fn get_directory_records(mut buf: Bytes, names: Names) -> Result<Vec<Record>> {
    let length = buf.len() as u32;
    let mut records: Vec<Record> = Vec::new();
    let mut continued = false;
    while let Some(raw) =
        get_next_directory_record(&mut buf, length, names).context("reading next record")?
    {
        let was_continued = continued;
        continued = raw.flags & FLAG_MULTI_EXTENT != 0;
        let name = match raw.name {
            Some(name) => name,
            None => continue,
        };
        match records.last_mut() {
            Some(last) if was_continued && last.name == name => last.extents.push(raw.extent),
            _ => records.push(Record {
                name,
                extents: vec![raw.extent],
                is_dir: raw.flags & FLAG_DIRECTORY != 0,
                modified: raw.modified,
            }),
        }
    }
    Ok(records)
}

/// One directory record.  `name` is None for "." and "..".
struct RawRecord {
    name: Option<String>,
    extent: Extent,
    flags: u8,
    modified: Option<Timestamp>,
}

/// Reads the directory record at cursor and advances to the next one.
fn get_next_directory_record(
    buf: &mut Bytes,
    length: u32,
    names: Names,
) -> Result<Option<RawRecord>> {
    loop {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let len = buf.get_u8() as usize;
        if len == 0 {
            let jump = {
                // calculate where we are we in the directory
                let pos = length as usize - buf.remaining();
                // get distance to next 2k-aligned address
                ((pos + SECTOR_SIZE) & !(SECTOR_SIZE - 1)) - pos
            };
            if jump >= buf.remaining() {
                return Ok(None);
            }
            buf.advance(jump);
            continue;
        } else if len > buf.remaining() + 1 {
            // + 1 because len includes the length of the length byte
            // itself, which we already read
            bail!(FormatError(
                "incomplete directory record; corrupt ISO?".into()
            ));
        } else if len < 34 {
            bail!(FormatError(format!(
                "directory record of {} bytes is too short",
                len
            )));
        }

        // the rest of this record, after the length byte
        let mut record = buf.split_to(len - 1);
        let address = Address(eat(&mut record, 1).get_u32_le());
        let data_length = eat(&mut record, 4).get_u32_le();
        let modified = parse_recording_date(eat(&mut record, 4));
        let flags = record.get_u8();
        let name_length = eat(&mut record, 32 - 26).get_u8() as usize;
        if name_length > record.remaining() {
            bail!(FormatError(
                "incomplete directory record name; corrupt ISO?".into()
            ));
        }
        let raw_name = record.split_to(name_length);
        // padding byte after even-length names
        if name_length % 2 == 0 && record.has_remaining() {
            record.advance(1);
        }

        let name = if name_length == 1 && (raw_name[0] == 0 || raw_name[0] == 1) {
            // "." or ".."
            None
        } else {
            Some(match names {
                Names::Plain => parse_iso9660_string(
                    &mut raw_name.clone(),
                    name_length,
                    IsoString::File,
                )
                .context("parsing record name")?,
                Names::Joliet => parse_joliet_name(&raw_name),
                Names::RockRidge { skip } => {
                    let system_use = record.get(skip as usize..).unwrap_or_default();
                    match rock_ridge_name(system_use) {
                        Some(name) => name,
                        None => parse_iso9660_string(
                            &mut raw_name.clone(),
                            name_length,
                            IsoString::File,
                        )
                        .context("parsing record name")?,
                    }
                }
            })
        };

        return Ok(Some(RawRecord {
            name,
            extent: Extent {
                address,
                length: data_length,
            },
            flags,
            modified,
        }));
    }
}

/// Seven-byte recording date: years since 1900, month, day, hour, minute,
/// second and a timezone offset we ignore.
fn parse_recording_date(buf: &mut Bytes) -> Option<Timestamp> {
    let b = buf.copy_to_bytes(7);
    if b[..6].iter().all(|v| *v == 0) {
        return None;
    }
    Some(Timestamp {
        year: 1900 + b[0] as i16,
        month: b[1],
        day: b[2],
        hour: b[3],
        minute: b[4],
        second: b[5],
    })
}

/// Iterates over SUSP entries as (signature, body) pairs.
fn system_use_entries(mut buf: &[u8]) -> impl Iterator<Item = ([u8; 2], &[u8])> {
    std::iter::from_fn(move || {
        if buf.len() < 4 {
            return None;
        }
        let len = buf[2] as usize;
        if len < 4 || len > buf.len() {
            return None;
        }
        let sig = [buf[0], buf[1]];
        let body = &buf[4..len];
        buf = &buf[len..];
        Some((sig, body))
    })
}

/// Concatenates the NM entries of a record.
fn rock_ridge_name(system_use: &[u8]) -> Option<String> {
    const NM_CURRENT: u8 = 1 << 1;
    const NM_PARENT: u8 = 1 << 2;

    let mut name: Option<Vec<u8>> = None;
    for (sig, body) in system_use_entries(system_use) {
        if &sig != b"NM" || body.is_empty() {
            continue;
        }
        if body[0] & (NM_CURRENT | NM_PARENT) != 0 {
            return None;
        }
        name.get_or_insert_with(Vec::new)
            .extend_from_slice(&body[1..]);
    }
    name.map(|n| String::from_utf8_lossy(&n).into_owned())
}

fn parse_joliet_name(raw: &[u8]) -> String {
    let name: String = char::decode_utf16(
        raw.chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]])),
    )
    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
    .collect();
    strip_version(&name).to_string()
}

/// Drops a ";1"-style version suffix.
fn strip_version(name: &str) -> &str {
    match name.rsplit_once(';') {
        Some((base, version)) if version.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

enum IsoString {
    StrA,
    File,
}

/// Reads an ISO9660 string.
fn parse_iso9660_string(buf: &mut Bytes, len: usize, kind: IsoString) -> Result<String> {
    // References:
    // https://wiki.osdev.org/ISO_9660#String_format
    // https://github.com/torvalds/linux/blob/ddf21bd8ab984ccaa924f090fc7f515bb6d51414/fs/isofs/dir.c#L17
    const FILE_CHARS: [u8; 17] = *b"!\"%&'()*+,-.:<=>?"; // full file chars set includes D-chars
    const A_CHARS: [u8; 2] = *b";/"; // full A-chars includes file chars set
    if len > buf.remaining() {
        bail!(FormatError(
            "incomplete string name; corrupt ISO?".into()
        ));
    }
    let mut s = String::with_capacity(len);
    let mut bytes = buf.copy_to_bytes(len);
    if matches!(kind, IsoString::File) {
        let stripped = strip_version_bytes(&bytes);
        bytes.truncate(stripped);
        if bytes.ends_with(b".") {
            bytes.truncate(bytes.len() - 1);
        }
    }
    for byte in &bytes {
        #[allow(clippy::if_same_then_else)] // I find it easier to follow this way
        if byte.is_ascii_alphabetic() || byte.is_ascii_digit() || *byte == b'_' || *byte == b' ' {
            s.push(char::from(*byte));
        } else if FILE_CHARS.contains(byte) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::StrA) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::File) {
            s.push('.'); // this matches what the kernel does
        } else if *byte == 0 {
            break;
        } else {
            // mastering tools aren't always strict about d-characters
            s.push(char::from(*byte).to_ascii_lowercase());
        }
    }
    if matches!(kind, IsoString::StrA) {
        s.truncate(s.trim_end_matches(' ').len());
    }
    Ok(s)
}

/// Length of a raw name without its version suffix.
fn strip_version_bytes(bytes: &[u8]) -> usize {
    match bytes.iter().rposition(|b| *b == b';') {
        Some(pos) if bytes[pos + 1..].iter().all(u8::is_ascii_digit) => pos,
        _ => bytes.len(),
    }
}

fn eat(buf: &mut Bytes, n: usize) -> &mut Bytes {
    buf.advance(n);
    buf
}
