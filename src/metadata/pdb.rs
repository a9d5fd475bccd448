//! Portable-PDB sequence points.
//!
//! A companion `.pdb` is itself an ECMA-335 metadata blob (no PE wrapper):
//! a `BSJB` root, stream headers, and a `#~`-shaped table stream carrying
//! the debug tables. Only two tables matter here: Document (0x30) for
//! source paths and MethodDebugInformation (0x31) for the per-method
//! sequence-point blobs (Portable PDB spec, "SequencePoints blob").
//! Rows of MethodDebugInformation parallel the MethodDef table of the
//! assembly, so callers index by MethodDef rid.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{CompileError, Result};

use super::model::{SequencePoint, HIDDEN_SEQUENCE_POINT_LINE};

const DOCUMENT_TABLE: usize = 0x30;
const METHOD_DEBUG_INFO_TABLE: usize = 0x31;

/// Parsed debug data for one assembly.
#[derive(Debug, Default)]
pub struct PdbData {
    /// Document names in row order.
    pub documents: Vec<String>,
    /// Sequence points per MethodDef row, in rid order.
    methods: Vec<Vec<SequencePoint>>,
}

impl PdbData {
    /// Sequence points for a 1-based MethodDef rid; empty when the method
    /// has no debug information.
    pub fn sequence_points_for(&self, rid: u32) -> Vec<SequencePoint> {
        self.methods
            .get(rid.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// `Foo.dll` -> `Foo.pdb` next to it.
pub fn companion_pdb_path(assembly: &Path) -> PathBuf {
    assembly.with_extension("pdb")
}

pub fn read_portable_pdb(path: &Path) -> Result<PdbData> {
    let bytes = fs::read(path)?;
    parse_portable_pdb(&bytes).map_err(|detail| CompileError::MetadataFormat {
        path: path.display().to_string(),
        detail,
    })
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| format!("truncated pdb at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// ECMA-335 II.23.2 compressed unsigned integer.
    fn compressed_u32(&mut self) -> std::result::Result<u32, String> {
        let first = self.u8()?;
        if first & 0x80 == 0 {
            Ok(u32::from(first))
        } else if first & 0xC0 == 0x80 {
            let second = self.u8()?;
            Ok((u32::from(first & 0x3F) << 8) | u32::from(second))
        } else if first & 0xE0 == 0xC0 {
            let (b2, b3, b4) = (self.u8()?, self.u8()?, self.u8()?);
            Ok((u32::from(first & 0x1F) << 24)
                | (u32::from(b2) << 16)
                | (u32::from(b3) << 8)
                | u32::from(b4))
        } else {
            Err(format!("bad compressed integer lead byte {first:#x}"))
        }
    }

    /// Compressed signed integer (sign bit rotated into the LSB).
    fn compressed_i32(&mut self) -> std::result::Result<i32, String> {
        let raw = self.compressed_u32()?;
        let value = (raw >> 1) as i32;
        if raw & 1 != 0 {
            Ok(-value - 1)
        } else {
            Ok(value)
        }
    }
}

struct Stream<'a> {
    name: String,
    bytes: &'a [u8],
}

fn parse_streams(bytes: &[u8]) -> std::result::Result<Vec<Stream<'_>>, String> {
    let mut reader = ByteReader::new(bytes);
    let signature = reader.u32()?;
    if signature != 0x424A_5342 {
        return Err(format!("bad metadata signature {signature:#x}"));
    }
    let _major = reader.u16()?;
    let _minor = reader.u16()?;
    let _reserved = reader.u32()?;
    let version_len = reader.u32()? as usize;
    reader.take(version_len)?;
    let _flags = reader.u16()?;
    let stream_count = reader.u16()?;

    let mut streams = Vec::with_capacity(stream_count as usize);
    for _ in 0..stream_count {
        let offset = reader.u32()? as usize;
        let size = reader.u32()? as usize;
        // Stream names are zero-padded to 4-byte boundaries.
        let mut name = String::new();
        loop {
            let chunk = reader.take(4)?;
            let end = chunk.iter().position(|&b| b == 0);
            match end {
                Some(i) => {
                    name.push_str(&String::from_utf8_lossy(&chunk[..i]));
                    break;
                }
                None => name.push_str(&String::from_utf8_lossy(chunk)),
            }
        }
        let slice = bytes
            .get(offset..offset + size)
            .ok_or_else(|| format!("stream '{name}' exceeds file size"))?;
        streams.push(Stream { name, bytes: slice });
    }
    Ok(streams)
}

fn parse_portable_pdb(bytes: &[u8]) -> std::result::Result<PdbData, String> {
    let streams = parse_streams(bytes)?;
    let tables = streams
        .iter()
        .find(|s| s.name == "#~" || s.name == "#-")
        .ok_or("pdb has no table stream")?;
    let blobs = streams
        .iter()
        .find(|s| s.name == "#Blob")
        .map(|s| s.bytes)
        .unwrap_or(&[]);

    let mut reader = ByteReader::new(tables.bytes);
    let _reserved = reader.u32()?;
    let _major = reader.u8()?;
    let _minor = reader.u8()?;
    let heap_sizes = reader.u8()?;
    let _rid_bits = reader.u8()?;
    let valid = reader.u64()?;
    let _sorted = reader.u64()?;

    let mut row_counts = [0u32; 64];
    for (table, count) in row_counts.iter_mut().enumerate() {
        if valid & (1u64 << table) != 0 {
            *count = reader.u32()?;
        }
    }

    let blob_index_wide = heap_sizes & 0x04 != 0;
    let guid_index_wide = heap_sizes & 0x02 != 0;
    let document_rows = row_counts[DOCUMENT_TABLE];
    let method_rows = row_counts[METHOD_DEBUG_INFO_TABLE];
    if method_rows == 0 {
        return Ok(PdbData::default());
    }
    if valid & ((1u64 << DOCUMENT_TABLE) - 1) != 0 {
        // Type-system tables ahead of the debug tables would shift our row
        // offsets; portable PDBs produced by the standard toolchain do not
        // carry them.
        return Err("unexpected type-system tables in pdb".to_string());
    }

    let blob_index = |r: &mut ByteReader<'_>| -> std::result::Result<u32, String> {
        if blob_index_wide {
            r.u32()
        } else {
            r.u16().map(u32::from)
        }
    };
    let guid_index_size = if guid_index_wide { 4 } else { 2 };
    let document_index_size: usize = if document_rows >= 0x10000 { 4 } else { 2 };

    // Document rows: Name (blob), HashAlgorithm (guid), Hash (blob),
    // Language (guid).
    let mut document_name_indices = Vec::with_capacity(document_rows as usize);
    for _ in 0..document_rows {
        document_name_indices.push(blob_index(&mut reader)?);
        reader.take(guid_index_size)?;
        blob_index(&mut reader)?;
        reader.take(guid_index_size)?;
    }

    // MethodDebugInformation rows: Document (rid), SequencePoints (blob).
    let mut method_rows_data = Vec::with_capacity(method_rows as usize);
    for _ in 0..method_rows {
        let document = match document_index_size {
            4 => reader.u32()?,
            _ => u32::from(reader.u16()?),
        };
        let points = blob_index(&mut reader)?;
        method_rows_data.push((document, points));
    }

    let documents: Vec<String> = document_name_indices
        .iter()
        .map(|&idx| read_document_name(blobs, idx).unwrap_or_default())
        .collect();

    let mut methods = Vec::with_capacity(method_rows as usize);
    for (document, points_blob) in method_rows_data {
        if points_blob == 0 {
            methods.push(Vec::new());
            continue;
        }
        let points = read_blob(blobs, points_blob)
            .and_then(|blob| decode_sequence_points(blob, document, &documents).ok());
        methods.push(points.unwrap_or_default());
    }

    debug!(
        "pdb: {} documents, {} method debug rows",
        documents.len(),
        methods.len()
    );
    Ok(PdbData { documents, methods })
}

fn read_blob(heap: &[u8], index: u32) -> Option<&[u8]> {
    let mut reader = ByteReader::at(heap, index as usize);
    let len = reader.compressed_u32().ok()? as usize;
    heap.get(reader.pos..reader.pos + len)
}

/// Document-name blob: a separator byte, then blob indices of the parts.
fn read_document_name(heap: &[u8], index: u32) -> Option<String> {
    let blob = read_blob(heap, index)?;
    let mut reader = ByteReader::new(blob);
    let separator = reader.u8().ok()? as char;
    let mut parts = Vec::new();
    while reader.pos < blob.len() {
        let part_index = reader.compressed_u32().ok()?;
        if part_index == 0 {
            parts.push(String::new());
        } else {
            let part = read_blob(heap, part_index)?;
            parts.push(String::from_utf8_lossy(part).into_owned());
        }
    }
    Some(parts.join(&separator.to_string()))
}

fn decode_sequence_points(
    blob: &[u8],
    document_rid: u32,
    documents: &[String],
) -> std::result::Result<Vec<SequencePoint>, String> {
    let mut reader = ByteReader::new(blob);
    let _local_signature = reader.compressed_u32()?;
    let mut current_document = document_rid;
    if current_document == 0 {
        current_document = reader.compressed_u32()?;
    }

    let document_name = |rid: u32| -> String {
        documents
            .get(rid.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    };

    let mut points = Vec::new();
    let mut il_offset: i64 = -1;
    let mut start_line: i64 = 0;
    let mut start_column: i64 = 0;
    let mut first_non_hidden = true;

    while reader.pos < blob.len() {
        let delta = reader.compressed_u32()?;
        if il_offset >= 0 && delta == 0 {
            // document-record: switch files mid-method.
            current_document = reader.compressed_u32()?;
            continue;
        }
        il_offset = if il_offset < 0 {
            i64::from(delta)
        } else {
            il_offset + i64::from(delta)
        };

        let delta_lines = reader.compressed_u32()?;
        let delta_columns = if delta_lines == 0 {
            i64::from(reader.compressed_u32()?)
        } else {
            i64::from(reader.compressed_i32()?)
        };

        if delta_lines == 0 && delta_columns == 0 {
            points.push(SequencePoint {
                source_file: document_name(current_document),
                start_line: HIDDEN_SEQUENCE_POINT_LINE,
                start_column: 0,
                end_line: HIDDEN_SEQUENCE_POINT_LINE,
                end_column: 0,
                il_offset: il_offset as u32,
            });
            continue;
        }

        if first_non_hidden {
            start_line = i64::from(reader.compressed_u32()?);
            start_column = i64::from(reader.compressed_u32()?);
            first_non_hidden = false;
        } else {
            start_line += i64::from(reader.compressed_i32()?);
            start_column += i64::from(reader.compressed_i32()?);
        }

        points.push(SequencePoint {
            source_file: document_name(current_document),
            start_line: start_line as u32,
            start_column: start_column as u32,
            end_line: (start_line + i64::from(delta_lines)) as u32,
            end_column: delta_columns.saturating_add(start_column) as u32,
            il_offset: il_offset as u32,
        });
    }
    Ok(points)
}
