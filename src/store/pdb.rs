//! Portable PDB decoding
//!
//! Decodes the debug tables of a portable symbol file: documents, sequence
//! points, local scopes and the Source Link map.

use std::collections::HashMap;

use serde::Deserialize;

use crate::common::{Error, Result};

use super::assembly::{LocalScope, LocalVariable, SequencePoint, HIDDEN_LINE};
use super::metadata::{table, Cursor, Metadata};

/// Kind GUID of the Source Link custom debug information
/// `{CC110556-A091-4D38-9FEC-25AB9A351A6A}`
const SOURCE_LINK_KIND: [u8; 16] = [
    0x56, 0x05, 0x11, 0xCC, 0x91, 0xA0, 0x38, 0x4D, 0x9F, 0xEC, 0x25, 0xAB, 0x9A, 0x35, 0x1A, 0x6A,
];

/// Debug information of one method
#[derive(Debug, Default, Clone)]
pub struct MethodDebugInfo {
    pub sequence_points: Vec<SequencePoint>,
    pub scopes: Vec<LocalScope>,
}

/// Everything the store needs from a symbol file
#[derive(Debug, Default)]
pub struct SymbolData {
    /// Document paths, by document index
    pub documents: Vec<String>,
    /// Debug info keyed by MethodDef row
    pub methods: HashMap<u32, MethodDebugInfo>,
    pub source_link: Option<SourceLink>,
}

/// Read the debug tables of a portable symbol file
pub fn read_symbols(md: &Metadata<'_>) -> Result<SymbolData> {
    if md.pdb_stream().is_none() {
        return Err(Error::metadata("not a portable PDB: missing #Pdb stream"));
    }

    let mut documents = Vec::with_capacity(md.row_count(table::DOCUMENT) as usize);
    for rid in 1..=md.row_count(table::DOCUMENT) {
        let row = md.row(table::DOCUMENT, rid)?;
        documents.push(document_name(md, row.blob(0)?)?);
    }

    let mut methods: HashMap<u32, MethodDebugInfo> = HashMap::new();
    for rid in 1..=md.row_count(table::METHOD_DEBUG_INFORMATION) {
        let row = md.row(table::METHOD_DEBUG_INFORMATION, rid)?;
        let blob = row.blob(1)?;
        if blob.is_empty() {
            continue;
        }
        let points = sequence_points(blob, row.get(0))?;
        methods.entry(rid).or_default().sequence_points = points;
    }

    let scope_rows = md.row_count(table::LOCAL_SCOPE);
    let variable_rows = md.row_count(table::LOCAL_VARIABLE);
    for rid in 1..=scope_rows {
        let row = md.row(table::LOCAL_SCOPE, rid)?;
        let method = row.get(0);
        let first = row.get(2);
        let end = if rid < scope_rows {
            md.row(table::LOCAL_SCOPE, rid + 1)?.get(2)
        } else {
            variable_rows + 1
        };
        let start_offset = row.get(4);
        let length = row.get(5);

        let mut locals = Vec::new();
        for var in first..end.max(first) {
            let v = md.row(table::LOCAL_VARIABLE, var)?;
            locals.push(LocalVariable {
                hidden: v.get(0) & 0x1 != 0,
                index: v.get(1),
                name: v.string(2)?.to_string(),
            });
        }

        methods.entry(method).or_default().scopes.push(LocalScope {
            start_offset,
            end_offset: start_offset
                .checked_add(length)
                .ok_or_else(|| Error::metadata("local scope extends past the IL range"))?,
            locals,
        });
    }

    let mut source_link = None;
    for rid in 1..=md.row_count(table::CUSTOM_DEBUG_INFORMATION) {
        let row = md.row(table::CUSTOM_DEBUG_INFORMATION, rid)?;
        if row.guid(1)? == SOURCE_LINK_KIND {
            source_link = Some(SourceLink::parse(row.blob(2)?)?);
            break;
        }
    }

    Ok(SymbolData {
        documents,
        methods,
        source_link,
    })
}

/// Decode a document name blob: a separator followed by blob-heap parts
fn document_name(md: &Metadata<'_>, blob: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(blob);
    if cursor.is_empty() {
        return Ok(String::new());
    }
    let separator = cursor.u8()?;

    let mut parts = Vec::new();
    while !cursor.is_empty() {
        let part = cursor.compressed_u32()?;
        let bytes = md.blob(part)?;
        parts.push(String::from_utf8_lossy(bytes).into_owned());
    }

    if separator == 0 {
        Ok(parts.concat())
    } else {
        Ok(parts.join(&(separator as char).to_string()))
    }
}

/// Decode a sequence point blob
///
/// `document` is the MethodDebugInformation document row, 0 when the blob
/// names its initial document itself. Returned points use 0-based document
/// indices.
pub fn sequence_points(blob: &[u8], document: u32) -> Result<Vec<SequencePoint>> {
    let mut cursor = Cursor::new(blob);
    let _local_signature = cursor.compressed_u32()?;
    let mut document = if document == 0 {
        cursor.compressed_u32()?
    } else {
        document
    };

    let mut points = Vec::new();
    let mut offset = 0u32;
    let mut previous: Option<(u32, u32)> = None;
    let mut first = true;

    while !cursor.is_empty() {
        let delta_offset = cursor.compressed_u32()?;
        if delta_offset == 0 && !first {
            document = cursor.compressed_u32()?;
            continue;
        }
        offset = if first {
            delta_offset
        } else {
            offset
                .checked_add(delta_offset)
                .ok_or_else(|| Error::metadata("sequence point IL offset out of range"))?
        };
        first = false;

        let delta_lines = cursor.compressed_u32()?;
        let delta_columns = if delta_lines == 0 {
            cursor.compressed_u32()? as i64
        } else {
            cursor.compressed_i32()? as i64
        };

        let doc_index = document
            .checked_sub(1)
            .ok_or_else(|| Error::metadata("sequence point without a document"))?;

        if delta_lines == 0 && delta_columns == 0 {
            points.push(SequencePoint::hidden(offset, doc_index));
            continue;
        }

        let (start_line, start_column) = match previous {
            None => (cursor.compressed_u32()?, cursor.compressed_u32()?),
            Some((line, column)) => {
                let line = line as i64 + cursor.compressed_i32()? as i64;
                let column = column as i64 + cursor.compressed_i32()? as i64;
                (to_u32(line)?, to_u32(column)?)
            }
        };
        previous = Some((start_line, start_column));

        let end_line = start_line
            .checked_add(delta_lines)
            .ok_or_else(|| Error::metadata("sequence point line out of range"))?;
        let end_column = to_u32(start_column as i64 + delta_columns)?;
        if start_line >= HIDDEN_LINE {
            return Err(Error::metadata("sequence point line out of range"));
        }

        points.push(SequencePoint::new(
            offset,
            doc_index,
            (start_line, start_column),
            (end_line, end_column),
        ));
    }

    Ok(points)
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::metadata("sequence point coordinate out of range"))
}

/// Source Link map from local document paths to download urls
#[derive(Debug, Clone, Deserialize)]
pub struct SourceLink {
    documents: HashMap<String, String>,
}

impl SourceLink {
    pub fn parse(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).map_err(|e| Error::metadata(format!("Source Link: {e}")))
    }

    /// Url of a document, preferring the longest matching pattern
    pub fn resolve(&self, path: &str) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        for (pattern, target) in &self.documents {
            let candidate = match pattern.strip_suffix('*') {
                Some(prefix) => path.strip_prefix(prefix).map(|rest| {
                    (prefix.len(), target.replacen('*', &rest.replace('\\', "/"), 1))
                }),
                None if pattern == path => Some((pattern.len(), target.clone())),
                None => None,
            };
            if let Some((len, url)) = candidate {
                if best.as_ref().map_or(true, |(l, _)| len > *l) {
                    best = Some((len, url));
                }
            }
        }
        best.map(|(_, url)| url)
    }
}
