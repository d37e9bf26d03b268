//! ECMA-335 metadata reader
//!
//! Reads the metadata root, its heaps and the compressed (`#~`) table
//! stream. The same reader serves both module images and portable symbol
//! files: a symbol file carries an extra `#Pdb` stream that supplies the row
//! counts of the type-system tables it references.

use crate::common::{Error, Result};

const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Table numbers used by the proxy
pub mod table {
    pub const MODULE: usize = 0x00;
    pub const TYPE_REF: usize = 0x01;
    pub const TYPE_DEF: usize = 0x02;
    pub const FIELD: usize = 0x04;
    pub const METHOD_DEF: usize = 0x06;
    pub const PARAM: usize = 0x08;
    pub const INTERFACE_IMPL: usize = 0x09;
    pub const MEMBER_REF: usize = 0x0A;
    pub const DECL_SECURITY: usize = 0x0E;
    pub const STAND_ALONE_SIG: usize = 0x11;
    pub const EVENT: usize = 0x14;
    pub const PROPERTY: usize = 0x17;
    pub const MODULE_REF: usize = 0x1A;
    pub const TYPE_SPEC: usize = 0x1B;
    pub const ASSEMBLY: usize = 0x20;
    pub const ASSEMBLY_REF: usize = 0x23;
    pub const FILE: usize = 0x26;
    pub const EXPORTED_TYPE: usize = 0x27;
    pub const MANIFEST_RESOURCE: usize = 0x28;
    pub const NESTED_CLASS: usize = 0x29;
    pub const GENERIC_PARAM: usize = 0x2A;
    pub const METHOD_SPEC: usize = 0x2B;
    pub const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

    pub const DOCUMENT: usize = 0x30;
    pub const METHOD_DEBUG_INFORMATION: usize = 0x31;
    pub const LOCAL_SCOPE: usize = 0x32;
    pub const LOCAL_VARIABLE: usize = 0x33;
    pub const LOCAL_CONSTANT: usize = 0x34;
    pub const IMPORT_SCOPE: usize = 0x35;
    pub const STATE_MACHINE_METHOD: usize = 0x36;
    pub const CUSTOM_DEBUG_INFORMATION: usize = 0x37;
}

use table::*;

/// Coded index kinds (II.24.2.6)
#[derive(Debug, Clone, Copy)]
enum Coded {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
    HasCustomDebugInformation,
}

impl Coded {
    fn tag_bits(self) -> u32 {
        match self {
            Coded::HasFieldMarshal
            | Coded::HasSemantics
            | Coded::MethodDefOrRef
            | Coded::MemberForwarded
            | Coded::TypeOrMethodDef => 1,
            Coded::TypeDefOrRef
            | Coded::HasConstant
            | Coded::HasDeclSecurity
            | Coded::Implementation
            | Coded::ResolutionScope => 2,
            Coded::MemberRefParent | Coded::CustomAttributeType => 3,
            Coded::HasCustomAttribute | Coded::HasCustomDebugInformation => 5,
        }
    }

    fn tables(self) -> &'static [usize] {
        match self {
            Coded::TypeDefOrRef => &[TYPE_DEF, TYPE_REF, TYPE_SPEC],
            Coded::HasConstant => &[FIELD, PARAM, PROPERTY],
            Coded::HasCustomAttribute => &[
                METHOD_DEF, FIELD, TYPE_REF, TYPE_DEF, PARAM, INTERFACE_IMPL, MEMBER_REF, MODULE,
                DECL_SECURITY, PROPERTY, EVENT, STAND_ALONE_SIG, MODULE_REF, TYPE_SPEC, ASSEMBLY,
                ASSEMBLY_REF, FILE, EXPORTED_TYPE, MANIFEST_RESOURCE, GENERIC_PARAM,
                GENERIC_PARAM_CONSTRAINT, METHOD_SPEC,
            ],
            Coded::HasFieldMarshal => &[FIELD, PARAM],
            Coded::HasDeclSecurity => &[TYPE_DEF, METHOD_DEF, ASSEMBLY],
            Coded::MemberRefParent => &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC],
            Coded::HasSemantics => &[EVENT, PROPERTY],
            Coded::MethodDefOrRef => &[METHOD_DEF, MEMBER_REF],
            Coded::MemberForwarded => &[FIELD, METHOD_DEF],
            Coded::Implementation => &[FILE, ASSEMBLY_REF, EXPORTED_TYPE],
            Coded::CustomAttributeType => &[METHOD_DEF, MEMBER_REF],
            Coded::ResolutionScope => &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF],
            Coded::TypeOrMethodDef => &[TYPE_DEF, METHOD_DEF],
            Coded::HasCustomDebugInformation => &[
                METHOD_DEF, FIELD, TYPE_REF, TYPE_DEF, PARAM, INTERFACE_IMPL, MEMBER_REF, MODULE,
                DECL_SECURITY, PROPERTY, EVENT, STAND_ALONE_SIG, MODULE_REF, TYPE_SPEC, ASSEMBLY,
                ASSEMBLY_REF, FILE, EXPORTED_TYPE, MANIFEST_RESOURCE, GENERIC_PARAM,
                GENERIC_PARAM_CONSTRAINT, METHOD_SPEC, DOCUMENT, LOCAL_SCOPE, LOCAL_VARIABLE,
                LOCAL_CONSTANT, IMPORT_SCOPE,
            ],
        }
    }
}

/// Column types of a table row
#[derive(Debug, Clone, Copy)]
enum Col {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Index(usize),
    CodedIndex(Coded),
}

use Col::*;

/// Row layout of every table that may appear in a module or symbol file
fn schema(table: usize) -> &'static [Col] {
    match table {
        0x00 => &[U16, Str, Guid, Guid, Guid],
        0x01 => &[CodedIndex(Coded::ResolutionScope), Str, Str],
        0x02 => &[
            U32,
            Str,
            Str,
            CodedIndex(Coded::TypeDefOrRef),
            Index(FIELD),
            Index(METHOD_DEF),
        ],
        0x03 => &[Index(FIELD)],
        0x04 => &[U16, Str, Blob],
        0x05 => &[Index(METHOD_DEF)],
        0x06 => &[U32, U16, U16, Str, Blob, Index(PARAM)],
        0x07 => &[Index(PARAM)],
        0x08 => &[U16, U16, Str],
        0x09 => &[Index(TYPE_DEF), CodedIndex(Coded::TypeDefOrRef)],
        0x0A => &[CodedIndex(Coded::MemberRefParent), Str, Blob],
        0x0B => &[U16, CodedIndex(Coded::HasConstant), Blob],
        0x0C => &[
            CodedIndex(Coded::HasCustomAttribute),
            CodedIndex(Coded::CustomAttributeType),
            Blob,
        ],
        0x0D => &[CodedIndex(Coded::HasFieldMarshal), Blob],
        0x0E => &[U16, CodedIndex(Coded::HasDeclSecurity), Blob],
        0x0F => &[U16, U32, Index(TYPE_DEF)],
        0x10 => &[U32, Index(FIELD)],
        0x11 => &[Blob],
        0x12 => &[Index(TYPE_DEF), Index(EVENT)],
        0x13 => &[Index(EVENT)],
        0x14 => &[U16, Str, CodedIndex(Coded::TypeDefOrRef)],
        0x15 => &[Index(TYPE_DEF), Index(PROPERTY)],
        0x16 => &[Index(PROPERTY)],
        0x17 => &[U16, Str, Blob],
        0x18 => &[U16, Index(METHOD_DEF), CodedIndex(Coded::HasSemantics)],
        0x19 => &[
            Index(TYPE_DEF),
            CodedIndex(Coded::MethodDefOrRef),
            CodedIndex(Coded::MethodDefOrRef),
        ],
        0x1A => &[Str],
        0x1B => &[Blob],
        0x1C => &[U16, CodedIndex(Coded::MemberForwarded), Str, Index(MODULE_REF)],
        0x1D => &[U32, Index(FIELD)],
        0x1E => &[U32, U32],
        0x1F => &[U32],
        0x20 => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        0x21 => &[U32],
        0x22 => &[U32, U32, U32],
        0x23 => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        0x24 => &[U32, Index(ASSEMBLY_REF)],
        0x25 => &[U32, U32, U32, Index(ASSEMBLY_REF)],
        0x26 => &[U32, Str, Blob],
        0x27 => &[U32, U32, Str, Str, CodedIndex(Coded::Implementation)],
        0x28 => &[U32, U32, Str, CodedIndex(Coded::Implementation)],
        0x29 => &[Index(TYPE_DEF), Index(TYPE_DEF)],
        0x2A => &[U16, U16, CodedIndex(Coded::TypeOrMethodDef), Str],
        0x2B => &[CodedIndex(Coded::MethodDefOrRef), Blob],
        0x2C => &[Index(GENERIC_PARAM), CodedIndex(Coded::TypeDefOrRef)],
        0x30 => &[Blob, Guid, Blob, Guid],
        0x31 => &[Index(DOCUMENT), Blob],
        0x32 => &[
            Index(METHOD_DEF),
            Index(IMPORT_SCOPE),
            Index(LOCAL_VARIABLE),
            Index(LOCAL_CONSTANT),
            U32,
            U32,
        ],
        0x33 => &[U16, U16, Str],
        0x34 => &[Str, Blob],
        0x35 => &[Index(IMPORT_SCOPE), Blob],
        0x36 => &[Index(METHOD_DEF), Index(METHOD_DEF)],
        0x37 => &[CodedIndex(Coded::HasCustomDebugInformation), Guid, Blob],
        _ => &[],
    }
}

/// Little-endian cursor over a byte slice
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::metadata("unexpected end of data"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    /// Compressed unsigned integer (II.23.2)
    pub(crate) fn compressed_u32(&mut self) -> Result<u32> {
        let first = self.u8()? as u32;
        if first & 0x80 == 0 {
            Ok(first)
        } else if first & 0xC0 == 0x80 {
            let second = self.u8()? as u32;
            Ok(((first & 0x3F) << 8) | second)
        } else if first & 0xE0 == 0xC0 {
            let rest = self.bytes(3)?;
            Ok(((first & 0x1F) << 24)
                | ((rest[0] as u32) << 16)
                | ((rest[1] as u32) << 8)
                | rest[2] as u32)
        } else {
            Err(Error::metadata(format!(
                "invalid compressed integer prefix 0x{first:02x}"
            )))
        }
    }

    /// Compressed signed integer; the sign bit is rotated into the lowest bit
    pub(crate) fn compressed_i32(&mut self) -> Result<i32> {
        let first = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::metadata("unexpected end of data"))?;
        let raw = self.compressed_u32()?;
        let negative = raw & 1 != 0;
        let value = (raw >> 1) as i32;
        if !negative {
            return Ok(value);
        }
        let bias = if first & 0x80 == 0 {
            0x40
        } else if first & 0xC0 == 0x80 {
            0x2000
        } else {
            0x1000_0000
        };
        Ok(value - bias)
    }
}

/// Row counts and row data of one table
#[derive(Debug, Default, Clone)]
struct Table<'a> {
    rows: u32,
    row_size: usize,
    /// `(offset, width)` of each column
    columns: Vec<(usize, usize)>,
    data: &'a [u8],
}

/// Header of the `#Pdb` stream
#[derive(Debug, Clone)]
pub struct PdbStream {
    pub id: [u8; 20],
    pub entry_point: u32,
    type_system_rows: [u32; 64],
}

/// Parsed metadata with borrowed heaps
pub struct Metadata<'a> {
    strings: &'a [u8],
    blobs: &'a [u8],
    guids: &'a [u8],
    tables: Vec<Table<'a>>,
    pdb: Option<PdbStream>,
}

impl<'a> Metadata<'a> {
    /// Parse a metadata root
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut root = Cursor::new(data);
        if root.u32()? != METADATA_SIGNATURE {
            return Err(Error::metadata("bad metadata signature"));
        }
        root.skip(8)?; // major, minor, reserved
        let version_len = root.u32()? as usize;
        root.skip(version_len)?;
        root.skip(2)?; // flags
        let stream_count = root.u16()?;

        let mut tables_stream = None;
        let mut strings: &[u8] = &[];
        let mut blobs: &[u8] = &[];
        let mut guids: &[u8] = &[];
        let mut pdb = None;

        for _ in 0..stream_count {
            let offset = root.u32()? as usize;
            let size = root.u32()? as usize;
            let name_start = root.position();
            let mut name_len = 0;
            while root.u8()? != 0 {
                name_len += 1;
            }
            let name = &data[name_start..name_start + name_len];
            // Names are padded to a four byte boundary
            let consumed = root.position() - name_start;
            root.skip((4 - consumed % 4) % 4)?;

            let stream = data
                .get(offset..offset.saturating_add(size))
                .ok_or_else(|| Error::metadata("stream outside metadata"))?;
            match name {
                b"#~" | b"#-" => tables_stream = Some(stream),
                b"#Strings" => strings = stream,
                b"#Blob" => blobs = stream,
                b"#GUID" => guids = stream,
                b"#Pdb" => pdb = Some(parse_pdb_stream(stream)?),
                _ => {}
            }
        }

        let tables_stream =
            tables_stream.ok_or_else(|| Error::metadata("missing table stream"))?;
        let tables = parse_tables(tables_stream, pdb.as_ref())?;

        Ok(Self {
            strings,
            blobs,
            guids,
            tables,
            pdb,
        })
    }

    /// The `#Pdb` stream of a symbol file
    pub fn pdb_stream(&self) -> Option<&PdbStream> {
        self.pdb.as_ref()
    }

    /// Number of rows in a table
    pub fn row_count(&self, table: usize) -> u32 {
        self.tables.get(table).map(|t| t.rows).unwrap_or(0)
    }

    /// Row `rid` (1-based) of a table
    pub fn row(&self, table: usize, rid: u32) -> Result<Row<'_, 'a>> {
        let t = self
            .tables
            .get(table)
            .filter(|t| rid >= 1 && rid <= t.rows)
            .ok_or_else(|| {
                Error::metadata(format!("row {rid} out of range in table 0x{table:02x}"))
            })?;
        let start = (rid as usize - 1) * t.row_size;
        Ok(Row {
            metadata: self,
            table: t,
            data: &t.data[start..start + t.row_size],
        })
    }

    /// Null-terminated string from the `#Strings` heap
    pub fn string(&self, index: u32) -> Result<&'a str> {
        let start = index as usize;
        let rest = self
            .strings
            .get(start..)
            .ok_or_else(|| Error::metadata("string index out of range"))?;
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        std::str::from_utf8(&rest[..end]).map_err(|e| Error::metadata(e.to_string()))
    }

    /// Blob from the `#Blob` heap, without its length prefix
    pub fn blob(&self, index: u32) -> Result<&'a [u8]> {
        let mut cursor = Cursor::at(self.blobs, index as usize);
        if cursor.is_empty() {
            return Ok(&[]);
        }
        let len = cursor.compressed_u32()? as usize;
        cursor.bytes(len)
    }

    /// GUID from the `#GUID` heap; index 0 is the nil GUID
    pub fn guid(&self, index: u32) -> Result<[u8; 16]> {
        if index == 0 {
            return Ok([0; 16]);
        }
        let start = (index as usize - 1) * 16;
        let bytes = self
            .guids
            .get(start..start + 16)
            .ok_or_else(|| Error::metadata("guid index out of range"))?;
        let mut guid = [0; 16];
        guid.copy_from_slice(bytes);
        Ok(guid)
    }
}

/// One table row
pub struct Row<'m, 'a> {
    metadata: &'m Metadata<'a>,
    table: &'m Table<'a>,
    data: &'m [u8],
}

impl<'m, 'a> Row<'m, 'a> {
    /// Raw value of a column, widened to u32
    pub fn get(&self, column: usize) -> u32 {
        let Some(&(offset, width)) = self.table.columns.get(column) else {
            return 0;
        };
        let b = &self.data[offset..offset + width];
        match width {
            2 => u16::from_le_bytes([b[0], b[1]]) as u32,
            _ => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        }
    }

    pub fn string(&self, column: usize) -> Result<&'a str> {
        self.metadata.string(self.get(column))
    }

    pub fn blob(&self, column: usize) -> Result<&'a [u8]> {
        self.metadata.blob(self.get(column))
    }

    pub fn guid(&self, column: usize) -> Result<[u8; 16]> {
        self.metadata.guid(self.get(column))
    }
}

fn parse_pdb_stream(stream: &[u8]) -> Result<PdbStream> {
    let mut cursor = Cursor::new(stream);
    let mut id = [0; 20];
    id.copy_from_slice(cursor.bytes(20)?);
    let entry_point = cursor.u32()?;
    let referenced = cursor.u64()?;

    let mut type_system_rows = [0; 64];
    for (table, rows) in type_system_rows.iter_mut().enumerate() {
        if referenced & (1 << table) != 0 {
            *rows = cursor.u32()?;
        }
    }

    Ok(PdbStream {
        id,
        entry_point,
        type_system_rows,
    })
}

fn parse_tables<'a>(stream: &'a [u8], pdb: Option<&PdbStream>) -> Result<Vec<Table<'a>>> {
    let mut cursor = Cursor::new(stream);
    cursor.skip(4)?; // reserved
    cursor.skip(2)?; // major, minor
    let heap_sizes = cursor.u8()?;
    cursor.skip(1)?; // reserved
    let valid = cursor.u64()?;
    let _sorted = cursor.u64()?;

    let mut rows = pdb.map(|p| p.type_system_rows).unwrap_or([0; 64]);
    for (table, count) in rows.iter_mut().enumerate() {
        if valid & (1 << table) != 0 {
            *count = cursor.u32()?;
        }
    }
    if heap_sizes & 0x40 != 0 {
        cursor.skip(4)?;
    }

    let string_width = if heap_sizes & 0x01 != 0 { 4 } else { 2 };
    let guid_width = if heap_sizes & 0x02 != 0 { 4 } else { 2 };
    let blob_width = if heap_sizes & 0x04 != 0 { 4 } else { 2 };

    let column_width = |col: Col| -> usize {
        match col {
            U16 => 2,
            U32 => 4,
            Str => string_width,
            Guid => guid_width,
            Blob => blob_width,
            Index(target) => {
                if rows[target] < 0x1_0000 {
                    2
                } else {
                    4
                }
            }
            CodedIndex(kind) => {
                let max = kind.tables().iter().map(|&t| rows[t]).max().unwrap_or(0);
                if max < (1 << (16 - kind.tag_bits())) {
                    2
                } else {
                    4
                }
            }
        }
    };

    let mut tables = vec![Table::default(); 64];
    for (number, table) in tables.iter_mut().enumerate() {
        if valid & (1 << number) == 0 {
            continue;
        }
        let cols = schema(number);
        if cols.is_empty() {
            return Err(Error::metadata(format!("unknown table 0x{number:02x}")));
        }

        let mut offset = 0;
        let columns = cols
            .iter()
            .map(|&col| {
                let width = column_width(col);
                let entry = (offset, width);
                offset += width;
                entry
            })
            .collect();

        let size = offset * rows[number] as usize;
        *table = Table {
            rows: rows[number],
            row_size: offset,
            columns,
            data: cursor.bytes(size)?,
        };
    }

    Ok(tables)
}
