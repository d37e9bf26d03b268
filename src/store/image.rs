//! Module image (PE) access
//!
//! Locates the CLI metadata of a module and, when present, the portable
//! symbol file embedded in its debug directory.

use std::io::Read;

use flate2::read::DeflateDecoder;
use object::pe::{
    ImageNtHeaders32, ImageNtHeaders64, IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR,
    IMAGE_DIRECTORY_ENTRY_DEBUG,
};
use object::read::pe::{ImageNtHeaders, PeFile};
use object::FileKind;

use crate::common::{Error, Result};

use super::metadata::Cursor;

/// Debug directory entry type of an embedded portable PDB
const DEBUG_TYPE_EMBEDDED_PORTABLE_PDB: u32 = 17;
/// `MPDB`
const EMBEDDED_PDB_SIGNATURE: u32 = 0x4244_504D;
const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;

/// Metadata and embedded symbols of one module image
pub struct ModuleImage<'data> {
    pub metadata: &'data [u8],
    pub embedded_pdb: Option<Vec<u8>>,
}

impl<'data> ModuleImage<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        match FileKind::parse(data).map_err(object_error)? {
            FileKind::Pe32 => read_image::<ImageNtHeaders32>(data),
            FileKind::Pe64 => read_image::<ImageNtHeaders64>(data),
            other => Err(Error::metadata(format!("not a PE image: {other:?}"))),
        }
    }
}

fn object_error(e: object::Error) -> Error {
    Error::metadata(e.to_string())
}

fn read_image<Pe: ImageNtHeaders>(data: &[u8]) -> Result<ModuleImage<'_>> {
    let pe = PeFile::<Pe>::parse(data).map_err(object_error)?;
    let sections = pe.section_table();

    let cli_dir = pe
        .data_directory(IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)
        .ok_or_else(|| Error::metadata("image has no CLI header"))?;
    let cli_header = cli_dir.data(data, &sections).map_err(object_error)?;

    // IMAGE_COR20_HEADER: cb, major, minor, then the metadata directory
    let mut cursor = Cursor::at(cli_header, 8);
    let metadata_rva = cursor.u32()?;
    let metadata_size = cursor.u32()? as usize;
    let metadata = sections
        .pe_data_at(data, metadata_rva)
        .and_then(|d| d.get(..metadata_size))
        .ok_or_else(|| Error::metadata("metadata outside of image sections"))?;

    let embedded_pdb = match pe.data_directory(IMAGE_DIRECTORY_ENTRY_DEBUG) {
        Some(dir) => embedded_pdb(data, dir.data(data, &sections).map_err(object_error)?)?,
        None => None,
    };

    Ok(ModuleImage {
        metadata,
        embedded_pdb,
    })
}

fn embedded_pdb(data: &[u8], directory: &[u8]) -> Result<Option<Vec<u8>>> {
    for entry in directory.chunks_exact(DEBUG_DIRECTORY_ENTRY_SIZE) {
        let mut cursor = Cursor::at(entry, 12);
        let kind = cursor.u32()?;
        let size = cursor.u32()? as usize;
        let _rva = cursor.u32()?;
        let pointer = cursor.u32()? as usize;
        if kind != DEBUG_TYPE_EMBEDDED_PORTABLE_PDB {
            continue;
        }

        let raw = data
            .get(pointer..pointer.saturating_add(size))
            .ok_or_else(|| Error::metadata("embedded PDB outside of image"))?;
        return inflate_embedded(raw).map(Some);
    }
    Ok(None)
}

/// Decompress an `MPDB` blob
pub(crate) fn inflate_embedded(raw: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(raw);
    if cursor.u32()? != EMBEDDED_PDB_SIGNATURE {
        return Err(Error::metadata("bad embedded PDB signature"));
    }
    let size = cursor.u32()? as usize;

    let mut pdb = Vec::with_capacity(size);
    DeflateDecoder::new(&raw[8..])
        .read_to_end(&mut pdb)
        .map_err(|e| Error::metadata(format!("embedded PDB: {e}")))?;
    if pdb.len() != size {
        return Err(Error::metadata("embedded PDB size mismatch"));
    }
    Ok(pdb)
}
