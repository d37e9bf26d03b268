//! Builds an [`AssemblyInfo`] from a module image and its symbols

use std::collections::HashMap;

use crate::common::{Error, Result};

use super::assembly::{AssemblyBuilder, AssemblyInfo, MethodDef, VarInfo};
use super::image::ModuleImage;
use super::metadata::{table, Metadata};
use super::pdb::{read_symbols, SymbolData};

const METHOD_DEF_TOKEN: u32 = 0x0600_0000;

/// Parse a module and its symbols
///
/// `symbols` is the side-car symbol file, if one was fetched. Without it the
/// symbols embedded in the image are used when `embedded` allows it.
pub fn read_assembly(
    url: &str,
    module: &[u8],
    symbols: Option<&[u8]>,
    embedded: bool,
) -> Result<AssemblyInfo> {
    let image = ModuleImage::parse(module)?;
    let metadata = Metadata::parse(image.metadata)?;

    let symbol_bytes = match (symbols, &image.embedded_pdb) {
        (Some(bytes), _) => bytes,
        (None, Some(bytes)) if embedded => bytes.as_slice(),
        _ => return Err(Error::metadata("no debug symbols available")),
    };
    let symbol_metadata = Metadata::parse(symbol_bytes)?;
    let symbols = read_symbols(&symbol_metadata)?;

    build(url, &metadata, symbols)
}

fn build(url: &str, md: &Metadata<'_>, mut symbols: SymbolData) -> Result<AssemblyInfo> {
    let name = md.row(table::MODULE, 1)?.string(1)?;
    let mut builder = AssemblyBuilder::new(name, url);

    for path in &symbols.documents {
        let doc = builder.add_document(path.clone());
        if let Some(uri) = symbols.source_link.as_ref().and_then(|sl| sl.resolve(path)) {
            builder.set_source_link(doc, uri);
        }
    }

    let type_count = md.row_count(table::TYPE_DEF);
    let method_count = md.row_count(table::METHOD_DEF);
    let param_count = md.row_count(table::PARAM);

    let mut enclosing = HashMap::new();
    for rid in 1..=md.row_count(table::NESTED_CLASS) {
        let row = md.row(table::NESTED_CLASS, rid)?;
        enclosing.insert(row.get(0), row.get(1));
    }

    for rid in 1..=type_count {
        let row = md.row(table::TYPE_DEF, rid)?;
        let first = row.get(5);
        let end = if rid < type_count {
            md.row(table::TYPE_DEF, rid + 1)?.get(5)
        } else {
            method_count + 1
        };

        let ty = builder.add_type(type_name(md, &enclosing, rid)?);
        for method_rid in first..end.max(first) {
            let mut method = read_method(md, method_rid, method_count, param_count)?;
            if let Some(debug) = symbols.methods.remove(&method_rid) {
                method.sequence_points = debug.sequence_points;
                method.scopes = debug.scopes;
            }
            builder.add_method(ty, method);
        }
    }

    Ok(builder.build())
}

/// `Namespace.Name`, with nested types as `Outer/Inner`
fn type_name(md: &Metadata<'_>, enclosing: &HashMap<u32, u32>, rid: u32) -> Result<String> {
    let mut parts = Vec::new();
    let mut current = rid;
    loop {
        let row = md.row(table::TYPE_DEF, current)?;
        let name = row.string(1)?;
        match enclosing.get(&current) {
            Some(&outer) if parts.len() < 64 => {
                parts.push(name.to_string());
                current = outer;
            }
            _ => {
                let namespace = row.string(2)?;
                parts.push(if namespace.is_empty() {
                    name.to_string()
                } else {
                    format!("{namespace}.{name}")
                });
                break;
            }
        }
    }
    parts.reverse();
    Ok(parts.join("/"))
}

fn read_method(md: &Metadata<'_>, rid: u32, method_count: u32, param_count: u32) -> Result<MethodDef> {
    let row = md.row(table::METHOD_DEF, rid)?;
    let first = row.get(5);
    let end = if rid < method_count {
        md.row(table::METHOD_DEF, rid + 1)?.get(5)
    } else {
        param_count + 1
    };

    let mut method = MethodDef::new(METHOD_DEF_TOKEN | rid, row.string(3)?);
    for param_rid in first..end.max(first) {
        let param = md.row(table::PARAM, param_rid)?;
        let sequence = param.get(1);
        // Sequence 0 describes the return value
        if sequence == 0 {
            continue;
        }
        method.parameters.push(VarInfo {
            name: param.string(2)?.to_string(),
            index: -(sequence as i32),
        });
    }
    Ok(method)
}
