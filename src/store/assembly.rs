//! Indexed assemblies, documents and methods
//!
//! Everything here is immutable once built. [`AssemblyBuilder`] is the only
//! way to create an [`AssemblyInfo`]; the symbol reader feeds it from module
//! metadata and tests feed it directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::location::{SourceId, SourceLocation, SCHEME};

static NEXT_ASSEMBLY_ID: AtomicU32 = AtomicU32::new(1);

/// Line number marking a hidden sequence point
pub const HIDDEN_LINE: u32 = 0xfeefee;

/// Offset to 1-based source span mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoint {
    pub offset: u32,
    /// Index of the document in its assembly
    pub document: u32,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SequencePoint {
    pub fn new(
        offset: u32,
        document: u32,
        (start_line, start_column): (u32, u32),
        (end_line, end_column): (u32, u32),
    ) -> Self {
        Self {
            offset,
            document,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    pub fn hidden(offset: u32, document: u32) -> Self {
        Self::new(offset, document, (HIDDEN_LINE, 0), (HIDDEN_LINE, 0))
    }

    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }
}

/// A variable the sandbox can be asked about
///
/// Parameters use negative indices, locals their slot number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub index: i32,
}

#[derive(Debug, Clone)]
pub struct LocalVariable {
    pub name: String,
    pub index: u32,
    pub hidden: bool,
}

/// IL range in which a set of locals is live
#[derive(Debug, Clone)]
pub struct LocalScope {
    pub start_offset: u32,
    pub end_offset: u32,
    pub locals: Vec<LocalVariable>,
}

#[derive(Debug)]
pub struct MethodInfo {
    pub token: u32,
    pub name: String,
    pub type_name: String,
    pub assembly_id: u32,
    pub assembly_name: String,
    /// Document holding the method's first sequence point
    pub source: Option<SourceId>,
    pub sequence_points: Vec<SequencePoint>,
    pub start: Option<SourceLocation>,
    pub end: Option<SourceLocation>,
    pub parameters: Vec<VarInfo>,
    pub scopes: Vec<LocalScope>,
}

impl MethodInfo {
    /// Row number of the method in the MethodDef table
    pub fn rid(&self) -> u32 {
        self.token & 0x00ff_ffff
    }

    pub fn visible_points(&self) -> impl Iterator<Item = &SequencePoint> {
        self.sequence_points.iter().filter(|sp| !sp.is_hidden())
    }

    /// Source location of the last visible point at or before `offset`
    pub fn location_by_il(&self, offset: u32) -> Option<SourceLocation> {
        self.visible_points()
            .filter(|sp| sp.offset <= offset)
            .last()
            .map(|sp| SourceLocation::at_point(self, sp))
    }

    /// Parameters plus the locals whose scope covers `offset`
    pub fn live_vars_at(&self, offset: u32) -> Vec<VarInfo> {
        let locals = self
            .scopes
            .iter()
            .filter(|s| s.start_offset <= offset && (s.end_offset > offset || s.end_offset == 0))
            .flat_map(|s| s.locals.iter())
            .filter(|l| !l.hidden)
            .map(|l| VarInfo {
                name: l.name.clone(),
                index: l.index as i32,
            });

        self.parameters.iter().cloned().chain(locals).collect()
    }
}

/// One source document of an assembly
#[derive(Debug)]
pub struct SourceFile {
    pub id: SourceId,
    pub assembly_name: String,
    /// Path as recorded in the symbol file
    pub doc_url: String,
    /// Path with forward slashes and no drive colon
    pub debugger_file_name: String,
    /// `file://` url when the document exists locally, the `dotnet://` url otherwise
    pub url: String,
    pub dotnet_url: String,
    pub source_link_uri: Option<String>,
    pub methods: Vec<Arc<MethodInfo>>,
}

impl SourceFile {
    /// Local path of the document, if it was found on disk
    pub fn local_path(&self) -> Option<PathBuf> {
        url::Url::parse(&self.url)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
    }
}

#[derive(Debug)]
pub struct TypeInfo {
    /// `Namespace.Name`, nested types as `Outer/Inner`
    pub full_name: String,
    pub methods: Vec<Arc<MethodInfo>>,
}

impl TypeInfo {
    pub fn method(&self, name: &str) -> Option<&Arc<MethodInfo>> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// One loaded module with its symbols
#[derive(Debug)]
pub struct AssemblyInfo {
    /// Process-unique id used in [`SourceId`]s
    pub id: u32,
    pub name: String,
    pub url: String,
    pub sources: Vec<Arc<SourceFile>>,
    pub types: Vec<TypeInfo>,
    methods: HashMap<u32, Arc<MethodInfo>>,
}

impl AssemblyInfo {
    /// Look a method up by metadata token
    pub fn method_by_token(&self, token: u32) -> Option<&Arc<MethodInfo>> {
        self.methods.get(&(token & 0x00ff_ffff))
    }

    pub fn type_by_name(&self, full_name: &str) -> Option<&TypeInfo> {
        self.types.iter().find(|t| t.full_name == full_name)
    }

    pub fn source(&self, document: u32) -> Option<&Arc<SourceFile>> {
        self.sources.get(document as usize)
    }
}

/// A method as read from metadata, before indexing
#[derive(Debug, Clone, Default)]
pub struct MethodDef {
    pub token: u32,
    pub name: String,
    pub sequence_points: Vec<SequencePoint>,
    pub parameters: Vec<VarInfo>,
    pub scopes: Vec<LocalScope>,
}

impl MethodDef {
    pub fn new(token: u32, name: impl Into<String>) -> Self {
        Self {
            token,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_points(mut self, points: Vec<SequencePoint>) -> Self {
        self.sequence_points = points;
        self
    }
}

struct DocumentDef {
    path: String,
    source_link: Option<String>,
}

struct TypeDef {
    full_name: String,
    methods: Vec<MethodDef>,
}

pub struct AssemblyBuilder {
    name: String,
    url: String,
    documents: Vec<DocumentDef>,
    types: Vec<TypeDef>,
}

impl AssemblyBuilder {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            documents: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Add a document and return its index
    pub fn add_document(&mut self, path: impl Into<String>) -> u32 {
        self.documents.push(DocumentDef {
            path: path.into(),
            source_link: None,
        });
        (self.documents.len() - 1) as u32
    }

    pub fn set_source_link(&mut self, document: u32, uri: impl Into<String>) {
        if let Some(doc) = self.documents.get_mut(document as usize) {
            doc.source_link = Some(uri.into());
        }
    }

    /// Add a type and return its index
    pub fn add_type(&mut self, full_name: impl Into<String>) -> usize {
        self.types.push(TypeDef {
            full_name: full_name.into(),
            methods: Vec::new(),
        });
        self.types.len() - 1
    }

    pub fn add_method(&mut self, ty: usize, method: MethodDef) {
        if let Some(t) = self.types.get_mut(ty) {
            t.methods.push(method);
        }
    }

    pub fn build(self) -> AssemblyInfo {
        let id = NEXT_ASSEMBLY_ID.fetch_add(1, Ordering::Relaxed);
        let mut by_document: Vec<Vec<Arc<MethodInfo>>> = vec![Vec::new(); self.documents.len()];
        let mut methods = HashMap::new();

        let types = self
            .types
            .into_iter()
            .map(|ty| {
                let type_methods = ty
                    .methods
                    .into_iter()
                    .map(|def| {
                        let method = Arc::new(index_method(id, &self.name, &ty.full_name, def));
                        if let Some(source) = method.source {
                            if let Some(list) = by_document.get_mut(source.document as usize) {
                                list.push(Arc::clone(&method));
                            }
                        }
                        methods.insert(method.rid(), Arc::clone(&method));
                        method
                    })
                    .collect();
                TypeInfo {
                    full_name: ty.full_name,
                    methods: type_methods,
                }
            })
            .collect();

        let sources = self
            .documents
            .into_iter()
            .zip(by_document)
            .enumerate()
            .map(|(index, (doc, methods))| {
                Arc::new(source_file(
                    SourceId::new(id, index as u32),
                    &self.name,
                    doc,
                    methods,
                ))
            })
            .collect();

        AssemblyInfo {
            id,
            name: self.name,
            url: self.url,
            sources,
            types,
            methods,
        }
    }
}

fn index_method(assembly_id: u32, assembly_name: &str, type_name: &str, def: MethodDef) -> MethodInfo {
    let source = def
        .sequence_points
        .first()
        .map(|sp| SourceId::new(assembly_id, sp.document));

    let mut method = MethodInfo {
        token: def.token,
        name: def.name,
        type_name: type_name.to_string(),
        assembly_id,
        assembly_name: assembly_name.to_string(),
        source,
        sequence_points: def.sequence_points,
        start: None,
        end: None,
        parameters: def.parameters,
        scopes: def.scopes,
    };

    let start = method
        .visible_points()
        .min_by_key(|sp| (sp.start_line, sp.start_column))
        .map(|sp| SourceLocation::at_point(&method, sp));
    let end = method
        .visible_points()
        .max_by_key(|sp| (sp.end_line, sp.end_column))
        .map(|sp| SourceLocation::at_point_end(&method, sp));
    method.start = start;
    method.end = end;
    method
}

fn source_file(
    id: SourceId,
    assembly_name: &str,
    doc: DocumentDef,
    methods: Vec<Arc<MethodInfo>>,
) -> SourceFile {
    let debugger_file_name = doc.path.replace('\\', "/").replace(':', "");
    let dotnet_url = format!(
        "{}{}/{}",
        SCHEME,
        assembly_name,
        debugger_file_name.trim_start_matches('/')
    );

    let path = Path::new(&doc.path);
    let url = if path.is_absolute() && path.exists() {
        url::Url::from_file_path(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| dotnet_url.clone())
    } else {
        dotnet_url.clone()
    };

    SourceFile {
        id,
        assembly_name: assembly_name.to_string(),
        doc_url: doc.path,
        debugger_file_name,
        url,
        dotnet_url,
        source_link_uri: doc.source_link,
        methods,
    }
}
