//! Debug metadata store
//!
//! Loads modules and their symbols and answers location queries: which
//! sequence points a breakpoint request lands on, which points lie in a
//! range, and which method a sandbox frame belongs to. Assemblies are only
//! ever added.

mod assembly;
mod image;
mod loader;
mod metadata;
mod pdb;
mod reader;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{self, FuturesUnordered, Stream, StreamExt};
use parking_lot::RwLock;

use crate::common::{change_extension, file_name};
use crate::location::{BreakpointRequest, SourceId, SourceLocation};

pub use assembly::{
    AssemblyBuilder, AssemblyInfo, LocalScope, LocalVariable, MethodDef, MethodInfo,
    SequencePoint, SourceFile, TypeInfo, VarInfo, HIDDEN_LINE,
};
pub use loader::{AssemblyLoader, HttpLoader, ModuleRequest};
pub use pdb::SourceLink;
pub use reader::read_assembly;

pub struct DebugStore {
    loader: Arc<dyn AssemblyLoader>,
    symbol_extension: String,
    assemblies: RwLock<Vec<Arc<AssemblyInfo>>>,
}

impl DebugStore {
    pub fn new(loader: Arc<dyn AssemblyLoader>, symbol_extension: impl Into<String>) -> Self {
        Self {
            loader,
            symbol_extension: symbol_extension.into(),
            assemblies: RwLock::new(Vec::new()),
        }
    }

    /// Pair module urls with the symbol files listed next to them
    pub fn module_requests(&self, urls: &[String]) -> Vec<ModuleRequest> {
        let symbol_suffix = format!(".{}", self.symbol_extension.to_ascii_lowercase());
        let is_symbols = |url: &str| file_name(url).to_ascii_lowercase().ends_with(&symbol_suffix);
        let symbols: HashSet<&str> = urls
            .iter()
            .map(String::as_str)
            .filter(|u| is_symbols(u))
            .collect();

        urls.iter()
            .filter(|u| file_name(u).to_ascii_lowercase().ends_with(".dll"))
            .map(|url| ModuleRequest {
                url: url.clone(),
                symbols_url: change_extension(url, &self.symbol_extension)
                    .filter(|s| symbols.contains(s.as_str())),
            })
            .collect()
    }

    /// Load every module in `urls`, yielding documents as each module finishes
    ///
    /// All fetches start immediately. A module that fails to load is logged
    /// and skipped.
    pub fn load(&self, urls: &[String]) -> impl Stream<Item = Arc<SourceFile>> + '_ {
        let fetches: FuturesUnordered<_> = self
            .module_requests(urls)
            .into_iter()
            .map(|request| {
                let loader = Arc::clone(&self.loader);
                tokio::spawn(async move {
                    let result = loader.load(&request).await;
                    (request, result)
                })
            })
            .collect();

        fetches
            .filter_map(move |joined| {
                let loaded = match joined {
                    Ok((_, Ok(assembly))) => Some(self.add_assembly(assembly)),
                    Ok((request, Err(e))) => {
                        tracing::warn!(url = %request.url, "Failed to load module: {}", e);
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Module load task failed: {}", e);
                        None
                    }
                };
                futures_util::future::ready(loaded)
            })
            .flat_map(|assembly| stream::iter(assembly.sources.clone()))
    }

    /// Add an already built assembly
    pub fn add_assembly(&self, assembly: AssemblyInfo) -> Arc<AssemblyInfo> {
        let assembly = Arc::new(assembly);
        tracing::info!(
            assembly = %assembly.name,
            id = assembly.id,
            documents = assembly.sources.len(),
            "Loaded assembly"
        );
        self.assemblies.write().push(Arc::clone(&assembly));
        assembly
    }

    pub fn all_sources(&self) -> Vec<Arc<SourceFile>> {
        self.assemblies
            .read()
            .iter()
            .flat_map(|a| a.sources.iter().cloned())
            .collect()
    }

    pub fn get_file_by_id(&self, id: &SourceId) -> Option<Arc<SourceFile>> {
        self.assemblies
            .read()
            .iter()
            .find(|a| a.id == id.assembly)
            .and_then(|a| a.source(id.document).cloned())
    }

    /// Case-insensitive lookup by assembly name
    pub fn get_assembly_by_name(&self, name: &str) -> Option<Arc<AssemblyInfo>> {
        self.assemblies
            .read()
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Method a sandbox frame points at
    pub fn method_by_token(&self, assembly: &str, token: u32) -> Option<Arc<MethodInfo>> {
        self.get_assembly_by_name(assembly)?
            .method_by_token(token)
            .cloned()
    }

    /// Visible sequence points a resolved request lands on
    ///
    /// Request coordinates are 0-based, sequence points 1-based. A request
    /// column of 0 matches any column on the line. Points a method has in other
    /// documents never match.
    pub fn find_breakpoint_locations(&self, request: &BreakpointRequest) -> Vec<SourceLocation> {
        let (Some(assembly), Some(file)) = (&request.assembly, &request.file) else {
            return Vec::new();
        };
        let Some(source) = self
            .get_assembly_by_name(assembly)
            .and_then(|a| a.sources.iter().find(|s| s.debugger_file_name == *file).cloned())
        else {
            return Vec::new();
        };

        let mut locations = Vec::new();
        for method in &source.methods {
            for sp in method
                .visible_points()
                .filter(|sp| sp.document == source.id.document)
            {
                if sp.start_line == request.line + 1
                    && (request.column == 0 || sp.start_column == request.column + 1)
                {
                    locations.push(SourceLocation::at_point(method, sp));
                }
            }
        }
        locations
    }

    /// Visible sequence points between two locations of one document
    ///
    /// Returns `None` when the endpoints name different documents. Without an
    /// end the rest of the start line is searched.
    pub fn find_possible_breakpoints(
        &self,
        start: &SourceLocation,
        end: Option<&SourceLocation>,
    ) -> Option<Vec<SourceLocation>> {
        if end.is_some_and(|e| e.id != start.id) {
            return None;
        }
        let end = end
            .cloned()
            .unwrap_or_else(|| SourceLocation::new(start.id, start.line, u32::MAX));

        let source = self.get_file_by_id(&start.id)?;
        let mut locations: Vec<SourceLocation> = source
            .methods
            .iter()
            .flat_map(|method| {
                method
                    .visible_points()
                    .filter(|sp| sp.document == start.id.document)
                    .map(|sp| SourceLocation::at_point(method, sp))
                    .collect::<Vec<_>>()
            })
            .filter(|loc| loc.is_between(start, &end))
            .collect();
        locations.sort_by_key(|l| (l.line, l.column));
        locations.dedup();
        Some(locations)
    }

    /// Public url of a location's document, empty when unknown
    pub fn to_url(&self, location: Option<&SourceLocation>) -> String {
        location
            .and_then(|l| self.get_file_by_id(&l.id))
            .map(|f| f.url.clone())
            .unwrap_or_default()
    }
}
