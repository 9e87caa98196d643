//! everything a compile reads but never changes
//!
//! An [Environment] is built once from the manifest documents and can then be shared by any number
//! of compiles, also across threads.
use crate::ast::{ClassDef, DefineDef, Manifest, NodeDef};
use crate::data::{DataProvider, LayeredData};
use crate::functions::FunctionRegistry;
use crate::hcl_documents::HclDocuments;
use crate::lower::{lower, ManifestErrors};
use crate::types::{TypeCatalog, TypeSchema};
use std::sync::Arc;

#[derive(Debug)]
pub struct Environment {
    manifest: Manifest,
    types: Box<dyn TypeCatalog>,
    functions: FunctionRegistry,
    data: Box<dyn DataProvider>,
}

#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    types: Option<Box<dyn TypeCatalog>>,
    functions: Option<FunctionRegistry>,
    data: Option<Box<dyn DataProvider>>,
}

impl EnvironmentBuilder {
    pub fn types(mut self, types: impl TypeCatalog + 'static) -> Self {
        self.types = Some(Box::new(types));
        self
    }

    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn data(mut self, data: impl DataProvider + 'static) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    /// Lower the documents; unset parts fall back to the standard type schema, the built-in
    /// functions and an empty data provider
    pub fn build(self, documents: &HclDocuments) -> Result<Environment, ManifestErrors> {
        let functions = self.functions.unwrap_or_else(FunctionRegistry::standard);
        let manifest = lower(documents, &functions)?;

        Ok(Environment {
            manifest,
            types: self.types.unwrap_or_else(|| Box::new(TypeSchema::standard())),
            functions,
            data: self
                .data
                .unwrap_or_else(|| Box::new(LayeredData::default())),
        })
    }
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Environment with all standard parts
    pub fn from_documents(documents: &HclDocuments) -> Result<Self, ManifestErrors> {
        Self::builder().build(documents)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn types(&self) -> &dyn TypeCatalog {
        self.types.as_ref()
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn data(&self) -> &dyn DataProvider {
        self.data.as_ref()
    }

    /// Candidate names for `name` relative to `namespaces` (most specific first)
    fn candidates(namespaces: &[String], name: &str) -> Vec<String> {
        let name = name.to_lowercase();
        if let Some(absolute) = name.strip_prefix("::") {
            return vec![absolute.to_string()];
        }

        namespaces
            .iter()
            .map(|namespace| format!("{namespace}::{name}"))
            .chain(std::iter::once(name.clone()))
            .collect()
    }

    pub fn find_class(&self, namespaces: &[String], name: &str) -> Option<&Arc<ClassDef>> {
        Self::candidates(namespaces, name)
            .iter()
            .find_map(|candidate| self.manifest.classes.get(candidate))
    }

    pub fn find_define(&self, namespaces: &[String], name: &str) -> Option<&Arc<DefineDef>> {
        Self::candidates(namespaces, name)
            .iter()
            .find_map(|candidate| self.manifest.defines.get(candidate))
    }

    /// Parent of a class, resolved relative to the class's own namespace
    pub fn parent_class(&self, class: &ClassDef) -> Option<&Arc<ClassDef>> {
        let parent = class.parent.as_deref()?;
        self.find_class(&namespaces_of(&class.name), parent)
    }

    /// True when `child` inherits from `ancestor`, directly or transitively
    pub fn is_subclass(&self, child: &str, ancestor: &str) -> bool {
        let mut current = self.manifest.classes.get(child);
        // bounded by the number of classes in case of an inheritance cycle
        let mut steps = 0;

        while let Some(class) = current {
            if steps > self.manifest.classes.len() {
                return false;
            }
            let Some(parent) = self.parent_class(class) else {
                return false;
            };
            if parent.name == ancestor {
                return true;
            }
            current = Some(parent);
            steps += 1;
        }
        false
    }

    /// Node definition matching the first of `names`, falling back to `default`
    pub fn find_node(&self, names: &[String]) -> Option<&Arc<NodeDef>> {
        names
            .iter()
            .find_map(|name| self.find_node_named(name))
            .or_else(|| self.find_node_named("default"))
    }

    pub fn find_node_named(&self, name: &str) -> Option<&Arc<NodeDef>> {
        let name = name.to_lowercase();
        self.manifest
            .nodes
            .iter()
            .find(|node| node.names.contains(&name))
    }

    pub fn has_nodes(&self) -> bool {
        !self.manifest.nodes.is_empty()
    }
}

/// `a::b::c` yields `a::b::c`, `a::b`, `a`
pub fn namespaces_of(name: &str) -> Vec<String> {
    let mut namespaces = vec![];
    let mut current = name;
    while !current.is_empty() {
        namespaces.push(current.to_string());
        current = current.rsplit_once("::").map(|(head, _)| head).unwrap_or("");
    }
    namespaces
}
