//! resources, references and overrides
//!
//! A [Resource] lives in the resource arena of a [crate::compile::Compile] and is addressed by its
//! [ResourceId]. Its [ResourceRef] (`Type[title]`) is the key in the compile's resource table.
use crate::ast::{ClassDef, DefineDef};
use crate::error::{CompileError, Location, Result};
use crate::scope::ScopeId;
use crate::types::TypeCatalog;
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

/// Parameters every resource type accepts
pub const METAPARAMS: &[&str] = &[
    "alias",
    "audit",
    "before",
    "loglevel",
    "noop",
    "notify",
    "require",
    "schedule",
    "stage",
    "subscribe",
    "tag",
];

/// Metaparameters that are copied from enclosing scopes onto resources lacking them
pub const AMBIENT_METAPARAMS: &[&str] = &["schedule", "noop", "loglevel", "audit"];

pub fn is_metaparam(name: &str) -> bool {
    METAPARAMS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

/// `Type[title]`
///
/// Type names are stored lowercase without a leading `::`; class titles are lowercased as well.
/// Two references are equal when type and title are equal after that normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub type_name: String,
    pub title: String,
}

impl ResourceRef {
    pub fn new(type_name: impl AsRef<str>, title: impl Into<String>) -> Self {
        let type_name = normalize_name(type_name.as_ref());
        let mut title = title.into();
        if type_name == "class" {
            title = normalize_name(&title);
        }

        Self { type_name, title }
    }

    pub fn class(name: &str) -> Self {
        Self::new("class", name)
    }

    /// Type name as written in references: every `::` segment capitalized
    pub fn type_display(&self) -> String {
        self.type_name
            .split("::")
            .map(|segment| {
                let mut chars = segment.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join("::")
    }

    pub fn is_class(&self) -> bool {
        self.type_name == "class"
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.type_display(), self.title)
    }
}

impl std::str::FromStr for ResourceRef {
    type Err = CompileError;

    /// Parses `Type[title]`, the title optionally quoted
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CompileError::parameter(format!("Invalid resource reference '{s}'"));

        let (type_name, rest) = s.trim().split_once('[').ok_or_else(invalid)?;
        let title = rest.strip_suffix(']').ok_or_else(invalid)?;
        let title = title
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .or_else(|| title.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
            .unwrap_or(title);

        let valid_type = !type_name.is_empty()
            && type_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
        if !valid_type || title.is_empty() {
            return Err(invalid());
        }

        Ok(ResourceRef::new(type_name, title))
    }
}

/// Lowercase and strip a leading `::`
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches("::").to_lowercase()
}

/// A single parameter value together with where it came from
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct Param {
    pub name: String,
    pub value: Value,
    /// Class, define or node that set the value
    pub source: String,
    pub location: Option<Location>,
}

/// A pending parameter modification for a resource that may not exist yet
#[derive(Debug, Clone, derive_new::new)]
pub struct Override {
    pub reference: ResourceRef,
    pub params: Vec<Param>,
    pub source: String,
    pub scope: ScopeId,
    pub location: Option<Location>,
    /// Overrides attached to a collection may target resources of any class
    #[new(default)]
    pub from_collector: bool,
}

/// What a resource's type resolved to at declaration time
#[derive(Debug, Clone)]
pub enum ResourceKind {
    /// Type known to the [TypeCatalog]; passes straight to the catalog
    Builtin,
    /// Instance of a user defined type; evaluating it evaluates the definition body
    Defined(Arc<DefineDef>),
    /// `Class[name]`
    Class(Arc<ClassDef>),
    /// `Node[name]`
    Node,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub reference: ResourceRef,
    pub kind: ResourceKind,
    params: IndexMap<String, Param>,
    /// Class, define or node that declared the resource
    pub source: String,
    /// Scope that was active at declaration time
    pub scope: ScopeId,
    /// Resource that contains this one in the catalog
    pub container: Option<ResourceId>,
    pub virtual_: bool,
    pub exported: bool,
    /// Realized by an exported collection
    pub collected: bool,
    pub tags: IndexSet<String>,
    pub location: Option<Location>,
    evaluated: bool,
    finished: bool,
}

impl Resource {
    pub fn new(
        reference: ResourceRef,
        kind: ResourceKind,
        source: impl Into<String>,
        scope: ScopeId,
        location: Option<Location>,
    ) -> Result<Self> {
        let source = source.into();
        if reference.type_name.is_empty() || reference.title.is_empty() || source.is_empty() {
            return Err(CompileError::internal(format!(
                "resource requires a type, title and source (type: '{}', title: '{}', source: '{}')",
                reference.type_name, reference.title, source
            )));
        }

        let mut resource = Self {
            reference,
            kind,
            params: Default::default(),
            source,
            scope,
            container: None,
            virtual_: false,
            exported: false,
            collected: false,
            tags: Default::default(),
            location,
            evaluated: false,
            finished: false,
        };

        for segment in resource.reference.type_name.clone().split("::") {
            resource.tag(segment);
        }
        resource.tag(&resource.reference.type_name.clone());
        if is_tag_shaped(&resource.reference.title) {
            resource.tag(&resource.reference.title.clone());
        }

        Ok(resource)
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.kind, ResourceKind::Defined(_))
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }

    pub(crate) fn mark_evaluated(&mut self) {
        self.evaluated = true;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name).map(|param| &param.value)
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params.values()
    }

    pub fn tag(&mut self, tag: &str) {
        let tag = tag.to_lowercase();
        if !tag.is_empty() {
            self.tags.insert(tag);
        }
    }

    /// True when `tag` is one of the resource's tags or a value of its `tag` parameter
    pub fn tagged(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        if self.tags.contains(&tag) {
            return true;
        }

        self.get("tag")
            .map(|value| {
                value
                    .clone()
                    .flatten()
                    .iter()
                    .any(|value| value.as_str().map(str::to_lowercase).as_deref() == Some(tag.as_str()))
            })
            .unwrap_or(false)
    }

    /// Check that `name` is a valid parameter for the resource's type
    pub fn paramcheck(&self, name: &str, types: &dyn TypeCatalog) -> Result<()> {
        if is_metaparam(name) || name == "name" || name == "title" {
            return Ok(());
        }

        let valid = match &self.kind {
            ResourceKind::Builtin => types
                .type_properties(&self.reference.type_name)
                .map(|properties| properties.contains(name))
                .unwrap_or(false),
            ResourceKind::Defined(define) => define.parameters.iter().any(|p| p.name == name),
            ResourceKind::Class(class) => class.parameters.iter().any(|p| p.name == name),
            ResourceKind::Node => false,
        };

        if !valid {
            return Err(CompileError::parameter(format!(
                "Invalid parameter '{name}' for type {}",
                self.reference.type_display()
            )));
        }

        Ok(())
    }

    /// Directly set a single parameter
    ///
    /// An undef value removes the parameter.
    pub fn set(&mut self, param: Param, types: &dyn TypeCatalog) -> Result<()> {
        self.paramcheck(&param.name, types)
            .map_err(|e| e.at(param.location.as_ref()))?;

        if param.value.is_undef() {
            self.params.shift_remove(&param.name);
        } else {
            self.params.insert(param.name.clone(), param);
        }
        Ok(())
    }

    /// Append references to a relationship metaparameter
    pub(crate) fn append_relationship(&mut self, name: &str, value: Value, source: &str) {
        let merged = match self.params.shift_remove(name).map(|param| param.value) {
            None | Some(Value::Undef) => value,
            Some(Value::Array(mut existing)) => {
                existing.extend(value.flatten());
                Value::Array(existing)
            }
            Some(existing) => {
                let mut values = vec![existing];
                values.extend(value.flatten());
                Value::Array(values)
            }
        };

        self.params
            .insert(name.to_string(), Param::new(name.to_string(), merged, source.to_string(), None));
    }

    /// Apply an override to this resource
    ///
    /// `is_subclass` answers whether its first argument is a (transitive) subclass of its second.
    /// Overrides must come from the declaring class or one of its subclasses unless they were
    /// attached to a collection.
    pub fn merge(
        &mut self,
        other: &Override,
        types: &dyn TypeCatalog,
        is_subclass: impl Fn(&str, &str) -> bool,
    ) -> Result<()> {
        let permitted = other.from_collector
            || other.source == self.source
            || is_subclass(&other.source, &self.source);

        if !permitted {
            return Err(CompileError::conflict(format!(
                "Only subclasses can override parameters: {} is declared in {} and cannot be overridden from {}",
                self.reference, self.source, other.source
            ))
            .at(other.location.as_ref()));
        }

        for param in &other.params {
            tracing::trace!(resource=%self.reference, param=%param.name, source=%other.source, "override");
            self.set(param.clone(), types)?;
        }

        Ok(())
    }

    /// Apply defaults for every parameter that is not set yet
    pub fn add_defaults(
        &mut self,
        defaults: IndexMap<String, Param>,
        types: &dyn TypeCatalog,
    ) -> Result<()> {
        for (name, param) in defaults {
            if self.params.contains_key(&name) {
                continue;
            }
            self.set(param, types)?;
        }
        Ok(())
    }

    /// Drain and apply pending overrides
    pub fn add_overrides(
        &mut self,
        overrides: Vec<Override>,
        types: &dyn TypeCatalog,
        is_subclass: impl Fn(&str, &str) -> bool,
    ) -> Result<()> {
        for pending in overrides {
            self.merge(&pending, types, &is_subclass)?;
        }
        Ok(())
    }

    /// Copy ambient metaparameters; never replaces a value that is already set
    pub fn add_metaparams(&mut self, ambient: Vec<Param>) {
        for param in ambient {
            if self.params.contains_key(&param.name) || param.value.is_undef() {
                continue;
            }
            self.params.insert(param.name.clone(), param);
        }
    }

    pub(crate) fn finish(&mut self) -> bool {
        std::mem::replace(&mut self.finished, true)
    }

    /// The record emitted in the catalog
    pub fn to_output_form(&self) -> crate::catalog::CatalogResource {
        let mut tags: IndexSet<String> = self.tags.clone();
        if let Some(value) = self.get("tag") {
            for tag in value.clone().flatten() {
                if let Value::String(tag) = tag {
                    tags.insert(tag.to_lowercase());
                }
            }
        }

        crate::catalog::CatalogResource {
            type_name: self.reference.type_display(),
            title: self.reference.title.clone(),
            parameters: self
                .params
                .values()
                .map(|param| (param.name.clone(), param.value.clone().into_output_form()))
                .collect(),
            tags: tags.into_iter().collect(),
            virtual_: self.virtual_,
            exported: self.exported,
            collected: self.collected,
        }
    }
}

fn is_tag_shaped(title: &str) -> bool {
    !title.is_empty()
        && title
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
}
