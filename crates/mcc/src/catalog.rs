//! the compiled catalog
//!
//! The catalog is a graph: resources are the vertices, containment and relationship metaparameters
//! the edges. It serializes with serde, e.g.
//!
//! ```json
//! {
//!   "name": "web01",
//!   "classes": ["main", "ntp"],
//!   "resources": [{ "type": "File", "title": "/etc/ntp.conf", "parameters": {}, ... }],
//!   "edges": [{ "source": "Class[ntp]", "target": "File[/etc/ntp.conf]", "relation": "contains" }]
//! }
//! ```
use crate::value::Value;
use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Catalog {
    /// Node the catalog was compiled for
    pub name: String,
    /// Evaluated classes in evaluation order
    pub classes: Vec<String>,
    pub resources: Vec<CatalogResource>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogResource {
    #[serde(rename = "type")]
    pub type_name: String,
    pub title: String,
    pub parameters: IndexMap<String, Value>,
    pub tags: Vec<String>,
    #[serde(rename = "virtual")]
    pub virtual_: bool,
    pub exported: bool,
    /// Realized by an exported collection
    pub collected: bool,
}

impl CatalogResource {
    /// `Type[title]`
    pub fn reference(&self) -> String {
        format!("{}[{}]", self.type_name, self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: Relation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Contains,
    Requires,
    Notifies,
    Subscribes,
    Before,
}

impl Relation {
    /// Relation created by a relationship metaparameter
    pub fn from_metaparam(name: &str) -> Option<Self> {
        match name {
            "require" => Some(Relation::Requires),
            "notify" => Some(Relation::Notifies),
            "subscribe" => Some(Relation::Subscribes),
            "before" => Some(Relation::Before),
            _ => None,
        }
    }
}

impl Catalog {
    /// Find a resource by its `Type[title]` reference
    pub fn resource(&self, reference: &str) -> Option<&CatalogResource> {
        self.resources
            .iter()
            .find(|resource| resource.reference() == reference)
    }

    /// Edges leaving `source`
    pub fn edges_from<'c>(&'c self, source: &'c str) -> impl Iterator<Item = &'c Edge> + 'c {
        self.edges.iter().filter(move |edge| edge.source == source)
    }

    /// Resources contained by `source`
    pub fn contained_in<'c>(&'c self, source: &'c str) -> Vec<&'c str> {
        self.edges_from(source)
            .filter(|edge| edge.relation == Relation::Contains)
            .map(|edge| edge.target.as_str())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
