//! resource type catalog
//!
//! The compiler does not know any resource type by itself. It asks a [TypeCatalog] whether a type
//! exists, which parameters it accepts and whether duplicate titles are meaningful for it.
//!
//! [TypeSchema] is a catalog read from a yaml document:
//!
//! ```yaml
//! types:
//!   file:
//!     parameters: [path, ensure, owner]
//!   exec:
//!     isomorphic: false
//!     parameters: [command, cwd]
//! aliases:
//!   directory: file
//! ```
use indexmap::{IndexMap, IndexSet};

/// The standard schema bundled with the compiler
const STANDARD_SCHEMA: &str = include_str!("types.yaml");

pub trait TypeCatalog: Send + Sync + std::fmt::Debug {
    fn type_exists(&self, name: &str) -> bool;

    /// Parameter names (properties and parameters, without metaparameters)
    fn type_properties(&self, name: &str) -> Option<&IndexSet<String>>;

    /// Isomorphic types treat duplicate titles as the same resource
    fn type_isomorphic(&self, name: &str) -> bool;

    /// Resolve type aliases; unknown names are returned unchanged
    fn canonical_name(&self, name: &str) -> String {
        name.to_string()
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    types: IndexMap<String, TypeSpec>,
    #[serde(default)]
    aliases: IndexMap<String, String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct TypeSpec {
    #[serde(default = "isomorphic_default")]
    pub isomorphic: bool,
    #[serde(default)]
    pub parameters: IndexSet<String>,
}

fn isomorphic_default() -> bool {
    true
}

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse type schema")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Alias '{alias}' refers to unknown type '{target}'")]
    DanglingAlias { alias: String, target: String },
}

impl TypeSchema {
    pub fn standard() -> Self {
        Self::from_yaml(STANDARD_SCHEMA).expect("bundled type schema must be valid")
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SchemaError> {
        let mut schema: TypeSchema = serde_yaml::from_str(yaml)?;

        schema.types = std::mem::take(&mut schema.types)
            .into_iter()
            .map(|(name, spec)| (name.to_lowercase(), spec))
            .collect();
        schema.aliases = std::mem::take(&mut schema.aliases)
            .into_iter()
            .map(|(alias, target)| (alias.to_lowercase(), target.to_lowercase()))
            .collect();

        if let Some((alias, target)) = schema
            .aliases
            .iter()
            .find(|(_, target)| !schema.types.contains_key(*target))
        {
            return Err(SchemaError::DanglingAlias {
                alias: alias.clone(),
                target: target.clone(),
            });
        }

        Ok(schema)
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self, SchemaError> {
        tracing::info!(path=%path.display(), "loading type schema");
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn types(&self) -> impl Iterator<Item = (&String, &TypeSpec)> {
        self.types.iter()
    }

    fn spec(&self, name: &str) -> Option<&TypeSpec> {
        self.types.get(&self.canonical_name(name))
    }
}

impl TypeCatalog for TypeSchema {
    fn type_exists(&self, name: &str) -> bool {
        self.spec(name).is_some()
    }

    fn type_properties(&self, name: &str) -> Option<&IndexSet<String>> {
        self.spec(name).map(|spec| &spec.parameters)
    }

    fn type_isomorphic(&self, name: &str) -> bool {
        self.spec(name).map(|spec| spec.isomorphic).unwrap_or(true)
    }

    fn canonical_name(&self, name: &str) -> String {
        let name = name.to_lowercase();
        self.aliases.get(&name).cloned().unwrap_or(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn standard_schema() {
        let schema = TypeSchema::standard();

        assert!(schema.type_exists("file"));
        assert!(schema.type_exists("File"));
        assert!(schema.type_isomorphic("file"));
        assert!(!schema.type_isomorphic("exec"));
        assert!(schema.type_properties("file").unwrap().contains("owner"));
        assert!(!schema.type_exists("apache::vhost"));
    }

    #[test]
    fn aliases_resolve() {
        let schema = TypeSchema::from_yaml(
            "types:\n  package:\n    parameters: [ensure]\naliases:\n  Pkg: package\n",
        )
        .unwrap();

        assert_eq!(schema.canonical_name("pkg"), "package");
        assert!(schema.type_exists("PKG"));
        assert_eq!(schema.canonical_name("other"), "other");
    }

    #[test]
    fn dangling_alias() {
        let result = TypeSchema::from_yaml("aliases:\n  pkg: package\n");
        assert!(matches!(result, Err(SchemaError::DanglingAlias { .. })));
    }
}
