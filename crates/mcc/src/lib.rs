//! # mcc - manifest catalog compiler
//!
//! `mcc` compiles manifests describing classes, defined types, nodes and resources into the catalog
//! of a single node: the resources that apply to it and the edges between them.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `mcc` works internally.
//!
//! ### Manifests
//!
//! Manifests are HCL documents (`*.mcc.hcl`). Blocks declare things, attributes assign variables
//! or call statement functions:
//!
//! ```hcl
//! class ntp {
//!   params {
//!     server = "pool.ntp.org"
//!   }
//!
//!   file "/etc/ntp.conf" {
//!     content = "server ${server}"
//!   }
//! }
//!
//! node "web01" {
//!   include = "ntp"
//! }
//! ```
//!
//! ### Loading and lowering
//!
//! [hcl_documents::HclDocuments] keeps every parsed document next to its source path so errors can
//! point to `file:line`. [lower::lower] then turns the documents into a [ast::Manifest]: classes,
//! defined types and nodes are collected by name and every other top-level structure becomes part
//! of the `main` body. Lowering collects all problems before failing, see [lower::ManifestErrors].
//!
//! ### Environment
//!
//! An [environment::Environment] bundles the manifest with the pieces a compile reads but never
//! changes: the [types::TypeCatalog] of built-in resource types, the [functions::FunctionRegistry]
//! and the [data::DataProvider] used for lookups and class parameter binding.
//!
//! ### Compiling
//!
//! A [compile::Compile] owns the state of one compile:
//!
//! - the [scope::ScopeGraph] holding variables, defaults and tags
//! - the resource arena and the table mapping each `Type[title]` to its resource
//! - pending overrides and [collector::Collector]s
//!
//! Evaluating code declares resources, includes classes and registers collectors. Defined resources
//! and collectors can produce more of each, so they are evaluated in rounds until a round makes no
//! progress. Finally defaults and metaparameters are applied and the [catalog::Catalog] is emitted.
//!
//! ### Output
//!
//! The catalog serializes via [serde]; the CLI writes it as YAML or JSON.
pub mod ast;
pub mod catalog;
pub mod collector;
pub mod compile;
pub mod data;
pub mod environment;
pub mod error;
pub mod functions;
pub mod hcl_documents;
pub mod lower;
pub mod node;
pub mod resource;
pub mod scope;
pub mod types;
pub mod value;

use catalog::Catalog;
use compile::{Compile, CompileOptions};
use environment::Environment;
use error::Result;
use node::Node;

/// Compile the catalog of `node` with default options
pub fn compile(env: &Environment, node: Node) -> Result<Catalog> {
    Compile::new(env, node, CompileOptions::default())?.compile()
}
