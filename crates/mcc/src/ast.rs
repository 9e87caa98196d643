//! abstract syntax of a manifest
//!
//! Produced by [crate::lower] from [crate::hcl_documents::HclDocuments] and consumed by
//! [crate::compile::Compile]. Definitions are shared through [Arc] so an
//! [crate::environment::Environment] can be used by several compiles at once.
use crate::error::Location;
use crate::value::Value;
use indexmap::IndexMap;
use std::sync::Arc;

/// A fully lowered manifest: top-level code plus all definitions
#[derive(Debug, Default)]
pub struct Manifest {
    /// Body of the implicit `main` class
    pub main: Vec<Statement>,
    pub classes: IndexMap<String, Arc<ClassDef>>,
    pub defines: IndexMap<String, Arc<DefineDef>>,
    pub nodes: Vec<Arc<NodeDef>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// `None` marks a required parameter
    pub default: Option<Expr>,
}

#[derive(Debug)]
pub struct ClassDef {
    /// Fully qualified, lowercase name
    pub name: String,
    pub parent: Option<String>,
    pub parameters: Vec<Parameter>,
    pub body: Vec<Statement>,
    pub location: Location,
}

#[derive(Debug)]
pub struct DefineDef {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub body: Vec<Statement>,
    pub location: Location,
}

#[derive(Debug)]
pub struct NodeDef {
    /// Node names this definition matches; `default` matches any node
    pub names: Vec<String>,
    pub parent: Option<String>,
    pub body: Vec<Statement>,
    pub location: Location,
}

impl NodeDef {
    /// Name under which the node scope is registered
    pub fn classname(&self) -> &str {
        &self.names[0]
    }
}

/// How a resource declaration or collection treats virtuality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Real,
    Virtual,
    Exported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub value: Expr,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assign {
        name: String,
        value: Expr,
        location: Location,
    },
    Resource {
        type_name: String,
        /// Evaluates to a string or an array of strings
        title: Expr,
        params: Vec<ParamDecl>,
        form: Form,
        location: Location,
    },
    Defaults {
        type_name: String,
        params: Vec<ParamDecl>,
        location: Location,
    },
    Override {
        type_name: String,
        title: Expr,
        params: Vec<ParamDecl>,
        location: Location,
    },
    Collect {
        type_name: String,
        query: Option<Query<Expr>>,
        form: Form,
        params: Vec<ParamDecl>,
        location: Location,
    },
    Call {
        function: String,
        args: Vec<Expr>,
        location: Location,
    },
    If {
        condition: Expr,
        then: Vec<Statement>,
        otherwise: Vec<Statement>,
        location: Location,
    },
    Each {
        /// one name binds the element, two names bind key and value (or index and element)
        names: Vec<String>,
        items: Expr,
        body: Vec<Statement>,
        location: Location,
    },
    Return,
    Next,
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Binding strength, higher binds tighter; all operators associate to the left
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::NotEq => 3,
            BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A string containing `$name` / `${name}` interpolations
    Interpolated(String),
    /// An HCL template, rendered by concatenating its parts
    Template(Vec<Expr>),
    /// Plain or qualified (`a::b::name`) variable
    Variable(String),
    /// `Type["title"]`; an array title yields an array of references
    Reference {
        type_name: String,
        title: Box<Expr>,
    },
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
        location: Location,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Value::String(value.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
}

/// Collection query over resource parameters
///
/// `T` is [Expr] in the syntax tree and [Value] once the collector evaluated its operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<T> {
    Compare {
        param: String,
        op: CompareOp,
        value: T,
    },
    And(Box<Query<T>>, Box<Query<T>>),
    Or(Box<Query<T>>, Box<Query<T>>),
}

impl<T> Query<T> {
    /// Convert every operand, keeping the structure
    pub fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<Query<U>, E> {
        Ok(match self {
            Query::Compare { param, op, value } => Query::Compare {
                param: param.clone(),
                op: *op,
                value: f(value)?,
            },
            Query::And(lhs, rhs) => Query::And(Box::new(lhs.try_map(f)?), Box::new(rhs.try_map(f)?)),
            Query::Or(lhs, rhs) => Query::Or(Box::new(lhs.try_map(f)?), Box::new(rhs.try_map(f)?)),
        })
    }
}
