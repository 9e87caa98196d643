//! function registry
//!
//! Functions are plain `fn` pointers registered by name. A statement function is called for its
//! effect and may not be used as a value; an rvalue function must be used as a value.
use crate::collector::Collector;
use crate::compile::Compile;
use crate::data::MergeStrategy;
use crate::error::{CompileError, Result};
use crate::resource::ResourceRef;
use crate::scope::ScopeId;
use crate::value::Value;
use indexmap::IndexMap;

pub type FunctionImpl = fn(&mut Compile<'_>, ScopeId, Vec<Value>) -> Result<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Statement,
    Rvalue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(min, max) => (min..=max).contains(&count),
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Between(min, max) => write!(f, "{min} to {max}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub kind: FunctionKind,
    pub arity: Arity,
    pub call: FunctionImpl,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: IndexMap<String, Function>,
}

impl FunctionRegistry {
    /// All built-in functions
    pub fn standard() -> Self {
        use Arity::*;
        use FunctionKind::*;

        let mut registry = Self::default();
        registry.register("include", Statement, AtLeast(1), include);
        registry.register("require", Statement, AtLeast(1), require);
        registry.register("realize", Statement, AtLeast(1), realize);
        registry.register("tag", Statement, AtLeast(1), tag);
        registry.register("fail", Statement, AtLeast(0), fail);
        registry.register("debug", Statement, AtLeast(0), log_debug);
        registry.register("info", Statement, AtLeast(0), log_info);
        registry.register("notice", Statement, AtLeast(0), log_notice);
        registry.register("warning", Statement, AtLeast(0), log_warning);
        registry.register("err", Statement, AtLeast(0), log_err);
        registry.register("defined", Rvalue, AtLeast(1), defined);
        registry.register("tagged", Rvalue, AtLeast(1), tagged);
        registry.register("lookup", Rvalue, Between(1, 3), lookup);
        registry.register("hiera", Rvalue, Between(1, 3), hiera);
        registry.register("hiera_array", Rvalue, Between(1, 3), hiera_array);
        registry.register("hiera_hash", Rvalue, Between(1, 3), hiera_hash);
        registry
    }

    /// Register or replace a function
    pub fn register(&mut self, name: &str, kind: FunctionKind, arity: Arity, call: FunctionImpl) {
        self.functions.insert(
            name.to_string(),
            Function { kind, arity, call },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn is_statement(&self, name: &str) -> bool {
        self.get(name)
            .map(|function| function.kind == FunctionKind::Statement)
            .unwrap_or(false)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.functions.keys()
    }

    /// Find a function and check that it is used as `kind` with an acceptable argument count
    pub fn resolve(&self, name: &str, kind: FunctionKind, count: usize) -> Result<FunctionImpl> {
        let Some(function) = self.get(name) else {
            return Err(CompileError::name(format!("Unknown function '{name}'")));
        };

        match (function.kind, kind) {
            (FunctionKind::Statement, FunctionKind::Rvalue) => {
                return Err(CompileError::evaluation(format!(
                    "Function '{name}' does not return a value"
                )))
            }
            (FunctionKind::Rvalue, FunctionKind::Statement) => {
                return Err(CompileError::evaluation(format!(
                    "Function '{name}' must be the value of a statement"
                )))
            }
            _ => {}
        }

        if !function.arity.accepts(count) {
            return Err(CompileError::evaluation(format!(
                "Function '{name}' takes {} arguments, {count} given",
                function.arity
            )));
        }

        Ok(function.call)
    }
}

fn strings(function: &str, args: Vec<Value>) -> Result<Vec<String>> {
    args.into_iter()
        .flat_map(Value::flatten)
        .map(|value| match value {
            Value::String(s) => Ok(s),
            other => Err(CompileError::evaluation(format!(
                "{function} expects strings, got {}",
                other.kind()
            ))),
        })
        .collect()
}

/// Class names given as strings or as `Class["name"]` references
fn class_names(function: &str, args: Vec<Value>) -> Result<Vec<String>> {
    args.into_iter()
        .flat_map(Value::flatten)
        .map(|value| match value {
            Value::String(name) => Ok(name),
            Value::Reference(reference) if reference.is_class() => Ok(reference.title),
            other => Err(CompileError::evaluation(format!(
                "{function} expects class names, got {}",
                other.kind()
            ))),
        })
        .collect()
}

fn include(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let names = class_names("include", args)?;
    compile.evaluate_classes(scope, &names)?;
    Ok(Value::Undef)
}

/// `include` plus a dependency of the enclosing resource on every class
fn require(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let names = class_names("require", args)?;
    let evaluated = compile.evaluate_classes(scope, &names)?;

    let references: Vec<Value> = evaluated
        .iter()
        .map(|name| Value::Reference(ResourceRef::class(name)))
        .collect();
    compile.add_relationship(scope, "require", Value::Array(references))?;
    Ok(Value::Undef)
}

fn realize(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let references = args
        .into_iter()
        .flat_map(Value::flatten)
        .map(|value| match value {
            Value::Reference(reference) => Ok(compile.canonical_reference(scope, reference)),
            Value::String(s) => Ok(compile.canonical_reference(scope, s.parse()?)),
            other => Err(CompileError::evaluation(format!(
                "realize expects resource references, got {}",
                other.kind()
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let source = compile.scopes.get(scope).source.clone();
    compile.add_collector(Collector::explicit(scope, references, &source, None));
    Ok(Value::Undef)
}

fn tag(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let tags = strings("tag", args)?;
    compile.add_tags(scope, &tags);
    Ok(Value::Undef)
}

fn message(args: Vec<Value>) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fail(_compile: &mut Compile, _scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    Err(CompileError::external(format!("Failed: {}", message(args))))
}

macro_rules! log_function {
    ($name:ident, $level:ident) => {
        fn $name(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
            let source = &compile.scopes.get(scope).source;
            tracing::$level!(scope = %source, "{}", message(args));
            Ok(Value::Undef)
        }
    };
}

log_function!(log_debug, debug);
log_function!(log_info, info);
log_function!(log_notice, info);
log_function!(log_warning, warn);
log_function!(log_err, error);

/// True when every argument names a known class, defined type or resource type, or a declared
/// resource
fn defined(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    for value in args.into_iter().flat_map(Value::flatten) {
        let known = match value {
            Value::Reference(reference) => {
                let reference = compile.canonical_reference(scope, reference);
                compile.resource(&reference).is_some()
            }
            Value::String(name) => compile.is_known_type(scope, &name),
            other => {
                return Err(CompileError::evaluation(format!(
                    "defined expects names or references, got {}",
                    other.kind()
                )))
            }
        };

        if !known {
            return Ok(Value::Boolean(false));
        }
    }
    Ok(Value::Boolean(true))
}

/// True when the calling scope carries every tag
fn tagged(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let tags = compile.tags(scope);
    let all = strings("tagged", args)?
        .iter()
        .all(|tag| tags.contains(&tag.to_lowercase()));
    Ok(Value::Boolean(all))
}

fn data_lookup(
    compile: &mut Compile,
    scope: ScopeId,
    function: &str,
    key: &Value,
    default: Option<Value>,
    override_source: Option<&Value>,
    merge: MergeStrategy,
) -> Result<Value> {
    let Value::String(key) = key else {
        return Err(CompileError::evaluation(format!(
            "{function} expects a string key, got {}",
            key.kind()
        )));
    };
    let override_source = match override_source {
        None | Some(Value::Undef) => None,
        Some(Value::String(source)) => Some(source.as_str()),
        Some(other) => {
            return Err(CompileError::evaluation(format!(
                "{function} expects a data source name, got {}",
                other.kind()
            )))
        }
    };

    match compile.lookup_data(scope, key, override_source, &merge)? {
        Some(value) => Ok(value),
        None => match default {
            Some(default) => Ok(default),
            None => Err(CompileError::external(format!(
                "Could not find data item {key} in any data source"
            ))),
        },
    }
}

/// `lookup(key, [merge], [default])`
fn lookup(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
    let mut args = args.into_iter();
    let key = args.next().unwrap_or_default();
    let merge = match args.next() {
        None | Some(Value::Undef) => MergeStrategy::First,
        Some(Value::String(strategy)) => strategy
            .parse()
            .map_err(|e: crate::data::LookupError| CompileError::evaluation(e.to_string()))?,
        Some(other) => {
            return Err(CompileError::evaluation(format!(
                "lookup expects a merge strategy name, got {}",
                other.kind()
            )))
        }
    };
    let default = args.next();

    data_lookup(compile, scope, "lookup", &key, default, None, merge)
}

macro_rules! hiera_function {
    ($name:ident, $merge:expr) => {
        /// `(key, [default], [override])`
        fn $name(compile: &mut Compile, scope: ScopeId, args: Vec<Value>) -> Result<Value> {
            let mut args = args.into_iter();
            let key = args.next().unwrap_or_default();
            let default = args.next();
            let override_source = args.next();

            data_lookup(
                compile,
                scope,
                stringify!($name),
                &key,
                default,
                override_source.as_ref(),
                $merge,
            )
        }
    };
}

hiera_function!(hiera, MergeStrategy::First);
hiera_function!(hiera_array, MergeStrategy::Unique);
hiera_function!(hiera_hash, MergeStrategy::Hash);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statement_and_rvalue_usage() {
        let registry = FunctionRegistry::standard();

        assert!(registry.is_statement("include"));
        assert!(!registry.is_statement("defined"));
        assert!(!registry.is_statement("unknown"));

        assert!(registry.resolve("include", FunctionKind::Statement, 1).is_ok());
        assert!(matches!(
            registry.resolve("include", FunctionKind::Rvalue, 1),
            Err(CompileError::Evaluation { .. })
        ));
        assert!(matches!(
            registry.resolve("defined", FunctionKind::Statement, 1),
            Err(CompileError::Evaluation { .. })
        ));
        assert!(matches!(
            registry.resolve("nope", FunctionKind::Rvalue, 0),
            Err(CompileError::Name { .. })
        ));
    }

    #[test]
    fn arity_is_checked() {
        let registry = FunctionRegistry::standard();

        assert!(matches!(
            registry.resolve("include", FunctionKind::Statement, 0),
            Err(CompileError::Evaluation { .. })
        ));
        assert!(registry.resolve("lookup", FunctionKind::Rvalue, 3).is_ok());
        assert!(registry.resolve("lookup", FunctionKind::Rvalue, 4).is_err());
    }
}
