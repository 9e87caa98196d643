//! variable and default scopes
//!
//! All scopes of a compile live in one [ScopeGraph] arena and refer to each other by [ScopeId].
//! Every scope but the top scope has exactly one parent, so the graph is a tree rooted at the top
//! scope. Scopes are never removed; a scope whose body finished evaluating is simply not used anymore.
//!
//! Lookups walk from a scope to the root. Assignments always write into the scope they are made in.
use crate::error::{CompileError, Location, Result};
use crate::resource::{Param, ResourceId, AMBIENT_METAPARAMS};
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Top,
    Class,
    Node,
    Definition,
    /// Per-iteration scope of an `each` loop
    Local,
}

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    location: Option<Location>,
}

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    /// Class, define or node whose code runs in this scope
    pub source: String,
    /// Namespace used to resolve relative class and define names
    pub namespace: String,
    /// Resource that contains everything declared in this scope
    pub resource: Option<ResourceId>,
    pub declarative: bool,
    pub tags: IndexSet<String>,
    vars: IndexMap<String, Binding>,
    defaults: IndexMap<String, IndexMap<String, Param>>,
    children: Vec<ScopeId>,
}

impl Scope {
    pub fn is_nodescope(&self) -> bool {
        self.kind == ScopeKind::Node
    }
}

#[derive(Debug, Default)]
pub struct ScopeGraph {
    scopes: Vec<Scope>,
    class_scopes: IndexMap<String, ScopeId>,
}

impl ScopeGraph {
    /// Create the root scope
    pub fn new_top(&mut self, source: &str, declarative: bool) -> Result<ScopeId> {
        if !self.scopes.is_empty() {
            return Err(CompileError::internal("top scope created twice"));
        }

        Ok(self.push(None, ScopeKind::Top, source, "", declarative))
    }

    pub fn new_scope(
        &mut self,
        parent: ScopeId,
        kind: ScopeKind,
        source: &str,
        namespace: &str,
    ) -> ScopeId {
        let declarative = self.get(parent).declarative;
        let id = self.push(Some(parent), kind, source, namespace, declarative);
        self.scopes[parent.0].children.push(id);
        id
    }

    fn push(
        &mut self,
        parent: Option<ScopeId>,
        kind: ScopeKind,
        source: &str,
        namespace: &str,
        declarative: bool,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        tracing::trace!(?id, ?parent, ?kind, source, "new scope");

        let mut tags = IndexSet::new();
        if matches!(kind, ScopeKind::Class | ScopeKind::Definition) {
            for segment in source.split("::") {
                tags.insert(segment.to_string());
            }
            tags.insert(source.to_string());
        }

        self.scopes.push(Scope {
            parent,
            kind,
            source: source.to_string(),
            namespace: namespace.to_string(),
            resource: None,
            declarative,
            tags,
            vars: Default::default(),
            defaults: Default::default(),
            children: Default::default(),
        });
        id
    }

    pub fn top(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn children(&self, id: ScopeId) -> &[ScopeId] {
        &self.get(id).children
    }

    /// The scope itself followed by all of its ancestors up to the top scope
    pub fn ancestors(&self, id: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(id), move |current| self.get(*current).parent)
    }

    /// Resource owning the nearest enclosing scope
    pub fn container(&self, id: ScopeId) -> Option<ResourceId> {
        self.ancestors(id).find_map(|scope| self.get(scope).resource)
    }

    /// Namespaces to try, most specific first, when resolving a relative name
    pub fn namespaces(&self, id: ScopeId) -> Vec<String> {
        let namespace = self
            .ancestors(id)
            .map(|scope| self.get(scope).namespace.as_str())
            .find(|namespace| !namespace.is_empty())
            .unwrap_or_default();

        let mut namespaces = vec![];
        let mut current = namespace;
        while !current.is_empty() {
            namespaces.push(current.to_string());
            current = current.rsplit_once("::").map(|(head, _)| head).unwrap_or("");
        }
        namespaces
    }

    /// Tags of this scope and all enclosing scopes
    pub fn tags(&self, id: ScopeId) -> IndexSet<String> {
        let mut chain: Vec<ScopeId> = self.ancestors(id).collect();
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|scope| self.get(scope).tags.iter().cloned())
            .collect()
    }

    /// Register the scope a class or node body was evaluated in
    ///
    /// Node and class names share one namespace.
    pub fn class_set(&mut self, name: &str, scope: ScopeId) -> Result<()> {
        if let Some(existing) = self.class_scopes.get(name) {
            if self.get(*existing).is_nodescope() != self.get(scope).is_nodescope() {
                return Err(CompileError::conflict(format!(
                    "Cannot have classes, nodes, or definitions with the same name: {name}"
                )));
            }

            let kind = if self.get(*existing).is_nodescope() {
                "node"
            } else {
                "class"
            };
            return Err(CompileError::internal(format!(
                "evaluated {kind} {name} twice"
            )));
        }

        tracing::trace!(name, ?scope, "class scope registered");
        self.class_scopes.insert(name.to_string(), scope);
        Ok(())
    }

    pub fn class_scope(&self, name: &str) -> Option<ScopeId> {
        self.class_scopes.get(name).copied()
    }

    pub fn class_scopes(&self) -> impl Iterator<Item = (&String, &ScopeId)> {
        self.class_scopes.iter()
    }

    /// Resolve a variable
    ///
    /// Qualified names (`a::b::name`) are resolved in the scope of class `a::b`, `::name` in the top
    /// scope. Unqualified names walk from `id` to the top scope.
    pub fn lookup(&self, id: ScopeId, name: &str) -> Result<Value> {
        match self.lookup_opt(id, name)? {
            Some(value) => Ok(value.clone()),
            None => Err(CompileError::name(format!("Unknown variable: '{name}'"))),
        }
    }

    /// Like [ScopeGraph::lookup] but an unbound name is not an error
    ///
    /// A qualified name that refers to a class which has not been evaluated still fails.
    pub fn lookup_opt(&self, id: ScopeId, name: &str) -> Result<Option<&Value>> {
        if let Some(short) = name.strip_prefix("::") {
            if short.contains("::") {
                return self.lookup_opt(id, short);
            }
            return Ok(self.local(self.top(), short));
        }

        if let Some((class, short)) = name.rsplit_once("::") {
            let Some(class_scope) = self.class_scope(&class.to_lowercase()) else {
                return Err(CompileError::name(format!(
                    "Could not look up variable '{name}': class {class} has not been evaluated"
                )));
            };
            return Ok(self.walk(class_scope, short));
        }

        Ok(self.walk(id, name))
    }

    fn local(&self, id: ScopeId, name: &str) -> Option<&Value> {
        self.get(id).vars.get(name).map(|binding| &binding.value)
    }

    fn walk(&self, id: ScopeId, name: &str) -> Option<&Value> {
        self.ancestors(id).find_map(|scope| self.local(scope, name))
    }

    /// Bind `name` in scope `id`
    pub fn assign(
        &mut self,
        id: ScopeId,
        name: &str,
        value: Value,
        location: Option<&Location>,
    ) -> Result<()> {
        if name.contains("::") {
            return Err(CompileError::reassignment(format!(
                "Cannot assign to variables in other namespaces: '{name}'"
            )));
        }

        let scope = self.get_mut(id);
        if scope.declarative {
            if let Some(existing) = scope.vars.get(name) {
                let previous = existing
                    .location
                    .as_ref()
                    .map(|location| format!(" (previously assigned at {location})"))
                    .unwrap_or_default();
                return Err(CompileError::reassignment(format!(
                    "Cannot reassign variable '{name}'{previous}"
                )));
            }
        }

        tracing::trace!(?id, name, ?value, "assign");
        scope.vars.insert(
            name.to_string(),
            Binding {
                value,
                location: location.cloned(),
            },
        );
        Ok(())
    }

    /// Store defaults for a resource type in scope `id`
    pub fn set_defaults(&mut self, id: ScopeId, type_name: &str, params: Vec<Param>) -> Result<()> {
        let scope = self.get_mut(id);
        let declarative = scope.declarative;
        let defaults = scope.defaults.entry(type_name.to_string()).or_default();

        for param in params {
            if declarative && defaults.contains_key(&param.name) {
                return Err(CompileError::reassignment(format!(
                    "Default already defined for {type_name} {{ {} }}; cannot redefine",
                    param.name
                ))
                .at(param.location.as_ref()));
            }
            defaults.insert(param.name.clone(), param);
        }
        Ok(())
    }

    /// Defaults for a resource type visible from scope `id`; nearer scopes win
    pub fn lookup_defaults(&self, id: ScopeId, type_name: &str) -> IndexMap<String, Param> {
        let mut chain: Vec<ScopeId> = self.ancestors(id).collect();
        chain.reverse();

        let mut defaults = IndexMap::new();
        for scope in chain {
            if let Some(params) = self.get(scope).defaults.get(type_name) {
                for (name, param) in params {
                    defaults.insert(name.clone(), param.clone());
                }
            }
        }
        defaults
    }

    /// Metaparameter values bound as variables in scope `id` or above
    pub fn ambient_metaparams(&self, id: ScopeId) -> Vec<Param> {
        AMBIENT_METAPARAMS
            .iter()
            .filter_map(|name| {
                let scope = self
                    .ancestors(id)
                    .find(|scope| self.local(*scope, name).is_some())?;
                let value = self.local(scope, name)?.clone();
                Some(Param::new(
                    name.to_string(),
                    value,
                    self.get(scope).source.clone(),
                    None,
                ))
            })
            .collect()
    }

    /// Replace `$name` and `${name}` with the value of the variable
    ///
    /// Unknown and undef variables interpolate as the empty string. `\$` is a literal dollar.
    pub fn string_interpolate(&self, id: ScopeId, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(position) = rest.find(['$', '\\']) {
            out.push_str(&rest[..position]);
            let tail = &rest[position..];

            if let Some(after) = tail.strip_prefix("\\$") {
                out.push('$');
                rest = after;
                continue;
            }
            if let Some(after) = tail.strip_prefix('\\') {
                out.push('\\');
                rest = after;
                continue;
            }

            let after = &tail[1..];
            if let Some(inner) = after.strip_prefix('{') {
                if let Some(end) = inner.find('}') {
                    out.push_str(&self.interpolated(id, inner[..end].trim()));
                    rest = &inner[end + 1..];
                    continue;
                }
            }

            let length = variable_name_len(after);
            if length == 0 {
                out.push('$');
                rest = after;
                continue;
            }

            out.push_str(&self.interpolated(id, &after[..length]));
            rest = &after[length..];
        }

        out.push_str(rest);
        out
    }

    /// Value of `name` as it appears inside a string; unknown and undef render empty
    pub fn interpolated(&self, id: ScopeId, name: &str) -> String {
        match self.lookup_opt(id, name) {
            Ok(Some(value)) => value.to_string(),
            _ => {
                tracing::trace!(name, "undefined variable interpolated as empty string");
                String::new()
            }
        }
    }

    /// Indented scope tree for diagnostics
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        if !self.is_empty() {
            self.render(self.top(), 0, &mut out);
        }
        out
    }

    fn render(&self, id: ScopeId, depth: usize, out: &mut String) {
        let scope = self.get(id);
        out.push_str(&format!(
            "{:indent$}{:?} {} ({} variables)\n",
            "",
            scope.kind,
            scope.source,
            scope.vars.len(),
            indent = depth * 2
        ));
        for child in &scope.children {
            self.render(*child, depth + 1, out);
        }
    }
}

/// Length of the variable name at the start of `s` (`name`, `a::b`, `::name`)
fn variable_name_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    let mut index = if s.starts_with("::") { 2 } else { 0 };
    let mut end = 0;
    loop {
        let start = index;
        while index < bytes.len() && word(bytes[index]) {
            index += 1;
        }
        if index == start {
            break;
        }
        end = index;

        if s[index..].starts_with("::") && index + 2 < bytes.len() && word(bytes[index + 2]) {
            index += 2;
        } else {
            break;
        }
    }
    end
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(declarative: bool) -> (ScopeGraph, ScopeId) {
        let mut graph = ScopeGraph::default();
        let top = graph.new_top("main", declarative).unwrap();
        (graph, top)
    }

    fn param(name: &str, value: i64) -> Param {
        Param::new(name.into(), Value::Integer(value), "main".into(), None)
    }

    #[test]
    fn chain_lookup() {
        let (mut graph, top) = graph(true);
        let mut chain = vec![top];
        for depth in 0..5 {
            let parent = *chain.last().unwrap();
            let scope = graph.new_scope(parent, ScopeKind::Class, &format!("c{depth}"), "");
            graph
                .assign(scope, &format!("v{depth}"), Value::Integer(depth), None)
                .unwrap();
            chain.push(scope);
        }

        let innermost = *chain.last().unwrap();
        for depth in 0..5 {
            assert_eq!(
                graph.lookup(innermost, &format!("v{depth}")).unwrap(),
                Value::Integer(depth)
            );
        }

        for ancestor in &chain[..chain.len() - 1] {
            assert!(matches!(
                graph.lookup(*ancestor, "v4"),
                Err(CompileError::Name { .. })
            ));
        }
    }

    #[test]
    fn declarative_reassignment() {
        let (mut graph, top) = graph(true);
        graph.assign(top, "x", "a".into(), None).unwrap();
        assert!(matches!(
            graph.assign(top, "x", "b".into(), None),
            Err(CompileError::Reassignment { .. })
        ));

        let child = graph.new_scope(top, ScopeKind::Class, "c", "");
        graph.assign(child, "x", "b".into(), None).unwrap();
        assert_eq!(graph.lookup(child, "x").unwrap(), Value::from("b"));
        assert_eq!(graph.lookup(top, "x").unwrap(), Value::from("a"));
    }

    #[test]
    fn non_declarative_last_writer_wins() {
        let (mut graph, top) = graph(false);
        graph.assign(top, "x", "a".into(), None).unwrap();
        graph.assign(top, "x", "b".into(), None).unwrap();
        assert_eq!(graph.lookup(top, "x").unwrap(), Value::from("b"));
    }

    #[test]
    fn qualified_names() {
        let (mut graph, top) = graph(true);
        graph.assign(top, "site", "eu".into(), None).unwrap();
        let class = graph.new_scope(top, ScopeKind::Class, "apache::mod", "apache::mod");
        graph.class_set("apache::mod", class).unwrap();
        graph.assign(class, "port", Value::Integer(80), None).unwrap();

        let other = graph.new_scope(top, ScopeKind::Class, "other", "other");
        assert_eq!(graph.lookup(other, "apache::mod::port").unwrap(), Value::Integer(80));
        assert_eq!(graph.lookup(other, "::site").unwrap(), Value::from("eu"));
        assert!(matches!(
            graph.lookup(other, "missing::port"),
            Err(CompileError::Name { .. })
        ));
        assert!(matches!(
            graph.assign(other, "apache::mod::port", Value::Integer(1), None),
            Err(CompileError::Reassignment { .. })
        ));
    }

    #[test]
    fn defaults_merge_nearer_wins() {
        let (mut graph, top) = graph(true);
        graph
            .set_defaults(top, "file", vec![param("a", 1), param("b", 2)])
            .unwrap();
        let child = graph.new_scope(top, ScopeKind::Class, "c", "");
        graph
            .set_defaults(child, "file", vec![param("b", 3), param("c", 4)])
            .unwrap();

        let merged: Vec<(String, Value)> = graph
            .lookup_defaults(child, "file")
            .into_iter()
            .map(|(name, param)| (name, param.value))
            .collect();
        assert_eq!(
            merged,
            vec![
                ("a".to_string(), Value::Integer(1)),
                ("b".to_string(), Value::Integer(3)),
                ("c".to_string(), Value::Integer(4)),
            ]
        );
    }

    #[test]
    fn declarative_defaults_cannot_be_redefined() {
        let (mut graph, top) = graph(true);
        graph.set_defaults(top, "file", vec![param("a", 1)]).unwrap();
        assert!(matches!(
            graph.set_defaults(top, "file", vec![param("a", 2)]),
            Err(CompileError::Reassignment { .. })
        ));
    }

    #[test]
    fn interpolation_is_lenient() {
        let (mut graph, top) = graph(true);
        graph.assign(top, "name", "web".into(), None).unwrap();
        graph.assign(top, "none", Value::Undef, None).unwrap();

        assert_eq!(graph.string_interpolate(top, "host-$name.example"), "host-web.example");
        assert_eq!(graph.string_interpolate(top, "${name}01"), "web01");
        assert_eq!(graph.string_interpolate(top, "[$missing]"), "[]");
        assert_eq!(graph.string_interpolate(top, "[${none}]"), "[]");
        assert_eq!(graph.string_interpolate(top, "cost: \\$5 or $"), "cost: $5 or $");
        assert_eq!(graph.string_interpolate(top, "${::name}:$::name"), "web:web");
        assert_eq!(graph.string_interpolate(top, "$name::"), "web::");
    }

    #[test]
    fn node_and_class_names_collide() {
        let (mut graph, top) = graph(true);
        let node = graph.new_scope(top, ScopeKind::Node, "web", "");
        let class = graph.new_scope(top, ScopeKind::Class, "web", "web");
        graph.class_set("web", node).unwrap();
        assert!(matches!(
            graph.class_set("web", class),
            Err(CompileError::Conflict { .. })
        ));
    }

    #[test]
    fn namespaces_from_most_specific() {
        let (mut graph, top) = graph(true);
        let class = graph.new_scope(top, ScopeKind::Class, "a::b::c", "a::b::c");
        assert_eq!(graph.namespaces(class), vec!["a::b::c", "a::b", "a"]);
        assert!(graph.namespaces(top).is_empty());
    }

    #[test]
    fn ambient_metaparams_come_from_enclosing_scopes() {
        let (mut graph, top) = graph(true);
        graph.assign(top, "schedule", "daily".into(), None).unwrap();
        let child = graph.new_scope(top, ScopeKind::Definition, "d", "");

        let ambient = graph.ambient_metaparams(child);
        assert_eq!(ambient.len(), 1);
        assert_eq!(ambient[0].name, "schedule");
        assert_eq!(ambient[0].value, Value::from("daily"));
    }
}
