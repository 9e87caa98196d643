//! the catalog compiler
//!
//! A [Compile] turns an [Environment] plus a [Node] into a [Catalog]:
//!
//! 1. create the top scope and `Class[main]`
//! 2. bind the node's facts in the top scope
//! 3. evaluate the top-level code
//! 4. evaluate the matching node definition
//! 5. evaluate the classes assigned to the node
//! 6. evaluate defined resources and collections until nothing changes
//! 7. fail on overrides and collections that found nothing
//! 8. apply defaults and ambient metaparameters to every resource
//! 9. emit the catalog
//!
//! A compile owns all of its state; the environment is only read.
mod evaluate;

use crate::ast::{ClassDef, NodeDef, Parameter};
use crate::catalog::{Catalog, Edge, Relation};
use crate::collector::Collector;
use crate::data::MergeStrategy;
use crate::environment::Environment;
use crate::error::{CompileError, Location, Result};
use crate::node::Node;
use crate::resource::{
    Override, Param, Resource, ResourceId, ResourceKind, ResourceRef, AMBIENT_METAPARAMS,
};
use crate::scope::{ScopeGraph, ScopeId, ScopeKind};
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

/// Name of the implicit class holding the top-level code
pub const MAIN_CLASS: &str = "main";

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Upper bound for rounds of defined resource and collection evaluation
    pub max_iterations: usize,
    /// Reject re-binding variables and defaults within one scope
    pub declarative: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            declarative: true,
        }
    }
}

#[derive(Debug)]
pub struct Compile<'e> {
    env: &'e Environment,
    options: CompileOptions,
    node: Node,
    pub(crate) scopes: ScopeGraph,
    resources: Vec<Resource>,
    /// First resource declared for each reference
    resource_table: IndexMap<ResourceRef, ResourceId>,
    /// Overrides for resources that do not exist yet
    overrides: IndexMap<ResourceRef, Vec<Override>>,
    collectors: Vec<Collector>,
    main: ResourceId,
    node_scope: Option<ScopeId>,
}

impl<'e> Compile<'e> {
    /// Step 1: top scope and `Class[main]`
    pub fn new(env: &'e Environment, node: Node, options: CompileOptions) -> Result<Self> {
        let mut scopes = ScopeGraph::default();
        let top = scopes.new_top(MAIN_CLASS, options.declarative)?;

        let main_class = Arc::new(ClassDef {
            name: MAIN_CLASS.to_string(),
            parent: None,
            parameters: vec![],
            body: vec![],
            location: Location::new(None, 0),
        });
        let main = Resource::new(
            ResourceRef::class(MAIN_CLASS),
            ResourceKind::Class(main_class),
            MAIN_CLASS,
            top,
            None,
        )?;

        let mut compile = Self {
            env,
            options,
            node,
            scopes,
            resources: vec![],
            resource_table: Default::default(),
            overrides: Default::default(),
            collectors: vec![],
            main: ResourceId(0),
            node_scope: None,
        };

        compile.main = compile.store_resource(main)?;
        compile.resources[compile.main.0].mark_evaluated();
        compile.scopes.get_mut(top).resource = Some(compile.main);
        compile.scopes.class_set(MAIN_CLASS, top)?;
        Ok(compile)
    }

    /// Run every step and emit the catalog
    pub fn compile(mut self) -> Result<Catalog> {
        self.run()?;
        self.to_catalog()
    }

    /// Steps 2 to 8
    pub fn run(&mut self) -> Result<()> {
        self.set_node_parameters()?;
        self.evaluate_main()?;
        self.evaluate_ast_node()?;
        self.evaluate_node_classes()?;
        self.evaluate_generators()?;
        self.fail_on_unevaluated()?;
        self.finish()
    }

    pub fn env(&self) -> &'e Environment {
        self.env
    }

    pub fn scopes(&self) -> &ScopeGraph {
        &self.scopes
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn resource(&self, reference: &ResourceRef) -> Option<&Resource> {
        self.resource_table
            .get(reference)
            .map(|id| &self.resources[id.0])
    }

    /// Step 2: facts become top scope variables
    #[tracing::instrument(skip_all)]
    fn set_node_parameters(&mut self) -> Result<()> {
        let top = self.scopes.top();
        let mut parameters = self.node.parameters.clone();
        parameters
            .entry("clientcert".to_string())
            .or_insert_with(|| Value::from(self.node.name.clone()));

        for (name, value) in parameters {
            self.scopes.assign(top, &name, value, None)?;
        }
        Ok(())
    }

    /// Step 3
    #[tracing::instrument(skip_all)]
    fn evaluate_main(&mut self) -> Result<()> {
        let env = self.env;
        let top = self.scopes.top();
        self.evaluate_body(top, &env.manifest().main)
    }

    /// Step 4: evaluate the node definition matching the node, if the manifest has any
    #[tracing::instrument(skip_all, fields(node = %self.node.name))]
    fn evaluate_ast_node(&mut self) -> Result<()> {
        let env = self.env;
        if !env.has_nodes() {
            return Ok(());
        }

        let names = self.node.names();
        let Some(definition) = env.find_node(&names) else {
            return Err(CompileError::name(format!(
                "Could not find node definition for {} (tried {})",
                self.node.name,
                names.join(", ")
            )));
        };

        let scope = self.evaluate_node(definition.clone())?;
        self.node_scope = Some(scope);
        Ok(())
    }

    fn evaluate_node(&mut self, definition: Arc<NodeDef>) -> Result<ScopeId> {
        let env = self.env;
        let location = Some(&definition.location);

        let parent_scope = match &definition.parent {
            Some(parent) => {
                let Some(parent_definition) = env.find_node_named(parent) else {
                    return Err(CompileError::name(format!("Could not find parent node {parent}"))
                        .at(location));
                };
                match self.scopes.class_scope(parent_definition.classname()) {
                    Some(scope) => scope,
                    None => self.evaluate_node(parent_definition.clone())?,
                }
            }
            None => self.scopes.top(),
        };

        let name = definition.classname().to_string();
        let mut resource = Resource::new(
            ResourceRef::new("node", &name),
            ResourceKind::Node,
            MAIN_CLASS,
            parent_scope,
            location.cloned(),
        )?;
        resource.container = Some(self.main);
        let id = self.store_resource(resource)?;
        self.resources[id.0].mark_evaluated();

        let scope = self.scopes.new_scope(parent_scope, ScopeKind::Node, &name, "");
        self.scopes.get_mut(scope).resource = Some(id);
        self.scopes.class_set(&name, scope).map_err(|e| e.at(location))?;

        tracing::debug!(node = name, "evaluating node definition");
        self.evaluate_body(scope, &definition.body)?;
        Ok(scope)
    }

    /// Step 5
    #[tracing::instrument(skip_all)]
    fn evaluate_node_classes(&mut self) -> Result<()> {
        let classes = self.node.classes.clone();
        if classes.is_empty() {
            return Ok(());
        }

        let scope = self.node_scope.unwrap_or_else(|| self.scopes.top());
        self.evaluate_classes(scope, &classes)?;
        Ok(())
    }

    /// Step 6: alternate between collections and defined resources until a round makes no progress
    #[tracing::instrument(skip_all)]
    fn evaluate_generators(&mut self) -> Result<()> {
        let mut iterations = 0;

        loop {
            iterations += 1;
            if iterations > self.options.max_iterations {
                return Err(CompileError::unresolved(format!(
                    "Somehow looped more than {} times while evaluating defined resources and collections",
                    self.options.max_iterations
                )));
            }

            let collections = self.evaluate_collections()?;
            let definitions = self.evaluate_definitions()?;
            tracing::debug!(iterations, collections, definitions, "generator round");

            if !collections && !definitions {
                return Ok(());
            }
        }
    }

    /// Evaluate every real, not yet evaluated defined resource
    fn evaluate_definitions(&mut self) -> Result<bool> {
        let pending: Vec<ResourceId> = self
            .resources
            .iter()
            .enumerate()
            .filter(|(_, resource)| {
                resource.is_defined() && !resource.is_evaluated() && !resource.virtual_
            })
            .map(|(index, _)| ResourceId(index))
            .collect();

        for id in &pending {
            self.evaluate_define(*id)?;
        }
        Ok(!pending.is_empty())
    }

    /// Run every pending collector once; satisfied explicit collectors are dropped
    ///
    /// Collector overrides go to every matching resource that is not virtual, including resources
    /// realized before the collector was registered.
    fn evaluate_collections(&mut self) -> Result<bool> {
        let mut progress = false;

        for index in 0..self.collectors.len() {
            let realized = self.collectors[index].evaluate(&mut self.resources, &self.resource_table);
            let targets = self.collectors[index].override_targets(&self.resources);
            if realized.is_empty() && targets.is_empty() {
                continue;
            }
            progress = true;

            let collector = &self.collectors[index];
            let overrides: Vec<Override> = targets
                .iter()
                .map(|id| {
                    let mut pending = Override::new(
                        self.resources[id.0].reference.clone(),
                        collector.overrides.clone(),
                        collector.source.clone(),
                        collector.scope,
                        collector.location.clone(),
                    );
                    pending.from_collector = true;
                    pending
                })
                .collect();
            for pending in overrides {
                self.store_override(pending)?;
            }
        }

        self.collectors.retain(|collector| !collector.is_satisfied());
        Ok(progress)
    }

    /// Step 7
    #[tracing::instrument(skip_all)]
    fn fail_on_unevaluated(&mut self) -> Result<()> {
        if let Some((reference, pending)) = self.overrides.iter().find(|(_, pending)| !pending.is_empty()) {
            return Err(CompileError::unresolved(format!(
                "Could not find resource '{reference}' for overriding"
            ))
            .at(pending[0].location.as_ref()));
        }

        if let Some(collector) = self
            .collectors
            .iter()
            .find(|collector| collector.is_explicit() && !collector.is_satisfied())
        {
            let missing: Vec<String> = collector
                .unresolved()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(CompileError::unresolved(format!(
                "Failed to realize virtual resources {}",
                missing.join(", ")
            ))
            .at(collector.location.as_ref()));
        }

        if let Some(resource) = self
            .resources
            .iter()
            .find(|resource| resource.is_defined() && !resource.is_evaluated() && !resource.virtual_)
        {
            return Err(CompileError::unresolved(format!(
                "{} was never evaluated",
                resource.reference
            ))
            .at(resource.location.as_ref()));
        }

        Ok(())
    }

    /// Step 8: defaults, ambient metaparameters and scope tags for every resource
    #[tracing::instrument(skip_all)]
    fn finish(&mut self) -> Result<()> {
        for index in 0..self.resources.len() {
            self.finish_resource(ResourceId(index))?;
        }
        Ok(())
    }

    fn finish_resource(&mut self, id: ResourceId) -> Result<()> {
        if self.resources[id.0].finish() {
            return Ok(());
        }

        let resource = &self.resources[id.0];
        let defaults = self
            .scopes
            .lookup_defaults(resource.scope, &resource.reference.type_name);
        let ambient = self.scopes.ambient_metaparams(resource.scope);
        let tags = self.scopes.tags(resource.scope);

        let types = self.env.types();
        let resource = &mut self.resources[id.0];
        resource.add_defaults(defaults, types)?;
        resource.add_metaparams(ambient);
        for tag in &tags {
            resource.tag(tag);
        }
        Ok(())
    }

    /// Step 9: every resource that is not purely virtual, containment and relationship edges
    #[tracing::instrument(skip_all)]
    pub fn to_catalog(&self) -> Result<Catalog> {
        let emitted = |resource: &Resource| !resource.virtual_ || resource.exported;

        let mut resources = vec![];
        let mut edges = vec![];

        for resource in self.resources.iter().filter(|resource| emitted(resource)) {
            resources.push(resource.to_output_form());

            if let Some(container) = resource.container {
                edges.push(Edge {
                    source: self.resources[container.0].reference.to_string(),
                    target: resource.reference.to_string(),
                    relation: Relation::Contains,
                });
            }
        }

        for resource in self.resources.iter().filter(|resource| !resource.virtual_) {
            edges.extend(self.relationship_edges(resource)?);
        }

        let classes = self
            .scopes
            .class_scopes()
            .filter(|(_, scope)| !self.scopes.get(**scope).is_nodescope())
            .map(|(name, _)| name.clone())
            .collect();

        tracing::debug!(resources = resources.len(), edges = edges.len(), "catalog");
        Ok(Catalog {
            name: self.node.name.clone(),
            classes,
            resources,
            edges,
        })
    }

    fn relationship_edges(&self, resource: &Resource) -> Result<Vec<Edge>> {
        let mut edges = vec![];

        for param in resource.params() {
            let Some(relation) = Relation::from_metaparam(&param.name) else {
                continue;
            };

            for target in param.value.clone().flatten() {
                let reference = match target {
                    Value::Reference(reference) => reference,
                    Value::String(s) => s.parse().map_err(|e: CompileError| e.at(param.location.as_ref()))?,
                    other => {
                        return Err(CompileError::parameter(format!(
                            "{} of {} must be resource references, got {}",
                            param.name,
                            resource.reference,
                            other.kind()
                        ))
                        .at(param.location.as_ref()))
                    }
                };
                let reference = self.canonical_type_reference(reference);

                let exists = self
                    .resource(&reference)
                    .map(|target| !target.virtual_)
                    .unwrap_or(false);
                if !exists {
                    return Err(CompileError::unresolved(format!(
                        "Could not find resource '{reference}' for relationship from '{}'",
                        resource.reference
                    ))
                    .at(param.location.as_ref().or(resource.location.as_ref())));
                }
                if reference == resource.reference {
                    return Err(CompileError::unresolved(format!(
                        "{} cannot have a relationship with itself",
                        resource.reference
                    ))
                    .at(param.location.as_ref().or(resource.location.as_ref())));
                }

                edges.push(Edge {
                    source: resource.reference.to_string(),
                    target: reference.to_string(),
                    relation,
                });
            }
        }

        Ok(edges)
    }

    /// Add a resource to the arena and the resource table
    ///
    /// Pending overrides for the resource are applied right away.
    pub(crate) fn store_resource(&mut self, resource: Resource) -> Result<ResourceId> {
        self.verify_uniqueness(&resource)?;

        let id = ResourceId(self.resources.len());
        let reference = resource.reference.clone();
        tracing::trace!(resource=%reference, source=%resource.source, ?id, "stored");

        self.resources.push(resource);
        self.resource_table.entry(reference.clone()).or_insert(id);

        if let Some(pending) = self.overrides.shift_remove(&reference) {
            self.apply_overrides(id, pending)?;
        }
        Ok(id)
    }

    fn verify_uniqueness(&self, resource: &Resource) -> Result<()> {
        let Some(existing) = self.resource(&resource.reference) else {
            return Ok(());
        };

        let isomorphic = match resource.kind {
            ResourceKind::Builtin => self.env.types().type_isomorphic(&resource.reference.type_name),
            _ => true,
        };
        if !isomorphic {
            return Ok(());
        }

        let previous = existing
            .location
            .as_ref()
            .map(|location| format!(" (previously declared at {location})"))
            .unwrap_or_default();
        Err(CompileError::conflict(format!(
            "Duplicate declaration: {} is already declared{previous}; cannot redeclare",
            resource.reference
        ))
        .at(resource.location.as_ref()))
    }

    /// Apply an override now or keep it until its resource is declared
    pub(crate) fn store_override(&mut self, pending: Override) -> Result<()> {
        match self.resource_table.get(&pending.reference) {
            Some(id) => self.apply_overrides(*id, vec![pending]),
            None => {
                tracing::trace!(resource=%pending.reference, source=%pending.source, "override deferred");
                self.overrides
                    .entry(pending.reference.clone())
                    .or_default()
                    .push(pending);
                Ok(())
            }
        }
    }

    fn apply_overrides(&mut self, id: ResourceId, pending: Vec<Override>) -> Result<()> {
        let env = self.env;
        self.resources[id.0].add_overrides(pending, env.types(), |child, ancestor| {
            env.is_subclass(child, ancestor)
        })
    }

    pub(crate) fn add_collector(&mut self, collector: Collector) {
        tracing::trace!(type_name=?collector.type_name, source=%collector.source, "collector added");
        self.collectors.push(collector);
    }

    /// Include classes by name from `scope`; returns the resolved class names
    ///
    /// Classes that were already evaluated are not evaluated again.
    pub(crate) fn evaluate_classes(&mut self, scope: ScopeId, names: &[String]) -> Result<Vec<String>> {
        let env = self.env;
        let namespaces = self.scopes.namespaces(scope);
        let mut evaluated = vec![];

        for name in names {
            let Some(class) = env.find_class(&namespaces, name) else {
                return Err(CompileError::name(format!("Could not find class {name}")));
            };

            if self.scopes.class_scope(&class.name).is_none() {
                let container = self.scopes.container(scope);
                let source = self.scopes.get(scope).source.clone();
                self.evaluate_class(class.clone(), &source, container, vec![], None)?;
            }
            evaluated.push(class.name.clone());
        }

        Ok(evaluated)
    }

    /// Declare `Class[name]` and evaluate its body in a new class scope
    ///
    /// A parent class is evaluated first, contained by this class.
    pub(crate) fn evaluate_class(
        &mut self,
        class: Arc<ClassDef>,
        source: &str,
        container: Option<ResourceId>,
        params: Vec<Param>,
        location: Option<&Location>,
    ) -> Result<ScopeId> {
        let env = self.env;
        tracing::debug!(class = class.name, source, "evaluating class");

        let mut resource = Resource::new(
            ResourceRef::class(&class.name),
            ResourceKind::Class(class.clone()),
            source,
            self.scopes.top(),
            location.cloned(),
        )?;
        resource.container = container;
        for param in params {
            resource.set(param, env.types()).map_err(|e| e.at(location))?;
        }
        let id = self.store_resource(resource)?;

        let parent_scope = match &class.parent {
            Some(parent_name) => {
                let Some(parent) = env.parent_class(&class) else {
                    return Err(CompileError::name(format!(
                        "Could not find parent class {parent_name} of class {}",
                        class.name
                    ))
                    .at(Some(&class.location)));
                };
                if parent.name == class.name {
                    return Err(CompileError::evaluation(format!(
                        "Class {} cannot inherit from itself",
                        class.name
                    ))
                    .at(Some(&class.location)));
                }

                match self.scopes.class_scope(&parent.name) {
                    Some(scope) => scope,
                    None => self.evaluate_class(
                        parent.clone(),
                        &class.name,
                        Some(id),
                        vec![],
                        Some(&class.location),
                    )?,
                }
            }
            None => self.node_scope.unwrap_or_else(|| self.scopes.top()),
        };

        let scope = self
            .scopes
            .new_scope(parent_scope, ScopeKind::Class, &class.name, &class.name);
        self.scopes.get_mut(scope).resource = Some(id);
        self.resources[id.0].scope = scope;
        self.scopes
            .class_set(&class.name, scope)
            .map_err(|e| e.at(Some(&class.location)))?;

        self.scopes.assign(scope, "title", Value::from(class.name.clone()), None)?;
        self.scopes.assign(scope, "name", Value::from(class.name.clone()), None)?;
        self.bind_parameters(scope, id, &class.parameters, true)?;
        self.resources[id.0].mark_evaluated();

        self.evaluate_body(scope, &class.body)?;
        Ok(scope)
    }

    /// Evaluate a defined resource: bind its parameters in a new scope and run the body
    #[tracing::instrument(skip(self))]
    fn evaluate_define(&mut self, id: ResourceId) -> Result<()> {
        let ResourceKind::Defined(define) = self.resources[id.0].kind.clone() else {
            return Err(CompileError::internal(format!(
                "{} is not a defined resource",
                self.resources[id.0].reference
            )));
        };

        // defaults and metaparameters must be visible to the body
        self.finish_resource(id)?;

        let resource = &self.resources[id.0];
        let declaring_scope = resource.scope;
        let title = resource.reference.title.clone();
        let name = resource
            .get("name")
            .cloned()
            .unwrap_or_else(|| Value::from(title.clone()));
        let ambient: Vec<(String, Value)> = AMBIENT_METAPARAMS
            .iter()
            .filter_map(|metaparam| {
                resource
                    .get(metaparam)
                    .map(|value| (metaparam.to_string(), value.clone()))
            })
            .collect();
        tracing::debug!(resource=%resource.reference, "evaluating definition");

        let scope = self
            .scopes
            .new_scope(declaring_scope, ScopeKind::Definition, &define.name, &define.name);
        self.scopes.get_mut(scope).resource = Some(id);
        self.resources[id.0].mark_evaluated();

        self.scopes.assign(scope, "title", Value::from(title), None)?;
        self.scopes.assign(scope, "name", name, None)?;
        for (metaparam, value) in ambient {
            self.scopes.assign(scope, &metaparam, value, None)?;
        }
        self.bind_parameters(scope, id, &define.parameters, false)?;

        self.evaluate_body(scope, &define.body)
    }

    /// Bind formal parameters as variables in `scope`
    ///
    /// Values come from the resource, then (for classes) the data provider under
    /// `<class>::<parameter>`, then the default expression. Values found outside the resource are
    /// recorded on it as well.
    fn bind_parameters(
        &mut self,
        scope: ScopeId,
        id: ResourceId,
        parameters: &[Parameter],
        data_binding: bool,
    ) -> Result<()> {
        let env = self.env;

        for parameter in parameters {
            if matches!(parameter.name.as_str(), "title" | "name") {
                continue;
            }

            let mut value = self.resources[id.0].get(&parameter.name).cloned();
            let mut record = false;

            if value.is_none() && data_binding {
                let key = format!("{}::{}", self.scopes.get(scope).source, parameter.name);
                value = self.lookup_data(scope, &key, None, &MergeStrategy::First)?;
                record = value.is_some();
            }
            if value.is_none() {
                if let Some(default) = &parameter.default {
                    value = Some(self.evaluate_expr(scope, default)?);
                    record = true;
                }
            }

            let Some(value) = value else {
                let resource = &self.resources[id.0];
                return Err(CompileError::parameter(format!(
                    "Must pass {} to {}",
                    parameter.name, resource.reference
                ))
                .at(resource.location.as_ref()));
            };

            if record && !value.is_undef() {
                let source = self.scopes.get(scope).source.clone();
                self.resources[id.0].set(
                    Param::new(parameter.name.clone(), value.clone(), source, None),
                    env.types(),
                )?;
            }
            self.scopes.assign(scope, &parameter.name, value, None)?;
        }
        Ok(())
    }

    /// Append values to a relationship metaparameter of the resource containing `scope`
    pub(crate) fn add_relationship(&mut self, scope: ScopeId, metaparam: &str, value: Value) -> Result<()> {
        let Some(container) = self.scopes.container(scope) else {
            return Err(CompileError::internal("scope without containing resource"));
        };

        let source = self.scopes.get(scope).source.clone();
        self.resources[container.0].append_relationship(metaparam, value, &source);
        Ok(())
    }

    /// Tag `scope` and the resource containing it
    pub(crate) fn add_tags(&mut self, scope: ScopeId, tags: &[String]) {
        for tag in tags {
            let tag = tag.to_lowercase();
            self.scopes.get_mut(scope).tags.insert(tag.clone());
            if let Some(container) = self.scopes.container(scope) {
                self.resources[container.0].tag(&tag);
            }
        }
    }

    /// Tags of `scope` and the resource containing it
    pub(crate) fn tags(&self, scope: ScopeId) -> IndexSet<String> {
        let mut tags = self.scopes.tags(scope);
        if let Some(container) = self.scopes.container(scope) {
            tags.extend(self.resources[container.0].tags.iter().cloned());
        }
        tags
    }

    /// Query the data provider with the variables visible from `scope`
    pub(crate) fn lookup_data(
        &self,
        scope: ScopeId,
        key: &str,
        override_source: Option<&str>,
        merge: &MergeStrategy,
    ) -> Result<Option<Value>> {
        let variables = |name: &str| self.scopes.lookup_opt(scope, name).ok().flatten().cloned();

        self.env
            .data()
            .lookup(key, &variables, override_source, merge)
            .map_err(|e| CompileError::external(format!("Lookup of '{key}' failed: {e}")))
    }

    /// Resolve a resource type name as seen from `scope`
    ///
    /// Built-in types win over defined types; defined types are searched from the scope's namespace
    /// outward.
    pub(crate) fn resolve_type(&self, scope: ScopeId, type_name: &str) -> Option<(String, ResourceKind)> {
        let types = self.env.types();
        if types.type_exists(type_name) {
            return Some((types.canonical_name(type_name), ResourceKind::Builtin));
        }

        let define = self.env.find_define(&self.scopes.namespaces(scope), type_name)?;
        Some((define.name.clone(), ResourceKind::Defined(define.clone())))
    }

    /// Normalize a reference's type through aliases and namespaces
    pub(crate) fn canonical_reference(&self, scope: ScopeId, reference: ResourceRef) -> ResourceRef {
        if reference.is_class() {
            let namespaces = self.scopes.namespaces(scope);
            return match self.env.find_class(&namespaces, &reference.title) {
                Some(class) => ResourceRef::class(&class.name),
                None => reference,
            };
        }

        match self.resolve_type(scope, &reference.type_name) {
            Some((type_name, _)) => ResourceRef::new(type_name, reference.title),
            None => reference,
        }
    }

    fn canonical_type_reference(&self, reference: ResourceRef) -> ResourceRef {
        let types = self.env.types();
        if types.type_exists(&reference.type_name) {
            return ResourceRef::new(types.canonical_name(&reference.type_name), reference.title);
        }
        reference
    }

    /// A known class, defined type or built-in type
    pub(crate) fn is_known_type(&self, scope: ScopeId, name: &str) -> bool {
        let namespaces = self.scopes.namespaces(scope);
        self.env.find_class(&namespaces, name).is_some() || self.resolve_type(scope, name).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hcl_documents;
    use pretty_assertions::assert_eq;

    fn compile(manifest: &str) -> Result<Catalog> {
        let env = Environment::from_documents(&hcl_documents!(manifest)).unwrap();
        Compile::new(&env, Node::new("web01"), CompileOptions::default())?.compile()
    }

    #[test]
    fn main_class_contains_top_level_resources() {
        let catalog = compile("file \"/tmp/x\" {}\n").unwrap();

        assert_eq!(catalog.classes, vec!["main"]);
        assert_eq!(catalog.contained_in("Class[main]"), vec!["File[/tmp/x]"]);
    }

    #[test]
    fn facts_are_top_scope_variables() {
        let env = Environment::from_documents(&hcl_documents!("file \"/tmp/$os\" {}\n")).unwrap();
        let mut facts = IndexMap::new();
        facts.insert("os".to_string(), Value::from("linux"));

        let catalog = Compile::new(&env, Node::new("web01").with_facts(facts), CompileOptions::default())
            .unwrap()
            .compile()
            .unwrap();
        assert!(catalog.resource("File[/tmp/linux]").is_some());
    }

    #[test]
    fn iteration_cap_is_enforced() {
        let env = Environment::from_documents(&hcl_documents!(
            r#"
define chain {
  params { depth = 0 }
  chain {
    title = "link${depth}"
    depth = depth + 1
  }
}
chain "start" {}
"#
        ))
        .unwrap();

        let options = CompileOptions {
            max_iterations: 5,
            ..Default::default()
        };
        let result = Compile::new(&env, Node::new("web01"), options).unwrap().compile();
        assert!(matches!(result, Err(CompileError::Unresolved { .. })));
    }

    #[test]
    fn collections_run_before_definitions_in_a_round() {
        let env = Environment::from_documents(&hcl_documents!(
            r#"
define maker {
  file {
    title = "/made/${title}"
  }
}

virtual maker "one" {}
realize = Maker["one"]
"#
        ))
        .unwrap();

        // realized and evaluated in the first round, the second one finds nothing to do
        let options = CompileOptions {
            max_iterations: 2,
            ..Default::default()
        };
        let catalog = Compile::new(&env, Node::new("web01"), options)
            .unwrap()
            .compile()
            .unwrap();
        assert!(catalog.resource("File[/made/one]").is_some());
    }

    #[test]
    fn generators_reach_a_fixpoint() {
        let env = Environment::from_documents(&hcl_documents!(
            r#"
collect file {
  where = owner == "gen"
}

define maker {
  virtual file {
    title = "/made/${title}"
    owner = "gen"
  }
}

maker "one" {}
"#
        ))
        .unwrap();

        let mut compile = Compile::new(&env, Node::new("web01"), CompileOptions::default()).unwrap();
        compile.run().unwrap();
        let resources: Vec<String> = compile.resources().map(|r| r.reference.to_string()).collect();
        assert_eq!(resources, vec!["Class[main]", "Maker[one]", "File[/made/one]"]);
        assert!(compile.resources().all(|resource| !resource.virtual_));

        compile.evaluate_generators().unwrap();
        assert_eq!(compile.resources().count(), resources.len());
    }

    #[test]
    fn relationship_to_missing_resource() {
        let result = compile("file \"/a\" { require = File[\"/b\"] }\n");
        assert!(matches!(result, Err(CompileError::Unresolved { .. })));
    }

    #[test]
    fn relationship_to_self() {
        let result = compile("file \"/a\" { before = File[\"/a\"] }\n");
        assert!(matches!(result, Err(CompileError::Unresolved { .. })));
    }
}
