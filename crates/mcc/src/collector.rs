//! virtual and exported resource collection
//!
//! A [Collector] either queries resources of one type with a predicate (`collect file { where = ... }`)
//! or looks for an explicit list of references (`realize`). Realizing a resource only clears its
//! virtual flag; collectors never create or remove resources.
use crate::ast::{CompareOp, Query};
use crate::error::Location;
use crate::resource::{Param, Resource, ResourceId, ResourceRef};
use crate::scope::ScopeId;
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorForm {
    Virtual,
    Exported,
}

#[derive(Debug)]
pub struct Collector {
    pub scope: ScopeId,
    pub type_name: Option<String>,
    pub query: Option<Query<Value>>,
    pub form: CollectorForm,
    /// Parameters applied to every realized resource
    pub overrides: Vec<Param>,
    pub source: String,
    pub location: Option<Location>,
    /// Explicit references that have not been found yet
    pending: Vec<ResourceRef>,
    /// Resources that already received `overrides`
    overridden: IndexSet<ResourceId>,
    explicit: bool,
}

impl Collector {
    /// Collector for all resources of `type_name` matching `query`
    pub fn new(
        scope: ScopeId,
        type_name: &str,
        query: Option<Query<Value>>,
        form: CollectorForm,
        source: &str,
        location: Option<Location>,
    ) -> Self {
        Self {
            scope,
            type_name: Some(type_name.to_string()),
            query,
            form,
            overrides: vec![],
            source: source.to_string(),
            location,
            pending: vec![],
            overridden: IndexSet::new(),
            explicit: false,
        }
    }

    /// Collector for a fixed list of resources
    pub fn explicit(
        scope: ScopeId,
        resources: Vec<ResourceRef>,
        source: &str,
        location: Option<Location>,
    ) -> Self {
        Self {
            scope,
            type_name: None,
            query: None,
            form: CollectorForm::Virtual,
            overrides: vec![],
            source: source.to_string(),
            location,
            pending: resources,
            overridden: IndexSet::new(),
            explicit: true,
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<Param>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// An explicit collector that found everything it was looking for
    pub fn is_satisfied(&self) -> bool {
        self.explicit && self.pending.is_empty()
    }

    /// References an explicit collector is still waiting for
    pub fn unresolved(&self) -> &[ResourceRef] {
        &self.pending
    }

    /// Virtual resources this collector would realize right now
    pub fn collect_virtual(
        &self,
        resources: &[Resource],
        table: &IndexMap<ResourceRef, ResourceId>,
    ) -> Vec<ResourceId> {
        if self.explicit {
            return self
                .pending
                .iter()
                .filter_map(|reference| table.get(reference).copied())
                .filter(|id| resources[id.0].virtual_)
                .collect();
        }

        resources
            .iter()
            .enumerate()
            .filter(|(_, resource)| resource.virtual_ && self.selects(resource))
            .map(|(index, _)| ResourceId(index))
            .collect()
    }

    fn selects(&self, resource: &Resource) -> bool {
        Some(&resource.reference.type_name) == self.type_name.as_ref()
            && (self.form == CollectorForm::Virtual || resource.exported)
            && self
                .query
                .as_ref()
                .map(|query| matches(query, resource))
                .unwrap_or(true)
    }

    /// Matching resources that are not virtual and have not received this collector's overrides
    ///
    /// This covers resources realized by other collectors, by `realize` or declared real. Each
    /// resource is returned once over the lifetime of the collector.
    pub fn override_targets(&mut self, resources: &[Resource]) -> Vec<ResourceId> {
        if self.explicit || self.overrides.is_empty() {
            return vec![];
        }

        let targets: Vec<ResourceId> = resources
            .iter()
            .enumerate()
            .map(|(index, resource)| (ResourceId(index), resource))
            .filter(|(id, resource)| {
                !resource.virtual_ && !self.overridden.contains(id) && self.selects(resource)
            })
            .map(|(id, _)| id)
            .collect();

        self.overridden.extend(targets.iter().copied());
        targets
    }

    /// Realize all currently matching resources
    ///
    /// Returns the resources realized by this call; an empty list means no progress.
    pub fn evaluate(
        &mut self,
        resources: &mut [Resource],
        table: &IndexMap<ResourceRef, ResourceId>,
    ) -> Vec<ResourceId> {
        let realized = self.collect_virtual(resources, table);

        for id in &realized {
            let resource = &mut resources[id.0];
            tracing::debug!(resource=%resource.reference, source=%self.source, "realized");
            resource.virtual_ = false;
            if self.form == CollectorForm::Exported {
                resource.collected = true;
            }
        }

        if self.explicit {
            self.pending.retain(|reference| !table.contains_key(reference));
        }

        realized
    }
}

fn matches(query: &Query<Value>, resource: &Resource) -> bool {
    match query {
        Query::Compare { param, op, value } => {
            let equal = param_equals(resource, param, value);
            match op {
                CompareOp::Eq => equal,
                CompareOp::NotEq => !equal,
            }
        }
        Query::And(lhs, rhs) => matches(lhs, resource) && matches(rhs, resource),
        Query::Or(lhs, rhs) => matches(lhs, resource) || matches(rhs, resource),
    }
}

fn param_equals(resource: &Resource, param: &str, value: &Value) -> bool {
    match param {
        "title" => matches!(value, Value::String(title) if *title == resource.reference.title),
        "tag" => value.as_str().map(|tag| resource.tagged(tag)).unwrap_or(false),
        _ => match (resource.get(param), value) {
            (None, _) => false,
            (Some(Value::Array(items)), value) if !matches!(value, Value::Array(_)) => {
                items.contains(value)
            }
            (Some(actual), value) => actual == value,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::ResourceKind;
    use crate::types::TypeSchema;

    fn table(resources: &[Resource]) -> IndexMap<ResourceRef, ResourceId> {
        resources
            .iter()
            .enumerate()
            .map(|(index, resource)| (resource.reference.clone(), ResourceId(index)))
            .collect()
    }

    fn resource(type_name: &str, title: &str, params: &[(&str, Value)], virtual_: bool) -> Resource {
        let types = TypeSchema::standard();
        let mut resource = Resource::new(
            ResourceRef::new(type_name, title),
            ResourceKind::Builtin,
            "main",
            ScopeId(0),
            None,
        )
        .unwrap();
        for (name, value) in params {
            resource
                .set(Param::new(name.to_string(), value.clone(), "main".into(), None), &types)
                .unwrap();
        }
        resource.virtual_ = virtual_;
        resource
    }

    fn eq(param: &str, value: impl Into<Value>) -> Query<Value> {
        Query::Compare {
            param: param.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    fn query_collector(query: Option<Query<Value>>) -> Collector {
        Collector::new(ScopeId(0), "user", query, CollectorForm::Virtual, "main", None)
    }

    #[test]
    fn nothing_collected_leaves_resources_virtual() {
        let mut resources = vec![resource("user", "alice", &[("uid", Value::Integer(1))], true)];
        let table = table(&resources);

        let mut collector = query_collector(Some(eq("uid", Value::Integer(2))));
        assert!(collector.evaluate(&mut resources, &table).is_empty());
        assert!(resources[0].virtual_);
    }

    #[test]
    fn realizes_matches_once() {
        let mut resources = vec![
            resource("user", "alice", &[("shell", "/bin/sh".into())], true),
            resource("user", "bob", &[("shell", "/bin/zsh".into())], true),
            resource("group", "alice", &[], true),
        ];
        let table = table(&resources);

        let mut collector = query_collector(Some(eq("shell", "/bin/sh")));
        assert_eq!(collector.evaluate(&mut resources, &table), vec![ResourceId(0)]);
        assert!(!resources[0].virtual_);
        assert!(resources[1].virtual_);
        assert!(resources[2].virtual_);

        // idempotent
        assert!(collector.evaluate(&mut resources, &table).is_empty());
        assert!(!collector.is_satisfied());
    }

    #[test]
    fn predicates_combine() {
        let resources = vec![
            resource("user", "a", &[("uid", Value::Integer(1)), ("shell", "sh".into())], true),
            resource("user", "b", &[("uid", Value::Integer(2)), ("shell", "sh".into())], true),
            resource("user", "c", &[("uid", Value::Integer(3))], true),
        ];
        let table = table(&resources);

        let query = Query::Or(
            Box::new(Query::And(Box::new(eq("shell", "sh")), Box::new(eq("uid", Value::Integer(2))))),
            Box::new(eq("title", "c")),
        );
        let collector = query_collector(Some(query));
        assert_eq!(
            collector.collect_virtual(&resources, &table),
            vec![ResourceId(1), ResourceId(2)]
        );
    }

    #[test]
    fn comparison_does_not_coerce() {
        let resources = vec![resource("user", "a", &[("uid", Value::Integer(1))], true)];
        let table = table(&resources);

        let collector = query_collector(Some(eq("uid", "1")));
        assert!(collector.collect_virtual(&resources, &table).is_empty());

        let collector = query_collector(Some(Query::Compare {
            param: "uid".into(),
            op: CompareOp::NotEq,
            value: "1".into(),
        }));
        assert_eq!(collector.collect_virtual(&resources, &table), vec![ResourceId(0)]);
    }

    #[test]
    fn array_parameters_match_any_element() {
        let resources = vec![resource(
            "user",
            "a",
            &[("groups", Value::from(vec!["wheel", "adm"]))],
            true,
        )];
        let table = table(&resources);

        let collector = query_collector(Some(eq("groups", "adm")));
        assert_eq!(collector.collect_virtual(&resources, &table), vec![ResourceId(0)]);
    }

    #[test]
    fn exported_form_only_sees_exported() {
        let mut resources = vec![
            resource("host", "a", &[], true),
            resource("host", "b", &[], true),
        ];
        resources[1].exported = true;
        let table = table(&resources);

        let mut collector =
            Collector::new(ScopeId(0), "host", None, CollectorForm::Exported, "main", None);
        assert_eq!(collector.evaluate(&mut resources, &table), vec![ResourceId(1)]);
        assert!(resources[1].collected);
        assert!(resources[1].exported);
        assert!(!resources[1].virtual_);
        assert!(resources[0].virtual_);

        // still matched after realization, exported stays as declared
        assert!(collector.evaluate(&mut resources, &table).is_empty());
        assert!(resources[1].exported);
    }

    #[test]
    fn overrides_reach_realized_and_real_resources_once() {
        let mut resources = vec![
            resource("user", "a", &[("shell", "sh".into())], false),
            resource("user", "b", &[("shell", "sh".into())], true),
            resource("user", "c", &[("shell", "zsh".into())], false),
        ];
        let table = table(&resources);

        let mut collector = query_collector(Some(eq("shell", "sh"))).with_overrides(vec![Param::new(
            "home".into(),
            "/home".into(),
            "main".into(),
            None,
        )]);

        // virtual resources are left to evaluate
        assert_eq!(collector.override_targets(&resources), vec![ResourceId(0)]);
        assert_eq!(collector.evaluate(&mut resources, &table), vec![ResourceId(1)]);
        assert_eq!(collector.override_targets(&resources), vec![ResourceId(1)]);
        assert!(collector.override_targets(&resources).is_empty());
    }

    #[test]
    fn collectors_without_overrides_have_no_targets() {
        let resources = vec![resource("user", "a", &[], false)];
        let mut collector = query_collector(None);
        assert!(collector.override_targets(&resources).is_empty());
    }

    #[test]
    fn explicit_collector_retires_when_satisfied() {
        let mut resources = vec![resource("user", "a", &[], true)];
        let table_before = table(&resources);

        let mut collector = Collector::explicit(
            ScopeId(0),
            vec![ResourceRef::new("user", "a"), ResourceRef::new("user", "b")],
            "main",
            None,
        );
        assert_eq!(collector.evaluate(&mut resources, &table_before), vec![ResourceId(0)]);
        assert!(!collector.is_satisfied());
        assert_eq!(collector.unresolved(), &[ResourceRef::new("user", "b")]);

        resources.push(resource("user", "b", &[], false));
        let table_after = table(&resources);
        assert!(collector.evaluate(&mut resources, &table_after).is_empty());
        assert!(collector.is_satisfied());
    }
}
