//! the node a catalog is compiled for
use crate::value::Value;
use indexmap::IndexMap;

#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Certificate name, e.g. `web01.example.com`
    pub name: String,
    /// Facts, bound as variables in the top scope
    pub parameters: IndexMap<String, Value>,
    /// Classes assigned to the node from outside the manifest
    pub classes: Vec<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_facts(mut self, facts: IndexMap<String, Value>) -> Self {
        self.parameters = facts;
        self
    }

    pub fn with_classes(mut self, classes: Vec<String>) -> Self {
        self.classes = classes;
        self
    }

    /// Names to match against node definitions, most specific first
    ///
    /// `web01.dc1.example.com` yields itself, `web01.dc1.example`, `web01.dc1` and `web01`, followed
    /// by the `hostname` and `fqdn` facts when they add anything new.
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![];
        let mut push = |name: &str| {
            let name = name.to_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        };

        let mut current = self.name.as_str();
        loop {
            push(current);
            match current.rsplit_once('.') {
                Some((head, _)) => current = head,
                None => break,
            }
        }

        for fact in ["hostname", "fqdn"] {
            if let Some(Value::String(value)) = self.parameters.get(fact) {
                push(value);
            }
        }

        names
    }
}
