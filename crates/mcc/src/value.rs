//! value representation
//!
//! Manifest values are one of
//! - undef (an unset value, serialized as `null`)
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//! - hash (order-preserving "map"/"dictionary", where the key is of type string)
//! - resource reference (`Type[title]`)
//!
//! Equality is strict: there is no implicit conversion between kinds, so `"1" != 1` and
//! `1 != 1.0`. Only string interpolation is lenient (see [crate::scope::ScopeGraph::string_interpolate]).
use crate::resource::ResourceRef;
use indexmap::IndexMap;
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serializer,
};

/// All possible value types
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undef,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
    Hash(IndexMap<String, Value>),
    Reference(ResourceRef),
}

impl Value {
    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    /// Truthiness used by conditionals: `undef`, `false` and `""` are false
    pub fn is_true(&self) -> bool {
        match self {
            Value::Undef => false,
            Value::Boolean(b) => *b,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Short name of the kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undef => "undef",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
            Value::Reference(_) => "reference",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Flatten nested arrays into a single list; scalars become a one element list
    pub fn flatten(self) -> Vec<Value> {
        match self {
            Value::Array(values) => values.into_iter().flat_map(Value::flatten).collect(),
            Value::Undef => vec![],
            other => vec![other],
        }
    }

    /// Replace every [Value::Reference] with a `[type, title]` pair
    ///
    /// This is the representation references take in the emitted catalog.
    pub fn into_output_form(self) -> Value {
        match self {
            Value::Reference(reference) => Value::Array(vec![
                Value::String(reference.type_display()),
                Value::String(reference.title),
            ]),
            Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::into_output_form).collect())
            }
            Value::Hash(map) => Value::Hash(
                map.into_iter()
                    .map(|(key, value)| (key, value.into_output_form()))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl std::fmt::Display for Value {
    /// Renders the value the way it appears inside an interpolated string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undef => Ok(()),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Decimal(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Array(values) => {
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
            Value::Hash(map) => {
                f.write_str("{")?;
                for (index, (key, value)) in map.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key} => {value}")?;
                }
                f.write_str("}")
            }
            Value::Reference(reference) => write!(f, "{reference}"),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<ResourceRef> for Value {
    fn from(value: ResourceRef) -> Self {
        Self::Reference(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<K: ToString, V: Into<Value>> From<IndexMap<K, V>> for Value {
    fn from(value: IndexMap<K, V>) -> Self {
        Value::Hash(
            value
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}

impl From<hcl::Number> for Value {
    fn from(value: hcl::Number) -> Self {
        if let Some(int) = value.as_i64() {
            return Value::Integer(int);
        }

        // a number that is neither i64 nor f64 does not exist in hcl
        Value::Decimal(value.as_f64().unwrap_or(f64::NAN))
    }
}

/// Facts and data layers are read as json/yaml documents
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Value::Undef,
            Json::Bool(b) => b.into(),
            Json::Number(n) => match n.as_i64() {
                Some(int) => Value::Integer(int),
                None => Value::Decimal(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => s.into(),
            Json::Array(a) => a.into(),
            Json::Object(o) => Value::Hash(o.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value as Yaml;

        match value {
            Yaml::Null => Value::Undef,
            Yaml::Bool(b) => b.into(),
            Yaml::Number(n) => match n.as_i64() {
                Some(int) => Value::Integer(int),
                None => Value::Decimal(n.as_f64().unwrap_or(f64::NAN)),
            },
            Yaml::String(s) => s.into(),
            Yaml::Sequence(items) => items.into(),
            Yaml::Mapping(mapping) => Value::Hash(
                mapping
                    .into_iter()
                    .map(|(key, value)| {
                        let key = match key {
                            Yaml::String(key) => key,
                            other => Value::from(other).to_string(),
                        };
                        (key, value.into())
                    })
                    .collect(),
            ),
            Yaml::Tagged(tagged) => tagged.value.into(),
        }
    }
}

impl serde::ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Undef => serializer.serialize_none(),
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Hash(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
            Value::Reference(reference) => serializer.collect_str(reference),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equality_is_strict() {
        assert_ne!(Value::from("1"), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::Decimal(1.0));
        assert_eq!(Value::from("a"), Value::from("a"));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undef.is_true());
        assert!(!Value::from("").is_true());
        assert!(!Value::Boolean(false).is_true());
        assert!(Value::Integer(0).is_true());
        assert!(Value::Array(vec![]).is_true());
    }

    #[test]
    fn output_form_replaces_references_with_pairs() {
        let value = Value::Array(vec![
            ResourceRef::new("file", "/tmp/a").into(),
            ResourceRef::new("package", "ntp").into(),
        ]);

        assert_eq!(
            value.into_output_form(),
            Value::Array(vec![
                Value::from(vec!["File", "/tmp/a"]),
                Value::from(vec!["Package", "ntp"]),
            ])
        );
    }

    #[test]
    fn display_for_interpolation() {
        assert_eq!(Value::Undef.to_string(), "");
        assert_eq!(Value::from(vec!["a", "b"]).to_string(), "a,b");
        assert_eq!(
            Value::Reference(ResourceRef::new("apache::vhost", "x")).to_string(),
            "Apache::Vhost[x]"
        );
    }
}
