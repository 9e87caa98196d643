//! Compiles small manifests end to end and inspects the catalogs

use indexmap::IndexMap;
use mcc::catalog::{Catalog, Relation};
use mcc::compile::{Compile, CompileOptions};
use mcc::data::LayeredData;
use mcc::environment::Environment;
use mcc::error::CompileError;
use mcc::hcl_documents;
use mcc::node::Node;
use mcc::value::Value;
use pretty_assertions::assert_eq;

fn compile(manifest: &str) -> Result<Catalog, CompileError> {
    let env = Environment::from_documents(&hcl_documents!(manifest)).expect("valid manifest");
    mcc::compile(&env, Node::new("web01"))
}

fn param<'c>(catalog: &'c Catalog, reference: &str, name: &str) -> Option<&'c Value> {
    catalog.resource(reference)?.parameters.get(name)
}

/// Containers of `reference`, innermost first
fn containers(catalog: &Catalog, reference: &str) -> Vec<String> {
    let mut chain = vec![];
    let mut current = reference.to_string();

    while let Some(edge) = catalog
        .edges
        .iter()
        .find(|edge| edge.relation == Relation::Contains && edge.target == current)
    {
        chain.push(edge.source.clone());
        current = edge.source.clone();
    }
    chain
}

#[test]
fn subclass_collects_and_overrides_a_virtual_resource() {
    let catalog = compile(
        r#"
class base {
  virtual file "/tmp/f" {
    owner = "root"
  }
}

class sub inherits base {
  collect file {
    where = title == "/tmp/f"
    owner = "bin"
  }
}

include = "sub"
"#,
    )
    .unwrap();

    let files: Vec<_> = catalog
        .resources
        .iter()
        .filter(|resource| resource.type_name == "File")
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].title, "/tmp/f");
    assert!(!files[0].virtual_);
    assert_eq!(param(&catalog, "File[/tmp/f]", "owner"), Some(&Value::from("bin")));

    assert_eq!(
        containers(&catalog, "File[/tmp/f]"),
        vec!["Class[base]", "Class[sub]", "Class[main]"]
    );
}

#[test]
fn required_class_is_included_once() {
    let catalog = compile(
        r#"
class foo {}

class a {
  require = "foo"
}

class b {
  require = "foo"
}

include = ["a", "b"]
"#,
    )
    .unwrap();

    let foo: Vec<_> = catalog
        .resources
        .iter()
        .filter(|resource| resource.reference() == "Class[foo]")
        .collect();
    assert_eq!(foo.len(), 1);
    assert_eq!(catalog.classes, vec!["main", "a", "foo", "b"]);

    for requiring in ["Class[a]", "Class[b]"] {
        let requires: Vec<_> = catalog
            .edges_from(requiring)
            .filter(|edge| edge.relation == Relation::Requires)
            .map(|edge| edge.target.as_str())
            .collect();
        assert_eq!(requires, vec!["Class[foo]"]);
    }
}

#[test]
fn duplicate_isomorphic_resource_is_a_conflict() {
    let result = compile("file \"/tmp/x\" {}\nfile \"/tmp/x\" {}\n");
    let error = result.unwrap_err();

    assert!(matches!(error, CompileError::Conflict { .. }));
    assert_eq!(error.location().map(|location| location.line), Some(2));
}

#[test]
fn duplicate_non_isomorphic_resources_coexist() {
    let catalog = compile(
        r#"
exec "x" {
  command = "/bin/true"
}
exec "x" {
  command = "/bin/false"
}
"#,
    )
    .unwrap();

    let execs = catalog
        .resources
        .iter()
        .filter(|resource| resource.type_name == "Exec")
        .count();
    assert_eq!(execs, 2);
}

#[test]
fn override_before_declaration() {
    let catalog = compile(
        r#"
class app {
  override file "/x" {
    owner = "boo"
  }

  file "/x" {
    owner = "rah"
    group = "foo"
  }
}

include = "app"
"#,
    )
    .unwrap();

    assert_eq!(param(&catalog, "File[/x]", "owner"), Some(&Value::from("boo")));
    assert_eq!(param(&catalog, "File[/x]", "group"), Some(&Value::from("foo")));
}

#[test]
fn override_from_unrelated_class_is_rejected() {
    let result = compile(
        r#"
class a {
  file "/x" {}
}

class b {
  override file "/x" {
    owner = "bin"
  }
}

include = ["a", "b"]
"#,
    );
    assert!(matches!(result, Err(CompileError::Conflict { .. })));
}

#[test]
fn override_from_subclass_is_applied() {
    let catalog = compile(
        r#"
class a {
  file "/x" {
    owner = "root"
  }
}

class c inherits a {
  override file "/x" {
    owner = "bin"
  }
}

include = "c"
"#,
    )
    .unwrap();

    assert_eq!(param(&catalog, "File[/x]", "owner"), Some(&Value::from("bin")));
}

#[test]
fn override_of_missing_resource() {
    let result = compile("override file \"/nowhere\" {\n  owner = \"bin\"\n}\n");
    assert!(matches!(result, Err(CompileError::Unresolved { .. })));
}

#[test]
fn virtual_resources_are_excluded_until_realized() {
    let catalog = compile("virtual file \"/v\" {}\nvirtual file \"/w\" {}\nrealize = File[\"/w\"]\n").unwrap();

    assert!(catalog.resource("File[/v]").is_none());
    assert!(catalog.resource("File[/w]").is_some());
}

#[test]
fn realizing_a_missing_resource() {
    let error = compile("file \"/v\" {}\n\nrealize = File[\"/w\"]\n").unwrap_err();
    assert!(matches!(error, CompileError::Unresolved { .. }));
    assert_eq!(error.location().map(|location| location.line), Some(3));
}

#[test]
fn exported_resources_are_emitted_but_not_applied() {
    let catalog = compile("exported file \"/e\" {}\n").unwrap();

    let exported = catalog.resource("File[/e]").unwrap();
    assert!(exported.exported);
    assert!(exported.virtual_);
}

#[test]
fn exported_resources_keep_their_flag_when_collected() {
    let catalog = compile(
        r#"
exported host "db" {
  ip = "10.0.0.1"
}

collect exported host {}
"#,
    )
    .unwrap();

    let host = catalog.resource("Host[db]").unwrap();
    assert!(!host.virtual_);
    assert!(host.exported);
    assert!(host.collected);
}

#[test]
fn collection_query_with_combined_comparisons() {
    let catalog = compile(
        r#"
virtual user "alice" {
  shell = "/bin/sh"
  uid   = 1
}

virtual user "bob" {
  shell = "/bin/sh"
  uid   = 2
}

collect user {
  where = shell == "/bin/sh" && uid == 1
}

file "/tmp/n" {
  content = "${10 - 2 - 3}"
}
"#,
    )
    .unwrap();

    assert!(catalog.resource("User[alice]").is_some());
    assert!(catalog.resource("User[bob]").is_none());
    assert_eq!(param(&catalog, "File[/tmp/n]", "content"), Some(&Value::from("5")));
}

#[test]
fn collector_overrides_reach_resources_realized_elsewhere() {
    let catalog = compile(
        r#"
virtual user "alice" {
  shell = "/bin/sh"
}

user "root" {
  shell = "/bin/sh"
}

user "daemon" {
  shell = "/sbin/nologin"
}

realize = User["alice"]

collect user {
  where = shell == "/bin/sh"
  home  = "/home"
}
"#,
    )
    .unwrap();

    assert_eq!(param(&catalog, "User[alice]", "home"), Some(&Value::from("/home")));
    assert_eq!(param(&catalog, "User[root]", "home"), Some(&Value::from("/home")));
    assert_eq!(param(&catalog, "User[daemon]", "home"), None);
}

#[test]
fn collector_declared_before_generated_resource() {
    let catalog = compile(
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
maker "two" {}
"#,
    )
    .unwrap();

    for reference in ["File[/made/one]", "File[/made/two]"] {
        let made = catalog.resource(reference).unwrap();
        assert!(!made.virtual_);
    }
    assert_eq!(containers(&catalog, "File[/made/one]"), vec!["Maker[one]", "Class[main]"]);
}

#[test]
fn defines_with_required_parameters() {
    let result = compile(
        r#"
define vhost {
  params {
    port = null
  }
}

vhost "a" {}
"#,
    );
    assert!(matches!(result, Err(CompileError::Parameter { .. })));
}

#[test]
fn class_parameters_from_data() {
    let documents = hcl_documents!(
        r#"
class ntp {
  params {
    server = "pool.ntp.org"
    fallback = "time.example.com"
  }

  file "/etc/ntp.conf" {
    content = "${server} ${fallback}"
  }
}

include = "ntp"
"#
    );
    let mut data = LayeredData::new(vec!["common".to_string()]);
    data.add_yaml("common", "ntp::server: ntp.internal\n").unwrap();
    let env = Environment::builder().data(data).build(&documents).unwrap();

    let catalog = mcc::compile(&env, Node::new("web01")).unwrap();
    assert_eq!(
        param(&catalog, "File[/etc/ntp.conf]", "content"),
        Some(&Value::from("ntp.internal time.example.com"))
    );
    assert_eq!(
        param(&catalog, "Class[ntp]", "server"),
        Some(&Value::from("ntp.internal"))
    );
}

#[test]
fn resource_like_class_declaration() {
    let catalog = compile(
        r#"
class ntp {
  params {
    server = null
  }
}

resource class "ntp" {
  server = "a"
}
"#,
    )
    .unwrap();
    assert_eq!(param(&catalog, "Class[ntp]", "server"), Some(&Value::from("a")));

    let result = compile(
        r#"
class ntp {}

include = "ntp"
resource class "ntp" {}
"#,
    );
    assert!(matches!(result, Err(CompileError::Conflict { .. })));
}

#[test]
fn node_definitions_and_classes() {
    let documents = hcl_documents!(
        r#"
class base {}
class web {}

node "web01" {
  include = "base"
}

node default {}
"#
    );
    let env = Environment::from_documents(&documents).unwrap();

    let node = Node::new("web01.example.com").with_classes(vec!["web".to_string()]);
    let catalog = Compile::new(&env, node, CompileOptions::default())
        .unwrap()
        .compile()
        .unwrap();

    assert_eq!(catalog.name, "web01.example.com");
    assert_eq!(catalog.classes, vec!["main", "base", "web"]);
    assert_eq!(containers(&catalog, "Class[base]"), vec!["Node[web01]", "Class[main]"]);
    assert_eq!(containers(&catalog, "Class[web]"), vec!["Node[web01]", "Class[main]"]);
}

#[test]
fn facts_and_defaults() {
    let documents = hcl_documents!(
        r#"
defaults file {
  owner = "root"
  mode  = "0644"
}

class app {
  defaults file {
    mode = "0600"
  }

  file {
    title = "/etc/${os}.conf"
  }
}

include = "app"
"#
    );
    let env = Environment::from_documents(&documents).unwrap();

    let mut facts = IndexMap::new();
    facts.insert("os".to_string(), Value::from("linux"));
    let catalog = mcc::compile(&env, Node::new("web01").with_facts(facts)).unwrap();

    assert_eq!(param(&catalog, "File[/etc/linux.conf]", "owner"), Some(&Value::from("root")));
    assert_eq!(param(&catalog, "File[/etc/linux.conf]", "mode"), Some(&Value::from("0600")));
}

#[test]
fn compiles_share_an_environment() {
    let env = Environment::from_documents(&hcl_documents!("file \"/etc/$clientcert\" {}\n")).unwrap();

    let catalogs: Vec<Catalog> = std::thread::scope(|threads| {
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let env = &env;
                threads.spawn(move || mcc::compile(env, Node::new(name)).unwrap())
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(catalogs[0].resource("File[/etc/a]").is_some());
    assert!(catalogs[1].resource("File[/etc/b]").is_some());
}
