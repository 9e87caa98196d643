//! Snapshot tests
//!
//! Compiles each *.mcc.hcl file in /tests/ individually for node `web01` and compares if the
//! rendered catalog changes.

#[test]
fn snapshots() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("MCC_LOG"))
        .with_writer(std::io::stderr)
        .init();

    insta::glob!("*.mcc.hcl", |path| {
        let mut documents = mcc::hcl_documents::HclDocuments::default();
        let text = std::fs::read_to_string(path).unwrap();
        documents.insert(text, Some(path.to_owned())).unwrap();

        let env = mcc::environment::Environment::from_documents(&documents)
            .expect("must be a valid manifest");
        let catalog = mcc::compile(&env, mcc::node::Node::new("web01")).expect("must compile");

        insta::assert_snapshot!(catalog.to_json().unwrap());
    });
}
