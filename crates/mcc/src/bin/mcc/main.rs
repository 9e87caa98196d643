mod cli;

use mcc::catalog::Catalog;
use mcc::compile::{Compile, CompileOptions};
use mcc::data::LayeredData;
use mcc::environment::Environment;
use mcc::hcl_documents::HclDocuments;
use mcc::node::Node;
use mcc::types::TypeSchema;
use mcc::value::Value;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("MCC_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Compile(compile_cli) => compile(compile_cli),
        cli::Command::Dev(dev_cli) => dev(dev_cli),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

pub fn compile(cli: cli::CompileCommand) -> anyhow::Result<()> {
    let documents = load(&cli.input)?;

    let mut builder = Environment::builder();
    if let Some(path) = &cli.types {
        builder = builder.types(TypeSchema::load_file(path)?);
    }
    if !cli.data.is_empty() {
        let mut data = LayeredData::default();
        for path in &cli.data {
            data.load_file(path)?;
        }
        builder = builder.data(data);
    }
    let env = builder.build(&documents)?;

    let mut node = Node::new(&cli.node).with_classes(cli.classes.clone());
    if let Some(path) = &cli.facts {
        node = node.with_facts(load_facts(path)?);
    }

    let options = CompileOptions {
        max_iterations: cli.max_iterations,
        declarative: !cli.non_declarative,
    };
    let catalog = Compile::new(&env, node, options)?.compile()?;

    output(&cli.output, &catalog)?;
    Ok(())
}

fn load(input: &cli::InputArgs) -> anyhow::Result<HclDocuments> {
    let mut documents = HclDocuments::default();

    if !input.workdir && input.files.is_empty() && input.directories.is_empty() {
        let stdin = std::io::read_to_string(std::io::stdin())?;
        documents.insert(stdin, None)?;
        return Ok(documents);
    }

    if input.workdir {
        documents.load_directory(&std::env::current_dir()?)?;
    }

    for file_path in &input.files {
        documents.load_file(file_path)?;
    }

    for dir_path in &input.directories {
        documents.load_directory(dir_path)?;
    }

    anyhow::ensure!(documents.source_count() > 0, "No files loaded");

    Ok(documents)
}

/// Facts are a flat YAML (or JSON) mapping
fn load_facts(path: &std::path::Path) -> anyhow::Result<indexmap::IndexMap<String, Value>> {
    tracing::info!(path=%path.display(), "loading facts");
    let yaml: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;

    match Value::from(yaml) {
        Value::Hash(facts) => Ok(facts),
        Value::Undef => Ok(Default::default()),
        other => anyhow::bail!(
            "Facts in {} must be a mapping, got {}",
            path.display(),
            other.kind()
        ),
    }
}

fn output(output: &cli::OutputArgs, catalog: &Catalog) -> anyhow::Result<()> {
    let rendered = match output.format {
        cli::OutputFormat::Yaml => catalog.to_yaml()?,
        cli::OutputFormat::Json => catalog.to_json()?,
    };
    println!("{}", rendered.trim_end());

    Ok(())
}

/// (mcc-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand::*;

    let documents = load(&cli.input)?;

    match cli.command {
        Documents => println!("{documents:#?}"),
        Manifest => {
            let env = Environment::from_documents(&documents)?;
            println!("{:#?}", env.manifest())
        }
        Scopes { node } => {
            let env = Environment::from_documents(&documents)?;
            let mut compile = Compile::new(&env, Node::new(node), CompileOptions::default())?;
            let result = compile.run();
            // the scope tree is most useful when the compile failed
            print!("{}", compile.scopes().render_tree());
            result?;
        }
    }

    Ok(())
}
