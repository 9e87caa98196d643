//! mcc cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; mcc ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile the catalog of a node
    ///
    /// Reads manifests from stdin unless any other source is provided (via -w, -f or -d)
    Compile(CompileCommand),

    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct CompileCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Certname of the node to compile for
    #[clap(long = "node")]
    pub node: String,

    /// YAML or JSON mapping of facts
    #[clap(long = "facts")]
    pub facts: Option<PathBuf>,

    /// YAML data layer, highest priority first
    #[clap(long = "data")]
    pub data: Vec<PathBuf>,

    /// YAML type schema replacing the built-in one
    #[clap(long = "types")]
    pub types: Option<PathBuf>,

    /// Class assigned to the node
    #[clap(long = "class")]
    pub classes: Vec<String>,

    /// Upper bound for rounds of defined resource and collection evaluation
    #[clap(long = "max-iterations", default_value_t = 1000)]
    pub max_iterations: usize,

    /// Allow variables and defaults to be re-bound within a scope
    #[clap(long = "non-declarative")]
    pub non_declarative: bool,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Load manifests from work directory
    #[clap(short = 'w', long = "input-workdir")]
    pub workdir: bool,

    /// Load a manifest file
    #[clap(short = 'f', long = "input-file")]
    pub files: Vec<PathBuf>,

    /// Load manifests from given directory
    #[clap(short = 'd', long = "input-dir")]
    pub directories: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[command(subcommand)]
    pub command: DevSubCommand,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// Loaded documents
    Documents,
    /// Lowered manifest
    Manifest,
    /// Scope tree after compiling for a node
    Scopes {
        #[clap(long = "node")]
        node: String,
    },
}
