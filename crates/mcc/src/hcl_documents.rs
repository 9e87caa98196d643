//! collection of manifest documents ([Body] and source path)
//!
//! [HclDocuments] tracks
//! - the source path and line offsets of every loaded document
//! - the parsed [Body] of every document
//!
//! Documents keep the order in which they were inserted. That order is the evaluation order of their
//! top-level statements.
use crate::error::Location;
use hcl_edit::structure::Body;
use std::path::{Path, PathBuf};

/// Manifest files are recognized by this suffix when loading directories
pub const MANIFEST_SUFFIX: &str = "mcc.hcl";

#[derive(Default, Debug)]
pub struct HclDocuments {
    documents: Vec<Document>,
}

#[derive(Debug)]
pub struct Document {
    pub source: Source,
    pub body: Body,
    /// byte offsets at which each line starts
    line_starts: Vec<usize>,
}

impl Document {
    fn new(text: &str, body: Body, source: Source) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(index, _)| index + 1))
            .collect();

        Self {
            source,
            body,
            line_starts,
        }
    }

    /// Translate a byte offset into a [Location]
    pub fn location(&self, offset: usize) -> Location {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(index) => index + 1,
            Err(index) => index,
        };

        Location::new(self.source.clone(), line)
    }
}

impl HclDocuments {
    /// Parses and inserts a manifest document
    pub fn insert(
        &mut self,
        text: impl Into<String>,
        path: impl Into<Source>,
    ) -> Result<(), LoadError> {
        let text = text.into();
        let body = hcl_edit::parser::parse_body(&text)?;

        self.documents.push(Document::new(&text, body, path.into()));
        Ok(())
    }

    pub fn get(&self, index: usize) -> &Document {
        &self.documents[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Document)> {
        self.documents.iter().enumerate()
    }

    pub fn source_count(&self) -> usize {
        self.documents.len()
    }
}

impl HclDocuments {
    pub fn load_file(&mut self, file_path: &Path) -> Result<(), LoadError> {
        let file_path = file_path.canonicalize()?;
        tracing::info!(path=%file_path.display(), "loading file");

        let file_contents = std::fs::read_to_string(&file_path)?;
        self.insert(file_contents, Some(file_path))
    }

    /// Loads all manifest files of a directory in file name order
    pub fn load_directory(&mut self, dir_path: &Path) -> Result<(), LoadError> {
        let mut file_paths = vec![];

        let read_dir = std::fs::read_dir(dir_path)?;
        for dir_entry in read_dir {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }

            let is_manifest_file = dir_entry
                .file_name()
                .to_string_lossy()
                .ends_with(MANIFEST_SUFFIX);
            if !is_manifest_file {
                continue;
            }

            file_paths.push(dir_entry.path());
        }

        if file_paths.is_empty() {
            return Err(LoadError::NoFilesFound(dir_path.to_owned()));
        }

        file_paths.sort();
        for file_path in file_paths {
            self.load_file(&file_path)?;
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("No manifest files (*{MANIFEST_SUFFIX}) found in {}", .0.display())]
    NoFilesFound(PathBuf),
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse hcl file")]
    HclParseFailed(#[from] hcl_edit::parser::Error),
}

/// Utility macro to create [HclDocuments]
///
/// Create from a single document
/// ```
/// # use mcc::hcl_documents;
/// hcl_documents!(r#"file "/tmp/x" {}"#);
/// ```
///
/// Create from multiple documents (path required)
/// ```
/// # use mcc::hcl_documents;
/// hcl_documents! {
///   "one.mcc.hcl" => "include = \"one\"",
///   "two.mcc.hcl" => "class one {}"
/// };
/// ```
///
/// # Panic
/// Panics on invalid input
///
/// ```should_panic
/// # use mcc::hcl_documents;
/// hcl_documents!("not = valid = hcl");
/// ```
#[macro_export]
macro_rules! hcl_documents {
    // single document without source
    { $expr:expr } => {{
        let mut docs = $crate::hcl_documents::HclDocuments::default();
        docs.insert($expr, None).expect("body must parse");
        docs
    }};
    // multi document with sources
    { $($source:expr => $expr:expr),+ } => {{
        let mut docs = $crate::hcl_documents::HclDocuments::default();
        $(
            docs.insert($expr, Some(std::path::PathBuf::from($source))).expect("body must parse");
        )+

        docs
    }};
}

pub type Source = Option<PathBuf>;

#[cfg(test)]
pub(crate) mod test {
    use pretty_assertions::assert_eq;

    #[test]
    fn iterators() {
        let hcl_documents = hcl_documents! {
            "one.mcc.hcl" => "a = 1",
            "two.mcc.hcl" => "b = 2"
        };

        assert_eq!(hcl_documents.source_count(), 2);
        assert_eq!(
            hcl_documents
                .iter()
                .map(|(_, document)| document.source.clone())
                .collect::<Vec<_>>(),
            vec![Some("one.mcc.hcl".into()), Some("two.mcc.hcl".into())]
        );
    }

    #[test]
    fn offsets_map_to_lines() {
        let documents = hcl_documents!("a = 1\nb = 2\n\nc = 3\n");
        let document = documents.get(0);

        assert_eq!(document.location(0).line, 1);
        assert_eq!(document.location(4).line, 1);
        assert_eq!(document.location(6).line, 2);
        assert_eq!(document.location(13).line, 4);
    }
}
