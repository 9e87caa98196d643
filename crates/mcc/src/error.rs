//! compile errors
//!
//! Every [CompileError] is fatal for the compile that raised it. There is no partial catalog.
use std::path::PathBuf;

pub type Result<T, E = CompileError> = std::result::Result<T, E>;

/// A position in a manifest file
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct Location {
    pub file: Option<PathBuf>,
    pub line: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file.display(), self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

fn at(location: &Option<Location>) -> String {
    location
        .as_ref()
        .map(|location| format!(" at {location}"))
        .unwrap_or_default()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Undefined variable, class, definition, node or resource
    #[error("{message}{}", at(.location))]
    Name {
        message: String,
        location: Option<Location>,
    },
    /// Re-binding a variable or default in a declarative scope
    #[error("{message}{}", at(.location))]
    Reassignment {
        message: String,
        location: Option<Location>,
    },
    /// Unknown, missing or malformed resource parameter
    #[error("{message}{}", at(.location))]
    Parameter {
        message: String,
        location: Option<Location>,
    },
    /// Duplicate declaration, cross-branch override or namespace collision
    #[error("{message}{}", at(.location))]
    Conflict {
        message: String,
        location: Option<Location>,
    },
    /// Overrides, collectors or relationships that could not be satisfied
    #[error("{message}{}", at(.location))]
    Unresolved {
        message: String,
        location: Option<Location>,
    },
    /// A function or data provider failed
    #[error("{message}{}", at(.location))]
    External {
        message: String,
        location: Option<Location>,
    },
    /// Misuse of an expression or statement the lowering pass could not catch
    #[error("{message}{}", at(.location))]
    Evaluation {
        message: String,
        location: Option<Location>,
    },
    /// Broken internal invariant
    #[error("internal error: {message}")]
    Internal { message: String },
}

macro_rules! constructor {
    ($name:ident, $variant:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            CompileError::$variant {
                message: message.into(),
                location: None,
            }
        }
    };
}

impl CompileError {
    constructor!(name, Name);
    constructor!(reassignment, Reassignment);
    constructor!(parameter, Parameter);
    constructor!(conflict, Conflict);
    constructor!(unresolved, Unresolved);
    constructor!(external, External);
    constructor!(evaluation, Evaluation);

    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal {
            message: message.into(),
        }
    }

    fn location_mut(&mut self) -> Option<&mut Option<Location>> {
        match self {
            CompileError::Name { location, .. }
            | CompileError::Reassignment { location, .. }
            | CompileError::Parameter { location, .. }
            | CompileError::Conflict { location, .. }
            | CompileError::Unresolved { location, .. }
            | CompileError::External { location, .. }
            | CompileError::Evaluation { location, .. } => Some(location),
            CompileError::Internal { .. } => None,
        }
    }

    /// Attach a location unless the error already carries a more specific one
    pub fn at(mut self, location: Option<&Location>) -> Self {
        if let Some(slot) = self.location_mut() {
            if slot.is_none() {
                *slot = location.cloned();
            }
        }
        self
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            CompileError::Name { location, .. }
            | CompileError::Reassignment { location, .. }
            | CompileError::Parameter { location, .. }
            | CompileError::Conflict { location, .. }
            | CompileError::Unresolved { location, .. }
            | CompileError::External { location, .. }
            | CompileError::Evaluation { location, .. } => location.as_ref(),
            CompileError::Internal { .. } => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_with_and_without_location() {
        let error = CompileError::name("Could not find class foo");
        assert_eq!(error.to_string(), "Could not find class foo");

        let location = Location::new(Some("site.mcc.hcl".into()), 3);
        let error = error.at(Some(&location));
        assert_eq!(error.to_string(), "Could not find class foo at site.mcc.hcl:3");
    }

    #[test]
    fn first_location_wins() {
        let inner = Location::new(None, 7);
        let outer = Location::new(None, 1);
        let error = CompileError::conflict("x")
            .at(Some(&inner))
            .at(Some(&outer));
        assert_eq!(error.location(), Some(&inner));
    }
}
