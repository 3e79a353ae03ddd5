use std::fmt;

/// A source location: the error context (file name, REPL, etc.) plus a
/// 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub context: Option<String>,
    pub line_num: usize,
}

impl SourceLoc {
    pub fn new(context: Option<String>, line_num: usize) -> Self {
        SourceLoc { context, line_num }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) if !ctx.is_empty() => write!(f, "[{} line {}]", ctx, self.line_num),
            _ => write!(f, "[line {}]", self.line_num),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MiniscriptError {
    #[error("{0}")]
    Lexer(String),

    #[error("{0}")]
    Compiler(String),

    #[error("Undefined Identifier: '{0}' is unknown in this context")]
    UndefinedIdentifier(String),

    #[error("Key Not Found: '{0}' not found in map")]
    KeyNotFound(String),

    #[error("{0}")]
    Index(String),

    #[error("{0}")]
    Type(String),

    #[error("Too Many Arguments")]
    TooManyArguments,

    #[error("{0}")]
    LimitExceeded(String),

    #[error("{0}")]
    Runtime(String),

    #[error("{inner}")]
    Located {
        inner: Box<MiniscriptError>,
        location: SourceLoc,
    },
}

impl MiniscriptError {
    pub fn lexer(msg: impl Into<String>) -> Self {
        MiniscriptError::Lexer(msg.into())
    }

    pub fn compiler(msg: impl Into<String>) -> Self {
        MiniscriptError::Compiler(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        MiniscriptError::Runtime(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        MiniscriptError::Type(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        MiniscriptError::Index(msg.into())
    }

    pub fn limit(msg: impl Into<String>) -> Self {
        MiniscriptError::LimitExceeded(msg.into())
    }

    /// Range check shared by indexing paths.  `max` is inclusive.
    pub fn check_range(i: i64, min: i64, max: i64, desc: &str) -> Result<(), MiniscriptError> {
        if i < min || i > max {
            return Err(MiniscriptError::Index(format!(
                "Index Error: {desc} ({i}) out of range ({min} to {max})"
            )));
        }
        Ok(())
    }

    /// Attach a source location, unless one is already present.
    pub fn with_location(self, location: SourceLoc) -> Self {
        match self {
            MiniscriptError::Located { .. } => self,
            other => MiniscriptError::Located {
                inner: Box::new(other),
                location,
            },
        }
    }

    pub fn location(&self) -> Option<&SourceLoc> {
        match self {
            MiniscriptError::Located { location, .. } => Some(location),
            _ => None,
        }
    }

    pub fn inner(&self) -> &MiniscriptError {
        match self {
            MiniscriptError::Located { inner, .. } => inner.inner(),
            other => other,
        }
    }

    /// Standard description: error class, message, and location if known.
    /// This is the string handed to the host's error output.
    pub fn description(&self) -> String {
        let prefix = match self.inner() {
            MiniscriptError::Lexer(_) => "Lexer Error: ",
            MiniscriptError::Compiler(_) => "Compiler Error: ",
            _ => "Runtime Error: ",
        };
        match self {
            MiniscriptError::Located { inner, location } => {
                format!("{}{} {}", prefix, inner, location)
            }
            other => format!("{}{}", prefix, other),
        }
    }
}
