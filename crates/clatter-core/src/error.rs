use std::fmt;
use std::fs;

use thiserror::Error;

use crate::ast::Span;

pub const ERROR_TAG: &str = "\x1b[31m[ERROR]\x1b[0m";
pub const WARN_TAG: &str = "\x1b[33m[WARN]\x1b[0m";

#[derive(Clone, Debug, Default)]
pub struct StackFrame {
    pub function: String,
    pub span: Option<Span>,
    pub file: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub span: Option<Span>,
    pub file: Option<String>,
    pub stack: Vec<StackFrame>,
}

impl ErrorContext {
    fn set_span(&mut self, span: Span) {
        if self.span.is_none() {
            self.span = Some(span);
        }
    }

    fn set_file(&mut self, file: Option<String>) {
        if self.file.is_none() {
            self.file = file;
        }
    }

    fn set_stack(&mut self, stack: Vec<StackFrame>) {
        if self.stack.is_empty() && !stack.is_empty() {
            self.stack = stack;
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorData {
    pub message: String,
    pub context: ErrorContext,
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Failure subkinds raised while reading one form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderErrorKind {
    UnterminatedList,
    UnterminatedString,
    InvalidNumber,
    InvalidEscape,
    UnmatchedDelimiter,
    InvalidDispatchChar,
    FeatureNotFound,
    UnsupportedArg,
    InvalidMeta,
}

impl fmt::Display for ReaderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderErrorKind::UnterminatedList => "unterminated list",
            ReaderErrorKind::UnterminatedString => "unterminated string",
            ReaderErrorKind::InvalidNumber => "invalid number",
            ReaderErrorKind::InvalidEscape => "invalid escape",
            ReaderErrorKind::UnmatchedDelimiter => "unmatched delimiter",
            ReaderErrorKind::InvalidDispatchChar => "invalid dispatch character",
            ReaderErrorKind::FeatureNotFound => "no matching reader-conditional feature",
            ReaderErrorKind::UnsupportedArg => "fn arg used outside #()",
            ReaderErrorKind::InvalidMeta => "invalid metadata target",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ClatterError {
    #[error("io error: {0}")]
    Io(ErrorData),

    #[error("reader error ({kind}): {data}")]
    Reader {
        kind: ReaderErrorKind,
        data: ErrorData,
    },

    #[error("unable to resolve symbol: {0}")]
    UnresolvedSymbol(ErrorData),

    #[error("bad special form: {0}")]
    BadSpecialForm(ErrorData),

    #[error("duplicate arity: {0}")]
    DuplicateArity(ErrorData),

    #[error("more than one variadic overload: {0}")]
    MultipleVariadic(ErrorData),

    #[error("variadic overload has fewer params than a fixed overload: {0}")]
    InvalidVariadicArity(ErrorData),

    #[error("recur argument count mismatch: {0}")]
    RecurArityMismatch(ErrorData),

    #[error("recur not in tail position: {0}")]
    RecurNotInTailPosition(ErrorData),

    #[error("unknown feature: {0}")]
    UnknownFeature(ErrorData),

    #[error("macroexpansion of {macro_name} failed: {cause}")]
    MacroExpansionFailed {
        macro_name: String,
        cause: Box<ClatterError>,
        context: ErrorContext,
    },

    #[error("assembly failed: {0}")]
    AssemblyFailed(ErrorData),

    #[error("load failed: {0}")]
    LoadFailed(ErrorData),

    #[error("no implementation of {protocol}/{method} for {value_type}")]
    NotImplemented {
        protocol: String,
        method: String,
        value_type: String,
        context: ErrorContext,
    },

    #[error("*compile-files* is set but no compile path is configured")]
    CompilePathUnset(ErrorData),

    #[error("thrown: {value}")]
    Thrown {
        value: Box<crate::value::Value>,
        context: ErrorContext,
    },
}

impl ClatterError {
    pub fn io(message: impl Into<String>) -> Self {
        ClatterError::Io(ErrorData::new(message))
    }

    pub fn reader(kind: ReaderErrorKind, message: impl Into<String>) -> Self {
        ClatterError::Reader {
            kind,
            data: ErrorData::new(message),
        }
    }

    pub fn unresolved(message: impl Into<String>) -> Self {
        ClatterError::UnresolvedSymbol(ErrorData::new(message))
    }

    pub fn bad_form(message: impl Into<String>) -> Self {
        ClatterError::BadSpecialForm(ErrorData::new(message))
    }

    pub fn assembly(message: impl Into<String>) -> Self {
        ClatterError::AssemblyFailed(ErrorData::new(message))
    }

    pub fn load(message: impl Into<String>) -> Self {
        ClatterError::LoadFailed(ErrorData::new(message))
    }

    pub fn thrown(value: crate::value::Value) -> Self {
        ClatterError::Thrown {
            value: Box::new(value),
            context: ErrorContext::default(),
        }
    }

    pub fn thrown_message(message: impl Into<String>) -> Self {
        ClatterError::thrown(crate::value::Value::string(message.into()))
    }

    pub fn thrown_value(&self) -> Option<&crate::value::Value> {
        match self {
            ClatterError::Thrown { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn macro_failed(macro_name: impl Into<String>, cause: ClatterError) -> Self {
        ClatterError::MacroExpansionFailed {
            macro_name: macro_name.into(),
            cause: Box::new(cause),
            context: ErrorContext::default(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.set_span(span);
        }
        self
    }

    pub fn with_file(mut self, file: Option<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.set_file(file);
        }
        self
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.set_stack(stack);
        }
        self
    }

    pub fn span(&self) -> Option<Span> {
        self.context_ref().and_then(|ctx| ctx.span)
    }

    pub fn file(&self) -> Option<&str> {
        self.context_ref().and_then(|ctx| ctx.file.as_deref())
    }

    pub fn stack(&self) -> &[StackFrame] {
        self.context_ref()
            .map(|ctx| ctx.stack.as_slice())
            .unwrap_or(&[])
    }

    pub fn reader_kind(&self) -> Option<ReaderErrorKind> {
        match self {
            ClatterError::Reader { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn context_ref(&self) -> Option<&ErrorContext> {
        match self {
            ClatterError::Io(data)
            | ClatterError::UnresolvedSymbol(data)
            | ClatterError::BadSpecialForm(data)
            | ClatterError::DuplicateArity(data)
            | ClatterError::MultipleVariadic(data)
            | ClatterError::InvalidVariadicArity(data)
            | ClatterError::RecurArityMismatch(data)
            | ClatterError::RecurNotInTailPosition(data)
            | ClatterError::UnknownFeature(data)
            | ClatterError::AssemblyFailed(data)
            | ClatterError::LoadFailed(data)
            | ClatterError::CompilePathUnset(data) => Some(&data.context),
            ClatterError::Reader { data, .. } => Some(&data.context),
            ClatterError::MacroExpansionFailed { context, .. }
            | ClatterError::NotImplemented { context, .. }
            | ClatterError::Thrown { context, .. } => Some(context),
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            ClatterError::Io(data)
            | ClatterError::UnresolvedSymbol(data)
            | ClatterError::BadSpecialForm(data)
            | ClatterError::DuplicateArity(data)
            | ClatterError::MultipleVariadic(data)
            | ClatterError::InvalidVariadicArity(data)
            | ClatterError::RecurArityMismatch(data)
            | ClatterError::RecurNotInTailPosition(data)
            | ClatterError::UnknownFeature(data)
            | ClatterError::AssemblyFailed(data)
            | ClatterError::LoadFailed(data)
            | ClatterError::CompilePathUnset(data) => Some(&mut data.context),
            ClatterError::Reader { data, .. } => Some(&mut data.context),
            ClatterError::MacroExpansionFailed { context, .. }
            | ClatterError::NotImplemented { context, .. }
            | ClatterError::Thrown { context, .. } => Some(context),
        }
    }
}

impl From<std::io::Error> for ClatterError {
    fn from(e: std::io::Error) -> Self {
        ClatterError::io(e.to_string())
    }
}

/// One line per error with a `file:line:col` prefix, followed by the source
/// snippet when the file is readable, then the stack.
pub fn format_error(err: &ClatterError) -> Vec<String> {
    let mut lines = Vec::new();
    let location = format_location(err.file(), err.span());
    match &location {
        Some(loc) => lines.push(format!("{} {}: {}", ERROR_TAG, loc, err)),
        None => lines.push(format!("{} {}", ERROR_TAG, err)),
    }
    if let (Some(file), Some(span)) = (err.file(), err.span()) {
        if let Some(snippet) = format_source_snippet(file, span) {
            lines.extend(snippet);
        }
    }
    for frame in err.stack().iter().rev() {
        let frame_loc = format_location(frame.file.as_deref(), frame.span)
            .unwrap_or_else(|| "unknown".into());
        if frame.function.is_empty() {
            lines.push(format!("  at {}", frame_loc));
        } else {
            lines.push(format!("  at {} in {}", frame_loc, frame.function));
        }
    }
    lines
}

pub fn format_warning(file: Option<&str>, span: Option<Span>, message: &str) -> String {
    match format_location(file, span) {
        Some(loc) => format!("{} {}: {}", WARN_TAG, loc, message),
        None => format!("{} {}", WARN_TAG, message),
    }
}

fn format_location(file: Option<&str>, span: Option<Span>) -> Option<String> {
    match (file, span) {
        (Some(file), Some(span)) => Some(format!("{}:{}:{}", file, span.line, span.col)),
        (Some(file), None) => Some(file.to_string()),
        (None, Some(span)) => Some(format!("{}:{}", span.line, span.col)),
        (None, None) => None,
    }
}

fn format_source_snippet(file: &str, span: Span) -> Option<Vec<String>> {
    if span.line == 0 {
        return None;
    }
    let content = fs::read_to_string(file).ok()?;
    let line = content.lines().nth(span.line.saturating_sub(1))?;
    let mut lines = vec![format!("  | {}", line)];
    let mut marker = String::from("  | ");
    marker.extend(std::iter::repeat(' ').take(span.col.saturating_sub(1)));
    marker.push('^');
    lines.push(marker);
    Some(lines)
}
