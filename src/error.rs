//! Error types for every failing edge of the crate: loading a definition, reading bits, and
//! evaluating match criteria or calibrators against a partial parse.

use std::fmt::{self, Display, Formatter};
use std::io;

use crate::value::ParsedValue;

/// Failure while building a [`crate::model::Definition`] from an XTCE document or CSV schema.
///
/// Always fatal: there is no partial [`crate::model::Definition`] to recover from a load error.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionLoadError {
    /// The element tree did not contain an element the loader required at this path.
    MissingElement {
        /// Dotted path of the containing element, e.g. `SpaceSystem.TelemetryMetaData`.
        path: String,
        /// Name of the missing child element.
        element: String,
    },
    /// An element or attribute was present but carried a value the loader could not parse
    /// (e.g. a non-numeric `sizeInBits`).
    MalformedAttribute {
        /// Dotted path of the offending element.
        path: String,
        /// Attribute name.
        attribute: String,
        /// Raw attribute text that failed to parse.
        value: String,
    },
    /// A `*Ref` attribute named an entity absent from the relevant index.
    UnresolvedReference {
        /// What kind of entity was being referenced, e.g. `"parameter"` or `"container"`.
        kind: &'static str,
        /// The name that failed to resolve.
        name: String,
        /// Dotted path of the element holding the reference.
        referenced_from: String,
    },
    /// The `baseContainer` graph contains a cycle; no sequence container may be its own ancestor.
    CircularInheritance {
        /// The container names forming the cycle, in traversal order.
        cycle: Vec<String>,
    },
    /// An XTCE element name the loader does not implement.
    UnsupportedElement {
        /// Dotted path of the parent element.
        path: String,
        /// Unsupported element name.
        element: String,
    },
    /// The document was not well-formed XML, or referenced an XML construct this loader does not
    /// walk (processing instructions, DTDs, and the like are never reached).
    MalformedXml {
        /// Message from the underlying XML reader.
        message: String,
    },
    /// A CSV definition row could not be coerced into a column's expected shape.
    InvalidCsvRow {
        /// 1-based row number within the CSV document (header excluded).
        row: usize,
        /// Column name.
        column: String,
        /// Human-readable explanation.
        message: String,
    },
}

impl Display for DefinitionLoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionLoadError::MissingElement { path, element } => {
                write!(f, "{path}: missing required element <{element}>")
            }
            DefinitionLoadError::MalformedAttribute {
                path,
                attribute,
                value,
            } => write!(f, "{path}: attribute {attribute}=\"{value}\" is malformed"),
            DefinitionLoadError::UnresolvedReference {
                kind,
                name,
                referenced_from,
            } => write!(f, "{referenced_from}: unresolved {kind} reference \"{name}\""),
            DefinitionLoadError::CircularInheritance { cycle } => {
                write!(f, "circular baseContainer inheritance: {}", cycle.join(" -> "))
            }
            DefinitionLoadError::UnsupportedElement { path, element } => {
                write!(f, "{path}: unsupported element <{element}>")
            }
            DefinitionLoadError::MalformedXml { message } => write!(f, "malformed XML: {message}"),
            DefinitionLoadError::InvalidCsvRow { row, column, message } => {
                write!(f, "csv row {row}, column \"{column}\": {message}")
            }
        }
    }
}

impl std::error::Error for DefinitionLoadError {}

/// Attempted read beyond the bounds of the current packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitReadError {
    /// Bit offset the read started at.
    pub bit_pos: usize,
    /// Number of bits the read attempted to consume.
    pub requested_bits: usize,
    /// Total bits available in the buffer.
    pub buffer_bits: usize,
}

impl Display for BitReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bit read of {} bits at offset {} overruns buffer of {} bits",
            self.requested_bits, self.bit_pos, self.buffer_bits
        )
    }
}

impl std::error::Error for BitReadError {}

/// Failure evaluating a [`crate::evaluator::MatchCriteria`], calibrator, or dynamic value against
/// the current [`crate::evaluator::ParseContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// A comparison or dynamic value referenced a parameter not yet present in the context.
    /// Per the spec this is always a definition error, never a silent `false`.
    ParameterNotYetParsed {
        /// Name of the parameter that was referenced too early.
        name: String,
    },
    /// A match criterion's literal could not be coerced to the referenced parameter's type.
    LiteralNotCoercible {
        /// The literal text from the definition.
        literal: String,
        /// Name of the Rust type it could not be coerced to.
        target: &'static str,
    },
}

impl Display for EvaluationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationError::ParameterNotYetParsed { name } => {
                write!(f, "parameter \"{name}\" referenced before it was parsed")
            }
            EvaluationError::LiteralNotCoercible { literal, target } => {
                write!(f, "literal \"{literal}\" is not coercible to {target}")
            }
        }
    }
}

impl std::error::Error for EvaluationError {}

/// Why container resolution failed to land on exactly one concrete container.
#[derive(Debug, Clone, PartialEq)]
pub enum UnrecognizedReason {
    /// Zero children matched and the last container reached is abstract.
    NoConcreteMatch,
    /// More than one child's restriction criteria matched.
    AmbiguousChildren(Vec<String>),
    /// A [`BitReadError`] or [`EvaluationError`] occurred while consuming an entry.
    ParseFailed(ParseFailureReason),
    /// [`crate::parser::ParserOptions::root_container`] named a container absent from the
    /// definition.
    UnknownRootContainer(String),
}

/// The underlying cause when a container's entries could not be fully consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseFailureReason {
    /// See [`BitReadError`].
    BitRead(BitReadError),
    /// See [`EvaluationError`].
    Evaluation(EvaluationError),
}

/// A packet whose container resolution did not land on exactly one concrete container.
///
/// Carries everything parsed before resolution failed so a caller can still inspect the header
/// and any parameters that were successfully decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct UnrecognizedPacketError {
    /// Parameters successfully parsed before resolution failed.
    pub partial_context: Vec<(String, ParsedValue)>,
    /// Name of the last container the walker was standing on.
    pub last_container: String,
    /// What went wrong.
    pub reason: UnrecognizedReason,
}

impl Display for UnrecognizedPacketError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unrecognized packet at container \"{}\": {:?}",
            self.last_container, self.reason
        )
    }
}

impl std::error::Error for UnrecognizedPacketError {}

/// Underlying byte source failed to produce the bytes a packet or header required.
#[derive(Debug)]
pub enum SourceReadError {
    /// The source returned fewer bytes than requested and reported end-of-stream.
    UnexpectedEof {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },
    /// A configured read timeout elapsed (socket sources only).
    Timeout,
    /// Any other I/O failure from the underlying [`std::io::Read`].
    Io(io::Error),
}

impl Display for SourceReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SourceReadError::UnexpectedEof { expected, got } => {
                write!(f, "unexpected EOF: wanted {expected} bytes, got {got}")
            }
            SourceReadError::Timeout => write!(f, "read timed out"),
            SourceReadError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SourceReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceReadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SourceReadError {
    fn from(e: io::Error) -> Self {
        SourceReadError::Io(e)
    }
}

/// Error surfaced from the [`crate::generator::Generator`] iterator.
///
/// Unlike [`UnrecognizedPacketError`], which a caller can choose to skip, a [`SourceReadError`]
/// always terminates iteration (per the concurrency/resource model: the generator holds no
/// recovery state once the underlying source has failed).
#[derive(Debug)]
pub enum StreamError {
    /// See [`UnrecognizedPacketError`].
    Unrecognized(UnrecognizedPacketError),
    /// See [`SourceReadError`].
    Source(SourceReadError),
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Unrecognized(e) => Display::fmt(e, f),
            StreamError::Source(e) => Display::fmt(e, f),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Unrecognized(e) => Some(e),
            StreamError::Source(e) => Some(e),
        }
    }
}
