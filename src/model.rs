//! Immutable in-memory representation of an XTCE (or CSV) packet definition: parameter types,
//! data encodings, and the sequence-container inheritance DAG.
//!
//! Nothing here performs I/O or evaluates anything against a live parse; that is
//! [`crate::xtce`]/[`crate::csv_loader`] (building this model) and [`crate::evaluator`]
//! (evaluating match criteria and calibrators against it), respectively.

use std::collections::HashMap;

use crate::evaluator::{Calibrator, MatchCriteria};

/// Byte order of a multi-byte integer or float encoding. Bit order within a byte is always
/// MSB-first; this only governs which byte comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first (network/CCSDS convention).
    MsbFirst,
    /// Least significant byte first.
    LsbFirst,
}

/// How a fixed-width integer's sign bit(s) are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    /// No sign bit; the full width is magnitude.
    Unsigned,
    /// Top bit is sign, remaining bits are magnitude.
    SignMagnitude,
    /// Negative values are the bitwise complement of their magnitude.
    OnesComplement,
    /// Standard twos-complement.
    TwosComplement,
}

/// Text encoding for [`StringParameterType`] and [`StringDataEncoding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// UTF-8.
    Utf8,
    /// UTF-16, little-endian code units.
    Utf16Le,
    /// UTF-16, big-endian code units.
    Utf16Be,
}

/// `intercept + slope * raw_value`, as used by dynamic sizes and dynamic values generally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearAdjustment {
    pub intercept: f64,
    pub slope: f64,
}

impl LinearAdjustment {
    /// The identity adjustment (`y = x`).
    pub const IDENTITY: LinearAdjustment = LinearAdjustment {
        intercept: 0.0,
        slope: 1.0,
    };

    /// Applies the adjustment to a raw numeric input.
    pub fn apply(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// A width, length, or other numeric quantity computed from a parameter parsed earlier in the
/// same packet, rather than fixed at definition time.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicValue {
    /// Name of the earlier parameter to read.
    pub parameter_ref: String,
    /// Linear adjustment applied to that parameter's value.
    pub adjustment: LinearAdjustment,
    /// Whether the adjustment is applied to the referenced parameter's calibrated value (when
    /// present) or always its raw value.
    pub use_calibrated: bool,
}

/// Either a value fixed at definition time, or one computed from an earlier parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SizeInBits {
    /// Constant width in bits.
    Fixed(u32),
    /// Computed per [`DynamicValue`]; the result is rounded to the nearest bit.
    Dynamic(DynamicValue),
}

/// Bit-level layout of an integer-valued field.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegerDataEncoding {
    pub size_in_bits: SizeInBits,
    pub signedness: Signedness,
    pub byte_order: ByteOrder,
}

/// IEEE754 width for a [`FloatDataEncoding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    Bits16,
    Bits32,
    Bits64,
}

impl FloatWidth {
    /// Width in bits (16, 32, or 64).
    pub fn bits(self) -> usize {
        match self {
            FloatWidth::Bits16 => 16,
            FloatWidth::Bits32 => 32,
            FloatWidth::Bits64 => 64,
        }
    }
}

/// Bit-level layout of an IEEE754 field.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatDataEncoding {
    pub width: FloatWidth,
    pub byte_order: ByteOrder,
}

/// How a string field's length is determined.
#[derive(Debug, Clone, PartialEq)]
pub enum StringLengthPolicy {
    /// Constant length in bits.
    Fixed(u32),
    /// Read until the charset's terminator is encountered; the terminator is consumed but not
    /// included in the returned string. For UTF-16 charsets the terminator matches a whole code
    /// unit, never a lone surrogate half (see DESIGN.md).
    Termination {
        /// Terminator byte(s): one byte for `Utf8`, two for `Utf16*`.
        terminator: Vec<u8>,
    },
    /// Length in bytes is encoded in the `prefix_bits` immediately preceding the string, or in a
    /// named parameter if `referenced_parameter` is set (in which case `prefix_bits` is unused).
    LengthPrefix {
        prefix_bits: u32,
        referenced_parameter: Option<String>,
    },
    /// Length in bits is `intercept + slope * value_of(parameter_ref)`.
    Dynamic(DynamicValue),
}

/// Bit-level layout of a text field.
#[derive(Debug, Clone, PartialEq)]
pub struct StringDataEncoding {
    pub charset: Charset,
    pub length_policy: StringLengthPolicy,
}

/// Bit-level layout of a raw byte-blob field.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryDataEncoding {
    pub size_in_bits: SizeInBits,
}

/// Either the integer or float encoding shape, used by [`AbsoluteTimeParameterType`] and
/// [`RelativeTimeParameterType`], whose underlying representation may be either.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeEncoding {
    Integer(IntegerDataEncoding),
    Float(FloatDataEncoding),
}

/// A signed or unsigned integer parameter, with an optional calibrator.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegerParameterType {
    pub encoding: IntegerDataEncoding,
    pub calibrator: Option<Calibrator>,
    pub unit: Option<String>,
}

/// An IEEE754 float parameter, with an optional calibrator.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatParameterType {
    pub encoding: FloatDataEncoding,
    pub calibrator: Option<Calibrator>,
    pub unit: Option<String>,
}

/// An integer-encoded parameter whose raw value is looked up in a label table.
///
/// Raw values absent from `mapping` surface as `calibrated: None` and `unrecognized_enum: true`
/// on the resulting [`crate::value::ParsedValue`] — never a synthesized label.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratedParameterType {
    pub encoding: IntegerDataEncoding,
    pub mapping: HashMap<i64, String>,
    pub unit: Option<String>,
}

/// A text parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct StringParameterType {
    pub encoding: StringDataEncoding,
}

/// A raw byte-blob parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryParameterType {
    pub encoding: BinaryDataEncoding,
}

/// A single-bit boolean parameter: `{0, 1} -> {false, true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BooleanParameterType;

/// A timestamp relative to a fixed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsoluteTimeParameterType {
    pub encoding: TimeEncoding,
    /// Epoch label from the definition (e.g. `"TAI"`, `"1970-01-01T00:00:00Z"`); carried through
    /// uninterpreted, since calendar math is outside this crate's scope.
    pub epoch: Option<String>,
    /// Multiplier converting the raw encoded unit into seconds.
    pub scale: f64,
}

/// A duration, encoded the same way as [`AbsoluteTimeParameterType`] but with no epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativeTimeParameterType {
    pub encoding: TimeEncoding,
    pub scale: f64,
}

/// The eight parameter-type kinds an XTCE `ParameterTypeSet` may declare.
///
/// Modeled as a tagged variant rather than a trait-object hierarchy: the parser dispatches on the
/// tag directly (see [`crate::parser`]), so adding a ninth kind never requires virtual dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterType {
    Integer(IntegerParameterType),
    Float(FloatParameterType),
    Enumerated(EnumeratedParameterType),
    String(StringParameterType),
    Binary(BinaryParameterType),
    Boolean(BooleanParameterType),
    AbsoluteTime(AbsoluteTimeParameterType),
    RelativeTime(RelativeTimeParameterType),
}

/// A named parameter: a slot in the context, pointing at the [`ParameterType`] that decodes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub type_ref: String,
}

/// One slot in a [`SequenceContainer`]'s entry list.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// Consume one parameter's worth of bits.
    Parameter { parameter_ref: String },
    /// Inline another container's entries at this point (used for shared fragments such as
    /// secondary headers). The referenced container's own `base_container` is irrelevant here;
    /// it is treated purely as a fragment of entries, and its `restriction_criteria` (if any) is
    /// not evaluated at the reference site.
    Container { container_ref: String },
}

/// One node of the container inheritance DAG.
///
/// `entries` holds only this container's own additions; ancestor entries are not repeated here.
/// If a loader's source format stores the full inherited entry list, it must normalize to
/// additions-only while building this model (see [`crate::xtce::XtceLoader`]).
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceContainer {
    pub name: String,
    pub entries: Vec<Entry>,
    pub base_container: Option<String>,
    pub restriction_criteria: Option<MatchCriteria>,
    pub abstract_: bool,
}

/// The fully-resolved, immutable packet definition: every parameter type, parameter, and
/// sequence container, indexed by name.
///
/// Safe to share across threads via `Arc<Definition>`: nothing here has interior mutability, and
/// loading happens once, up front.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    pub parameter_types: HashMap<String, ParameterType>,
    pub parameters: HashMap<String, Parameter>,
    pub containers: HashMap<String, SequenceContainer>,
    /// Name of the container parsing starts from (conventionally the CCSDS primary-header
    /// container), precomputed so the parser need not search for it per packet.
    pub root_container: String,
    /// `base_container -> [child names]`, precomputed at load time so the parser's per-level
    /// child lookup is O(children) rather than O(all containers).
    pub(crate) children_of: HashMap<String, Vec<String>>,
}

impl Definition {
    /// Children of `container_name`, in declaration order, or an empty slice if it has none.
    pub fn children_of(&self, container_name: &str) -> &[String] {
        self.children_of
            .get(container_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
