//! Decoded parameter values: the raw bits as a typed scalar, plus whatever calibrated value and
//! unit the definition derives from them.

use smallvec::SmallVec;

/// The bit-accurate decode of a parameter, before any calibrator is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Decoded via an unsigned [`crate::model::IntegerDataEncoding`].
    UInt(u64),
    /// Decoded via a signed [`crate::model::IntegerDataEncoding`].
    Int(i64),
    /// Decoded via a [`crate::model::FloatDataEncoding`].
    Float(f64),
    /// Decoded via a [`crate::model::BinaryDataEncoding`]; inline up to 16 bytes, heap beyond.
    Bytes(SmallVec<[u8; 16]>),
    /// Decoded via a [`crate::model::StringDataEncoding`].
    Str(String),
    /// Decoded via [`crate::model::BooleanParameterType`].
    Bool(bool),
}

impl RawValue {
    /// Best-effort numeric view, used by the evaluator to compare against literals and feed
    /// calibrators. Strings and byte blobs have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::UInt(v) => Some(*v as f64),
            RawValue::Int(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
            RawValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            RawValue::Bytes(_) | RawValue::Str(_) => None,
        }
    }
}

/// The engineering-units value derived from a [`RawValue`] by a calibrator or enumeration
/// mapping, when one applies.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibratedValue {
    /// Output of a [`crate::model::Calibrator`].
    Float(f64),
    /// Label looked up by an [`crate::model::EnumeratedParameterType`]'s mapping.
    Enum(String),
    /// Passthrough for [`crate::model::BooleanParameterType`].
    Bool(bool),
    /// Passthrough for string parameters (raw and calibrated coincide).
    Str(String),
}

/// One fully decoded parameter: its raw bits, optional calibrated value, optional unit, and
/// whether an enumerated raw value fell outside the declared label set.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedValue {
    /// The bit-accurate decode.
    pub raw: RawValue,
    /// The calibrated/engineering value, if a calibrator or enumeration mapping produced one.
    pub calibrated: Option<CalibratedValue>,
    /// Declared unit string, if any (`UnitSet/Unit`).
    pub unit: Option<String>,
    /// Set when this is an [`crate::model::EnumeratedParameterType`] and `raw` had no matching
    /// label. Per the invariant, such values never get a synthesized label: `calibrated` is
    /// `None` and this flag is the only signal.
    pub unrecognized_enum: bool,
}

impl ParsedValue {
    /// Constructs a value with no calibrator/unit/enum applied.
    pub fn raw_only(raw: RawValue) -> Self {
        Self {
            raw,
            calibrated: None,
            unit: None,
            unrecognized_enum: false,
        }
    }
}
