//! Builds a [`Definition`] from an XTCE document.
//!
//! Consumes the tree [`crate::xml_tree`] builds, walking `ParameterTypeSet`, `ParameterSet`, and
//! `ContainerSet` in that order so later passes can resolve references into earlier ones.
//! Everything here is a pure function of the tree; no XML library type crosses this module's
//! boundary, matching the component split in the system overview (the loader consumes an
//! "XTCE element tree", not a `quick_xml::Reader`).

use std::collections::HashMap;
use std::io::Read;

use log::warn;

use crate::error::DefinitionLoadError;
use crate::evaluator::{
    BooleanExpr, Calibrator, Comparison, ComparisonList, ComparisonOperator, ContextCalibratorEntry,
    ContextCalibratorList, DiscreteLookupEntry, DiscreteLookupList, ExtrapolationPolicy, MatchCriteria,
    PolynomialCalibrator, SplineCalibrator, SplineKnot, SplineOrder,
};
use crate::model::{
    AbsoluteTimeParameterType, BinaryDataEncoding, BinaryParameterType, BooleanParameterType, ByteOrder,
    Charset, Definition, DynamicValue, Entry, EnumeratedParameterType, FloatDataEncoding, FloatParameterType,
    FloatWidth, IntegerDataEncoding, IntegerParameterType, LinearAdjustment, Parameter, ParameterType,
    RelativeTimeParameterType, SequenceContainer, Signedness, SizeInBits, StringDataEncoding,
    StringLengthPolicy, StringParameterType, TimeEncoding,
};
use crate::xml_tree::{self, XmlElement};

fn missing(path: &str, element: &str) -> DefinitionLoadError {
    DefinitionLoadError::MissingElement {
        path: path.to_string(),
        element: element.to_string(),
    }
}

fn malformed(path: &str, attribute: &str, value: &str) -> DefinitionLoadError {
    DefinitionLoadError::MalformedAttribute {
        path: path.to_string(),
        attribute: attribute.to_string(),
        value: value.to_string(),
    }
}

fn require_attr<'a>(elem: &'a XmlElement, path: &str, attr: &str) -> Result<&'a str, DefinitionLoadError> {
    elem.attr(attr).ok_or_else(|| missing(path, &format!("@{attr}")))
}

fn require_child<'a>(elem: &'a XmlElement, path: &str, name: &str) -> Result<&'a XmlElement, DefinitionLoadError> {
    elem.child(name).ok_or_else(|| missing(path, name))
}

fn parse_f64(path: &str, attr: &str, raw: &str) -> Result<f64, DefinitionLoadError> {
    raw.trim().parse::<f64>().map_err(|_| malformed(path, attr, raw))
}

fn parse_u32(path: &str, attr: &str, raw: &str) -> Result<u32, DefinitionLoadError> {
    raw.trim().parse::<u32>().map_err(|_| malformed(path, attr, raw))
}

fn parse_i64(path: &str, attr: &str, raw: &str) -> Result<i64, DefinitionLoadError> {
    raw.trim().parse::<i64>().map_err(|_| malformed(path, attr, raw))
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(v) => matches!(v, "true" | "1"),
        None => default,
    }
}

// ---------------------------------------------------------------------------------------------
// SizeInBits / DynamicValue / LinearAdjustment
// ---------------------------------------------------------------------------------------------

fn parse_linear_adjustment(elem: &XmlElement, path: &str) -> LinearAdjustment {
    let intercept = elem
        .attr("intercept")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    let slope = elem
        .attr("slope")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(1.0);
    let _ = path;
    LinearAdjustment { intercept, slope }
}

fn parse_dynamic_value(elem: &XmlElement, path: &str) -> Result<DynamicValue, DefinitionLoadError> {
    let child_path = format!("{path}.DynamicValue");
    let param_ref_elem = require_child(elem, &child_path, "ParameterInstanceRef")?;
    let parameter_ref = require_attr(param_ref_elem, &child_path, "parameterRef")?.to_string();
    let adjustment = match elem.child("LinearAdjustment") {
        Some(adj) => parse_linear_adjustment(adj, &child_path),
        None => LinearAdjustment::IDENTITY,
    };
    let use_calibrated = parse_bool(elem.attr("useCalibratedValue"), false);
    Ok(DynamicValue {
        parameter_ref,
        adjustment,
        use_calibrated,
    })
}

/// Parses a `<SizeInBits>` element (or the `sizeInBits` attribute as a fallback) into a
/// [`SizeInBits`]. `elem` is the *encoding* element (`IntegerDataEncoding`, `BinaryDataEncoding`,
/// ...); its own `sizeInBits` attribute is checked first since that is the common fixed-width
/// case, falling back to a nested `<SizeInBits>` element for the dynamic case.
fn parse_size_in_bits(elem: &XmlElement, path: &str) -> Result<SizeInBits, DefinitionLoadError> {
    if let Some(raw) = elem.attr("sizeInBits") {
        return Ok(SizeInBits::Fixed(parse_u32(path, "sizeInBits", raw)?));
    }
    let size_elem = require_child(elem, path, "SizeInBits")?;
    let size_path = format!("{path}.SizeInBits");
    if let Some(dv) = size_elem.child("DynamicValue") {
        return Ok(SizeInBits::Dynamic(parse_dynamic_value(dv, &size_path)?));
    }
    if let Some(fixed) = size_elem.child("FixedValue") {
        return Ok(SizeInBits::Fixed(parse_u32(&size_path, "FixedValue", fixed.text())?));
    }
    let text = size_elem.text();
    if !text.is_empty() {
        return Ok(SizeInBits::Fixed(parse_u32(&size_path, "text", text)?));
    }
    Err(missing(&size_path, "FixedValue|DynamicValue"))
}

// ---------------------------------------------------------------------------------------------
// Data encodings
// ---------------------------------------------------------------------------------------------

fn parse_signedness(raw: Option<&str>, path: &str) -> Result<Signedness, DefinitionLoadError> {
    Ok(match raw.unwrap_or("unsigned") {
        "unsigned" => Signedness::Unsigned,
        "signMagnitude" => Signedness::SignMagnitude,
        "onesComplement" => Signedness::OnesComplement,
        "twosComplement" => Signedness::TwosComplement,
        other => return Err(malformed(path, "encoding", other)),
    })
}

fn parse_byte_order(raw: Option<&str>) -> ByteOrder {
    match raw {
        Some("leastSignificantByteFirst") => ByteOrder::LsbFirst,
        _ => ByteOrder::MsbFirst,
    }
}

fn parse_integer_data_encoding(elem: &XmlElement, path: &str) -> Result<IntegerDataEncoding, DefinitionLoadError> {
    Ok(IntegerDataEncoding {
        size_in_bits: parse_size_in_bits(elem, path)?,
        signedness: parse_signedness(elem.attr("encoding"), path)?,
        byte_order: parse_byte_order(elem.attr("byteOrder")),
    })
}

fn parse_float_width(path: &str, raw: &str) -> Result<FloatWidth, DefinitionLoadError> {
    Ok(match raw.trim() {
        "16" => FloatWidth::Bits16,
        "32" => FloatWidth::Bits32,
        "64" => FloatWidth::Bits64,
        other => return Err(malformed(path, "sizeInBits", other)),
    })
}

fn parse_float_data_encoding(elem: &XmlElement, path: &str) -> Result<FloatDataEncoding, DefinitionLoadError> {
    let raw_size = require_attr(elem, path, "sizeInBits")?;
    Ok(FloatDataEncoding {
        width: parse_float_width(path, raw_size)?,
        byte_order: parse_byte_order(elem.attr("byteOrder")),
    })
}

fn parse_charset(raw: Option<&str>, path: &str) -> Result<Charset, DefinitionLoadError> {
    Ok(match raw.unwrap_or("UTF-8") {
        "UTF-8" => Charset::Utf8,
        "UTF-16LE" => Charset::Utf16Le,
        "UTF-16BE" => Charset::Utf16Be,
        other => return Err(malformed(path, "charset", other)),
    })
}

fn parse_hex_or_text_bytes(raw: &str) -> Vec<u8> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        (0..hex.len())
            .step_by(2)
            .filter_map(|i| hex.get(i..i + 2))
            .filter_map(|byte| u8::from_str_radix(byte, 16).ok())
            .collect()
    } else {
        raw.as_bytes().to_vec()
    }
}

fn parse_string_length_policy(elem: &XmlElement, path: &str) -> Result<StringLengthPolicy, DefinitionLoadError> {
    if let Some(term) = elem.child("Termination") {
        let raw = require_attr(term, &format!("{path}.Termination"), "terminator")?;
        return Ok(StringLengthPolicy::Termination {
            terminator: parse_hex_or_text_bytes(raw),
        });
    }
    if let Some(prefix) = elem.child("LengthPrefix") {
        let prefix_path = format!("{path}.LengthPrefix");
        let referenced_parameter = prefix.attr("parameterRef").map(str::to_string);
        let prefix_bits = match prefix.attr("sizeInBitsOfSizeTag") {
            Some(raw) => parse_u32(&prefix_path, "sizeInBitsOfSizeTag", raw)?,
            None => 0,
        };
        return Ok(StringLengthPolicy::LengthPrefix {
            prefix_bits,
            referenced_parameter,
        });
    }
    if let Some(size_elem) = elem.child("SizeInBits") {
        if let Some(dv) = size_elem.child("DynamicValue") {
            return Ok(StringLengthPolicy::Dynamic(parse_dynamic_value(
                dv,
                &format!("{path}.SizeInBits"),
            )?));
        }
        if let Some(fixed) = size_elem.child("FixedValue") {
            return Ok(StringLengthPolicy::Fixed(parse_u32(
                &format!("{path}.SizeInBits"),
                "FixedValue",
                fixed.text(),
            )?));
        }
    }
    Err(missing(path, "Termination|LengthPrefix|SizeInBits"))
}

fn parse_string_data_encoding(elem: &XmlElement, path: &str) -> Result<StringDataEncoding, DefinitionLoadError> {
    Ok(StringDataEncoding {
        charset: parse_charset(elem.attr("charset"), path)?,
        length_policy: parse_string_length_policy(elem, path)?,
    })
}

fn parse_binary_data_encoding(elem: &XmlElement, path: &str) -> Result<BinaryDataEncoding, DefinitionLoadError> {
    Ok(BinaryDataEncoding {
        size_in_bits: parse_size_in_bits(elem, path)?,
    })
}

// ---------------------------------------------------------------------------------------------
// Match criteria
// ---------------------------------------------------------------------------------------------

fn parse_comparison_operator(raw: &str, path: &str) -> Result<ComparisonOperator, DefinitionLoadError> {
    Ok(match raw {
        "==" | "=" => ComparisonOperator::Eq,
        "!=" => ComparisonOperator::Ne,
        "<" => ComparisonOperator::Lt,
        "<=" => ComparisonOperator::Le,
        ">" => ComparisonOperator::Gt,
        ">=" => ComparisonOperator::Ge,
        other => return Err(malformed(path, "comparisonOperator", other)),
    })
}

fn parse_comparison(elem: &XmlElement, path: &str) -> Result<Comparison, DefinitionLoadError> {
    let parameter_ref = require_attr(elem, path, "parameterRef")?.to_string();
    let operator = parse_comparison_operator(elem.attr("comparisonOperator").unwrap_or("=="), path)?;
    let literal = require_attr(elem, path, "value")?.to_string();
    let use_calibrated = parse_bool(elem.attr("useCalibratedValue"), true);
    Ok(Comparison {
        parameter_ref,
        operator,
        literal,
        use_calibrated,
    })
}

fn parse_comparison_list(elem: &XmlElement, path: &str) -> Result<ComparisonList, DefinitionLoadError> {
    let comparisons = elem
        .children_named("Comparison")
        .map(|c| parse_comparison(c, path))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ComparisonList(comparisons))
}

fn parse_boolean_expr(elem: &XmlElement, path: &str) -> Result<BooleanExpr, DefinitionLoadError> {
    if let Some(c) = elem.child("Comparison") {
        return Ok(BooleanExpr::Comparison(parse_comparison(c, path)?));
    }
    if let Some(anded) = elem.child("ANDedConditions") {
        return Ok(BooleanExpr::And(parse_condition_list(anded, path)?));
    }
    if let Some(ored) = elem.child("ORedConditions") {
        return Ok(BooleanExpr::Or(parse_condition_list(ored, path)?));
    }
    Err(missing(path, "Comparison|ANDedConditions|ORedConditions"))
}

fn parse_condition_list(elem: &XmlElement, path: &str) -> Result<Vec<BooleanExpr>, DefinitionLoadError> {
    let mut out = Vec::new();
    for child in &elem.children {
        let expr = match child.name.as_str() {
            "Comparison" => BooleanExpr::Comparison(parse_comparison(child, path)?),
            "ANDedConditions" => BooleanExpr::And(parse_condition_list(child, path)?),
            "ORedConditions" => BooleanExpr::Or(parse_condition_list(child, path)?),
            _ => continue,
        };
        out.push(expr);
    }
    Ok(out)
}

/// Parses whichever of `Comparison`/`ComparisonList`/`BooleanExpression` is present directly
/// inside `elem` (used for both `RestrictionCriteria` and `ContextMatch`, which share this shape).
fn parse_match_criteria(elem: &XmlElement, path: &str) -> Result<MatchCriteria, DefinitionLoadError> {
    if let Some(c) = elem.child("Comparison") {
        return Ok(MatchCriteria::Comparison(parse_comparison(c, path)?));
    }
    if let Some(cl) = elem.child("ComparisonList") {
        return Ok(MatchCriteria::ComparisonList(parse_comparison_list(cl, path)?));
    }
    if let Some(be) = elem.child("BooleanExpression") {
        return Ok(MatchCriteria::BooleanExpression(parse_boolean_expr(be, path)?));
    }
    Err(missing(path, "Comparison|ComparisonList|BooleanExpression"))
}

// ---------------------------------------------------------------------------------------------
// Calibrators
// ---------------------------------------------------------------------------------------------

fn parse_polynomial_calibrator(elem: &XmlElement, path: &str) -> Result<PolynomialCalibrator, DefinitionLoadError> {
    let mut by_exponent: HashMap<usize, f64> = HashMap::new();
    let mut max_exp = 0usize;
    for term in elem.children_named("Term") {
        let term_path = format!("{path}.Term");
        let coefficient = parse_f64(&term_path, "coefficient", require_attr(term, &term_path, "coefficient")?)?;
        let exponent = parse_u32(&term_path, "exponent", require_attr(term, &term_path, "exponent")?)? as usize;
        max_exp = max_exp.max(exponent);
        by_exponent.insert(exponent, coefficient);
    }
    let coefficients = (0..=max_exp).map(|i| by_exponent.get(&i).copied().unwrap_or(0.0)).collect();
    Ok(PolynomialCalibrator { coefficients })
}

fn parse_spline_calibrator(elem: &XmlElement, path: &str) -> Result<SplineCalibrator, DefinitionLoadError> {
    let order = match elem.attr("order").unwrap_or("linear") {
        "quadratic" => SplineOrder::Quadratic,
        _ => SplineOrder::Linear,
    };
    let extrapolation = match elem.attr("extrapolate").unwrap_or("clamp") {
        "linear" => ExtrapolationPolicy::Linear,
        _ => ExtrapolationPolicy::Clamp,
    };
    let mut knots = elem
        .children_named("SplinePoint")
        .map(|p| {
            let p_path = format!("{path}.SplinePoint");
            Ok(SplineKnot {
                x: parse_f64(&p_path, "raw", require_attr(p, &p_path, "raw")?)?,
                y: parse_f64(&p_path, "calibrated", require_attr(p, &p_path, "calibrated")?)?,
            })
        })
        .collect::<Result<Vec<_>, DefinitionLoadError>>()?;
    knots.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
    Ok(SplineCalibrator {
        knots,
        order,
        extrapolation,
    })
}

fn parse_discrete_lookup_list(elem: &XmlElement, path: &str) -> Result<DiscreteLookupList, DefinitionLoadError> {
    let entries = elem
        .children_named("DiscreteLookup")
        .map(|dl| {
            let dl_path = format!("{path}.DiscreteLookup");
            let value = parse_f64(&dl_path, "value", require_attr(dl, &dl_path, "value")?)?;
            let criteria = parse_match_criteria(dl, &dl_path)?;
            Ok(DiscreteLookupEntry { criteria, value })
        })
        .collect::<Result<Vec<_>, DefinitionLoadError>>()?;
    Ok(DiscreteLookupList(entries))
}

fn parse_context_calibrator_list(elem: &XmlElement, path: &str) -> Result<ContextCalibratorList, DefinitionLoadError> {
    let mut entries = Vec::new();
    for cc in elem.children_named("ContextCalibrator") {
        let cc_path = format!("{path}.ContextCalibrator");
        let context_match = require_child(cc, &cc_path, "ContextMatch")?;
        let criteria = parse_match_criteria(context_match, &cc_path)?;
        let calibrator_elem = require_child(cc, &cc_path, "Calibrator")?;
        let calibrator = parse_calibrator(calibrator_elem, &cc_path)?
            .ok_or_else(|| missing(&cc_path, "Calibrator/*"))?;
        entries.push(ContextCalibratorEntry {
            criteria,
            calibrator: Box::new(calibrator),
        });
    }
    Ok(ContextCalibratorList(entries))
}

/// Parses whichever calibrator shape is the first matching child of `elem`, or `None` if none is
/// present (an encoding with no calibrator at all is the common case).
fn parse_calibrator(elem: &XmlElement, path: &str) -> Result<Option<Calibrator>, DefinitionLoadError> {
    if let Some(poly) = elem.child("PolynomialCalibrator") {
        return Ok(Some(Calibrator::Polynomial(parse_polynomial_calibrator(poly, path)?)));
    }
    if let Some(spline) = elem.child("SplineCalibrator") {
        return Ok(Some(Calibrator::Spline(parse_spline_calibrator(spline, path)?)));
    }
    if let Some(dll) = elem.child("DiscreteLookupList") {
        return Ok(Some(Calibrator::DiscreteLookup(parse_discrete_lookup_list(dll, path)?)));
    }
    if let Some(ccl) = elem.child("ContextCalibratorList") {
        return Ok(Some(Calibrator::Context(parse_context_calibrator_list(ccl, path)?)));
    }
    Ok(None)
}

/// Default calibrator for a data encoding: tries `DefaultCalibrator` first (for the unconditional
/// case), then `ContextCalibratorList` as a direct sibling (the conditional case).
fn parse_encoding_calibrator(encoding_elem: &XmlElement, path: &str) -> Result<Option<Calibrator>, DefinitionLoadError> {
    if let Some(default_cal) = encoding_elem.child("DefaultCalibrator") {
        if let Some(cal) = parse_calibrator(default_cal, &format!("{path}.DefaultCalibrator"))? {
            return Ok(Some(cal));
        }
    }
    if let Some(ccl) = encoding_elem.child("ContextCalibratorList") {
        return Ok(Some(Calibrator::Context(parse_context_calibrator_list(
            ccl,
            &format!("{path}.ContextCalibratorList"),
        )?)));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------------------------

fn parse_unit(elem: &XmlElement) -> Option<String> {
    elem.child("UnitSet")
        .and_then(|set| set.child("Unit"))
        .map(|u| u.text().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_parameter_type(elem: &XmlElement, path: &str) -> Result<ParameterType, DefinitionLoadError> {
    let unit = parse_unit(elem);
    Ok(match elem.name.as_str() {
        "IntegerParameterType" => {
            let enc_elem = require_child(elem, path, "IntegerDataEncoding")?;
            let enc_path = format!("{path}.IntegerDataEncoding");
            ParameterType::Integer(IntegerParameterType {
                encoding: parse_integer_data_encoding(enc_elem, &enc_path)?,
                calibrator: parse_encoding_calibrator(enc_elem, &enc_path)?,
                unit,
            })
        }
        "FloatParameterType" => {
            let enc_elem = require_child(elem, path, "FloatDataEncoding")?;
            let enc_path = format!("{path}.FloatDataEncoding");
            ParameterType::Float(FloatParameterType {
                encoding: parse_float_data_encoding(enc_elem, &enc_path)?,
                calibrator: parse_encoding_calibrator(enc_elem, &enc_path)?,
                unit,
            })
        }
        "EnumeratedParameterType" => {
            let enc_elem = require_child(elem, path, "IntegerDataEncoding")?;
            let enc_path = format!("{path}.IntegerDataEncoding");
            let enum_list = require_child(elem, path, "EnumerationList")?;
            let mut mapping = HashMap::new();
            for e in enum_list.children_named("Enumeration") {
                let e_path = format!("{path}.EnumerationList.Enumeration");
                let value = parse_i64(&e_path, "value", require_attr(e, &e_path, "value")?)?;
                let label = require_attr(e, &e_path, "label")?.to_string();
                mapping.insert(value, label);
            }
            ParameterType::Enumerated(EnumeratedParameterType {
                encoding: parse_integer_data_encoding(enc_elem, &enc_path)?,
                mapping,
                unit,
            })
        }
        "StringParameterType" => {
            let enc_elem = require_child(elem, path, "StringDataEncoding")?;
            let enc_path = format!("{path}.StringDataEncoding");
            ParameterType::String(StringParameterType {
                encoding: parse_string_data_encoding(enc_elem, &enc_path)?,
            })
        }
        "BinaryParameterType" => {
            let enc_elem = require_child(elem, path, "BinaryDataEncoding")?;
            let enc_path = format!("{path}.BinaryDataEncoding");
            ParameterType::Binary(BinaryParameterType {
                encoding: parse_binary_data_encoding(enc_elem, &enc_path)?,
            })
        }
        "BooleanParameterType" => ParameterType::Boolean(BooleanParameterType),
        "AbsoluteTimeParameterType" => {
            let encoding_wrap = require_child(elem, path, "Encoding")?;
            let encoding = parse_time_encoding(encoding_wrap, &format!("{path}.Encoding"))?;
            let epoch = elem.attr("epoch").map(str::to_string);
            let scale = elem.attr("scale").map(|v| parse_f64(path, "scale", v)).transpose()?.unwrap_or(1.0);
            ParameterType::AbsoluteTime(AbsoluteTimeParameterType { encoding, epoch, scale })
        }
        "RelativeTimeParameterType" => {
            let encoding_wrap = require_child(elem, path, "Encoding")?;
            let encoding = parse_time_encoding(encoding_wrap, &format!("{path}.Encoding"))?;
            let scale = elem.attr("scale").map(|v| parse_f64(path, "scale", v)).transpose()?.unwrap_or(1.0);
            ParameterType::RelativeTime(RelativeTimeParameterType { encoding, scale })
        }
        other => {
            return Err(DefinitionLoadError::UnsupportedElement {
                path: path.to_string(),
                element: other.to_string(),
            })
        }
    })
}

fn parse_time_encoding(elem: &XmlElement, path: &str) -> Result<TimeEncoding, DefinitionLoadError> {
    if let Some(int_enc) = elem.child("IntegerDataEncoding") {
        return Ok(TimeEncoding::Integer(parse_integer_data_encoding(
            int_enc,
            &format!("{path}.IntegerDataEncoding"),
        )?));
    }
    if let Some(float_enc) = elem.child("FloatDataEncoding") {
        return Ok(TimeEncoding::Float(parse_float_data_encoding(
            float_enc,
            &format!("{path}.FloatDataEncoding"),
        )?));
    }
    Err(missing(path, "IntegerDataEncoding|FloatDataEncoding"))
}

// ---------------------------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------------------------

fn parse_entry_list(elem: &XmlElement, path: &str) -> Result<Vec<Entry>, DefinitionLoadError> {
    let mut entries = Vec::new();
    let Some(entry_list) = elem.child("EntryList") else {
        return Ok(entries);
    };
    for child in &entry_list.children {
        match child.name.as_str() {
            "ParameterRefEntry" => {
                let parameter_ref = require_attr(child, path, "parameterRef")?.to_string();
                entries.push(Entry::Parameter { parameter_ref });
            }
            "ContainerRefEntry" => {
                let container_ref = require_attr(child, path, "containerRef")?.to_string();
                entries.push(Entry::Container { container_ref });
            }
            other => {
                return Err(DefinitionLoadError::UnsupportedElement {
                    path: format!("{path}.EntryList"),
                    element: other.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

struct RawContainer {
    entries: Vec<Entry>,
    base_container: Option<String>,
    restriction_criteria: Option<MatchCriteria>,
    abstract_: bool,
}

fn parse_sequence_container(elem: &XmlElement, path: &str) -> Result<(String, RawContainer), DefinitionLoadError> {
    let name = require_attr(elem, path, "name")?.to_string();
    let abstract_ = parse_bool(elem.attr("abstract"), false);
    let entries = parse_entry_list(elem, path)?;

    let (base_container, restriction_criteria) = match elem.child("BaseContainer") {
        Some(base) => {
            let base_path = format!("{path}.BaseContainer");
            let container_ref = require_attr(base, &base_path, "containerRef")?.to_string();
            let restriction = match base.child("RestrictionCriteria") {
                Some(rc) => Some(parse_match_criteria(rc, &format!("{base_path}.RestrictionCriteria"))?),
                None => None,
            };
            (Some(container_ref), restriction)
        }
        None => (None, None),
    };

    Ok((
        name,
        RawContainer {
            entries,
            base_container,
            restriction_criteria,
            abstract_,
        },
    ))
}

// ---------------------------------------------------------------------------------------------
// Top-level load
// ---------------------------------------------------------------------------------------------

fn find_telemetry_meta_data(root: &XmlElement) -> Option<&XmlElement> {
    if root.name == "TelemetryMetaData" {
        return Some(root);
    }
    root.child("TelemetryMetaData")
}

fn detect_cycle(
    containers: &HashMap<String, RawContainer>,
    start: &str,
) -> Option<Vec<String>> {
    let mut visited = vec![start.to_string()];
    let mut current = start;
    loop {
        let base = containers.get(current)?.base_container.as_deref()?;
        if base == start {
            visited.push(base.to_string());
            return Some(visited);
        }
        if visited.iter().any(|v| v == base) {
            // Cycle not involving `start` directly; still reachable from it, so still fatal.
            visited.push(base.to_string());
            return Some(visited);
        }
        visited.push(base.to_string());
        current = base;
    }
}

/// Builds a [`Definition`] from an in-memory XTCE document.
///
/// Entry point for the XTCE-driven definition loader (component C in the system overview);
/// [`crate::csv_loader`] is the flat fallback for when no XTCE document is available.
pub struct XtceLoader;

impl XtceLoader {
    /// Parses and loads a complete XTCE document from a string.
    pub fn load_str(xml: &str) -> Result<Definition, DefinitionLoadError> {
        let tree = xml_tree::parse(xml)?;
        Self::load_tree(&tree)
    }

    /// Parses and loads a complete XTCE document from any [`Read`] source.
    pub fn load_reader<R: Read>(mut reader: R) -> Result<Definition, DefinitionLoadError> {
        let mut xml = String::new();
        reader
            .read_to_string(&mut xml)
            .map_err(|e| DefinitionLoadError::MalformedXml { message: e.to_string() })?;
        Self::load_str(&xml)
    }

    /// Builds a [`Definition`] from an already-parsed element tree.
    pub fn load_tree(root: &XmlElement) -> Result<Definition, DefinitionLoadError> {
        let tmd = find_telemetry_meta_data(root).ok_or_else(|| missing("SpaceSystem", "TelemetryMetaData"))?;

        let mut parameter_types = HashMap::new();
        let type_set = require_child(tmd, "TelemetryMetaData", "ParameterTypeSet")?;
        for elem in &type_set.children {
            let path = format!("ParameterTypeSet.{}", elem.name);
            let name = require_attr(elem, &path, "name")?.to_string();
            let ptype = parse_parameter_type(elem, &path)?;
            parameter_types.insert(name, ptype);
        }

        let mut parameters = HashMap::new();
        let param_set = require_child(tmd, "TelemetryMetaData", "ParameterSet")?;
        for elem in param_set.children_named("Parameter") {
            let path = "ParameterSet.Parameter";
            let name = require_attr(elem, path, "name")?.to_string();
            let type_ref = require_attr(elem, path, "parameterTypeRef")?.to_string();
            if !parameter_types.contains_key(&type_ref) {
                return Err(DefinitionLoadError::UnresolvedReference {
                    kind: "parameter type",
                    name: type_ref,
                    referenced_from: format!("{path}[name={name}]"),
                });
            }
            parameters.insert(name.clone(), Parameter { name, type_ref });
        }

        let container_set = require_child(tmd, "TelemetryMetaData", "ContainerSet")?;
        let mut raw_containers = HashMap::new();
        let mut declaration_order = Vec::new();
        for elem in container_set.children_named("SequenceContainer") {
            let (name, raw) = parse_sequence_container(elem, "ContainerSet.SequenceContainer")?;
            declaration_order.push(name.clone());
            raw_containers.insert(name, raw);
        }

        // Resolve references: every parameter/container ref named anywhere must exist.
        for (name, raw) in &raw_containers {
            for entry in &raw.entries {
                match entry {
                    Entry::Parameter { parameter_ref } if !parameters.contains_key(parameter_ref) => {
                        return Err(DefinitionLoadError::UnresolvedReference {
                            kind: "parameter",
                            name: parameter_ref.clone(),
                            referenced_from: format!("SequenceContainer[name={name}]"),
                        })
                    }
                    Entry::Container { container_ref } if !raw_containers.contains_key(container_ref) => {
                        return Err(DefinitionLoadError::UnresolvedReference {
                            kind: "container",
                            name: container_ref.clone(),
                            referenced_from: format!("SequenceContainer[name={name}]"),
                        })
                    }
                    _ => {}
                }
            }
            if let Some(base) = &raw.base_container {
                if !raw_containers.contains_key(base) {
                    return Err(DefinitionLoadError::UnresolvedReference {
                        kind: "container",
                        name: base.clone(),
                        referenced_from: format!("SequenceContainer[name={name}].BaseContainer"),
                    });
                }
            }
        }

        for name in &declaration_order {
            if let Some(cycle) = detect_cycle(&raw_containers, name) {
                return Err(DefinitionLoadError::CircularInheritance { cycle });
            }
        }

        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        for name in &declaration_order {
            if let Some(base) = &raw_containers[name].base_container {
                children_of.entry(base.clone()).or_default().push(name.clone());
            }
        }

        let roots: Vec<&String> = declaration_order
            .iter()
            .filter(|n| raw_containers[*n].base_container.is_none())
            .collect();
        if roots.is_empty() {
            return Err(missing("ContainerSet", "a root SequenceContainer with no BaseContainer"));
        }
        if roots.len() > 1 {
            warn!(
                "XTCE document declares {} root containers with no BaseContainer; defaulting to \"{}\"",
                roots.len(),
                roots[0]
            );
        }
        let root_container = roots[0].clone();

        for name in &declaration_order {
            let raw = &raw_containers[name];
            if raw.abstract_ && !children_of.contains_key(name) {
                warn!("abstract container \"{name}\" has no declared children and can never be reached");
            }
        }

        let containers = raw_containers
            .into_iter()
            .map(|(name, raw)| {
                (
                    name.clone(),
                    SequenceContainer {
                        name,
                        entries: raw.entries,
                        base_container: raw.base_container,
                        restriction_criteria: raw.restriction_criteria,
                        abstract_: raw.abstract_,
                    },
                )
            })
            .collect();

        Ok(Definition {
            parameter_types,
            parameters,
            containers,
            root_container,
            children_of,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1_XTCE: &str = r#"
        <SpaceSystem name="S1">
          <TelemetryMetaData>
            <ParameterTypeSet>
              <IntegerParameterType name="U11_T">
                <IntegerDataEncoding sizeInBits="11" encoding="unsigned"/>
              </IntegerParameterType>
              <IntegerParameterType name="U3_T">
                <IntegerDataEncoding sizeInBits="3" encoding="unsigned"/>
              </IntegerParameterType>
              <IntegerParameterType name="U1_T">
                <IntegerDataEncoding sizeInBits="1" encoding="unsigned"/>
              </IntegerParameterType>
              <IntegerParameterType name="U2_T">
                <IntegerDataEncoding sizeInBits="2" encoding="unsigned"/>
              </IntegerParameterType>
              <IntegerParameterType name="U14_T">
                <IntegerDataEncoding sizeInBits="14" encoding="unsigned"/>
              </IntegerParameterType>
              <IntegerParameterType name="U16_T">
                <IntegerDataEncoding sizeInBits="16" encoding="unsigned"/>
              </IntegerParameterType>
              <BinaryParameterType name="PAYLOAD_T">
                <BinaryDataEncoding sizeInBits="64"/>
              </BinaryParameterType>
            </ParameterTypeSet>
            <ParameterSet>
              <Parameter name="VERSION" parameterTypeRef="U3_T"/>
              <Parameter name="TYPE" parameterTypeRef="U1_T"/>
              <Parameter name="SEC_HDR_FLG" parameterTypeRef="U1_T"/>
              <Parameter name="PKT_APID" parameterTypeRef="U11_T"/>
              <Parameter name="SEQ_FLGS" parameterTypeRef="U2_T"/>
              <Parameter name="SRC_SEQ_CTR" parameterTypeRef="U14_T"/>
              <Parameter name="PKT_LEN" parameterTypeRef="U16_T"/>
              <Parameter name="PAYLOAD" parameterTypeRef="PAYLOAD_T"/>
            </ParameterSet>
            <ContainerSet>
              <SequenceContainer name="CCSDSPacket">
                <EntryList>
                  <ParameterRefEntry parameterRef="VERSION"/>
                  <ParameterRefEntry parameterRef="TYPE"/>
                  <ParameterRefEntry parameterRef="SEC_HDR_FLG"/>
                  <ParameterRefEntry parameterRef="PKT_APID"/>
                  <ParameterRefEntry parameterRef="SEQ_FLGS"/>
                  <ParameterRefEntry parameterRef="SRC_SEQ_CTR"/>
                  <ParameterRefEntry parameterRef="PKT_LEN"/>
                  <ParameterRefEntry parameterRef="PAYLOAD"/>
                </EntryList>
              </SequenceContainer>
            </ContainerSet>
          </TelemetryMetaData>
        </SpaceSystem>
    "#;

    #[test]
    fn loads_s1_definition_and_resolves_refs() {
        let def = XtceLoader::load_str(S1_XTCE).unwrap();
        assert_eq!(def.root_container, "CCSDSPacket");
        assert_eq!(def.containers["CCSDSPacket"].entries.len(), 8);
        assert!(def.parameters.contains_key("PAYLOAD"));
    }

    #[test]
    fn unresolved_parameter_type_ref_is_a_load_error() {
        let xml = r#"
            <SpaceSystem name="S">
              <TelemetryMetaData>
                <ParameterTypeSet/>
                <ParameterSet>
                  <Parameter name="X" parameterTypeRef="MISSING_T"/>
                </ParameterSet>
                <ContainerSet>
                  <SequenceContainer name="ROOT"/>
                </ContainerSet>
              </TelemetryMetaData>
            </SpaceSystem>
        "#;
        let err = XtceLoader::load_str(xml).unwrap_err();
        assert!(matches!(err, DefinitionLoadError::UnresolvedReference { .. }));
    }

    #[test]
    fn circular_base_container_is_a_load_error() {
        let xml = r#"
            <SpaceSystem name="S">
              <TelemetryMetaData>
                <ParameterTypeSet/>
                <ParameterSet/>
                <ContainerSet>
                  <SequenceContainer name="A">
                    <BaseContainer containerRef="B"/>
                  </SequenceContainer>
                  <SequenceContainer name="B">
                    <BaseContainer containerRef="A"/>
                  </SequenceContainer>
                </ContainerSet>
              </TelemetryMetaData>
            </SpaceSystem>
        "#;
        let err = XtceLoader::load_str(xml).unwrap_err();
        assert!(matches!(err, DefinitionLoadError::CircularInheritance { .. }));
    }

    #[test]
    fn polymorphic_children_gain_restriction_criteria() {
        let xml = r#"
            <SpaceSystem name="S">
              <TelemetryMetaData>
                <ParameterTypeSet>
                  <IntegerParameterType name="U11_T">
                    <IntegerDataEncoding sizeInBits="11" encoding="unsigned"/>
                  </IntegerParameterType>
                </ParameterTypeSet>
                <ParameterSet>
                  <Parameter name="PKT_APID" parameterTypeRef="U11_T"/>
                </ParameterSet>
                <ContainerSet>
                  <SequenceContainer name="ROOT" abstract="true"/>
                  <SequenceContainer name="CHILD_A">
                    <BaseContainer containerRef="ROOT">
                      <RestrictionCriteria>
                        <Comparison parameterRef="PKT_APID" value="1424" comparisonOperator="=="/>
                      </RestrictionCriteria>
                    </BaseContainer>
                  </SequenceContainer>
                </ContainerSet>
              </TelemetryMetaData>
            </SpaceSystem>
        "#;
        let def = XtceLoader::load_str(xml).unwrap();
        assert_eq!(def.root_container, "ROOT");
        assert!(def.containers["ROOT"].abstract_);
        assert_eq!(def.children_of("ROOT"), &["CHILD_A".to_string()]);
        let restriction = def.containers["CHILD_A"].restriction_criteria.as_ref().unwrap();
        match restriction {
            MatchCriteria::Comparison(c) => assert_eq!(c.parameter_ref, "PKT_APID"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn polynomial_calibrator_coefficients_land_at_their_exponent() {
        let xml = r#"
            <SpaceSystem name="S">
              <TelemetryMetaData>
                <ParameterTypeSet>
                  <IntegerParameterType name="CAL_T">
                    <IntegerDataEncoding sizeInBits="8" encoding="unsigned">
                      <DefaultCalibrator>
                        <PolynomialCalibrator>
                          <Term coefficient="1.0" exponent="0"/>
                          <Term coefficient="2.0" exponent="1"/>
                          <Term coefficient="0.5" exponent="2"/>
                        </PolynomialCalibrator>
                      </DefaultCalibrator>
                    </IntegerDataEncoding>
                  </IntegerParameterType>
                </ParameterTypeSet>
                <ParameterSet>
                  <Parameter name="X" parameterTypeRef="CAL_T"/>
                </ParameterSet>
                <ContainerSet>
                  <SequenceContainer name="ROOT">
                    <EntryList>
                      <ParameterRefEntry parameterRef="X"/>
                    </EntryList>
                  </SequenceContainer>
                </ContainerSet>
              </TelemetryMetaData>
            </SpaceSystem>
        "#;
        let def = XtceLoader::load_str(xml).unwrap();
        match &def.parameter_types["CAL_T"] {
            ParameterType::Integer(p) => match p.calibrator.as_ref().unwrap() {
                Calibrator::Polynomial(poly) => assert_eq!(poly.coefficients, vec![1.0, 2.0, 0.5]),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
