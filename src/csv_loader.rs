//! Alternative builder of a [`Definition`] from a flat CSV schema: one row per field, no
//! inheritance and no dynamically-sized fields. Intended as a lightweight fallback when a full
//! XTCE document is unavailable, not a replacement for [`crate::xtce`].
//!
//! Mirrors `csv::Reader`-driven row iteration with a crate-local error type wrapping
//! `csv::Error`. Rows are read as `StringRecord`s by column name rather than deserialized via
//! `serde` into one fixed struct, since the row shape is heterogeneous: different field types
//! need different optional columns.

use std::collections::HashMap;
use std::io::Read;

use csv::StringRecord;

use crate::error::DefinitionLoadError;
use crate::evaluator::{Calibrator, Comparison, ComparisonOperator, MatchCriteria, PolynomialCalibrator};
use crate::model::{
    BinaryDataEncoding, BinaryParameterType, BooleanParameterType, ByteOrder, Definition,
    Entry, EnumeratedParameterType, FloatDataEncoding, FloatParameterType, FloatWidth,
    IntegerDataEncoding, IntegerParameterType, Parameter, ParameterType, Charset,
    SequenceContainer, Signedness, SizeInBits, StringDataEncoding, StringLengthPolicy,
    StringParameterType,
};

const ROOT_CONTAINER: &str = "ROOT";

fn column<'a>(headers: &StringRecord, record: &'a StringRecord, row: usize, name: &str) -> Result<&'a str, DefinitionLoadError> {
    let idx = headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| DefinitionLoadError::InvalidCsvRow {
            row,
            column: name.to_string(),
            message: "column not present in header row".to_string(),
        })?;
    record.get(idx).ok_or_else(|| DefinitionLoadError::InvalidCsvRow {
        row,
        column: name.to_string(),
        message: "row is shorter than the header".to_string(),
    })
}

fn optional_column<'a>(headers: &StringRecord, record: &'a StringRecord, name: &str) -> Option<&'a str> {
    let idx = headers.iter().position(|h| h == name)?;
    record.get(idx).filter(|s| !s.is_empty())
}

fn parse_width(row: usize, raw: &str) -> Result<u32, DefinitionLoadError> {
    raw.trim().parse::<u32>().map_err(|_| DefinitionLoadError::InvalidCsvRow {
        row,
        column: "width_bits".to_string(),
        message: format!("\"{raw}\" is not a valid bit width"),
    })
}

fn parse_byte_order(raw: Option<&str>) -> ByteOrder {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("lsb") => ByteOrder::LsbFirst,
        _ => ByteOrder::MsbFirst,
    }
}

fn parse_signed(raw: Option<&str>) -> bool {
    matches!(raw, Some("1") | Some("true") | Some("TRUE") | Some("True"))
}

fn parse_enum_mapping(row: usize, raw: &str) -> Result<HashMap<i64, String>, DefinitionLoadError> {
    let mut mapping = HashMap::new();
    for pair in raw.split(';').filter(|s| !s.is_empty()) {
        let (key, label) = pair.split_once(':').ok_or_else(|| DefinitionLoadError::InvalidCsvRow {
            row,
            column: "enum_mapping".to_string(),
            message: format!("\"{pair}\" is not a \"value:label\" pair"),
        })?;
        let key: i64 = key.trim().parse().map_err(|_| DefinitionLoadError::InvalidCsvRow {
            row,
            column: "enum_mapping".to_string(),
            message: format!("\"{key}\" is not an integer"),
        })?;
        mapping.insert(key, label.trim().to_string());
    }
    Ok(mapping)
}

fn parse_polynomial(raw: &str) -> Option<Calibrator> {
    let coefficients: Vec<f64> = raw.split(',').filter_map(|s| s.trim().parse::<f64>().ok()).collect();
    if coefficients.is_empty() {
        None
    } else {
        Some(Calibrator::Polynomial(PolynomialCalibrator { coefficients }))
    }
}

fn build_parameter_type(
    row: usize,
    kind: &str,
    width_bits: Option<u32>,
    signed: bool,
    byte_order: ByteOrder,
    unit: Option<String>,
    enum_mapping: Option<&str>,
    calibrator: Option<Calibrator>,
) -> Result<ParameterType, DefinitionLoadError> {
    let require_width = |row: usize| -> Result<u32, DefinitionLoadError> {
        width_bits.ok_or_else(|| DefinitionLoadError::InvalidCsvRow {
            row,
            column: "width_bits".to_string(),
            message: "required for this type".to_string(),
        })
    };

    Ok(match kind {
        "uint" | "int" => ParameterType::Integer(IntegerParameterType {
            encoding: IntegerDataEncoding {
                size_in_bits: SizeInBits::Fixed(require_width(row)?),
                signedness: if signed { Signedness::TwosComplement } else { Signedness::Unsigned },
                byte_order,
            },
            calibrator,
            unit,
        }),
        "float" => {
            let width = match require_width(row)? {
                16 => FloatWidth::Bits16,
                32 => FloatWidth::Bits32,
                64 => FloatWidth::Bits64,
                other => {
                    return Err(DefinitionLoadError::InvalidCsvRow {
                        row,
                        column: "width_bits".to_string(),
                        message: format!("{other} is not a valid float width (16, 32, 64)"),
                    })
                }
            };
            ParameterType::Float(FloatParameterType {
                encoding: FloatDataEncoding { width, byte_order },
                calibrator,
                unit,
            })
        }
        "enum" => {
            let mapping = parse_enum_mapping(row, enum_mapping.unwrap_or(""))?;
            ParameterType::Enumerated(EnumeratedParameterType {
                encoding: IntegerDataEncoding {
                    size_in_bits: SizeInBits::Fixed(require_width(row)?),
                    signedness: Signedness::Unsigned,
                    byte_order,
                },
                mapping,
                unit,
            })
        }
        "string" => ParameterType::String(StringParameterType {
            encoding: StringDataEncoding {
                charset: Charset::Utf8,
                length_policy: StringLengthPolicy::Fixed(require_width(row)?),
            },
        }),
        "binary" => ParameterType::Binary(BinaryParameterType {
            encoding: BinaryDataEncoding {
                size_in_bits: SizeInBits::Fixed(require_width(row)?),
            },
        }),
        "boolean" => ParameterType::Boolean(BooleanParameterType),
        other => {
            return Err(DefinitionLoadError::InvalidCsvRow {
                row,
                column: "type".to_string(),
                message: format!("unrecognized type \"{other}\""),
            })
        }
    })
}

/// Builds a [`Definition`] from a CSV reader.
///
/// Expected columns: `packet_name`, `apid`, `field_name`, `type`
/// (`uint`/`int`/`float`/`enum`/`string`/`binary`/`boolean`), `width_bits` (required for every
/// type but `boolean`). Optional columns: `signed`, `byte_order` (`msb`/`lsb`), `unit`,
/// `enum_mapping` (`value:label` pairs separated by `;`), `poly_coefficients` (ascending,
/// comma-separated).
///
/// Rows are grouped by `packet_name` in first-seen order; each group becomes one concrete
/// [`SequenceContainer`] gated on `PKT_APID == apid`, reachable from a synthesized abstract root.
pub fn load_definition<R: Read>(reader: R) -> Result<Definition, DefinitionLoadError> {
    let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = csv_reader.headers().map_err(|e| DefinitionLoadError::InvalidCsvRow {
        row: 0,
        column: "<header>".to_string(),
        message: e.to_string(),
    })?.clone();

    let mut parameters = HashMap::new();
    let mut parameter_types = HashMap::new();
    let mut containers: HashMap<String, SequenceContainer> = HashMap::new();
    let mut packet_order: Vec<String> = Vec::new();
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();

    for (idx, record) in csv_reader.records().enumerate() {
        let row = idx + 2; // +1 for 1-based, +1 for the header row already consumed
        let record = record.map_err(|e| DefinitionLoadError::InvalidCsvRow {
            row,
            column: "<row>".to_string(),
            message: e.to_string(),
        })?;

        let packet_name = column(&headers, &record, row, "packet_name")?.to_string();
        let field_name = column(&headers, &record, row, "field_name")?.to_string();
        let kind = column(&headers, &record, row, "type")?.to_string();
        let apid = column(&headers, &record, row, "apid")?.to_string();
        let width_bits = optional_column(&headers, &record, "width_bits")
            .map(|raw| parse_width(row, raw))
            .transpose()?;
        let signed = parse_signed(optional_column(&headers, &record, "signed"));
        let byte_order = parse_byte_order(optional_column(&headers, &record, "byte_order"));
        let unit = optional_column(&headers, &record, "unit").map(str::to_string);
        let enum_mapping = optional_column(&headers, &record, "enum_mapping");
        let calibrator = optional_column(&headers, &record, "poly_coefficients").and_then(parse_polynomial);

        let ptype = build_parameter_type(row, &kind, width_bits, signed, byte_order, unit, enum_mapping, calibrator)?;

        let type_ref = format!("{packet_name}.{field_name}_T");
        parameter_types.insert(type_ref.clone(), ptype);
        let qualified_name = format!("{packet_name}.{field_name}");
        parameters.insert(
            qualified_name.clone(),
            Parameter {
                name: qualified_name.clone(),
                type_ref,
            },
        );

        if !containers.contains_key(&packet_name) {
            containers.insert(
                packet_name.clone(),
                SequenceContainer {
                    name: packet_name.clone(),
                    entries: Vec::new(),
                    base_container: Some(ROOT_CONTAINER.to_string()),
                    restriction_criteria: Some(MatchCriteria::Comparison(Comparison {
                        parameter_ref: "PKT_APID".to_string(),
                        operator: ComparisonOperator::Eq,
                        literal: apid,
                        use_calibrated: false,
                    })),
                    abstract_: false,
                },
            );
            packet_order.push(packet_name.clone());
        }
        containers
            .get_mut(&packet_name)
            .expect("just inserted above if absent")
            .entries
            .push(Entry::Parameter { parameter_ref: qualified_name });
    }

    containers.insert(
        ROOT_CONTAINER.to_string(),
        SequenceContainer {
            name: ROOT_CONTAINER.to_string(),
            entries: Vec::new(),
            base_container: None,
            restriction_criteria: None,
            abstract_: true,
        },
    );
    children_of.insert(ROOT_CONTAINER.to_string(), packet_order);

    Ok(Definition {
        parameter_types,
        parameters,
        containers,
        root_container: ROOT_CONTAINER.to_string(),
        children_of,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_two_flat_packets_gated_on_apid() {
        let csv = "packet_name,apid,field_name,type,width_bits,signed,unit\n\
                   STATUS,100,FLAG,boolean,,,\n\
                   STATUS,100,TEMP,uint,16,,\n\
                   EVENT,200,CODE,enum,8,,\n";
        let definition = load_definition(csv.as_bytes()).unwrap();
        assert_eq!(definition.root_container, "ROOT");
        assert!(definition.containers["ROOT"].abstract_);
        assert_eq!(definition.children_of("ROOT"), &["STATUS".to_string(), "EVENT".to_string()]);
        assert_eq!(definition.containers["STATUS"].entries.len(), 2);
        assert_eq!(definition.containers["EVENT"].entries.len(), 1);
    }

    #[test]
    fn rejects_unknown_type() {
        let csv = "packet_name,apid,field_name,type,width_bits\nSTATUS,100,FLAG,nonsense,1\n";
        let err = load_definition(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DefinitionLoadError::InvalidCsvRow { .. }));
    }
}
