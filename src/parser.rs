//! Per-packet state machine: walks the container inheritance DAG, consuming bits via
//! [`crate::bit_cursor::BitCursor`] and resolving polymorphic children via
//! [`crate::evaluator`], to produce one [`ParsedPacket`] (or an
//! [`UnrecognizedPacketError`]) from one framed packet buffer.

use crate::bit_cursor::BitCursor;
use crate::error::{BitReadError, EvaluationError, ParseFailureReason, UnrecognizedPacketError, UnrecognizedReason};
use crate::evaluator::{resolve_dynamic, ParseContext};
use crate::header::{PrimaryHeader, DEFAULT_HEADER_NAMES, PRIMARY_HEADER_BYTES};
use crate::model::{
    AbsoluteTimeParameterType, BinaryParameterType, ByteOrder, Definition, Entry,
    EnumeratedParameterType, FloatParameterType, IntegerParameterType, ParameterType,
    RelativeTimeParameterType, Signedness, SizeInBits, StringLengthPolicy, StringParameterType,
    TimeEncoding,
};
use crate::value::{CalibratedValue, ParsedValue, RawValue};
use log::warn;

/// Overrides for a single [`parse_packet`] call. [`crate::generator::GeneratorConfig`] carries
/// the same fields plus generator-only concerns (see §4.5) and derives this via
/// [`crate::generator::GeneratorConfig::parser_options`].
#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Overrides [`Definition::root_container`] when set.
    pub root_container: Option<String>,
    /// Overrides [`crate::header::DEFAULT_HEADER_NAMES`] when set.
    pub header_name_map: Option<[String; 7]>,
    /// Bytes to skip after the primary header, before user-data parsing begins.
    pub skip_secondary_header_bytes: usize,
    /// When set, only the primary header is parsed; the container walk is skipped entirely.
    pub parse_headers_only: bool,
}

/// One fully decoded CCSDS packet.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    /// The decoded 48-bit primary header.
    pub header: PrimaryHeader,
    /// Every parameter parsed, in declaration order, including the seven header fields.
    pub context: ParseContext,
    /// Raw bytes following the primary header (the CCSDS "packet data field").
    pub user_data: Vec<u8>,
}

fn insert_header_fields(ctx: &mut ParseContext, header: &PrimaryHeader, names: &[String; 7]) {
    ctx.insert(names[0].clone(), ParsedValue::raw_only(RawValue::UInt(header.version() as u64)));
    ctx.insert(names[1].clone(), ParsedValue::raw_only(RawValue::Bool(header.packet_type())));
    ctx.insert(names[2].clone(), ParsedValue::raw_only(RawValue::Bool(header.sec_hdr_flag())));
    ctx.insert(names[3].clone(), ParsedValue::raw_only(RawValue::UInt(header.apid() as u64)));
    ctx.insert(names[4].clone(), ParsedValue::raw_only(RawValue::UInt(header.seq_flags() as u64)));
    ctx.insert(names[5].clone(), ParsedValue::raw_only(RawValue::UInt(header.seq_count() as u64)));
    ctx.insert(names[6].clone(), ParsedValue::raw_only(RawValue::UInt(header.pkt_len() as u64)));
}

fn default_header_names() -> [String; 7] {
    DEFAULT_HEADER_NAMES.map(String::from)
}

fn bitread_to_reason(e: BitReadError) -> ParseFailureReason {
    ParseFailureReason::BitRead(e)
}

fn eval_to_reason(e: EvaluationError) -> ParseFailureReason {
    ParseFailureReason::Evaluation(e)
}

fn width_of(size: &SizeInBits, ctx: &ParseContext) -> Result<usize, ParseFailureReason> {
    match size {
        SizeInBits::Fixed(n) => Ok(*n as usize),
        SizeInBits::Dynamic(dv) => {
            let bits = resolve_dynamic(dv, ctx).map_err(eval_to_reason)?;
            if bits < 0 {
                return Err(eval_to_reason(EvaluationError::LiteralNotCoercible {
                    literal: dv.parameter_ref.clone(),
                    target: "non-negative bit width",
                }));
            }
            Ok(bits as usize)
        }
    }
}

fn read_integer_raw(
    cursor: &mut BitCursor,
    width: usize,
    signedness: Signedness,
    byte_order: ByteOrder,
) -> Result<i64, BitReadError> {
    match byte_order {
        ByteOrder::MsbFirst => cursor.read_int(width, signedness),
        ByteOrder::LsbFirst => {
            debug_assert_eq!(width % 8, 0, "LSB byte order only applies to whole-byte integers");
            let mut bytes = cursor.read_bytes(width)?;
            bytes.reverse();
            let mut sub = BitCursor::new(&bytes);
            sub.read_int(width, signedness)
        }
    }
}

fn read_float_raw(cursor: &mut BitCursor, width: usize, byte_order: ByteOrder) -> Result<f64, BitReadError> {
    match byte_order {
        ByteOrder::MsbFirst => cursor.read_float(width),
        ByteOrder::LsbFirst => {
            let mut bytes = cursor.read_bytes(width)?;
            bytes.reverse();
            let mut sub = BitCursor::new(&bytes);
            sub.read_float(width)
        }
    }
}

fn decode_integer(
    p: &IntegerParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    let width = width_of(&p.encoding.size_in_bits, ctx)?;
    let raw = read_integer_raw(cursor, width, p.encoding.signedness, p.encoding.byte_order).map_err(bitread_to_reason)?;
    let raw_value = if p.encoding.signedness == Signedness::Unsigned {
        RawValue::UInt(raw as u64)
    } else {
        RawValue::Int(raw)
    };
    let mut value = ParsedValue::raw_only(raw_value);
    value.unit = p.unit.clone();
    if let Some(cal) = &p.calibrator {
        use crate::evaluator::CalibrateValue;
        if let Some(y) = cal.calibrate(raw as f64, ctx).map_err(eval_to_reason)? {
            value.calibrated = Some(CalibratedValue::Float(y));
        }
    }
    Ok(value)
}

fn decode_float(
    p: &FloatParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    let width = p.encoding.width.bits();
    let raw = read_float_raw(cursor, width, p.encoding.byte_order).map_err(bitread_to_reason)?;
    let mut value = ParsedValue::raw_only(RawValue::Float(raw));
    value.unit = p.unit.clone();
    if let Some(cal) = &p.calibrator {
        use crate::evaluator::CalibrateValue;
        if let Some(y) = cal.calibrate(raw, ctx).map_err(eval_to_reason)? {
            value.calibrated = Some(CalibratedValue::Float(y));
        }
    }
    Ok(value)
}

fn decode_enumerated(
    p: &EnumeratedParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    let width = width_of(&p.encoding.size_in_bits, ctx)?;
    let raw = read_integer_raw(cursor, width, p.encoding.signedness, p.encoding.byte_order).map_err(bitread_to_reason)?;
    let raw_value = if p.encoding.signedness == Signedness::Unsigned {
        RawValue::UInt(raw as u64)
    } else {
        RawValue::Int(raw)
    };
    let mut value = ParsedValue::raw_only(raw_value);
    value.unit = p.unit.clone();
    match p.mapping.get(&raw) {
        Some(label) => value.calibrated = Some(CalibratedValue::Enum(label.clone())),
        None => value.unrecognized_enum = true,
    }
    Ok(value)
}

fn decode_string_length(
    policy: &StringLengthPolicy,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<usize, ParseFailureReason> {
    match policy {
        StringLengthPolicy::Fixed(n) => Ok(*n as usize),
        StringLengthPolicy::Dynamic(dv) => {
            let bits = resolve_dynamic(dv, ctx).map_err(eval_to_reason)?;
            Ok(bits.max(0) as usize)
        }
        StringLengthPolicy::LengthPrefix {
            prefix_bits,
            referenced_parameter,
        } => {
            let length_bytes = match referenced_parameter {
                Some(name) => {
                    let value = ctx.get(name).ok_or_else(|| {
                        eval_to_reason(EvaluationError::ParameterNotYetParsed { name: name.clone() })
                    })?;
                    value.raw.as_f64().ok_or_else(|| {
                        eval_to_reason(EvaluationError::LiteralNotCoercible {
                            literal: name.clone(),
                            target: "length prefix",
                        })
                    })? as usize
                }
                None => cursor.read_uint(*prefix_bits as usize).map_err(bitread_to_reason)? as usize,
            };
            Ok(length_bytes * 8)
        }
        // Termination length is discovered by scanning, not computed up front.
        StringLengthPolicy::Termination { .. } => Ok(0),
    }
}

fn decode_terminated_string(
    charset: crate::model::Charset,
    terminator: &[u8],
    cursor: &mut BitCursor,
) -> Result<String, ParseFailureReason> {
    let unit_bytes = terminator.len().max(1);
    let mut bytes = Vec::new();
    loop {
        if cursor.remaining() < unit_bytes * 8 {
            return Err(bitread_to_reason(BitReadError {
                bit_pos: cursor.position(),
                requested_bits: unit_bytes * 8,
                buffer_bits: cursor.position() + cursor.remaining(),
            }));
        }
        let unit = cursor.read_bytes(unit_bytes * 8).map_err(bitread_to_reason)?;
        if unit == terminator {
            break;
        }
        bytes.extend_from_slice(&unit);
    }
    let mut sub = BitCursor::new(&bytes);
    sub.read_string(bytes.len() * 8, charset).map_err(bitread_to_reason)
}

fn decode_string(
    p: &StringParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    let s = if let StringLengthPolicy::Termination { terminator } = &p.encoding.length_policy {
        decode_terminated_string(p.encoding.charset, terminator, cursor)?
    } else {
        let nbits = decode_string_length(&p.encoding.length_policy, cursor, ctx)?;
        cursor.read_string(nbits, p.encoding.charset).map_err(bitread_to_reason)?
    };
    let mut value = ParsedValue::raw_only(RawValue::Str(s.clone()));
    value.calibrated = Some(CalibratedValue::Str(s));
    Ok(value)
}

fn decode_binary(
    p: &BinaryParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    let width = width_of(&p.encoding.size_in_bits, ctx)?;
    let bytes = cursor.read_bytes(width).map_err(bitread_to_reason)?;
    Ok(ParsedValue::raw_only(RawValue::Bytes(bytes.into())))
}

fn decode_boolean(cursor: &mut BitCursor) -> Result<ParsedValue, ParseFailureReason> {
    let raw = cursor.read_uint(1).map_err(bitread_to_reason)?;
    let b = raw != 0;
    let mut value = ParsedValue::raw_only(RawValue::Bool(b));
    value.calibrated = Some(CalibratedValue::Bool(b));
    Ok(value)
}

fn decode_time(encoding: &TimeEncoding, scale: f64, cursor: &mut BitCursor) -> Result<ParsedValue, ParseFailureReason> {
    let (raw_f64, raw_value) = match encoding {
        TimeEncoding::Integer(enc) => {
            let width = match &enc.size_in_bits {
                SizeInBits::Fixed(n) => *n as usize,
                SizeInBits::Dynamic(_) => {
                    return Err(eval_to_reason(EvaluationError::LiteralNotCoercible {
                        literal: "time encoding".into(),
                        target: "fixed width",
                    }))
                }
            };
            let raw = read_integer_raw(cursor, width, enc.signedness, enc.byte_order).map_err(bitread_to_reason)?;
            (raw as f64, RawValue::Int(raw))
        }
        TimeEncoding::Float(enc) => {
            let raw = read_float_raw(cursor, enc.width.bits(), enc.byte_order).map_err(bitread_to_reason)?;
            (raw, RawValue::Float(raw))
        }
    };
    let mut value = ParsedValue::raw_only(raw_value);
    value.calibrated = Some(CalibratedValue::Float(raw_f64 * scale));
    Ok(value)
}

fn decode_parameter_type(
    ptype: &ParameterType,
    cursor: &mut BitCursor,
    ctx: &ParseContext,
) -> Result<ParsedValue, ParseFailureReason> {
    match ptype {
        ParameterType::Integer(p) => decode_integer(p, cursor, ctx),
        ParameterType::Float(p) => decode_float(p, cursor, ctx),
        ParameterType::Enumerated(p) => decode_enumerated(p, cursor, ctx),
        ParameterType::String(p) => decode_string(p, cursor, ctx),
        ParameterType::Binary(p) => decode_binary(p, cursor, ctx),
        ParameterType::Boolean(_) => decode_boolean(cursor),
        ParameterType::AbsoluteTime(AbsoluteTimeParameterType { encoding, scale, .. }) => {
            decode_time(encoding, *scale, cursor)
        }
        ParameterType::RelativeTime(RelativeTimeParameterType { encoding, scale }) => {
            decode_time(encoding, *scale, cursor)
        }
    }
}

fn consume_entries(
    definition: &Definition,
    entries: &[Entry],
    cursor: &mut BitCursor,
    ctx: &mut ParseContext,
) -> Result<(), ParseFailureReason> {
    for entry in entries {
        match entry {
            Entry::Parameter { parameter_ref } => {
                let parameter = definition
                    .parameters
                    .get(parameter_ref)
                    .expect("loader resolved parameter refs at load time");
                let ptype = definition
                    .parameter_types
                    .get(&parameter.type_ref)
                    .expect("loader resolved type refs at load time");
                let value = decode_parameter_type(ptype, cursor, ctx)?;
                ctx.insert(parameter.name.clone(), value);
            }
            Entry::Container { container_ref } => {
                let fragment = definition
                    .containers
                    .get(container_ref)
                    .expect("loader resolved container refs at load time");
                // Inlined at the reference site: the fragment's own restriction_criteria and
                // base_container are not consulted here (see DESIGN.md).
                consume_entries(definition, &fragment.entries, cursor, ctx)?;
            }
        }
    }
    Ok(())
}

fn unrecognized(
    ctx: &ParseContext,
    last_container: String,
    reason: UnrecognizedReason,
) -> UnrecognizedPacketError {
    UnrecognizedPacketError {
        partial_context: ctx.to_vec(),
        last_container,
        reason,
    }
}

/// Parses one already-framed packet buffer (exactly `7 + PKT_LEN` bytes) against `definition`.
pub fn parse_packet(
    definition: &Definition,
    buf: &[u8],
    options: &ParserOptions,
) -> Result<ParsedPacket, UnrecognizedPacketError> {
    let mut cursor = BitCursor::new(buf);
    let mut ctx = ParseContext::new();

    let header_bytes: [u8; PRIMARY_HEADER_BYTES] = buf[..PRIMARY_HEADER_BYTES]
        .try_into()
        .expect("caller frames exactly 7 + PKT_LEN bytes, at least 6");
    let header = PrimaryHeader::parse(&header_bytes);
    cursor
        .skip(PRIMARY_HEADER_BYTES * 8)
        .expect("just verified buf holds the primary header");

    let default_names = default_header_names();
    let names = options.header_name_map.as_ref().unwrap_or(&default_names);
    insert_header_fields(&mut ctx, &header, names);

    if options.skip_secondary_header_bytes > 0 {
        cursor
            .skip(options.skip_secondary_header_bytes * 8)
            .map_err(|e| unrecognized(&ctx, definition.root_container.clone(), UnrecognizedReason::ParseFailed(ParseFailureReason::BitRead(e))))?;
    }

    if options.parse_headers_only {
        return Ok(ParsedPacket {
            header,
            context: ctx,
            user_data: buf[PRIMARY_HEADER_BYTES..].to_vec(),
        });
    }

    let mut container_name = options
        .root_container
        .clone()
        .unwrap_or_else(|| definition.root_container.clone());

    loop {
        let container = match definition.containers.get(&container_name) {
            Some(container) => container,
            None => {
                return Err(unrecognized(
                    &ctx,
                    container_name.clone(),
                    UnrecognizedReason::UnknownRootContainer(container_name.clone()),
                ))
            }
        };

        consume_entries(definition, &container.entries, &mut cursor, &mut ctx)
            .map_err(|reason| unrecognized(&ctx, container_name.clone(), UnrecognizedReason::ParseFailed(reason)))?;

        let children = definition.children_of(&container_name);
        let mut matching: Vec<&str> = Vec::new();
        for child_name in children {
            let child = &definition.containers[child_name];
            let matched = match &child.restriction_criteria {
                None => true,
                Some(criteria) => criteria
                    .evaluate(&ctx)
                    .map_err(|e| unrecognized(&ctx, container_name.clone(), UnrecognizedReason::ParseFailed(ParseFailureReason::Evaluation(e))))?,
            };
            if matched {
                matching.push(child_name.as_str());
            }
        }

        match matching.len() {
            0 if !container.abstract_ => break,
            0 => {
                return Err(unrecognized(
                    &ctx,
                    container_name.clone(),
                    UnrecognizedReason::NoConcreteMatch,
                ))
            }
            1 => {
                container_name = matching[0].to_string();
                continue;
            }
            _ => {
                warn!(
                    "ambiguous container resolution under \"{container_name}\": {} children matched",
                    matching.len()
                );
                return Err(unrecognized(
                    &ctx,
                    container_name.clone(),
                    UnrecognizedReason::AmbiguousChildren(matching.iter().map(|s| s.to_string()).collect()),
                ));
            }
        }
    }

    let consumed_bits = cursor.position();
    let total_bits = buf.len() * 8;
    if consumed_bits != total_bits {
        warn!(
            "length mismatch for container \"{container_name}\": consumed {consumed_bits} of {total_bits} bits"
        );
    }

    Ok(ParsedPacket {
        header,
        context: ctx,
        user_data: buf[PRIMARY_HEADER_BYTES..].to_vec(),
    })
}
