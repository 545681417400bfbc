//! End-to-end scenarios driving a small inline XTCE document through [`Generator`] against a
//! hand-built byte stream.
//!
//! The seven primary-header fields are synthesized directly from the decoded
//! [`xtce_packet::header::PrimaryHeader`] before a container's own entries are consumed (see
//! `parser::parse_packet`), so none of these definitions list header fields in a `SequenceContainer`'s
//! `EntryList` — only the user-data fields that follow the 6-byte header.

use std::sync::Arc;

use xtce_packet::error::{StreamError, UnrecognizedReason};
use xtce_packet::generator::{Generator, GeneratorConfig};
use xtce_packet::value::{CalibratedValue, RawValue};
use xtce_packet::xtce::XtceLoader;

fn pack_primary_header(apid: u16, pkt_len: u16) -> [u8; 6] {
    let word: u64 = (apid as u64 & 0x7FF) << 32 | (pkt_len as u64 & 0xFFFF);
    let bytes = word.to_be_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes[2..8]);
    out
}

// S1: one concrete container, user data = one 64-bit binary payload.
#[test]
fn s1_single_fixed_packet() {
    let xtce = r#"<SpaceSystem name="S1"><TelemetryMetaData>
        <ParameterTypeSet>
            <BinaryParameterType name="PAYLOAD_T"><BinaryDataEncoding sizeInBits="64"/></BinaryParameterType>
        </ParameterTypeSet>
        <ParameterSet>
            <Parameter name="PAYLOAD" parameterTypeRef="PAYLOAD_T"/>
        </ParameterSet>
        <ContainerSet>
            <SequenceContainer name="CCSDSPacket">
                <EntryList><ParameterRefEntry parameterRef="PAYLOAD"/></EntryList>
            </SequenceContainer>
        </ContainerSet>
    </TelemetryMetaData></SpaceSystem>"#;
    let definition = Arc::new(XtceLoader::load_str(xtce).unwrap());

    let stream: &[u8] = &[0x08, 0x64, 0xC0, 0x00, 0x00, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    let mut generator = Generator::new(stream, definition, GeneratorConfig::default());
    let packets: Vec<_> = generator.packets().collect::<Result<_, _>>().unwrap();
    assert_eq!(packets.len(), 1);
    let packet = &packets[0];
    assert_eq!(packet.header.apid(), 100);
    assert_eq!(packet.header.pkt_len(), 7);
    assert_eq!(packet.context.get("PKT_APID").unwrap().raw, RawValue::UInt(100));
    match &packet.context.get("PAYLOAD").unwrap().raw {
        RawValue::Bytes(bytes) => assert_eq!(bytes.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]),
        other => panic!("unexpected {other:?}"),
    }
}

// S2: implicit variable length. 72 fixed bits after the header, EVENTDATA is whatever remains of
// the data field: 8*PKT_LEN - 64 bits.
#[test]
fn s2_implicit_variable_length() {
    let xtce = r#"<SpaceSystem name="S2"><TelemetryMetaData>
        <ParameterTypeSet>
            <BinaryParameterType name="FIXED_T"><BinaryDataEncoding sizeInBits="72"/></BinaryParameterType>
            <BinaryParameterType name="EVENTDATA_T">
                <BinaryDataEncoding>
                    <SizeInBits>
                        <DynamicValue>
                            <ParameterInstanceRef parameterRef="PKT_LEN"/>
                            <LinearAdjustment intercept="-64" slope="8"/>
                        </DynamicValue>
                    </SizeInBits>
                </BinaryDataEncoding>
            </BinaryParameterType>
        </ParameterTypeSet>
        <ParameterSet>
            <Parameter name="FIXED" parameterTypeRef="FIXED_T"/>
            <Parameter name="EVENTDATA" parameterTypeRef="EVENTDATA_T"/>
        </ParameterSet>
        <ContainerSet>
            <SequenceContainer name="CCSDSPacket">
                <EntryList>
                    <ParameterRefEntry parameterRef="FIXED"/>
                    <ParameterRefEntry parameterRef="EVENTDATA"/>
                </EntryList>
            </SequenceContainer>
        </ContainerSet>
    </TelemetryMetaData></SpaceSystem>"#;
    let definition = Arc::new(XtceLoader::load_str(xtce).unwrap());

    // PKT_LEN=9 -> total packet bytes = 16 (6 header + 10 data field bytes): 9 fixed + 1 EVENTDATA.
    let mut stream = vec![0x08, 0x64, 0xC0, 0x00, 0x00, 0x09];
    stream.extend_from_slice(&[0xAA; 9]); // FIXED, 72 bits
    stream.push(0xBB); // EVENTDATA, 8 bits
    let mut generator = Generator::new(stream.as_slice(), definition, GeneratorConfig::default());
    let packet = generator.packets().next().unwrap().unwrap();
    assert_eq!(packet.header.pkt_len(), 9);
    match &packet.context.get("EVENTDATA").unwrap().raw {
        RawValue::Bytes(bytes) => assert_eq!(bytes.as_slice(), &[0xBB]),
        other => panic!("unexpected {other:?}"),
    }
}

// S3: explicit variable length. SCI_DATA_BYTELEN declares a byte count; SCI_DATA's SizeInBits is
// 8x that value.
#[test]
fn s3_explicit_variable_length() {
    let xtce = r#"<SpaceSystem name="S3"><TelemetryMetaData>
        <ParameterTypeSet>
            <IntegerParameterType name="BYTELEN_T"><IntegerDataEncoding sizeInBits="8" encoding="unsigned"/></IntegerParameterType>
            <BinaryParameterType name="SCI_DATA_T">
                <BinaryDataEncoding>
                    <SizeInBits>
                        <DynamicValue>
                            <ParameterInstanceRef parameterRef="SCI_DATA_BYTELEN"/>
                            <LinearAdjustment intercept="0" slope="8"/>
                        </DynamicValue>
                    </SizeInBits>
                </BinaryDataEncoding>
            </BinaryParameterType>
        </ParameterTypeSet>
        <ParameterSet>
            <Parameter name="SCI_DATA_BYTELEN" parameterTypeRef="BYTELEN_T"/>
            <Parameter name="SCI_DATA" parameterTypeRef="SCI_DATA_T"/>
        </ParameterSet>
        <ContainerSet>
            <SequenceContainer name="CCSDSPacket">
                <EntryList>
                    <ParameterRefEntry parameterRef="SCI_DATA_BYTELEN"/>
                    <ParameterRefEntry parameterRef="SCI_DATA"/>
                </EntryList>
            </SequenceContainer>
        </ContainerSet>
    </TelemetryMetaData></SpaceSystem>"#;
    let definition = Arc::new(XtceLoader::load_str(xtce).unwrap());

    // Data field = BYTELEN(1 byte) + SCI_DATA(4 bytes) = 5 bytes -> PKT_LEN = 4.
    let mut stream = vec![0x08, 0x64, 0xC0, 0x00, 0x00, 0x04];
    stream.push(4); // SCI_DATA_BYTELEN = 4
    stream.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
    let mut generator = Generator::new(stream.as_slice(), definition, GeneratorConfig::default());
    let packet = generator.packets().next().unwrap().unwrap();
    match &packet.context.get("SCI_DATA").unwrap().raw {
        RawValue::Bytes(bytes) => assert_eq!(bytes.as_slice(), &[0x11, 0x22, 0x33, 0x44]),
        other => panic!("unexpected {other:?}"),
    }
}

// S4/S5 share a definition: abstract root with two children gated on PKT_APID, no data fields.
fn polymorphic_definition() -> Arc<xtce_packet::Definition> {
    let xtce = r#"<SpaceSystem name="S4"><TelemetryMetaData>
        <ParameterTypeSet>
            <IntegerParameterType name="U11_T"><IntegerDataEncoding sizeInBits="11" encoding="unsigned"/></IntegerParameterType>
        </ParameterTypeSet>
        <ParameterSet>
            <Parameter name="PKT_APID" parameterTypeRef="U11_T"/>
        </ParameterSet>
        <ContainerSet>
            <SequenceContainer name="CCSDSPacket" abstract="true"/>
            <SequenceContainer name="CHILD_A">
                <BaseContainer containerRef="CCSDSPacket">
                    <RestrictionCriteria><Comparison parameterRef="PKT_APID" value="1424" comparisonOperator="=="/></RestrictionCriteria>
                </BaseContainer>
            </SequenceContainer>
            <SequenceContainer name="CHILD_B">
                <BaseContainer containerRef="CCSDSPacket">
                    <RestrictionCriteria><Comparison parameterRef="PKT_APID" value="1425" comparisonOperator="=="/></RestrictionCriteria>
                </BaseContainer>
            </SequenceContainer>
        </ContainerSet>
    </TelemetryMetaData></SpaceSystem>"#;
    Arc::new(XtceLoader::load_str(xtce).unwrap())
}

#[test]
fn s4_polymorphic_inheritance() {
    let definition = polymorphic_definition();
    let mut stream = Vec::new();
    stream.extend_from_slice(&pack_primary_header(1424, 0));
    stream.push(0);
    stream.extend_from_slice(&pack_primary_header(1425, 0));
    stream.push(0);

    let mut generator = Generator::new(stream.as_slice(), definition, GeneratorConfig::default());
    let packets: Vec<_> = generator.packets().collect::<Result<_, _>>().unwrap();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].header.apid(), 1424);
    assert_eq!(packets[1].header.apid(), 1425);
}

#[test]
fn s5_unrecognized_packet_behavior() {
    let definition = polymorphic_definition();
    let mut stream = Vec::new();
    stream.extend_from_slice(&pack_primary_header(9999, 0));
    stream.push(0);

    // Errors enabled (default): one UnrecognizedPacketError with all seven header fields.
    let mut generator = Generator::new(stream.as_slice(), definition.clone(), GeneratorConfig::default());
    let err = generator.packets().next().unwrap().unwrap_err();
    match err {
        StreamError::Unrecognized(e) => {
            assert_eq!(e.reason, UnrecognizedReason::NoConcreteMatch);
            assert_eq!(e.partial_context.len(), 7);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Errors disabled: generator yields nothing and terminates cleanly.
    let config = GeneratorConfig {
        yield_unrecognized_errors: false,
        ..GeneratorConfig::default()
    };
    let mut generator = Generator::new(stream.as_slice(), definition, config);
    assert!(generator.packets().next().is_none());
}

#[test]
fn s6_polynomial_calibration() {
    let xtce = r#"<SpaceSystem name="S6"><TelemetryMetaData>
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
        <ParameterSet><Parameter name="READING" parameterTypeRef="CAL_T"/></ParameterSet>
        <ContainerSet>
            <SequenceContainer name="CCSDSPacket">
                <EntryList><ParameterRefEntry parameterRef="READING"/></EntryList>
            </SequenceContainer>
        </ContainerSet>
    </TelemetryMetaData></SpaceSystem>"#;
    let definition = Arc::new(XtceLoader::load_str(xtce).unwrap());

    let mut stream = pack_primary_header(100, 0).to_vec();
    stream.push(10);
    let mut generator = Generator::new(stream.as_slice(), definition, GeneratorConfig::default());
    let packet = generator.packets().next().unwrap().unwrap();
    let reading = packet.context.get("READING").unwrap();
    match &reading.calibrated {
        Some(CalibratedValue::Float(f)) => assert_eq!(*f, 71.0),
        other => panic!("unexpected {other:?}"),
    }
}
