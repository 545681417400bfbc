//! Stream driver: repeatedly frames one packet's worth of bytes off a [`std::io::Read`] source
//! and hands it to [`crate::parser::parse_packet`].
//!
//! A stateful stream decoder wrapping a `Read` source, configured via a small options struct at
//! construction, with an `Iterator` adapter over its output rather than a free function or
//! callback registration.

use std::io::{self, Read};
use std::sync::Arc;

use crate::error::{SourceReadError, StreamError};
use crate::header::{PrimaryHeader, PRIMARY_HEADER_BYTES};
use crate::model::Definition;
use crate::parser::{parse_packet, ParserOptions, ParsedPacket};

/// [`Generator`] configuration. See field docs for the options this mirrors.
pub struct GeneratorConfig {
    /// Overrides [`Definition::root_container`] when set.
    pub root_container_name: Option<String>,
    /// If `true`, an [`crate::error::UnrecognizedPacketError`] is yielded to the caller; if
    /// `false`, the packet is skipped and iteration continues at the next primary header.
    pub yield_unrecognized_errors: bool,
    /// Bytes to skip after the primary header, before user-data parsing begins — for streams with
    /// a fixed secondary header described out-of-band from the packet definition.
    pub skip_secondary_header_bytes: usize,
    /// Alternative names for the seven primary-header fields.
    pub header_name_map: Option<[String; 7]>,
    /// Skip user-data parsing entirely; yield only the header fields.
    pub parse_headers_only: bool,
    /// Invoked with the running packet count after each packet (recognized or not) is framed.
    pub show_progress: Option<Box<dyn FnMut(usize) + Send>>,
    /// Word size, in bytes, the underlying transport pads each packet to. `0` or `1` both mean no
    /// padding. Bytes beyond `7 + PKT_LEN` up to the next word boundary are read and discarded.
    pub word_size_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            root_container_name: None,
            yield_unrecognized_errors: true,
            skip_secondary_header_bytes: 0,
            header_name_map: None,
            parse_headers_only: false,
            show_progress: None,
            word_size_bytes: 1,
        }
    }
}

fn round_up(n: usize, multiple: usize) -> usize {
    if multiple <= 1 {
        return n;
    }
    let rem = n % multiple;
    if rem == 0 {
        n
    } else {
        n + (multiple - rem)
    }
}

/// Reads exactly `buf.len()` bytes, retrying on `Interrupted`, distinguishing a clean
/// between-packets EOF (`got == 0`) from a short read mid-packet, and surfacing a
/// timeout-configured source's `WouldBlock`/`TimedOut` as [`SourceReadError::Timeout`].
fn read_exact_tracked<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), SourceReadError> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => {
                return Err(SourceReadError::UnexpectedEof {
                    expected: buf.len(),
                    got: total,
                })
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                return Err(SourceReadError::Timeout)
            }
            Err(e) => return Err(SourceReadError::from(e)),
        }
    }
    Ok(())
}

/// Drives a CCSDS Space Packet stream against a [`Definition`], yielding one [`ParsedPacket`] per
/// frame.
pub struct Generator<R: Read> {
    reader: R,
    definition: Arc<Definition>,
    config: GeneratorConfig,
    packet_count: usize,
}

impl<R: Read> Generator<R> {
    /// Wraps `reader`, ready to frame packets against `definition` per `config`.
    pub fn new(reader: R, definition: Arc<Definition>, config: GeneratorConfig) -> Self {
        Self {
            reader,
            definition,
            config,
            packet_count: 0,
        }
    }

    /// Returns a reference to the underlying [`Read`].
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Returns a mutable reference to the underlying [`Read`].
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Returns an iterator over this stream's packets.
    pub fn packets(&mut self) -> Packets<'_, R> {
        Packets { generator: self }
    }

    fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            root_container: self.config.root_container_name.clone(),
            header_name_map: self.config.header_name_map.clone(),
            skip_secondary_header_bytes: self.config.skip_secondary_header_bytes,
            parse_headers_only: self.config.parse_headers_only,
        }
    }

    fn next_packet(&mut self) -> Option<Result<ParsedPacket, StreamError>> {
        loop {
            let mut header_bytes = [0u8; PRIMARY_HEADER_BYTES];
            match read_exact_tracked(&mut self.reader, &mut header_bytes) {
                Ok(()) => {}
                Err(SourceReadError::UnexpectedEof { got: 0, .. }) => return None,
                Err(e) => return Some(Err(StreamError::Source(e))),
            }

            let header = PrimaryHeader::parse(&header_bytes);
            let remainder_len = header.pkt_len() as usize + 1;
            let mut buf = vec![0u8; PRIMARY_HEADER_BYTES + remainder_len];
            buf[..PRIMARY_HEADER_BYTES].copy_from_slice(&header_bytes);
            if let Err(e) = read_exact_tracked(&mut self.reader, &mut buf[PRIMARY_HEADER_BYTES..]) {
                return Some(Err(StreamError::Source(e)));
            }

            let padded_len = round_up(buf.len(), self.config.word_size_bytes);
            if padded_len > buf.len() {
                let mut padding = vec![0u8; padded_len - buf.len()];
                if let Err(e) = read_exact_tracked(&mut self.reader, &mut padding) {
                    return Some(Err(StreamError::Source(e)));
                }
            }

            self.packet_count += 1;
            if let Some(progress) = self.config.show_progress.as_mut() {
                progress(self.packet_count);
            }

            let options = self.parser_options();
            match parse_packet(&self.definition, &buf, &options) {
                Ok(packet) => return Some(Ok(packet)),
                Err(e) => {
                    if self.config.yield_unrecognized_errors {
                        return Some(Err(StreamError::Unrecognized(e)));
                    }
                    continue;
                }
            }
        }
    }
}

/// Iterator over a [`Generator`]'s packets, borrowing it for the duration of iteration.
pub struct Packets<'a, R: Read> {
    generator: &'a mut Generator<R>,
}

impl<'a, R: Read> Iterator for Packets<'a, R> {
    type Item = Result<ParsedPacket, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.generator.next_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, IntegerDataEncoding, Parameter, ParameterType, SequenceContainer, Signedness};
    use crate::model::{ByteOrder, IntegerParameterType, SizeInBits};
    use std::collections::HashMap;

    fn single_byte_definition() -> Arc<Definition> {
        let mut parameters = HashMap::new();
        let mut parameter_types = HashMap::new();
        parameters.insert(
            "BYTE".to_string(),
            Parameter {
                name: "BYTE".into(),
                type_ref: "BYTE_T".into(),
            },
        );
        parameter_types.insert(
            "BYTE_T".to_string(),
            ParameterType::Integer(IntegerParameterType {
                encoding: IntegerDataEncoding {
                    size_in_bits: SizeInBits::Fixed(8),
                    signedness: Signedness::Unsigned,
                    byte_order: ByteOrder::MsbFirst,
                },
                calibrator: None,
                unit: None,
            }),
        );
        let mut containers = HashMap::new();
        containers.insert(
            "ROOT".to_string(),
            SequenceContainer {
                name: "ROOT".into(),
                entries: vec![Entry::Parameter {
                    parameter_ref: "BYTE".into(),
                }],
                base_container: None,
                restriction_criteria: None,
                abstract_: false,
            },
        );
        Arc::new(Definition {
            parameter_types,
            parameters,
            containers,
            root_container: "ROOT".into(),
            children_of: HashMap::new(),
        })
    }

    // S1-shaped: two back-to-back packets, each a header plus one payload byte (PKT_LEN=0).
    #[test]
    fn iterates_two_consecutive_packets() {
        let definition = single_byte_definition();
        let stream: &[u8] = &[
            0x08, 0x64, 0xC0, 0x00, 0x00, 0x00, 0xAB, // packet 1: APID=100, payload 0xAB
            0x08, 0x65, 0xC0, 0x00, 0x00, 0x00, 0xCD, // packet 2: APID=101, payload 0xCD
        ];
        let mut generator = Generator::new(stream, definition, GeneratorConfig::default());
        let packets: Vec<_> = generator.packets().collect::<Result<_, _>>().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.apid(), 100);
        assert_eq!(packets[1].header.apid(), 101);
    }

    #[test]
    fn clean_eof_between_packets_ends_iteration() {
        let definition = single_byte_definition();
        let stream: &[u8] = &[0x08, 0x64, 0xC0, 0x00, 0x00, 0x00, 0xAB];
        let mut generator = Generator::new(stream, definition, GeneratorConfig::default());
        let mut iter = generator.packets();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
    }

    #[test]
    fn truncated_final_packet_is_a_source_error() {
        let definition = single_byte_definition();
        let stream: &[u8] = &[0x08, 0x64, 0xC0, 0x00, 0x00]; // short by 2 bytes
        let mut generator = Generator::new(stream, definition, GeneratorConfig::default());
        let err = generator.packets().next().unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Source(SourceReadError::UnexpectedEof { .. })));
    }

    #[test]
    fn word_size_padding_is_consumed_and_discarded() {
        let definition = single_byte_definition();
        // 7-byte packet padded to a 4-byte boundary -> one extra discarded byte.
        let stream: &[u8] = &[0x08, 0x64, 0xC0, 0x00, 0x00, 0x00, 0xAB, 0x00];
        let config = GeneratorConfig {
            word_size_bytes: 4,
            ..GeneratorConfig::default()
        };
        let mut generator = Generator::new(stream, definition, config);
        let mut iter = generator.packets();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
    }

    struct WouldBlockOnce;

    impl Read for WouldBlockOnce {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn would_block_surfaces_as_timeout() {
        let definition = single_byte_definition();
        let mut generator = Generator::new(WouldBlockOnce, definition, GeneratorConfig::default());
        let err = generator.packets().next().unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Source(SourceReadError::Timeout)));
    }
}
