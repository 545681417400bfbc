//! Decodes a stream of CCSDS Space Packets into structured parameter values, guided by an XTCE
//! (or flat CSV) packet-structure definition.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! xtce-packet = "~0.1.0"
//! ```
//!
//! Load a [`model::Definition`] with [`xtce::XtceLoader`] or [`csv_loader`], then drive a byte
//! source with [`generator::Generator`]:
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use xtce_packet::generator::{Generator, GeneratorConfig};
//! use xtce_packet::xtce::XtceLoader;
//!
//! let definition = Arc::new(XtceLoader::load_reader(File::open("packets.xtce").unwrap()).unwrap());
//! let mut generator = Generator::new(File::open("stream.bin").unwrap(), definition, GeneratorConfig::default());
//! for packet in generator.packets() {
//!     match packet {
//!         Ok(packet) => println!("{:?}", packet.context),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//! ```

#![deny(missing_docs, unsafe_code)]

pub mod bit_cursor;
pub mod csv_loader;
pub mod error;
pub mod evaluator;
pub mod generator;
pub mod header;
pub mod model;
pub mod parser;
pub mod value;
pub mod xtce;

mod xml_tree;

pub use error::{
    BitReadError, DefinitionLoadError, EvaluationError, ParseFailureReason, SourceReadError,
    StreamError, UnrecognizedPacketError, UnrecognizedReason,
};
pub use generator::{Generator, GeneratorConfig};
pub use model::Definition;
pub use parser::{parse_packet, ParsedPacket, ParserOptions};
pub use value::{CalibratedValue, ParsedValue, RawValue};
