//! # arbordb codec
//!
//! Bit-exact record-level encodings of the arbordb segment format.
//!
//! This crate knows nothing about segments, caches or stores. It defines:
//! - the small/medium/long length encodings ([`length`]),
//! - the 6-byte wire form of record references ([`RecordRef`]),
//! - blob identifier encodings ([`blob`]),
//! - the packed template record ([`Template`]),
//! - and [`RecordReader`], the typed-read surface that segment
//!   implementations plug their byte access into.
//!
//! All multi-byte integers are big-endian.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
mod error;
mod ids;
pub mod length;
mod reader;
pub mod template;
mod value;

pub use error::{CodecError, CodecResult};
pub use ids::{RecordRef, RECORD_REF_BYTES};
pub use reader::RecordReader;
pub use template::{Children, Template, TemplateBuilder};
pub use value::{BlobRef, StringValue};
