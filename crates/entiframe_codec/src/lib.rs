//! # entiframe codec
//!
//! The dynamic [`Value`] token shared by property values, relational rows and
//! stored documents, plus two encodings of it:
//!
//! - canonical CBOR, deterministic so it can key identity maps and derive
//!   etags;
//! - JSON, the wire shape of document-store documents.
//!
//! ## Canonical CBOR rules
//!
//! - Object keys are text, sorted by their encoded bytes (length-first)
//! - Integers use the shortest encoding
//! - Floats always use the 64-bit form, NaN is rejected
//! - No indefinite-length items, no tags
//!
//! ## Usage
//!
//! ```
//! use entiframe_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let doc = Value::object([("id", Value::from("1")), ("Name", Value::from("Rex"))]);
//! let bytes = to_canonical_cbor(&doc).unwrap();
//! let decoded = from_cbor(&bytes).unwrap();
//! assert_eq!(decoded.get("Name"), Some(&Value::from("Rex")));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod json;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use json::{from_json, parse_json, to_json, to_json_string};
pub use value::Value;
