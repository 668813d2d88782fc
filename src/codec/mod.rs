//! Payload codecs. Currently only permessage-deflate (RFC 7692).

pub mod deflate;

pub use deflate::{DeflateParams, Deflater, Inflater, DEFLATE_TRAILER};
