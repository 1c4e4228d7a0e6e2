//! MIME decoding of fetched messages.

mod parser;

pub use parser::{parse_body, parse_envelope, MimeBody, MimeError, Result};
