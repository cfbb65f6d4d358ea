// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Translation between wire bytes and typed [`Request`](crate::Request) /
//! [`Response`](crate::Response) values. No I/O happens here; the engines
//! feed bytes in and take bytes out.

pub mod parser;
pub mod query;
pub mod serializer;

pub use self::parser::{ParseError, ParseStatus, RequestParser};
pub use self::serializer::{serialize_response, SerializeOptions};

/// Maximum length of the request line, in bytes. Longer lines are rejected
/// with [`ParseError::UriTooLong`].
pub const MAX_REQUEST_LINE_SIZE: usize = 8 * 1024;

/// Maximum length of the header section (every header line including its
/// CRLF, not counting the final blank line). Larger sections are rejected
/// with [`ParseError::HeadersTooLarge`].
pub const MAX_HEADERS_SIZE: usize = 8 * 1024;

/// Default ceiling on the declared request body length. Engines may lower
/// it through their configuration, never raise it past this hard default.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Note httparse requires we preallocate an array of this size, so be wise.
/// More headers than this in one request parse as
/// [`ParseError::Malformed`].
pub const MAX_HEADERS_NUM: usize = 64;
