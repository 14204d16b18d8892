//! Just enough HPACK (RFC 7541) to send requests and read a response status.
//!
//! Requests are encoded with literal representations that never touch the
//! dynamic table, and without Huffman coding, so no decoder state is needed
//! on either side for what we send. Responses are only inspected for their
//! `:status` pseudo-header.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{HeaderName, Method, Request, StatusCode};

const AUTHORITY: usize = 1;
const METHOD: usize = 2;
const PATH: usize = 4;

const INDEXED_GET: u8 = 0x82;
const INDEXED_POST: u8 = 0x83;
const INDEXED_SCHEME_HTTPS: u8 = 0x87;

const LITERAL: u8 = 0x00;
const NEVER_INDEXED: u8 = 0x10;

/// `:status` values in static table entries 8 through 14.
const STATIC_STATUS: [u16; 7] = [200, 204, 206, 304, 400, 404, 500];

fn static_name_index(name: &HeaderName) -> Option<usize> {
    let index = if name == ACCEPT {
        19
    } else if name == AUTHORIZATION {
        23
    } else if name == CONTENT_LENGTH {
        28
    } else if name == CONTENT_TYPE {
        31
    } else if name == USER_AGENT {
        58
    } else {
        return None;
    };
    Some(index)
}

pub(super) fn encode_integer(dst: &mut BytesMut, value: usize, prefix: u8, flags: u8) {
    let max = (1usize << prefix) - 1;
    if value < max {
        dst.put_u8(flags | value as u8);
        return;
    }

    dst.put_u8(flags | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.put_u8((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// Decode a prefixed integer, returning the value and the bytes consumed.
pub(super) fn decode_integer(src: &[u8], prefix: u8) -> Option<(usize, usize)> {
    let max = (1usize << prefix) - 1;
    let mut value = usize::from(*src.first()?) & max;
    if value < max {
        return Some((value, 1));
    }

    let mut shift = 0u32;
    for (i, byte) in src[1..].iter().enumerate() {
        let part = usize::from(byte & 0x7f).checked_shl(shift)?;
        value = value.checked_add(part)?;
        if byte & 0x80 == 0 {
            return Some((value, i + 2));
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    None
}

fn encode_string(dst: &mut BytesMut, value: &[u8]) {
    encode_integer(dst, value.len(), 7, 0x00);
    dst.put_slice(value);
}

/// Decode a string literal. Huffman-coded content is reported as `None`.
fn decode_string(src: &[u8]) -> Option<(Option<&[u8]>, usize)> {
    let huffman = src.first()? & 0x80 != 0;
    let (len, start) = decode_integer(src, 7)?;
    let end = start.checked_add(len)?;
    let data = src.get(start..end)?;
    Some(((!huffman).then_some(data), end))
}

fn encode_field(dst: &mut BytesMut, name: &HeaderName, value: &[u8]) {
    let flags = if name == AUTHORIZATION {
        NEVER_INDEXED
    } else {
        LITERAL
    };

    match static_name_index(name) {
        Some(index) => encode_integer(dst, index, 4, flags),
        None => {
            dst.put_u8(flags);
            encode_string(dst, name.as_str().as_bytes());
        }
    }
    encode_string(dst, value);
}

/// Encode the header block for `request`.
pub(super) fn encode_request(request: &Request<Bytes>) -> Bytes {
    let mut dst = BytesMut::with_capacity(256);

    let method = request.method();
    if method == Method::GET {
        dst.put_u8(INDEXED_GET);
    } else if method == Method::POST {
        dst.put_u8(INDEXED_POST);
    } else {
        encode_integer(&mut dst, METHOD, 4, LITERAL);
        encode_string(&mut dst, method.as_str().as_bytes());
    }

    dst.put_u8(INDEXED_SCHEME_HTTPS);

    if let Some(authority) = request.uri().authority() {
        encode_integer(&mut dst, AUTHORITY, 4, LITERAL);
        encode_string(&mut dst, authority.as_str().as_bytes());
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    encode_integer(&mut dst, PATH, 4, LITERAL);
    encode_string(&mut dst, path.as_bytes());

    for (name, value) in request.headers() {
        encode_field(&mut dst, name, value.as_bytes());
    }

    if !request.body().is_empty() || request.method() == Method::POST {
        encode_field(
            &mut dst,
            &CONTENT_LENGTH,
            request.body().len().to_string().as_bytes(),
        );
    }

    dst.freeze()
}

/// Find the `:status` of a response header block.
///
/// `:status` must be the first field. Returns `None` when it is encoded in a
/// way that needs decoder state (a dynamic table reference or Huffman coding).
pub(super) fn decode_status(mut block: &[u8]) -> Option<StatusCode> {
    // dynamic table size updates
    while block.first()? & 0xe0 == 0x20 {
        let (_, len) = decode_integer(block, 5)?;
        block = &block[len..];
    }

    let first = *block.first()?;
    if first & 0x80 != 0 {
        let (index, _) = decode_integer(block, 7)?;
        let code = STATIC_STATUS.get(index.checked_sub(8)?)?;
        return StatusCode::from_u16(*code).ok();
    }

    let prefix = if first & 0x40 != 0 { 6 } else { 4 };
    let (index, len) = decode_integer(block, prefix)?;
    block = &block[len..];

    if index == 0 {
        let (name, len) = decode_string(block)?;
        if name? != b":status" {
            return None;
        }
        block = &block[len..];
    } else if !(8..=14).contains(&index) {
        return None;
    }

    let (value, _) = decode_string(block)?;
    StatusCode::from_bytes(value?).ok()
}
