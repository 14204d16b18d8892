//! A minimal client side of HTTP/2 framing (RFC 9113).
//!
//! Only one request is in flight at a time. We advertise the largest
//! possible receive windows up front so the server is never blocked on
//! flow control while the session is waiting on a response. Frames which
//! need an answer (SETTINGS, PING) are acknowledged at the front of the
//! next outbound message.

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Request, StatusCode};

use super::hpack;
use super::{CodecError, RawResponse};

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const DEFAULT_WINDOW: u32 = 65_535;
const MAX_WINDOW: u32 = (1 << 31) - 1;

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PUSH_PROMISE: u8 = 0x5;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;
const CONTINUATION: u8 = 0x9;

const END_STREAM: u8 = 0x1;
const ACK: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const NO_ERROR: u32 = 0x0;

#[derive(Debug)]
struct Frame {
    kind: u8,
    flags: u8,
    stream: u32,
    payload: Bytes,
}

#[derive(Debug)]
pub(super) struct Http2 {
    buffer: BytesMut,
    outbound: BytesMut,
    next_stream: u32,
    active: Option<u32>,
    peer_max_frame: usize,

    block: BytesMut,
    continuation: Option<u32>,
    end_stream: bool,
    status: Option<StatusCode>,
    final_head: bool,
    body: BytesMut,
}

impl Default for Http2 {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            outbound: BytesMut::new(),
            next_stream: 1,
            active: None,
            peer_max_frame: DEFAULT_MAX_FRAME_SIZE,
            block: BytesMut::new(),
            continuation: None,
            end_stream: false,
            status: None,
            final_head: false,
            body: BytesMut::new(),
        }
    }
}

fn put_frame_head(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream: u32) {
    dst.put_uint(len as u64, 3);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream & 0x7fff_ffff);
}

fn strip_padding(flags: u8, payload: &mut Bytes) -> Result<(), CodecError> {
    if flags & PADDED == 0 {
        return Ok(());
    }

    let pad = usize::from(
        *payload
            .first()
            .ok_or(CodecError::Http2("missing pad length"))?,
    );
    if pad + 1 > payload.len() {
        return Err(CodecError::Http2("padding exceeds frame"));
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad);
    Ok(())
}

impl Http2 {
    /// The connection preface, our SETTINGS, and a connection window increase.
    pub(super) fn preface(&mut self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_slice(PREFACE);

        put_frame_head(&mut dst, 12, SETTINGS, 0, 0);
        dst.put_u16(SETTINGS_ENABLE_PUSH);
        dst.put_u32(0);
        dst.put_u16(SETTINGS_INITIAL_WINDOW_SIZE);
        dst.put_u32(MAX_WINDOW);

        put_frame_head(&mut dst, 4, WINDOW_UPDATE, 0, 0);
        dst.put_u32(MAX_WINDOW - DEFAULT_WINDOW);

        dst.freeze()
    }

    pub(super) fn encode(&mut self, request: &Request<Bytes>) -> Result<Bytes, CodecError> {
        if self.active.is_some() {
            return Err(CodecError::Http2("a request is already in flight"));
        }

        let stream = self.next_stream;
        self.next_stream = stream
            .checked_add(2)
            .filter(|id| *id <= 0x7fff_ffff)
            .ok_or(CodecError::Http2("stream identifiers exhausted"))?;

        let block = hpack::encode_request(request);
        let body = request.body();

        let mut dst = mem::take(&mut self.outbound);
        dst.reserve(block.len() + body.len() + 4 * FRAME_HEADER_LEN);

        let mut fragments = block.chunks(self.peer_max_frame).peekable();
        let mut kind = HEADERS;
        let mut flags = if body.is_empty() { END_STREAM } else { 0 };
        while let Some(fragment) = fragments.next() {
            if fragments.peek().is_none() {
                flags |= END_HEADERS;
            }
            put_frame_head(&mut dst, fragment.len(), kind, flags, stream);
            dst.put_slice(fragment);
            kind = CONTINUATION;
            flags = 0;
        }

        let mut chunks = body.chunks(self.peer_max_frame).peekable();
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() { END_STREAM } else { 0 };
            put_frame_head(&mut dst, chunk.len(), DATA, flags, stream);
            dst.put_slice(chunk);
        }

        tracing::trace!(stream, "opened stream");
        self.active = Some(stream);
        Ok(dst.freeze())
    }

    /// A graceful GOAWAY, after any pending acknowledgements.
    pub(super) fn goaway(&mut self) -> Bytes {
        let mut dst = mem::take(&mut self.outbound);
        put_frame_head(&mut dst, 8, GOAWAY, 0, 0);
        dst.put_u32(0);
        dst.put_u32(NO_ERROR);
        dst.freeze()
    }

    pub(super) fn decode(&mut self, data: &[u8]) -> Result<Option<RawResponse>, CodecError> {
        self.buffer.extend_from_slice(data);

        while let Some(frame) = self.next_frame()? {
            if let Some(response) = self.handle(frame)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let head = &self.buffer[..FRAME_HEADER_LEN];
        let len = (usize::from(head[0]) << 16) | (usize::from(head[1]) << 8) | usize::from(head[2]);
        if len > DEFAULT_MAX_FRAME_SIZE {
            return Err(CodecError::Http2("frame exceeds maximum size"));
        }
        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let kind = head[3];
        let flags = head[4];
        let stream = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;

        self.buffer.advance(FRAME_HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame {
            kind,
            flags,
            stream,
            payload,
        }))
    }

    fn handle(&mut self, frame: Frame) -> Result<Option<RawResponse>, CodecError> {
        let Frame {
            kind,
            flags,
            stream,
            mut payload,
        } = frame;

        if let Some(expected) = self.continuation {
            if kind != CONTINUATION || stream != expected {
                return Err(CodecError::Http2("expected CONTINUATION"));
            }
        }

        let active = self.active.filter(|id| *id == stream).is_some();

        match kind {
            DATA => {
                if stream == 0 {
                    return Err(CodecError::Http2("DATA on stream 0"));
                }
                strip_padding(flags, &mut payload)?;
                if active {
                    self.body.extend_from_slice(&payload);
                    if flags & END_STREAM != 0 {
                        return Ok(Some(self.complete()));
                    }
                }
            }
            HEADERS => {
                if stream == 0 {
                    return Err(CodecError::Http2("HEADERS on stream 0"));
                }
                strip_padding(flags, &mut payload)?;
                if flags & PRIORITY != 0 {
                    if payload.len() < 5 {
                        return Err(CodecError::Http2("truncated priority"));
                    }
                    payload.advance(5);
                }
                self.block.clear();
                self.block.extend_from_slice(&payload);
                self.end_stream = flags & END_STREAM != 0;
                if flags & END_HEADERS == 0 {
                    self.continuation = Some(stream);
                } else if active {
                    return Ok(self.end_headers());
                }
            }
            CONTINUATION => {
                if self.continuation != Some(stream) {
                    return Err(CodecError::Http2("unexpected CONTINUATION"));
                }
                self.block.extend_from_slice(&payload);
                if flags & END_HEADERS != 0 {
                    self.continuation = None;
                    if active {
                        return Ok(self.end_headers());
                    }
                }
            }
            RST_STREAM => {
                if payload.len() != 4 {
                    return Err(CodecError::Http2("RST_STREAM has wrong length"));
                }
                let code = payload.get_u32();
                if active {
                    self.active = None;
                    return Err(CodecError::StreamReset(code));
                }
            }
            SETTINGS => self.settings(flags, stream, payload)?,
            PING => {
                if payload.len() != 8 {
                    return Err(CodecError::Http2("PING has wrong length"));
                }
                if flags & ACK == 0 {
                    put_frame_head(&mut self.outbound, 8, PING, ACK, 0);
                    self.outbound.put_slice(&payload);
                }
            }
            GOAWAY => {
                if payload.len() < 8 {
                    return Err(CodecError::Http2("GOAWAY is truncated"));
                }
                let last_stream = payload.get_u32() & 0x7fff_ffff;
                let code = payload.get_u32();
                tracing::debug!(last_stream, code, "server sent GOAWAY");
                if let Some(id) = self.active {
                    if code != NO_ERROR || id > last_stream {
                        self.active = None;
                        return Err(CodecError::GoAway { code, last_stream });
                    }
                }
            }
            PUSH_PROMISE => return Err(CodecError::Http2("PUSH_PROMISE with push disabled")),
            _ => {}
        }

        Ok(None)
    }

    fn settings(&mut self, flags: u8, stream: u32, mut payload: Bytes) -> Result<(), CodecError> {
        if stream != 0 {
            return Err(CodecError::Http2("SETTINGS on a stream"));
        }
        if flags & ACK != 0 {
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(CodecError::Http2("SETTINGS has wrong length"));
        }

        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            if id == SETTINGS_MAX_FRAME_SIZE {
                self.peer_max_frame = usize::try_from(value)
                    .ok()
                    .filter(|size| (DEFAULT_MAX_FRAME_SIZE..=0xff_ffff).contains(size))
                    .ok_or(CodecError::Http2("invalid SETTINGS_MAX_FRAME_SIZE"))?;
            }
        }

        put_frame_head(&mut self.outbound, 0, SETTINGS, ACK, 0);
        Ok(())
    }

    fn end_headers(&mut self) -> Option<RawResponse> {
        let block = mem::take(&mut self.block);
        if !self.final_head {
            let status = hpack::decode_status(&block);
            if status.is_some_and(|status| status.is_informational()) {
                return None;
            }
            self.status = status;
            self.final_head = true;
        }

        if self.end_stream {
            Some(self.complete())
        } else {
            None
        }
    }

    fn complete(&mut self) -> RawResponse {
        self.active = None;
        self.final_head = false;
        self.end_stream = false;
        RawResponse {
            status: self.status.take(),
            body: mem::take(&mut self.body).freeze(),
        }
    }
}
