//! HTTP/1.1 request encoding and incremental response parsing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Method, Request, StatusCode};
use httparse::Status;

use super::{CodecError, RawResponse};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Default)]
pub(super) struct Http1 {
    buffer: BytesMut,
    head: Option<Head>,
}

impl Http1 {
    pub(super) fn encode(&mut self, request: &Request<Bytes>) -> Bytes {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let body = request.body();

        let mut buf = BytesMut::with_capacity(256 + body.len());
        buf.put_slice(format!("{} {path} HTTP/1.1\r\n", request.method()).as_bytes());

        if let Some(authority) = request.uri().authority() {
            put_header(&mut buf, b"host", authority.as_str().as_bytes());
        }
        for (name, value) in request.headers() {
            put_header(&mut buf, name.as_str().as_bytes(), value.as_bytes());
        }
        if !body.is_empty() || request.method() == Method::POST {
            put_header(&mut buf, b"content-length", body.len().to_string().as_bytes());
        }

        buf.put_slice(b"\r\n");
        buf.put_slice(body);
        buf.freeze()
    }

    pub(super) fn decode(&mut self, data: &[u8]) -> Result<Option<RawResponse>, CodecError> {
        self.buffer.extend_from_slice(data);

        loop {
            let mut head = match self.head.take() {
                Some(head) => head,
                None => match parse_head(&self.buffer)? {
                    None => return Ok(None),
                    Some((len, head)) => {
                        self.buffer.advance(len);
                        if head.status.is_informational() {
                            tracing::trace!(status = %head.status, "skipping interim response");
                            continue;
                        }
                        head
                    }
                },
            };

            return match head.read_body(&mut self.buffer)? {
                Some(body) => Ok(Some(RawResponse {
                    status: Some(head.status),
                    body,
                })),
                None => {
                    self.head = Some(head);
                    Ok(None)
                }
            };
        }
    }
}

fn put_header(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    buf.put_slice(name);
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

#[derive(Debug)]
struct Head {
    status: StatusCode,
    body: Body,
}

#[derive(Debug)]
enum Body {
    Empty,
    Length(usize),
    Chunked(Chunked),
}

fn parse_head(buf: &[u8]) -> Result<Option<(usize, Head)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(len) => len,
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(CodecError::InvalidHeader("status"))?;

    let mut length = None;
    let mut chunked = false;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or(CodecError::InvalidHeader("content-length"))?;
            length = Some(value);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| CodecError::InvalidHeader("transfer-encoding"))?;
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    let body = if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        Body::Empty
    } else if chunked {
        Body::Chunked(Chunked::default())
    } else if let Some(length) = length {
        Body::Length(length)
    } else {
        return Err(CodecError::UnframedBody);
    };

    Ok(Some((len, Head { status, body })))
}

impl Head {
    fn read_body(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match &mut self.body {
            Body::Empty => Ok(Some(Bytes::new())),
            Body::Length(length) if buffer.len() >= *length => {
                Ok(Some(buffer.split_to(*length).freeze()))
            }
            Body::Length(_) => Ok(None),
            Body::Chunked(chunked) => chunked.read(buffer),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
enum ChunkState {
    #[default]
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Default)]
struct Chunked {
    state: ChunkState,
    body: BytesMut,
}

impl Chunked {
    fn read(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let parsed =
                        httparse::parse_chunk_size(buffer).map_err(|_| CodecError::InvalidChunk)?;
                    let Status::Complete((len, size)) = parsed else {
                        return Ok(None);
                    };
                    buffer.advance(len);

                    let size = usize::try_from(size).map_err(|_| CodecError::InvalidChunk)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buffer.len());
                    self.body.extend_from_slice(&buffer.split_to(n));
                    self.state = if n == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - n)
                    };
                }
                ChunkState::DataEnd => {
                    if buffer.len() < 2 {
                        return Ok(None);
                    }
                    if &buffer[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk);
                    }
                    buffer.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(end) = buffer.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(None);
                    };
                    buffer.advance(end + 2);
                    if end == 0 {
                        return Ok(Some(std::mem::take(&mut self.body).freeze()));
                    }
                }
            }
        }
    }
}
