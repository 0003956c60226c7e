/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Resumable HTTP/1.1 request-line and header parser, plus the
//! fixed-capacity receive ring it runs over. Ported state for state from
//! `original_source/src/http_parse.c`'s two functions; the header list
//! stores owned `String`s rather than pointer-pairs into the ring, so
//! nothing here ever borrows out of the ring across a resumption boundary,
//! unlike the original's NUL-terminator-in-place trick on the parsed URI.

use std::fmt;

/// Size of the per-connection receive buffer.
pub const RECV_BUFFER_CAP: usize = 8192;
/// Header-list cap; overflow is `InvalidHeader`.
pub const MAX_HEADERS: usize = 64;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// A fixed-capacity byte ring serving as a connection's receive buffer.
/// `pos` is the next byte to parse, `last` the next byte to fill; both are
/// monotonic logical cursors, so wraparound is always `cursor % CAPACITY`.
/// The original keeps raw buffer indices for `pos`/`last` and has to reason
/// about wraparound at every comparison; keeping the cursors monotonic and
/// indexing by `cursor mod capacity` only at the point of a read or write
/// sidesteps that class of bug entirely.
pub struct RecvRing {
    buf: Box<[u8; RECV_BUFFER_CAP]>,
    pos: u64,
    last: u64,
}

impl RecvRing {
    pub fn new() -> Self {
        RecvRing { buf: Box::new([0u8; RECV_BUFFER_CAP]), pos: 0, last: 0 }
    }

    fn len(&self) -> u64 {
        self.last - self.pos
    }

    /// True once the buffer holds `RECV_BUFFER_CAP` unparsed bytes: no room
    /// left to read more before the parser makes progress. A request whose
    /// headers don't fit in that much space is rejected rather than grown
    /// into, since the buffer is a fixed allocation per connection.
    pub fn is_full(&self) -> bool {
        self.len() >= RECV_BUFFER_CAP as u64
    }

    /// The next physically-contiguous writable slice (bounded by both the
    /// ring's wraparound point and remaining room), for a single `read(2)`
    /// call.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let room = RECV_BUFFER_CAP as u64 - self.len();
        let phys_last = (self.last % RECV_BUFFER_CAP as u64) as usize;
        let contiguous = (RECV_BUFFER_CAP - phys_last).min(room as usize);
        &mut self.buf[phys_last..phys_last + contiguous]
    }

    pub fn record_filled(&mut self, n: usize) {
        self.last += n as u64;
    }

    fn byte(&self, logical: u64) -> u8 {
        self.buf[(logical % RECV_BUFFER_CAP as u64) as usize]
    }

    /// Copies the (inclusive start, exclusive end) logical range into an
    /// owned `String`, lossily. Used once a field (method, URI, header key
    /// or value) is fully delimited.
    fn slice_to_string(&self, start: u64, end: u64) -> String {
        let mut out = Vec::with_capacity((end - start) as usize);
        let mut i = start;
        while i < end {
            out.push(self.byte(i));
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Default for RecvRing {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Unknown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidMethod,
    InvalidRequest,
    InvalidHeader,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidMethod => write!(f, "invalid HTTP method"),
            ParseError::InvalidRequest => write!(f, "invalid HTTP request line"),
            ParseError::InvalidHeader => write!(f, "invalid HTTP header"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Outcome of one parse step: either the caller needs to read more bytes
/// and call again (resuming from saved state), or parsing of this phase
/// completed.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Again,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Start,
    Method,
    SpacesBeforeUri,
    AfterSlashInUri,
    Http,
    HttpH,
    HttpHt,
    HttpHtt,
    HttpHttp,
    FirstMajorDigit,
    MajorDigit,
    FirstMinorDigit,
    MinorDigit,
    SpacesAfterDigit,
    AlmostDone,
}

/// Resumable parser for the request line: method, URI and HTTP version.
pub struct RequestLineParser {
    state: LineState,
    method_start: u64,
    method_end: u64,
    uri_start: u64,
    uri_end: u64,
    pub method: Method,
    pub http_major: u16,
    pub http_minor: u16,
}

impl RequestLineParser {
    pub fn new() -> Self {
        RequestLineParser {
            state: LineState::Start,
            method_start: 0,
            method_end: 0,
            uri_start: 0,
            uri_end: 0,
            method: Method::Unknown,
            http_major: 0,
            http_minor: 0,
        }
    }

    /// Consumes bytes from `ring.pos` up to `ring.last`, advancing
    /// `ring.pos` as it goes. On [`Step::Again`] the caller must read more
    /// bytes into the ring and call again; the parser resumes exactly
    /// where it left off.
    pub fn parse(&mut self, ring: &mut RecvRing) -> Result<Step, ParseError> {
        use LineState::*;
        let mut i = ring.pos;
        while i < ring.last {
            let ch = ring.byte(i);
            match self.state {
                Start => {
                    self.method_start = i;
                    if ch == CR || ch == LF {
                        // tolerate leading CR/LF before the method.
                    } else if !(ch.is_ascii_uppercase() || ch == b'_') {
                        return Err(ParseError::InvalidMethod);
                    } else {
                        self.state = Method;
                    }
                }
                Method => {
                    if ch == b' ' {
                        self.method_end = i;
                        let len = self.method_end - self.method_start;
                        self.method = match len {
                            3 if ring.slice_to_string(self.method_start, self.method_end) == "GET" => Method::Get,
                            4 => match ring.slice_to_string(self.method_start, self.method_end).as_str() {
                                "POST" => Method::Post,
                                "HEAD" => Method::Head,
                                _ => Method::Unknown,
                            },
                            _ => Method::Unknown,
                        };
                        self.state = SpacesBeforeUri;
                    } else if !(ch.is_ascii_uppercase() || ch == b'_') {
                        return Err(ParseError::InvalidMethod);
                    }
                }
                SpacesBeforeUri => {
                    if ch == b'/' {
                        self.uri_start = i;
                        self.state = AfterSlashInUri;
                    } else if ch != b' ' {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                AfterSlashInUri => {
                    if ch == b' ' {
                        self.uri_end = i;
                        self.state = Http;
                    }
                }
                Http => match ch {
                    b' ' => {}
                    b'H' => self.state = HttpH,
                    _ => return Err(ParseError::InvalidRequest),
                },
                HttpH => {
                    if ch == b'T' {
                        self.state = HttpHt;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                HttpHt => {
                    if ch == b'T' {
                        self.state = HttpHtt;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                HttpHtt => {
                    if ch == b'P' {
                        self.state = HttpHttp;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                HttpHttp => {
                    if ch == b'/' {
                        self.state = FirstMajorDigit;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                FirstMajorDigit => {
                    if !ch.is_ascii_digit() || ch == b'0' {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.http_major = (ch - b'0') as u16;
                    self.state = MajorDigit;
                }
                MajorDigit => {
                    if ch == b'.' {
                        self.state = FirstMinorDigit;
                    } else if ch.is_ascii_digit() {
                        self.http_major = self.http_major * 10 + (ch - b'0') as u16;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                FirstMinorDigit => {
                    if !ch.is_ascii_digit() {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.http_minor = (ch - b'0') as u16;
                    self.state = MinorDigit;
                }
                MinorDigit => {
                    if ch == CR {
                        self.state = AlmostDone;
                    } else if ch == LF {
                        ring.pos = i + 1;
                        return Ok(Step::Done);
                    } else if ch == b' ' {
                        self.state = SpacesAfterDigit;
                    } else if ch.is_ascii_digit() {
                        self.http_minor = self.http_minor * 10 + (ch - b'0') as u16;
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
                SpacesAfterDigit => match ch {
                    b' ' => {}
                    CR => self.state = AlmostDone,
                    LF => {
                        ring.pos = i + 1;
                        return Ok(Step::Done);
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
                AlmostDone => {
                    if ch == LF {
                        ring.pos = i + 1;
                        return Ok(Step::Done);
                    } else {
                        return Err(ParseError::InvalidRequest);
                    }
                }
            }
            i += 1;
        }
        ring.pos = i;
        Ok(Step::Again)
    }

    pub fn uri(&self, ring: &RecvRing) -> String {
        ring.slice_to_string(self.uri_start, self.uri_end)
    }
}

impl Default for RequestLineParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Start,
    Key,
    SpacesBeforeColon,
    SpacesAfterColon,
    Value,
    Cr,
    Crlf,
    CrlfCr,
}

/// Resumable parser for the header block.
pub struct HeaderParser {
    state: HeaderState,
    key_start: u64,
    key_end: u64,
    value_start: u64,
    value_end: u64,
    pub headers: Vec<(String, String)>,
}

impl HeaderParser {
    pub fn new() -> Self {
        HeaderParser {
            state: HeaderState::Start,
            key_start: 0,
            key_end: 0,
            value_start: 0,
            value_end: 0,
            headers: Vec::new(),
        }
    }

    fn push_header(&mut self, ring: &RecvRing) -> Result<(), ParseError> {
        if self.headers.len() >= MAX_HEADERS {
            return Err(ParseError::InvalidHeader);
        }
        let key = ring.slice_to_string(self.key_start, self.key_end);
        let value = ring.slice_to_string(self.value_start, self.value_end);
        self.headers.push((key, value));
        Ok(())
    }

    pub fn parse(&mut self, ring: &mut RecvRing) -> Result<Step, ParseError> {
        use HeaderState::*;
        let mut i = ring.pos;
        while i < ring.last {
            let ch = ring.byte(i);
            match self.state {
                Start => {
                    if ch == CR || ch == LF {
                        // blank line before any header: tolerated, stays in Start.
                    } else {
                        self.key_start = i;
                        self.state = Key;
                    }
                }
                Key => {
                    if ch == b' ' {
                        self.key_end = i;
                        self.state = SpacesBeforeColon;
                    } else if ch == b':' {
                        self.key_end = i;
                        self.state = SpacesAfterColon;
                    }
                }
                SpacesBeforeColon => {
                    if ch == b' ' {
                    } else if ch == b':' {
                        self.state = SpacesAfterColon;
                    } else {
                        return Err(ParseError::InvalidHeader);
                    }
                }
                SpacesAfterColon => {
                    if ch != b' ' {
                        self.value_start = i;
                        self.state = Value;
                    }
                }
                Value => {
                    if ch == CR {
                        self.value_end = i;
                        self.state = Cr;
                    } else if ch == LF {
                        self.value_end = i;
                        self.push_header(ring)?;
                        self.state = Crlf;
                    }
                }
                Cr => {
                    if ch == LF {
                        self.push_header(ring)?;
                        self.state = Crlf;
                    } else {
                        return Err(ParseError::InvalidHeader);
                    }
                }
                Crlf => {
                    if ch == CR {
                        self.state = CrlfCr;
                    } else {
                        self.key_start = i;
                        self.state = Key;
                    }
                }
                CrlfCr => {
                    if ch == LF {
                        ring.pos = i + 1;
                        return Ok(Step::Done);
                    } else {
                        return Err(ParseError::InvalidHeader);
                    }
                }
            }
            i += 1;
        }
        ring.pos = i;
        Ok(Step::Again)
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}
