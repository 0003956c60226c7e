/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Connection engine: the per-connection data model, request-target
//! resolution, and the header dispatch table. The state machine that drives
//! accept/read/write across these is in [`crate::server`], since it also
//! needs the reactor, timer index and arena. This module owns only what a
//! single connection is, not how the three handlers cooperate around it.

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::parser::{HeaderParser, Method, ParseError, RecvRing, RequestLineParser, Step};

/// Default keep-alive / idle timeout advertised in `Keep-Alive: timeout=`
/// and used as the timer deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// `original_source/src/http.c`'s `parse_uri` caps the request path at this
/// length.
pub const MAX_URI_LEN: usize = 256;

/// Which phase of request parsing a connection is resumed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestLine,
    Headers,
    Done,
}

/// The central per-connection entity. Owned solely by whichever handler
/// currently runs; see [`crate::arena`] for how handlers hand a connection
/// off to one another.
pub struct Connection {
    pub fd: RawFd,
    pub ring: RecvRing,
    pub phase: ParsePhase,
    pub line: RequestLineParser,
    pub headers: HeaderParser,
    /// Whether this connection's timer node is currently linked in the
    /// timer index.
    pub timerset: bool,
    /// The absolute deadline last registered with the timer index, needed
    /// to call `TimerIndex::del`, which takes the key the node was inserted
    /// under.
    pub timer_deadline: u64,
    pub root: Arc<PathBuf>,
}

impl Connection {
    pub fn new(fd: RawFd, root: Arc<PathBuf>) -> Self {
        Connection {
            fd,
            ring: RecvRing::new(),
            phase: ParsePhase::RequestLine,
            line: RequestLineParser::new(),
            headers: HeaderParser::new(),
            timerset: false,
            timer_deadline: 0,
            root,
        }
    }

    /// Drives parsing as far as the currently-buffered bytes allow,
    /// advancing through [`ParsePhase::RequestLine`] then
    /// [`ParsePhase::Headers`]. Returns `Ok(Step::Again)` when more bytes
    /// are needed, `Ok(Step::Done)` once the full request (line + headers)
    /// has been parsed.
    pub fn parse_step(&mut self) -> Result<Step, ParseError> {
        if self.phase == ParsePhase::RequestLine {
            match self.line.parse(&mut self.ring)? {
                Step::Again => return Ok(Step::Again),
                Step::Done => self.phase = ParsePhase::Headers,
            }
        }
        if self.phase == ParsePhase::Headers {
            match self.headers.parse(&mut self.ring)? {
                Step::Again => return Ok(Step::Again),
                Step::Done => self.phase = ParsePhase::Done,
            }
        }
        Ok(Step::Done)
    }

    pub fn method(&self) -> Method {
        self.line.method
    }

    pub fn raw_uri(&self) -> String {
        self.line.uri(&self.ring)
    }
}

/// Response descriptor: created fresh for each write pass.
pub struct ResponseDescriptor {
    pub fd: RawFd,
    pub keep_alive: bool,
    pub modified: bool,
    pub status: u16,
    pub mtime: Option<DateTime<Utc>>,
}

impl ResponseDescriptor {
    pub fn new(fd: RawFd) -> Self {
        ResponseDescriptor { fd, keep_alive: false, modified: true, status: 0, mtime: None }
    }
}

/// Applies the header dispatch table: `Host` is ignored, `Connection:
/// keep-alive` sets `keep_alive`, and a matching `If-Modified-Since` sets
/// `modified = false` and `status = 304`. Ported from
/// `original_source/src/http_request.c`'s `http_headers_in` table.
pub fn apply_headers(headers: &[(String, String)], resp: &mut ResponseDescriptor) {
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("connection") {
            if value.trim().eq_ignore_ascii_case("keep-alive") {
                resp.keep_alive = true;
            }
        } else if key.eq_ignore_ascii_case("if-modified-since") {
            if let (Some(mtime), Ok(client_time)) = (resp.mtime, parse_http_date(value.trim())) {
                if client_time.timestamp() == mtime.timestamp() {
                    resp.modified = false;
                    resp.status = 304;
                }
            }
        }
        // "Host" and any other header name: ignored.
    }
}

/// Parses an RFC-1123 date (`%a, %d %b %Y %H:%M:%S GMT`), the format used
/// by both `If-Modified-Since` and `Last-Modified`. Owned output, never
/// written back into the receive buffer, unlike the original, which parses
/// dates with `strptime` directly against buffer bytes.
pub fn parse_http_date(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S GMT")?;
    Ok(Utc.from_utc_datetime(&naive))
}

pub fn format_http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    UriTooLong,
    PathTraversal,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UriTooLong => write!(f, "request URI exceeds {MAX_URI_LEN} bytes"),
            ResolveError::PathTraversal => write!(f, "request URI escapes the document root"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolves a parsed request-target to a filesystem path under `root`.
/// Percent-decodes, rejects `..` path segments outright, and defaults an
/// empty or `/`-suffixed path to `index.html`, following
/// `original_source/src/http.c`'s `parse_uri` with its in-place
/// NUL-termination replaced by an owned `String`.
///
/// Deviates from `parse_uri` in one respect: the original also appends
/// `index.html` whenever the last path component has no `.`, treating any
/// extensionless request path as a directory. This only defaults the
/// empty and trailing-slash cases, so `GET /foo` against an extensionless
/// file `foo` resolves to `{root}/foo` rather than `{root}/foo/index.html`.
pub fn resolve_path(root: &Path, raw_uri: &str) -> Result<PathBuf, ResolveError> {
    if raw_uri.len() > MAX_URI_LEN {
        return Err(ResolveError::UriTooLong);
    }

    // strip a query string, like `parse_uri`'s `question_mark` handling.
    let path_part = raw_uri.split('?').next().unwrap_or("");
    let decoded = percent_decode(path_part);
    let decoded = String::from_utf8_lossy(&decoded).into_owned();

    for segment in decoded.split('/') {
        if segment == ".." {
            return Err(ResolveError::PathTraversal);
        }
    }

    let trimmed = decoded.trim_start_matches('/');
    let mut path = root.to_path_buf();
    if trimmed.is_empty() || decoded.ends_with('/') {
        if !trimmed.is_empty() {
            path.push(trimmed);
        }
        path.push("index.html");
    } else {
        path.push(trimmed);
    }
    Ok(path)
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_root_to_index_html() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/").unwrap(), PathBuf::from("/srv/www/index.html"));
        assert_eq!(resolve_path(root, "").unwrap(), PathBuf::from("/srv/www/index.html"));
    }

    #[test]
    fn resolves_a_direct_file_path() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/foo/bar.html").unwrap(), PathBuf::from("/srv/www/foo/bar.html"));
    }

    #[test]
    fn trailing_slash_directory_defaults_to_index_html() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/docs/").unwrap(), PathBuf::from("/srv/www/docs/index.html"));
    }

    #[test]
    fn percent_decodes_the_path() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/a%20b.html").unwrap(), PathBuf::from("/srv/www/a b.html"));
    }

    #[test]
    fn rejects_path_traversal() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/../etc/passwd"), Err(ResolveError::PathTraversal));
        assert_eq!(resolve_path(root, "/a/../../etc/passwd"), Err(ResolveError::PathTraversal));
    }

    #[test]
    fn rejects_uris_longer_than_256_bytes() {
        let root = Path::new("/srv/www");
        let long = format!("/{}", "a".repeat(300));
        assert_eq!(resolve_path(root, &long), Err(ResolveError::UriTooLong));
    }

    #[test]
    fn query_string_is_stripped_before_resolution() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/search?q=rust").unwrap(), PathBuf::from("/srv/www/search"));
    }

    #[test]
    fn connection_keep_alive_header_sets_flag_case_insensitively() {
        let mut resp = ResponseDescriptor::new(3);
        apply_headers(&[("Connection".to_string(), "Keep-Alive".to_string())], &mut resp);
        assert!(resp.keep_alive);
    }

    #[test]
    fn if_modified_since_matching_mtime_sets_304() {
        let mtime = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut resp = ResponseDescriptor::new(3);
        resp.mtime = Some(mtime);
        apply_headers(&[("If-Modified-Since".to_string(), format_http_date(mtime))], &mut resp);
        assert!(!resp.modified);
        assert_eq!(resp.status, 304);
    }

    #[test]
    fn if_modified_since_mismatch_leaves_200_path_untouched() {
        let mtime = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let mut resp = ResponseDescriptor::new(3);
        resp.mtime = Some(mtime);
        apply_headers(&[("If-Modified-Since".to_string(), format_http_date(earlier))], &mut resp);
        assert!(resp.modified);
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn host_header_is_ignored() {
        let mut resp = ResponseDescriptor::new(3);
        apply_headers(&[("Host".to_string(), "example.com".to_string())], &mut resp);
        assert!(!resp.keep_alive);
        assert!(resp.modified);
    }
}
