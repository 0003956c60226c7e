/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Extension to media-type lookup, ported from `original_source/src/http.c`'s
//! `mime[]` table.

/// Returns the media type for a file's extension (matched case-
/// insensitively, without the leading dot), defaulting to `text/plain`
/// when the extension is absent or unrecognized.
pub fn lookup(extension: Option<&str>) -> &'static str {
    let Some(extension) = extension else {
        return "text/plain";
    };
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "word" | "doc" => "application/msword",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "application/javascript",
        _ => "text/plain",
    }
}
