/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Minimal HTML formatter for error responses, ported from the inline
//! `sprintf` chain in `original_source/src/http.c`'s `do_error`.

/// Renders the HTML body for an error response. `cause` is usually the
/// request path that triggered the error.
pub fn render(status: u16, reason: &str, cause: &str) -> String {
    format!(
        "<html><title>Swift Error</title><body bgcolor=\"ffffff\">\n\
         {status} {reason}\n\
         <p>{reason}: {cause}\n</p>\
         <hr><em>Swift web server</em>\n</body></html>",
        status = status,
        reason = reason,
        cause = cause,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_cause_into_body() {
        let body = render(404, "Not Found", "/missing.html");
        assert!(body.contains("404 Not Found"));
        assert!(body.contains("/missing.html"));
    }
}
