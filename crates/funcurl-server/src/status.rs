//! HTTP status reason phrases and the generic error bodies built from them.

/// Reason phrase for a status code, or `"Unknown"`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "Ok",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Authorization Required",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "Unknown",
    }
}

/// Body of a missing static object: `[error]404 Not Found`.
pub fn not_found_body() -> String {
    format!("[error]404 {}", reason_phrase(404))
}

/// Body of a failed request: `error 500: Internal Server Error`.
pub fn error_body(code: u16) -> String {
    format!("error {code}: {}", reason_phrase(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(200), "Ok");
        assert_eq!(reason_phrase(302), "Moved Temporarily");
        assert_eq!(reason_phrase(599), "Unknown");
    }

    #[test]
    fn test_error_bodies() {
        assert_eq!(not_found_body(), "[error]404 Not Found");
        assert_eq!(error_body(500), "error 500: Internal Server Error");
    }
}
