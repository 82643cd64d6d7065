//! HTTP status codes and their reason phrases
use std::fmt::Display;

/// Response status code with its canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    /// 100
    Continue = 100,
    /// 101
    SwitchingProtocols = 101,
    /// 200
    Ok = 200,
    /// 201
    Created = 201,
    /// 202
    Accepted = 202,
    /// 204
    NoContent = 204,
    /// 301
    MovedPermanently = 301,
    /// 302
    Found = 302,
    /// 304
    NotModified = 304,
    /// 400
    BadRequest = 400,
    /// 401
    Unauthorized = 401,
    /// 403
    Forbidden = 403,
    /// 404
    NotFound = 404,
    /// 405
    MethodNotAllowed = 405,
    /// 408
    RequestTimeout = 408,
    /// 411
    LengthRequired = 411,
    /// 413
    PayloadTooLarge = 413,
    /// 500
    InternalServerError = 500,
    /// 501
    NotImplemented = 501,
    /// 502
    BadGateway = 502,
    /// 503
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// The numeric status code.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// The canonical reason phrase for this code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::SwitchingProtocols => "Switching Protocols",
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::RequestTimeout => "Request Timeout",
            Self::LengthRequired => "Length Required",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod test {
    use super::StatusCode;

    #[test]
    fn status_code_exposes_numeric_value() {
        assert_eq!(200, StatusCode::Ok.code());
        assert_eq!(404, StatusCode::NotFound.code());
        assert_eq!(503, StatusCode::ServiceUnavailable.code());
    }

    #[test]
    fn status_code_reason_comes_from_static_table() {
        assert_eq!("OK", StatusCode::Ok.reason());
        assert_eq!("Bad Request", StatusCode::BadRequest.reason());
        assert_eq!("200 OK", StatusCode::Ok.to_string());
    }
}
