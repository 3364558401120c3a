//! Body transcoding between the invocation protocol and HTTP.
//!
//! Request bodies arrive as strings: binary payloads are base64 encoded,
//! text payloads are passed verbatim. Reply bodies follow the same rule,
//! driven by the response content type.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine as _;

use crate::error::ProxyResult;

/// Content types treated as text even though they are not `text/*`.
pub const TEXT_CONTENT_TYPES: &[&str] = &[
    "application/atom+xml",
    "application/base64",
    "application/javascript",
    "application/json",
    "application/rss+xml",
    "application/soap+xml",
    "application/xhtml+xml",
    "application/xml",
];

/// Lenient decoder: accepts non-zero trailing bits, which the validity
/// check below does not reject either.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Whether `raw` is standard, padded base64.
///
/// Groups of four alphabet characters, where the final group may end in `=`
/// or `==`. The empty string qualifies. ASCII letters match regardless of
/// case since both cases are in the alphabet.
pub fn is_base64(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() % 4 != 0 {
        return false;
    }

    if bytes.is_empty() {
        return true;
    }

    let is_alpha = |b: &u8| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/';
    let (body, last) = bytes.split_at(bytes.len() - 4);

    if !body.iter().all(is_alpha) {
        return false;
    }

    match last {
        [a, b, b'=', b'='] => is_alpha(a) && is_alpha(b),
        [a, b, c, b'='] => is_alpha(a) && is_alpha(b) && is_alpha(c),
        _ => last.iter().all(is_alpha),
    }
}

/// Decode a request body string into bytes.
///
/// Every valid base64 string is decoded, even when it is also readable text.
pub fn decode_request_body(raw: &str) -> Vec<u8> {
    if is_base64(raw) {
        if let Ok(bytes) = LENIENT.decode(raw) {
            return bytes;
        }
    }
    raw.as_bytes().to_vec()
}

/// Whether a request with this method may carry a body.
pub fn can_have_body(method: &str) -> bool {
    !(method.eq_ignore_ascii_case("get") || method.eq_ignore_ascii_case("head"))
}

/// Strip parameters (`; charset=...`) from a content type.
pub fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

/// Whether a MIME type denotes binary content.
///
/// Empty or unknown types are binary.
pub fn is_binary_content_type(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    if mime.starts_with("text/") {
        return false;
    }
    !TEXT_CONTENT_TYPES.contains(&mime.as_str())
}

/// Encode a response body for the reply.
pub fn encode_response_body(content_type: Option<&str>, body: &[u8]) -> String {
    let mime = content_type.map(essence).unwrap_or_default();
    if is_binary_content_type(mime) {
        STANDARD.encode(body)
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Read a whole upstream response and encode its body.
pub async fn encode_response(response: reqwest::Response) -> ProxyResult<String> {
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let body = response.bytes().await?;
    Ok(encode_response_body(content_type.as_deref(), &body))
}
