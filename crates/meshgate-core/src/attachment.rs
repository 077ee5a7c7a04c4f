//! Attachment keys understood by the bridging layer.

/// Target domain for the outbound HTTP request.
pub const HTTP_HOST: &str = "HTTP_HOST";

/// Path applied to the outbound HTTP request, overriding the method name.
pub const HTTP_PATH: &str = "HTTP_PATH";

/// Query portion used when translating an RPC request to HTTP.
pub const HTTP_QUERY_STRING: &str = "HTTP_QUERY_STRING";

/// `"true"` marks transparent mode: the arguments carry raw HTTP header
/// and body bytes instead of translated values.
pub const HTTP_PROXY: &str = "HTTP_PROXY";

/// HTTP method used when translating from RPC.
pub const HTTP_METHOD: &str = "HTTP_Method";

/// HTTP status written back onto the translated response.
pub const HTTP_STATUS: &str = "HTTP_Status";

/// Caller remote address, for `X-Forwarded-For` chaining.
pub const REMOTE_IP: &str = "M_s";

/// Caller host.
pub const HOST: &str = "M_h";

/// Matched case-insensitively against incoming attachments.
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
