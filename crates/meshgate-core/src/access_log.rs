//! Access-log line formatting.
//!
//! A layout template with `${name}` placeholders is compiled once into an
//! ordered extractor list; formatting a (request, response) pair walks the
//! list into a reused buffer. Formatting never mutates its inputs.

use std::cell::RefCell;
use std::fmt::Write;

use crate::request::{RpcRequest, RpcResponse};

/// The canonical field order shared by every agent role.
pub const COMMON_LAYOUT: &str = "${request_id}|${service}|${method}|${desc}|${remote_addr}|${request_size}|${response_size}|${business_time}|${request_time}|${res_header.HTTP_Status}|${status}|${exception}";

const REQUEST_HEADER_PREFIX: &str = "req_header.";
const RESPONSE_HEADER_PREFIX: &str = "res_header.";

thread_local! {
    static FORMAT_BUF: RefCell<String> = RefCell::new(String::with_capacity(256));
}

/// One compiled piece of the layout: a literal or a named value finder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Extractor {
    Literal(String),
    RequestId,
    RequestTime,
    Service,
    Method,
    Desc,
    RemoteAddr,
    RequestSize,
    ResponseSize,
    BusinessTime,
    Status,
    Exception,
    ReqHeader(String),
    ResHeader(String),
}

impl Extractor {
    fn for_variable(name: &str) -> Self {
        match name {
            "request_id" => Self::RequestId,
            "request_time" => Self::RequestTime,
            "service" => Self::Service,
            "method" => Self::Method,
            "desc" => Self::Desc,
            "remote_addr" => Self::RemoteAddr,
            "request_size" => Self::RequestSize,
            "response_size" => Self::ResponseSize,
            "business_time" => Self::BusinessTime,
            "status" => Self::Status,
            "exception" => Self::Exception,
            _ => {
                if let Some(header) = name.strip_prefix(REQUEST_HEADER_PREFIX) {
                    Self::ReqHeader(header.to_owned())
                } else if let Some(header) = name.strip_prefix(RESPONSE_HEADER_PREFIX) {
                    Self::ResHeader(header.to_owned())
                } else {
                    // Unknown names stay in the output verbatim.
                    Self::Literal(format!("${{{name}}}"))
                }
            }
        }
    }

    fn write_into(&self, out: &mut String, req: &RpcRequest, res: &RpcResponse) {
        match self {
            Self::Literal(s) => out.push_str(s),
            Self::RequestId => {
                let _ = write!(out, "{}", res.request_id);
            }
            Self::RequestTime => {
                let _ = write!(out, "{}", req.context.request_time_ms);
            }
            Self::Service => out.push_str(&req.service),
            Self::Method => out.push_str(&req.method),
            Self::Desc => out.push_str(&req.method_desc),
            Self::RemoteAddr => out.push_str(&req.context.remote_address),
            Self::RequestSize => {
                let _ = write!(out, "{}", req.context.body_size);
            }
            Self::ResponseSize => {
                let _ = write!(out, "{}", res.context.body_size);
            }
            Self::BusinessTime => {
                let _ = write!(out, "{}", res.process_time_ms);
            }
            Self::Status => {
                let _ = write!(out, "{}", res.exception.is_none());
            }
            Self::Exception => {
                if let Some(ex) = &res.exception {
                    out.push_str(&serde_json::to_string(ex).unwrap_or_default());
                }
            }
            Self::ReqHeader(name) => out.push_str(req.attachment(name)),
            Self::ResHeader(name) => out.push_str(res.attachment(name)),
        }
    }
}

/// Pre-compiled access-log template.
#[derive(Debug, Clone)]
pub struct LayoutFormatter {
    layout: String,
    extractors: Vec<Extractor>,
}

impl LayoutFormatter {
    #[must_use]
    pub fn new(layout: &str) -> Self {
        Self {
            layout: layout.to_owned(),
            extractors: compile(layout),
        }
    }

    /// The canonical layout prefixed with an agent role tag.
    #[must_use]
    pub fn with_role(role: &str) -> Self {
        Self::new(&format!("access|{role}|{COMMON_LAYOUT}"))
    }

    #[must_use]
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Formats one request/response pair into an access-log line.
    #[must_use]
    pub fn format(&self, req: &RpcRequest, res: &RpcResponse) -> String {
        FORMAT_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            for extractor in &self.extractors {
                extractor.write_into(&mut buf, req, res);
            }
            buf.clone()
        })
    }
}

fn compile(layout: &str) -> Vec<Extractor> {
    let chars: Vec<char> = layout.chars().collect();
    let mut extractors = Vec::new();
    let mut val = String::new();
    let mut parsing_variable = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '$' => {
                if parsing_variable {
                    val.push(c);
                } else if i + 1 < chars.len() && chars[i + 1] == '{' {
                    parsing_variable = true;
                    i += 1;
                    // A variable begins, flush the pending literal.
                    if !val.is_empty() {
                        extractors.push(Extractor::Literal(std::mem::take(&mut val)));
                    }
                } else {
                    val.push(c);
                }
            }
            '}' => {
                if !parsing_variable {
                    val.push(c);
                } else {
                    // Empty variable names are dropped.
                    if !val.is_empty() {
                        extractors.push(Extractor::for_variable(&val));
                        val.clear();
                    }
                    parsing_variable = false;
                }
            }
            _ => val.push(c),
        }
        i += 1;
    }

    if parsing_variable {
        // Unclosed variable at end of layout: emit it as literal text,
        // restoring the consumed `${` prefix.
        extractors.push(Extractor::Literal(format!("${{{val}")));
    } else if !val.is_empty() {
        extractors.push(Extractor::Literal(val));
    }
    extractors
}
