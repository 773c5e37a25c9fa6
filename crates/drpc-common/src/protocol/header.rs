//! Per-frame metadata.
//!
//! Every frame on a connection is a `Header` followed by exactly one body.
//! The header names the target method, carries the caller-assigned
//! sequence number used to correlate the response, and, on responses only,
//! an error string.

use serde::{Deserialize, Serialize};

/// Caller-assigned correlation key.
pub type Seq = u64;

/// Frame header.
///
/// # Example
///
/// ```
/// use drpc_common::protocol::Header;
///
/// let request = Header::request("Arith.Sum", 7);
/// let reply = request.reply_error("boom");
///
/// assert_eq!(reply.seq, 7);
/// assert!(reply.is_error());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Target in `"Service.Method"` form
    pub service_method: String,
    /// Correlation key, echoed unchanged by the server
    pub seq: Seq,
    /// Empty on success
    pub error: String,
}

impl Header {
    /// Creates a request header.
    pub fn request(service_method: impl Into<String>, seq: Seq) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Creates the header of a successful response to this request.
    pub fn reply(&self) -> Self {
        Header {
            service_method: self.service_method.clone(),
            seq: self.seq,
            error: String::new(),
        }
    }

    /// Creates the header of an error response to this request.
    pub fn reply_error(&self, error: impl Into<String>) -> Self {
        Header {
            service_method: self.service_method.clone(),
            seq: self.seq,
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Splits `service_method` at the last dot.
    pub fn split_service_method(&self) -> Option<(&str, &str)> {
        split_service_method(&self.service_method)
    }
}

/// Splits `"Service.Method"` at the last dot into `(service, method)`.
///
/// # Returns
///
/// `None` if there is no dot. Either part may be empty.
pub fn split_service_method(service_method: &str) -> Option<(&str, &str)> {
    let dot = service_method.rfind('.')?;
    Some((&service_method[..dot], &service_method[dot + 1..]))
}
