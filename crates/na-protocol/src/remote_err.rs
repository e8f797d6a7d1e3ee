//! Server error strings carrying a branded code.
//!
//! The service appends a machine-readable code and a docs link to the
//! human message, e.g.:
//!
//! ```text
//! failed to bind endpoint: invalid URL
//!
//! ERR_NGROK_9037
//! https://ngrok.com/docs/errors/err_ngrok_9037
//! ```
//!
//! [`RemoteError::parse`] splits that into a scrubbed message and the code;
//! strings without a recognizable code pass through unchanged.

use std::fmt;

/// An error string returned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    msg: String,
    code: Option<String>,
}

impl RemoteError {
    pub fn parse(raw: &str) -> Self {
        let mut code = None;
        let mut msg_lines = Vec::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if code.is_none() && is_error_code(trimmed) {
                code = Some(trimmed.to_owned());
                continue;
            }
            // The docs link always refers to the code; scrub it with it.
            if trimmed.starts_with("https://ngrok.com/docs/errors/") {
                continue;
            }
            msg_lines.push(line);
        }
        // Drop blank lines left dangling at the end of the message.
        while msg_lines.last().is_some_and(|l| l.trim().is_empty()) {
            msg_lines.pop();
        }
        RemoteError {
            msg: msg_lines.join("\n"),
            code,
        }
    }

    /// The human message with the code and docs link scrubbed.
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// The branded `ERR_NGROK_<n>` code, if the server supplied one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]", self.msg, code),
            None => write!(f, "{}", self.msg),
        }
    }
}

impl std::error::Error for RemoteError {}

fn is_error_code(s: &str) -> bool {
    s.strip_prefix("ERR_NGROK_")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
