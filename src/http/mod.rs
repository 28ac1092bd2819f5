//! HTTP/1.x Protocol
//!
//! Incremental request parsing, response serialization and the connection
//! handler that ties them to the multiplexer.
//!
//! ## Request/Response Cycle
//!
//! ```text
//!   bytes ──> RequestParser ──> Request ──> RequestHandler ──> Response
//!                  ▲                                              │
//!                  │ leftover (pipelined)                         ▼
//!                  └──────── after flush, if keep-alive ───── Outbox
//! ```
//!
//! ## Keep-Alive
//!
//! | Version | `Connection` | Outcome |
//! |---------|--------------|---------|
//! | 1.1     | (none)       | open    |
//! | 1.1     | close        | close   |
//! | ≤ 1.0   | (none)       | close   |
//! | ≤ 1.0   | keep-alive   | open    |

pub mod handler;
pub mod parser;
pub mod request;
pub mod response;
pub mod types;

pub use handler::{HttpHandler, RequestHandler, TextResponder};
pub use parser::{parse_request, ParseError, RequestParser};
pub use request::Request;
pub use response::{Response, StatusCode};
pub use types::{Headers, Method, Version};
