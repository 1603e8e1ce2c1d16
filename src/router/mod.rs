//! Message routing: envelopes addressed by symbolic endpoint id.
//!
//! - `envelope`: the immutable message value and its payload types
//! - `router`: the dispatcher task and the handle producers hold

pub mod envelope;
pub mod router;

pub use envelope::{Body, EndpointId, Envelope, EnvelopeKind, JobType, ProgressUpdate, Status};
pub use router::{Mailbox, MailboxReceiver, Router, RouterHandle, RouterStats, mailbox};
