//! Envelope: the immutable message value exchanged through the router.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// Endpoint id the router answers to for control messages.
pub const ROUTER_ENDPOINT: &str = "MessageRouter";

/// Data keys carried by progress envelopes.
pub const FIELD_PART: &str = "part";
pub const FIELD_TOTAL: &str = "total";
pub const FIELD_JOB_NAME: &str = "jobName";
/// Data key naming the endpoint in channel add/remove requests.
pub const FIELD_ENDPOINT: &str = "endpoint";

/// Symbolic message address. Resolved only inside the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The router's own control endpoint.
    pub fn router() -> Self {
        Self::new(ROUTER_ENDPOINT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Asks the recipient to do something.
    Request,
    /// Reports back. Always carries a status.
    Answer,
    /// The sending job run has ended.
    JobExit,
}

/// Outcome status attached to answers and job exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error(String),
}

impl Status {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Error(m) => write!(f, "error: {m}"),
        }
    }
}

/// Kind of work an envelope is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Router control: register a delivery channel.
    AddChannel,
    /// Router control: drop a delivery channel.
    RemoveChannel,
    /// Generic progress report not tied to a specific pipeline.
    Progress,
    ExtractLandmarks,
    CropFaces,
    GenerateMriDataset,
    TrainAutoencoder,
    TrainGan,
    ScrapeImages,
    /// Anything else, named by the producer.
    Custom(String),
}

impl JobType {
    /// Whether this job type is a router control request.
    pub fn is_router_control(&self) -> bool {
        matches!(self, Self::AddChannel | Self::RemoveChannel)
    }
}

/// Tagged payload of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    pub job_type: JobType,
    /// Named fields in insertion order.
    pub data: Map<String, Value>,
    /// True exactly on the terminal progress update of a job run.
    pub finished: bool,
}

impl Body {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            data: Map::new(),
            finished: false,
        }
    }

    /// Append a named field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Replace the data map.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = finished;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Progress payload for `part` of `total`; `finished` on the last part.
    pub fn progress(job_type: JobType, job_name: &str, part: usize, total: usize) -> Self {
        Self::new(job_type)
            .with_field(FIELD_PART, part)
            .with_field(FIELD_TOTAL, total)
            .with_field(FIELD_JOB_NAME, job_name)
            .finished(total > 0 && part + 1 == total)
    }
}

/// An immutable message routed by recipient id.
///
/// Built through the constructors below so that every `Answer` carries a
/// status; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    kind: EnvelopeKind,
    sender: EndpointId,
    recipient: EndpointId,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
    body: Body,
}

/// Wire form of an [`Envelope`], checked before it becomes one.
#[derive(Deserialize)]
struct RawEnvelope {
    kind: EnvelopeKind,
    sender: EndpointId,
    recipient: EndpointId,
    #[serde(default)]
    status: Option<Status>,
    body: Body,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let needs_status = matches!(raw.kind, EnvelopeKind::Answer | EnvelopeKind::JobExit);
        if needs_status && raw.status.is_none() {
            return Err(EnvelopeError::MissingStatus {
                kind: format!("{:?}", raw.kind),
            });
        }
        Ok(Self {
            kind: raw.kind,
            sender: raw.sender,
            recipient: raw.recipient,
            status: raw.status,
            body: raw.body,
        })
    }
}

impl Envelope {
    /// A request envelope (no status).
    pub fn request(
        sender: impl Into<EndpointId>,
        recipient: impl Into<EndpointId>,
        body: Body,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            sender: sender.into(),
            recipient: recipient.into(),
            status: None,
            body,
        }
    }

    /// An answer envelope.
    pub fn answer(
        sender: impl Into<EndpointId>,
        recipient: impl Into<EndpointId>,
        status: Status,
        body: Body,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Answer,
            sender: sender.into(),
            recipient: recipient.into(),
            status: Some(status),
            body,
        }
    }

    /// A job-exit envelope, sent once when a job run ends.
    pub fn job_exit(
        sender: impl Into<EndpointId>,
        recipient: impl Into<EndpointId>,
        status: Status,
        body: Body,
    ) -> Self {
        Self {
            kind: EnvelopeKind::JobExit,
            sender: sender.into(),
            recipient: recipient.into(),
            status: Some(status),
            body,
        }
    }

    /// A progress answer for `part` of `total`.
    ///
    /// `finished` is set when `part` is the last index.
    pub fn progress(
        sender: impl Into<EndpointId>,
        recipient: impl Into<EndpointId>,
        job_type: JobType,
        job_name: &str,
        part: usize,
        total: usize,
        status: Status,
    ) -> Self {
        Self::answer(
            sender,
            recipient,
            status,
            Body::progress(job_type, job_name, part, total),
        )
    }

    /// A request asking the router to register `endpoint`.
    pub fn add_channel(
        sender: impl Into<EndpointId>,
        router: impl Into<EndpointId>,
        endpoint: &EndpointId,
    ) -> Self {
        Self::request(
            sender,
            router,
            Body::new(JobType::AddChannel).with_field(FIELD_ENDPOINT, endpoint.as_str()),
        )
    }

    /// A request asking the router to drop `endpoint`.
    pub fn remove_channel(
        sender: impl Into<EndpointId>,
        router: impl Into<EndpointId>,
        endpoint: &EndpointId,
    ) -> Self {
        Self::request(
            sender,
            router,
            Body::new(JobType::RemoveChannel).with_field(FIELD_ENDPOINT, endpoint.as_str()),
        )
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn sender(&self) -> &EndpointId {
        &self.sender
    }

    pub fn recipient(&self) -> &EndpointId {
        &self.recipient
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn job_type(&self) -> &JobType {
        &self.body.job_type
    }

    pub fn is_finished(&self) -> bool {
        self.body.finished
    }

    /// Endpoint named in an add/remove channel request.
    pub fn endpoint_field(&self) -> Option<EndpointId> {
        self.body
            .get(FIELD_ENDPOINT)
            .and_then(Value::as_str)
            .map(EndpointId::new)
    }
}

/// The progress fields a UI consumer reads from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_name: String,
    pub part: usize,
    pub total: usize,
    pub finished: bool,
}

impl ProgressUpdate {
    /// Extract progress from an answer envelope, if it is one.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.kind() != EnvelopeKind::Answer {
            return None;
        }
        let body = envelope.body();
        let as_usize = |key: &str| {
            body.get(key)
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
        };
        Some(Self {
            job_name: body
                .get(FIELD_JOB_NAME)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            part: as_usize(FIELD_PART)?,
            total: as_usize(FIELD_TOTAL)?,
            finished: body.finished,
        })
    }
}
