//! Event payload record for stream adapters
//!
//! The broadcaster itself is payload-agnostic; adapters that bridge it to a
//! transport exchange this record so they agree on a shape. The key and
//! value are `bytes::Bytes`, so cloning an event during fan-out
//! reference-counts the payload instead of copying it. Per-event metadata
//! (timestamps, subjects, sequence numbers) rides along unexamined by the
//! core.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// A single event flowing through a broadcaster
///
/// Cheap to clone: both payload halves are reference-counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Optional partitioning / routing key
    pub key: Bytes,
    /// The payload itself
    pub value: Bytes,
    /// Per-event metadata, opaque to the broadcaster
    pub metadata: EventMetadata,
}

impl Event {
    /// Create an event with empty metadata
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: EventMetadata::default(),
        }
    }

    /// Create a value-only event (empty key)
    pub fn from_value(value: impl Into<Bytes>) -> Self {
        Self::new(Bytes::new(), value)
    }
}

/// Metadata attached to an event by producers and adapters.
///
/// Timestamps are set from [`SystemTime`] and read back as epoch
/// nanoseconds, the convention transports on both ends of an adapter
/// already speak. Absent values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    event_type: Option<String>,
    event_type_version: Option<String>,
    subject: Option<String>,
    stream: Option<String>,
    event_time_ns: Option<i64>,
    stream_timestamp_ns: Option<i64>,
    origin_stream_timestamp_ns: Option<i64>,
    deadline_ns: Option<i64>,
    pending: Option<u64>,
    consumer_seq: Option<u64>,
    stream_seq: Option<u64>,
}

impl EventMetadata {
    /// Type name of the event, if the producer set one
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    pub fn set_event_type(&mut self, event_type: impl Into<String>) {
        self.event_type = Some(event_type.into());
    }

    /// Version of the event type, if the producer set one
    pub fn event_type_version(&self) -> Option<&str> {
        self.event_type_version.as_deref()
    }

    pub fn set_event_type_version(&mut self, version: impl Into<String>) {
        self.event_type_version = Some(version.into());
    }

    /// Subject the event was published under
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.subject = Some(subject.into());
    }

    /// Name of the stream that carried the event
    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn set_stream(&mut self, stream: impl Into<String>) {
        self.stream = Some(stream.into());
    }

    /// When the observation behind the event happened, as opposed to when
    /// it was streamed. Epoch nanoseconds.
    pub fn event_timestamp_ns(&self) -> Option<i64> {
        self.event_time_ns
    }

    /// Record when the observation behind the event happened
    pub fn set_event_time(&mut self, t: SystemTime) {
        self.event_time_ns = Some(epoch_ns(t));
    }

    /// When the event was sent by the producer. Epoch nanoseconds.
    pub fn stream_timestamp_ns(&self) -> Option<i64> {
        self.stream_timestamp_ns
    }

    /// Record when the event was sent by the producer
    pub fn set_stream_time(&mut self, t: SystemTime) {
        self.stream_timestamp_ns = Some(epoch_ns(t));
    }

    /// When the event was sent by the first producer in a relay chain.
    /// Epoch nanoseconds.
    pub fn origin_stream_timestamp_ns(&self) -> Option<i64> {
        self.origin_stream_timestamp_ns
    }

    /// Record when the event was sent by the first producer in a relay chain
    pub fn set_origin_stream_time(&mut self, t: SystemTime) {
        self.origin_stream_timestamp_ns = Some(epoch_ns(t));
    }

    /// Deadline after which the event is no longer worth processing.
    /// Epoch nanoseconds.
    pub fn deadline_ns(&self) -> Option<i64> {
        self.deadline_ns
    }

    pub fn set_deadline(&mut self, t: SystemTime) {
        self.deadline_ns = Some(epoch_ns(t));
    }

    /// Number of events still pending on the upstream source
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    pub fn set_pending(&mut self, pending: u64) {
        self.pending = Some(pending);
    }

    /// Position of the event for this consumer
    pub fn consumer_seq(&self) -> Option<u64> {
        self.consumer_seq
    }

    pub fn set_consumer_seq(&mut self, seq: u64) {
        self.consumer_seq = Some(seq);
    }

    /// Position of the event in its stream
    pub fn stream_seq(&self) -> Option<u64> {
        self.stream_seq
    }

    pub fn set_stream_seq(&mut self, seq: u64) {
        self.stream_seq = Some(seq);
    }
}

fn epoch_ns(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_nanos() as i64,
        // Pre-epoch timestamps only occur with a badly set clock; clamp.
        Err(_) => 0,
    }
}
