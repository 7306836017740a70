//! qlog draft-02 structured event logging, as a `Sink` seam the connection writes to and an
//! in-memory `LogFile` serializable via serde.

use serde::Serialize;

/// Something that accepts qlog events as they happen. The no-op implementation lets a
/// connection run without paying any serialization cost when nobody's collecting a trace.
pub trait Sink: Send {
    fn log(&mut self, event: Event);
}

pub struct NullSink;

impl Sink for NullSink {
    fn log(&mut self, _event: Event) {}
}

/// Buffers events into a single `LogFile`, handed to `serde_json` at the end of a connection's
/// life (or periodically, if the caller chooses to drain it).
#[derive(Default)]
pub struct BufferingSink {
    events: Vec<Event>,
}

impl Sink for BufferingSink {
    fn log(&mut self, event: Event) {
        self.events.push(event);
    }
}

impl BufferingSink {
    pub fn into_log_file(self, title: &str) -> LogFile {
        LogFile {
            qlog_version: "draft-02".into(),
            qlog_format: "JSON".into(),
            title: title.into(),
            traces: vec![Trace {
                events: self.events,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogFile {
    qlog_version: String,
    qlog_format: String,
    title: String,
    traces: Vec<Trace>,
}

#[derive(Debug, Serialize)]
pub struct Trace {
    events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub time: f64,
    pub name: &'static str,
    pub data: EventData,
}

/// The `header` object carried by `packet_sent`/`packet_lost` events; `packet_type` is the only
/// field this crate has a use for.
#[derive(Debug, Clone, Serialize)]
pub struct PacketHeader {
    pub packet_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventData {
    PacketSent {
        header: PacketHeader,
        packet_number: u64,
        size: u64,
    },
    PacketLost {
        header: PacketHeader,
        packet_number: u64,
    },
    ConnectionStarted {
        src_cid: String,
        dst_cid: String,
    },
    ConnectionClosed {
        error_code: u64,
        reason: String,
    },
}

impl Event {
    pub fn packet_sent(time: f64, packet_type: &'static str, packet_number: u64, size: u64) -> Self {
        Self {
            time,
            name: "transport:packet_sent",
            data: EventData::PacketSent {
                header: PacketHeader { packet_type },
                packet_number,
                size,
            },
        }
    }

    pub fn packet_lost(time: f64, packet_type: &'static str, packet_number: u64) -> Self {
        Self {
            time,
            name: "recovery:packet_lost",
            data: EventData::PacketLost {
                header: PacketHeader { packet_type },
                packet_number,
            },
        }
    }

    pub fn connection_started(time: f64, src_cid: String, dst_cid: String) -> Self {
        Self {
            time,
            name: "connectivity:connection_started",
            data: EventData::ConnectionStarted { src_cid, dst_cid },
        }
    }

    pub fn connection_closed(time: f64, error_code: u64, reason: String) -> Self {
        Self {
            time,
            name: "connectivity:connection_closed",
            data: EventData::ConnectionClosed { error_code, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffering_sink_collects_events_in_order() {
        let mut sink = BufferingSink::default();
        sink.log(Event::packet_sent(0.0, "initial", 0, 1200));
        sink.log(Event::packet_lost(5.0, "initial", 0));
        let file = sink.into_log_file("test trace");
        assert_eq!(file.traces[0].events.len(), 2);
        assert_eq!(file.traces[0].events[0].name, "transport:packet_sent");
    }

    #[test]
    fn log_file_serializes_to_json() {
        let mut sink = BufferingSink::default();
        sink.log(Event::connection_started(0.0, "ab".into(), "cd".into()));
        let file = sink.into_log_file("t");
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("connectivity:connection_started"));
        assert!(json.contains("\"qlog_version\":\"draft-02\""));
    }

    #[test]
    fn packet_sent_nests_packet_type_under_header() {
        let mut sink = BufferingSink::default();
        sink.log(Event::packet_sent(0.0, "initial", 3, 1200));
        let file = sink.into_log_file("t");
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"header\":{\"packet_type\":\"initial\"}"));
        assert!(json.contains("\"packet_number\":3"));
    }
}
