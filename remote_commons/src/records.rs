use crate::{RemoteError, RemoteResult};
use log::warn;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordPoint {
    MarshalStart,   // Stub starts validating and marshaling arguments
    TransportStart, // Message handed to the transport
    ReplyReceived,  // Reply message observed by the stub
    UnmarshalEnd,   // Results copied back into caller structures
}

const RECORD_POINTS: usize = 4;

const ALL_POINTS: [RecordPoint; RECORD_POINTS] = [
    RecordPoint::MarshalStart,
    RecordPoint::TransportStart,
    RecordPoint::ReplyReceived,
    RecordPoint::UnmarshalEnd,
];

/// Timestamps of the phases of a single invocation
#[derive(Debug, Clone)]
pub struct Recorder {
    start_time: Instant,
    timestamps: [Option<Instant>; RECORD_POINTS],
    last: Option<RecordPoint>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder {
            start_time: Instant::now(),
            timestamps: [None; RECORD_POINTS],
            last: None,
        }
    }

    /// Points have to be recorded in protocol order; a point can not be recorded twice.
    pub fn record(&mut self, current_point: RecordPoint) -> RemoteResult<()> {
        if let Some(last) = self.last {
            if last >= current_point {
                warn!("{:?} recorded after {:?}, keeping the earlier record", current_point, last);
                return Err(RemoteError::RecordSequencingFailure(last, current_point));
            }
        }
        self.timestamps[current_point as usize] = Some(Instant::now());
        self.last = Some(current_point);
        Ok(())
    }

    pub fn get(&self, point: RecordPoint) -> Option<Duration> {
        self.timestamps[point as usize].map(|stamp| stamp.duration_since(self.start_time))
    }

    /// Time between two recorded points, if both were recorded
    pub fn span(&self, from: RecordPoint, to: RecordPoint) -> Option<Duration> {
        let start = self.timestamps[from as usize]?;
        let end = self.timestamps[to as usize]?;
        end.checked_duration_since(start)
    }

    pub fn get_summary(&self) -> String {
        let mut summary = String::new();
        for point in ALL_POINTS {
            if let Some(duration) = self.get(point) {
                summary.push_str(&format!("{:?}: {}\n", point, duration.as_nanos()));
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut recorder = Recorder::new();
        recorder.record(RecordPoint::MarshalStart).unwrap();
        recorder.record(RecordPoint::TransportStart).unwrap();
        recorder.record(RecordPoint::UnmarshalEnd).unwrap();
        assert!(recorder.get(RecordPoint::ReplyReceived).is_none());
        assert!(recorder
            .span(RecordPoint::MarshalStart, RecordPoint::UnmarshalEnd)
            .is_some());
        let summary = recorder.get_summary();
        assert!(summary.contains("MarshalStart"));
        assert!(!summary.contains("ReplyReceived"));
    }

    #[test_log::test]
    fn rejects_out_of_order() {
        let mut recorder = Recorder::new();
        recorder.record(RecordPoint::ReplyReceived).unwrap();
        let received = recorder.get(RecordPoint::ReplyReceived);
        assert_eq!(
            recorder.record(RecordPoint::TransportStart),
            Err(RemoteError::RecordSequencingFailure(
                RecordPoint::ReplyReceived,
                RecordPoint::TransportStart
            ))
        );
        // a rejected point leaves the recorder as it was
        assert!(recorder.get(RecordPoint::TransportStart).is_none());
        assert_eq!(received, recorder.get(RecordPoint::ReplyReceived));
        assert!(recorder.record(RecordPoint::UnmarshalEnd).is_ok());
    }
}
