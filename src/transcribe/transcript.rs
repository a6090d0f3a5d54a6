//! # Transcript Payload Model
//!
//! Serde model for the JSON body carried by inbound `TranscriptEvent`
//! frames, plus the extraction step that flattens it into the ordered
//! segments the client channel forwards.
//!
//! The upstream wraps everything in optionals and PascalCase names:
//! `Transcript.Results[].Alternatives[].Transcript` / `IsPartial` /
//! `StartTime` / `EndTime`. Extraction is deliberately infallible — a
//! malformed or empty body yields no segments rather than an error, so
//! protocol noise never disturbs a live session.

use serde::Deserialize;

/// An alternative transcription for one result segment.
#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    /// The transcribed text.
    #[serde(rename = "Transcript")]
    pub transcript: Option<String>,
}

/// A transcription result segment.
///
/// Partial results may still be revised as more audio arrives; final
/// results are stable.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptResult {
    /// Start time of this segment in seconds from the start of the stream.
    #[serde(rename = "StartTime")]
    pub start_time: Option<f64>,

    /// End time of this segment in seconds.
    #[serde(rename = "EndTime")]
    pub end_time: Option<f64>,

    /// Whether this result may change in subsequent responses.
    #[serde(rename = "IsPartial")]
    pub is_partial: Option<bool>,

    /// Alternative transcriptions, ordered by confidence.
    #[serde(rename = "Alternatives")]
    pub alternatives: Option<Vec<Alternative>>,
}

impl TranscriptResult {
    /// Text of the first (highest-confidence) alternative.
    pub fn best_transcript(&self) -> Option<&str> {
        self.alternatives
            .as_ref()
            .and_then(|alts| alts.first())
            .and_then(|alt| alt.transcript.as_deref())
    }
}

/// The transcript object containing all result segments.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    #[serde(rename = "Results")]
    pub results: Option<Vec<TranscriptResult>>,
}

/// Top-level body of a `TranscriptEvent` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptEvent {
    #[serde(rename = "Transcript")]
    pub transcript: Option<Transcript>,
}

/// One transcript segment as forwarded to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    /// Transcribed text, never empty
    pub text: String,
    /// Whether the segment may still be revised
    pub is_partial: bool,
    /// Segment start in seconds, when the upstream supplied it
    pub start_time: Option<f64>,
    /// Segment end in seconds, when the upstream supplied it
    pub end_time: Option<f64>,
}

/// Flatten a decoded `TranscriptEvent` payload into ordered segments.
///
/// Walks the results in order, takes only the first alternative of each,
/// and drops results whose text is empty. Never fails: any missing or
/// malformed structure simply contributes nothing.
pub fn extract(payload: &[u8]) -> Vec<TranscriptSegment> {
    let event: TranscriptEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(_) => return Vec::new(),
    };

    let results = match event.transcript.and_then(|t| t.results) {
        Some(results) => results,
        None => return Vec::new(),
    };

    results
        .iter()
        .filter_map(|result| {
            let text = result.best_transcript().unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            Some(TranscriptSegment {
                text: text.to_string(),
                is_partial: result.is_partial.unwrap_or(false),
                start_time: result.start_time,
                end_time: result.end_time,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keeps_result_order() {
        let payload = br#"{
            "Transcript": {
                "Results": [
                    {
                        "StartTime": 0.0,
                        "EndTime": 1.2,
                        "IsPartial": true,
                        "Alternatives": [{"Transcript": "hello"}]
                    },
                    {
                        "StartTime": 1.2,
                        "EndTime": 2.4,
                        "IsPartial": false,
                        "Alternatives": [
                            {"Transcript": "hello world"},
                            {"Transcript": "yellow world"}
                        ]
                    }
                ]
            }
        }"#;

        let segments = extract(payload);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "hello");
        assert!(segments[0].is_partial);
        assert_eq!(segments[0].start_time, Some(0.0));
        assert_eq!(segments[0].end_time, Some(1.2));
        // Only the first alternative of each result is used
        assert_eq!(segments[1].text, "hello world");
        assert!(!segments[1].is_partial);
    }

    #[test]
    fn test_extract_skips_empty_text() {
        let payload = br#"{
            "Transcript": {
                "Results": [
                    {"Alternatives": [{"Transcript": ""}]},
                    {"Alternatives": [{"Transcript": "kept"}]},
                    {"Alternatives": []},
                    {}
                ]
            }
        }"#;

        let segments = extract(payload);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "kept");
    }

    #[test]
    fn test_is_partial_defaults_to_false_and_times_to_absent() {
        let payload = br#"{
            "Transcript": {
                "Results": [{"Alternatives": [{"Transcript": "no metadata"}]}]
            }
        }"#;

        let segments = extract(payload);

        assert_eq!(segments.len(), 1);
        assert!(!segments[0].is_partial);
        assert_eq!(segments[0].start_time, None);
        assert_eq!(segments[0].end_time, None);
    }

    #[test]
    fn test_extract_never_fails() {
        assert!(extract(b"not json").is_empty());
        assert!(extract(b"{}").is_empty());
        assert!(extract(br#"{"Transcript": {}}"#).is_empty());
        assert!(extract(br#"{"Transcript": {"Results": []}}"#).is_empty());
        assert!(extract(br#"{"Transcript": null}"#).is_empty());
        assert!(extract(&[0xFF, 0xFE]).is_empty());
    }
}
