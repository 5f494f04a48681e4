//! Generation request types
//!
//! Defines what a caller asks an engine to generate and how requests are identified.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-chosen identifier of one generation request
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random v4 id for callers without their own naming scheme
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Sampling parameters for generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
        }
    }
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature < 0.01
    }
}

/// A prompt plus generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Generation stops as soon as the output contains one of these
    #[serde(default)]
    pub stop: Vec<String>,
    /// Send the prompt verbatim instead of wrapping it in the model's chat template
    #[serde(default)]
    pub raw_prompt: bool,
    /// Deadline after which the request is cancelled
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            sampling: SamplingParams::default(),
            stop: Vec::new(),
            raw_prompt: false,
            timeout: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stop_sequences(&self) -> StopSequences {
        StopSequences::new(&self.stop)
    }
}

/// Incremental matcher for stop sequences over streamed text
///
/// Feed each decoded piece to [`StopSequences::push`]; it returns the part of
/// the piece that may be emitted and whether a stop sequence was hit. Text
/// that could still turn into a stop sequence is held back until the next
/// piece decides it, or until [`StopSequences::flush`] at the end of the run.
#[derive(Debug, Clone, Default)]
pub struct StopSequences {
    stops: Vec<String>,
    longest: usize,
    /// Not yet emitted; always a prefix of some stop sequence
    pending: String,
}

impl StopSequences {
    pub fn new(stops: &[String]) -> Self {
        let stops: Vec<String> = stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        let longest = stops.iter().map(String::len).max().unwrap_or(0);
        Self {
            stops,
            longest,
            pending: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Returns `(emit, stopped)`
    pub fn push(&mut self, piece: &str) -> (String, bool) {
        if self.stops.is_empty() {
            return (piece.to_string(), false);
        }

        self.pending.push_str(piece);

        let hit = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min();
        if let Some(pos) = hit {
            let emit = self.pending[..pos].to_string();
            self.pending.clear();
            return (emit, true);
        }

        let hold = self.partial_match_start();
        let held = self.pending.split_off(hold);
        (std::mem::replace(&mut self.pending, held), false)
    }

    /// Releases text held back as a possible stop sequence
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Start of the longest suffix of `pending` that begins a stop sequence
    fn partial_match_start(&self) -> usize {
        let len = self.pending.len();
        let mut from = len.saturating_sub(self.longest.saturating_sub(1));
        while !self.pending.is_char_boundary(from) {
            from += 1;
        }

        (from..len)
            .filter(|&i| self.pending.is_char_boundary(i))
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stops.iter().any(|stop| stop.starts_with(tail))
            })
            .unwrap_or(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = GenerationRequest::new("Hello");
        assert_eq!(request.max_tokens, 512);
        assert!(request.stop.is_empty());
        assert!(request.timeout.is_none());
        assert!(!request.sampling.is_greedy());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(RequestId::random(), RequestId::random());
        assert_eq!(RequestId::from("a").as_str(), "a");
    }

    #[test]
    fn test_stop_within_piece() {
        let mut stops = StopSequences::new(&["</s>".to_string()]);
        assert_eq!(stops.push("Hello"), ("Hello".to_string(), false));
        assert_eq!(stops.push(" world</s>tail"), (" world".to_string(), true));
    }

    #[test]
    fn test_stop_across_pieces() {
        let mut stops = StopSequences::new(&["STOP".to_string()]);
        assert_eq!(stops.push("abc ST"), ("abc ".to_string(), false));
        assert_eq!(stops.push("OP more"), (String::new(), true));
    }

    #[test]
    fn test_partial_stop_released_when_it_diverges() {
        let mut stops = StopSequences::new(&["STOP".to_string(), "</s>".to_string()]);
        assert_eq!(stops.push("ST"), (String::new(), false));
        assert_eq!(stops.push("ART <"), ("START ".to_string(), false));
        assert_eq!(stops.push("b>"), ("<b>".to_string(), false));
    }

    #[test]
    fn test_flush_releases_held_text() {
        let mut stops = StopSequences::new(&["STOP".to_string()]);
        assert_eq!(stops.push("end S"), ("end ".to_string(), false));
        assert_eq!(stops.flush(), "S");
        assert_eq!(stops.flush(), "");
    }

    #[test]
    fn test_stop_with_multibyte_text() {
        let mut stops = StopSequences::new(&["ñé".to_string()]);
        assert_eq!(stops.push("éé"), ("éé".to_string(), false));
        assert_eq!(stops.push("xñé"), ("x".to_string(), true));
    }

    #[test]
    fn test_no_stops_passes_through() {
        let mut stops = StopSequences::new(&[String::new()]);
        assert!(stops.is_empty());
        assert_eq!(stops.push("anything"), ("anything".to_string(), false));
    }
}
