//! Stop marker detection over the accumulated child output.

use crate::config::StopMarkers;

/// Which marker ended an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMarker {
    /// The child went back to its interactive prompt.
    PromptReturn,
    /// The child printed its end-of-generation marker.
    EndOfGeneration,
}

/// A marker found in the accumulated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerMatch {
    pub marker: StopMarker,
    /// Byte offset of the first marker byte.
    pub position: usize,
}

/// Incremental search for stop markers.
///
/// Output arrives in arbitrary chunks, so a marker can straddle two reads.
/// The matcher only rescans the tail that could still hold the start of a
/// marker, and tells the caller how many bytes are safe to forward.
#[derive(Debug, Clone)]
pub struct MarkerMatcher {
    markers: Vec<(StopMarker, Vec<u8>)>,
    /// Length of the longest marker minus one.
    overlap: usize,
    scanned: usize,
}

impl MarkerMatcher {
    pub fn new(config: &StopMarkers) -> Self {
        let markers: Vec<(StopMarker, Vec<u8>)> = [
            (StopMarker::PromptReturn, &config.prompt_return),
            (StopMarker::EndOfGeneration, &config.end_of_generation),
        ]
        .into_iter()
        .filter(|(_, text)| !text.is_empty())
        .map(|(marker, text)| (marker, text.as_bytes().to_vec()))
        .collect();

        let overlap = markers
            .iter()
            .map(|(_, bytes)| bytes.len().saturating_sub(1))
            .max()
            .unwrap_or(0);

        Self {
            markers,
            overlap,
            scanned: 0,
        }
    }

    /// Look for the earliest marker in `buffer`, which must be the same
    /// buffer passed on previous calls with new bytes appended.
    pub fn scan(&mut self, buffer: &[u8]) -> Option<MarkerMatch> {
        let start = self.scanned.saturating_sub(self.overlap);
        let found = self
            .markers
            .iter()
            .filter_map(|(marker, needle)| {
                find(&buffer[start..], needle).map(|offset| MarkerMatch {
                    marker: *marker,
                    position: start + offset,
                })
            })
            .min_by_key(|m| m.position);
        self.scanned = buffer.len();
        found
    }

    /// Bytes of `buffer` that can no longer become part of a marker.
    pub fn safe_len(&self, buffer_len: usize) -> usize {
        buffer_len.saturating_sub(self.overlap)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> MarkerMatcher {
        MarkerMatcher::new(&StopMarkers::default())
    }

    #[test]
    fn test_no_marker() {
        let mut m = matcher();
        assert_eq!(m.scan(b"Hello, I am"), None);
    }

    #[test]
    fn test_end_of_generation() {
        let mut m = matcher();
        let found = m.scan(b"hello[end of text]").unwrap();
        assert_eq!(found.marker, StopMarker::EndOfGeneration);
        assert_eq!(found.position, 5);
    }

    #[test]
    fn test_prompt_return() {
        let mut m = matcher();
        let found = m.scan(b"answer\n> ").unwrap();
        assert_eq!(found.marker, StopMarker::PromptReturn);
        assert_eq!(found.position, 6);
    }

    #[test]
    fn test_earliest_marker_wins() {
        let mut m = matcher();
        let found = m.scan(b"done [end of text]\n> ").unwrap();
        assert_eq!(found.marker, StopMarker::EndOfGeneration);
        assert_eq!(found.position, 5);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut m = matcher();
        let mut buffer = b"some text [end o".to_vec();
        assert_eq!(m.scan(&buffer), None);
        buffer.extend_from_slice(b"f text]");
        let found = m.scan(&buffer).unwrap();
        assert_eq!(found.position, 10);
    }

    #[test]
    fn test_safe_len_holds_back_possible_prefix() {
        let m = matcher();
        // "[end of text]" is 13 bytes, so 12 trailing bytes are held back
        assert_eq!(m.safe_len(20), 8);
        assert_eq!(m.safe_len(5), 0);
    }

    #[test]
    fn test_empty_marker_is_ignored() {
        let mut m = MarkerMatcher::new(&StopMarkers {
            prompt_return: String::new(),
            end_of_generation: "<|eot|>".to_string(),
        });
        assert_eq!(m.scan(b"abc"), None);
        assert_eq!(m.safe_len(10), 4);
        let found = m.scan(b"abc<|eot|>").unwrap();
        assert_eq!(found.marker, StopMarker::EndOfGeneration);
    }
}
