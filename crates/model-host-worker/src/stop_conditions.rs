// Stop sequence matching for streamed generation.
//
// Pieces arrive one token at a time and a stop sequence can straddle several
// of them, so text that could still turn into a stop sequence is held back
// until the next piece decides it. Nothing after (or including) a stop
// sequence is ever emitted.

/// Outcome of feeding one piece to a [`StopMatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStep {
    /// Text safe to emit now; generation continues.
    Continue(String),
    /// A stop sequence matched. Emit the text preceding it and stop.
    Stop(String),
}

#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
    matched: Option<String>,
}

impl StopMatcher {
    pub fn new<I, S>(stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stops = stops
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        Self {
            stops,
            pending: String::new(),
            matched: None,
        }
    }

    /// Stop sequence that ended generation, if any.
    pub fn matched(&self) -> Option<&str> {
        self.matched.as_deref()
    }

    pub fn push(&mut self, piece: &str) -> StopStep {
        if self.stops.is_empty() {
            return StopStep::Continue(piece.to_string());
        }
        self.pending.push_str(piece);

        // Earliest match wins; ties go to the longer sequence.
        let hit = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()).map(|pos| (pos, stop)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())));
        if let Some((pos, stop)) = hit {
            self.matched = Some(stop.clone());
            let emit = self.pending[..pos].to_string();
            self.pending.clear();
            return StopStep::Stop(emit);
        }

        let held = self.partial_suffix_len();
        let split = self.pending.len() - held;
        let emit = self.pending[..split].to_string();
        self.pending.drain(..split);
        StopStep::Continue(emit)
    }

    /// Flush held-back text once generation ends without a match.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Length of the longest suffix of `pending` that is a proper prefix of
    /// some stop sequence.
    fn partial_suffix_len(&self) -> usize {
        self.pending
            .char_indices()
            .map(|(i, _)| &self.pending[i..])
            .find(|suffix| {
                self.stops
                    .iter()
                    .any(|stop| stop.len() > suffix.len() && stop.starts_with(suffix))
            })
            .map_or(0, str::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stops: &[&str], pieces: &[&str]) -> (String, bool) {
        let mut matcher = StopMatcher::new(stops.iter().copied());
        let mut out = String::new();
        for piece in pieces {
            match matcher.push(piece) {
                StopStep::Continue(text) => out.push_str(&text),
                StopStep::Stop(text) => {
                    out.push_str(&text);
                    return (out, true);
                }
            }
        }
        out.push_str(&matcher.finish());
        (out, false)
    }

    #[test]
    fn test_no_stops_passes_through() {
        assert_eq!(run(&[], &["a", "b"]), ("ab".to_string(), false));
    }

    #[test]
    fn test_stop_inside_one_piece() {
        assert_eq!(
            run(&["<|im_end|>"], &["Hi", " there<|im_end|>junk"]),
            ("Hi there".to_string(), true)
        );
    }

    #[test]
    fn test_stop_across_pieces() {
        assert_eq!(
            run(&["<|im_end|>"], &["Hi", "<|im", "_e", "nd|>", "after"]),
            ("Hi".to_string(), true)
        );
    }

    #[test]
    fn test_partial_prefix_released_when_it_diverges() {
        let mut matcher = StopMatcher::new(["</s>"]);
        assert_eq!(matcher.push("a</"), StopStep::Continue("a".into()));
        assert_eq!(matcher.push("b"), StopStep::Continue("</b".into()));
        assert_eq!(matcher.finish(), "");
    }

    #[test]
    fn test_held_text_flushed_at_end() {
        assert_eq!(run(&["USER:"], &["ok US"]), ("ok US".to_string(), false));
    }

    #[test]
    fn test_earliest_stop_wins() {
        let mut matcher = StopMatcher::new(["B", "A"]);
        assert_eq!(matcher.push("xAyB"), StopStep::Stop("x".into()));
        assert_eq!(matcher.matched(), Some("A"));
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        assert_eq!(
            run(&["ééx"], &["café", "é", "!"]),
            ("caféé!".to_string(), false)
        );
    }

    #[test]
    fn test_empty_stop_is_ignored() {
        assert_eq!(run(&[""], &["text"]), ("text".to_string(), false));
    }
}
