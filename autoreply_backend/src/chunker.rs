//! Splitting of oversized replies into sendable segments.

/// Splits replies longer than `max_len` characters, preferring line breaks.
#[derive(Debug, Clone)]
pub struct ReplyChunker {
    max_len: usize,
    banner: String,
}

impl ReplyChunker {
    /// A zero `max_len` is treated as one character.
    pub fn new(max_len: usize, banner: impl Into<String>) -> Self {
        Self {
            max_len: max_len.max(1),
            banner: banner.into(),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn needs_split(&self, text: &str) -> bool {
        text.chars().count() > self.max_len
    }

    /// Segments ready to send. The banner survives only on the first one.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.raw_segments(text)
            .into_iter()
            .enumerate()
            .map(|(index, segment)| match segment.strip_prefix(&self.banner) {
                Some(rest) if index > 0 && !self.banner.is_empty() => rest.to_string(),
                _ => segment.to_string(),
            })
            .collect()
    }

    /// Cut points only; concatenating the result yields `text` exactly.
    pub fn raw_segments<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut segments = Vec::new();
        let mut remaining = text;

        while !remaining.is_empty() {
            // Byte offset just past the first `max_len` characters, if the rest is longer.
            let limit = match remaining.char_indices().nth(self.max_len) {
                Some((offset, _)) => offset,
                None => {
                    segments.push(remaining);
                    break;
                }
            };

            // A newline may sit at char position 1..=max_len; it opens the next segment.
            let window_end = limit + remaining[limit..].chars().next().map_or(0, char::len_utf8);
            let cut = match remaining[..window_end].rfind('\n') {
                Some(pos) if pos > 0 => pos,
                _ => limit,
            };

            let (head, tail) = remaining.split_at(cut);
            segments.push(head);
            remaining = tail;
        }

        segments
    }
}
