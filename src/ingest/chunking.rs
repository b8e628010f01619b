//! Whitespace-token window chunker with overlap

/// A chunk of source text with character offsets into the original
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split content into overlapping windows of whitespace tokens.
///
/// Offsets are byte offsets into the original content so chunks can be
/// located back in the source document.
pub fn chunk_text(content: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<ChunkSpan> {
    if content.is_empty() || max_tokens == 0 {
        return Vec::new();
    }

    // (start, end) byte span of each whitespace-delimited token
    let mut tokens: Vec<(usize, usize)> = Vec::new();
    let mut token_start: Option<usize> = None;
    for (idx, ch) in content.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = token_start.take() {
                tokens.push((start, idx));
            }
        } else if token_start.is_none() {
            token_start = Some(idx);
        }
    }
    if let Some(start) = token_start {
        tokens.push((start, content.len()));
    }
    if tokens.is_empty() {
        return Vec::new();
    }

    let step = max_tokens.saturating_sub(overlap_tokens).max(1);
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let window = &tokens[i..(i + max_tokens).min(tokens.len())];
        let start = window[0].0;
        let end = window[window.len() - 1].1;
        chunks.push(ChunkSpan {
            text: content[start..end].to_string(),
            start,
            end,
        });
        if i + max_tokens >= tokens.len() {
            break;
        }
        i += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content() {
        assert!(chunk_text("", 400, 50).is_empty());
        assert!(chunk_text("   \n\t ", 400, 50).is_empty());
    }

    #[test]
    fn test_single_chunk() {
        let chunks = chunk_text("Hoard search test", 400, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hoard search test");
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 17);
    }

    #[test]
    fn test_windows_overlap() {
        let words: Vec<String> = (0..10).map(|i| format!("w{}", i)).collect();
        let content = words.join(" ");
        let chunks = chunk_text(&content, 4, 1);
        assert!(chunks.len() > 1);
        // each window after the first starts 3 tokens later
        assert!(chunks[0].text.starts_with("w0"));
        assert!(chunks[1].text.starts_with("w3"));
        // offsets map back into the source
        for chunk in &chunks {
            assert_eq!(&content[chunk.start..chunk.end], chunk.text);
        }
    }

    #[test]
    fn test_tail_is_covered() {
        let words: Vec<String> = (0..11).map(|i| format!("w{}", i)).collect();
        let content = words.join(" ");
        let chunks = chunk_text(&content, 4, 1);
        let last = chunks.last().unwrap();
        assert!(last.text.ends_with("w10"));
    }
}
