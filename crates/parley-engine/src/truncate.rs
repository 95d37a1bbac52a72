use crate::context::tokens::CHARS_PER_TOKEN;

/// Largest char boundary at or below `index`.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn marker(original: usize, kept: usize) -> String {
    format!("\n\n[truncated: {original} bytes -> {kept} bytes]")
}

/// Truncate output if it exceeds `max_bytes`.
///
/// Cuts at a char boundary and appends a marker showing original vs kept
/// size. The result, marker included, never exceeds `max_bytes`; a cap too
/// small for the marker yields a bare cut.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    // `kept <= max_bytes`, so this marker is at least as long as the final one.
    let reserve = marker(output.len(), max_bytes).len();
    if reserve >= max_bytes {
        return output[..floor_char_boundary(output, max_bytes)].to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes - reserve);
    format!("{}{}", &output[..boundary], marker(output.len(), boundary))
}

/// Byte ceiling for a token allowance under the chars/4 estimate.
pub fn max_bytes_for_tokens(tokens: usize) -> usize {
    tokens.saturating_mul(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_when_within_limit() {
        assert_eq!(truncate_output("hello world", 1024), "hello world");
    }

    #[test]
    fn truncates_at_limit() {
        let input = "a".repeat(1000);
        let result = truncate_output(&input, 100);
        assert!(result.contains("[truncated: 1000 bytes -> 62 bytes]"));
        assert!(result.starts_with("aaaa"));
        assert!(result.len() <= 100);
    }

    #[test]
    fn truncates_at_char_boundary() {
        let input = "\u{1F980}".repeat(100); // 4 bytes each
        let result = truncate_output(&input, 60);
        assert!(result.contains("[truncated: 400 bytes -> 24 bytes]"));
        assert_eq!(result.len(), 60);
    }

    #[test]
    fn marker_never_pushes_past_the_cap() {
        let input = "b".repeat(5000);
        for cap in [1, 10, 37, 38, 39, 100, 999, 4999] {
            let result = truncate_output(&input, cap);
            assert!(result.len() <= cap, "cap {cap}: {}", result.len());
        }
        assert_eq!(truncate_output(&input, 10), "b".repeat(10));
    }

    #[test]
    fn truncated_output_is_stable() {
        let once = truncate_output(&"c".repeat(1000), 200);
        assert_eq!(truncate_output(&once, 200), once);
    }

    #[test]
    fn exact_boundary_no_truncation() {
        let input = "a".repeat(100);
        assert_eq!(truncate_output(&input, 100), input);
    }

    #[test]
    fn token_allowance_in_bytes() {
        assert_eq!(max_bytes_for_tokens(2000), 8000);
    }
}
