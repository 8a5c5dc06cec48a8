/// Output truncation for captured process output.

/// Smallest char boundary in `s` that is `>= idx`.
fn ceil_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Keep the last `max_bytes` of `output`, with a marker at the start.
///
/// Output within the limit is returned unchanged. Cuts never split a UTF-8
/// character, and the marker records how many bytes were removed.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let tail_start = ceil_boundary(output, output.len() - max_bytes);
    format!(
        "[... {} bytes truncated ...]\n{}",
        tail_start,
        &output[tail_start..]
    )
}

/// Drop the front of `buf` in place so at most `max_bytes` remain.
///
/// Returns the number of bytes removed.
pub fn keep_tail(buf: &mut String, max_bytes: usize) -> usize {
    if buf.len() <= max_bytes {
        return 0;
    }
    let cut = ceil_boundary(buf, buf.len() - max_bytes);
    buf.drain(..cut);
    cut
}

/// The last `n` lines of `output`.
pub fn last_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_when_within_limit() {
        let input = "short";
        assert_eq!(truncate_output(input, 100), input);
    }

    #[test]
    fn tail_truncation() {
        let input: String = (0..100).map(|i| char::from(b'a' + (i % 26))).collect();
        let result = truncate_output(&input, 50);

        assert!(result.starts_with("[... 50 bytes truncated ...]"));
        assert!(result.ends_with(&input[50..]));
    }

    #[test]
    fn tail_truncation_respects_char_boundaries() {
        let input = "é".repeat(40);
        let result = truncate_output(&input, 11);
        assert!(result.ends_with(&"é".repeat(5)));
    }

    #[test]
    fn keep_tail_trims_front_in_place() {
        let mut buf = "line one\nline two\n".to_string();
        assert_eq!(keep_tail(&mut buf, 100), 0);
        assert_eq!(buf, "line one\nline two\n");

        let removed = keep_tail(&mut buf, 9);
        assert_eq!(removed, 9);
        assert_eq!(buf, "line two\n");
    }

    #[test]
    fn keep_tail_never_splits_a_char() {
        let mut buf = "é".repeat(10);
        let removed = keep_tail(&mut buf, 5);
        assert_eq!(removed, 16);
        assert_eq!(buf, "éé");
    }

    #[test]
    fn last_lines_keeps_tail() {
        assert_eq!(last_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(last_lines("only", 5), "only");
        assert_eq!(last_lines("", 3), "");
    }
}
