/// Returns a prefix of the string with at most `max_chars` characters,
/// respecting UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_respects_multibyte_chars() {
        assert_eq!(prefix_chars("주장과 근거", 2), "주장");
        assert_eq!(prefix_chars("abc", 10), "abc");
        assert_eq!(prefix_chars("", 3), "");
    }
}
