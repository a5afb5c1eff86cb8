//! First-byte-position parsing for the `Range` header (spec.md §4.7b),
//! ported from `original_source/handler.go:parseRangeFirstStart`.
//!
//! This is a fast, shallow parse used only to decide whether a request
//! should be excluded from per-UA access counting (a resumed download
//! shouldn't count as a fresh visit) -- it is not a validating parse of
//! the Range header for serving purposes.

/// Returns `(start, ok)`. `ok` is `false` when the header isn't a `bytes=`
/// range or its first spec has no `-`, or when the start position fails to
/// parse as an integer -- the caller should not treat the request as a
/// resume in that case. `ok` is `true` with `start == -1` for a suffix
/// range (`bytes=-500`) or a zero-length spec, matching the original's
/// "ignore it, but it still counts as a range request" outcome.
pub fn parse_range_first_start(range: &str) -> (i64, bool) {
    let Some(rest) = range.strip_prefix("bytes=") else {
        return (0, false);
    };
    let first_spec = rest.split(',').next().unwrap_or("");
    let Some((start, len)) = first_spec.split_once('-') else {
        return (0, false);
    };
    let start = start.trim();
    let len = len.trim();
    if start.is_empty() || len.is_empty() {
        return (-1, true);
    }
    let start_n = match start.parse::<i64>() {
        Ok(n) => n,
        Err(_) => return (0, false),
    };
    let size_n = match len.parse::<i64>() {
        Ok(n) => n,
        Err(_) => return (0, false),
    };
    if size_n == 0 {
        return (-1, true);
    }
    (start_n, true)
}

/// `true` iff `range` parses to a non-zero first byte position -- the
/// signal used to suppress a request from per-UA access counting.
pub fn should_skip_ua_count(range: &str) -> bool {
    let (start, ok) = parse_range_first_start(range);
    ok && start != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_bytes_prefix_is_not_ok() {
        assert_eq!(parse_range_first_start("items=0-10"), (0, false));
    }

    #[test]
    fn plain_start_is_tagged_only_when_nonzero() {
        assert_eq!(parse_range_first_start("bytes=0-499"), (0, true));
        assert!(!should_skip_ua_count("bytes=0-499"));

        assert_eq!(parse_range_first_start("bytes=500-999"), (500, true));
        assert!(should_skip_ua_count("bytes=500-999"));
    }

    #[test]
    fn suffix_range_is_tagged() {
        assert_eq!(parse_range_first_start("bytes=-500"), (-1, true));
        assert!(should_skip_ua_count("bytes=-500"));
    }

    #[test]
    fn open_ended_range_with_zero_length_spec_is_tagged() {
        assert_eq!(parse_range_first_start("bytes=500-"), (-1, true));
        assert!(should_skip_ua_count("bytes=500-"));
    }

    #[test]
    fn unparseable_start_is_not_ok() {
        assert_eq!(parse_range_first_start("bytes=abc-999"), (0, false));
        assert!(!should_skip_ua_count("bytes=abc-999"));
    }

    #[test]
    fn only_first_spec_in_a_multi_range_header_is_considered() {
        assert_eq!(parse_range_first_start("bytes=200-300,400-500"), (200, true));
    }
}
