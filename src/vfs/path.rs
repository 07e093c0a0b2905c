//! Guest path normalization.
//!
//! Every path a guest hands us is reduced to a list of plain segments before
//! any mount lookup happens, so a `..` can never walk past the top of the
//! tree and out of a mount's backing root.

/// Characters a guest path may never contain.
const DISALLOWED: &[char] = &['"', ':', '<', '>', '?', '|'];

/// Normalize a guest path into segments.
///
/// Splits on `/` and `\`, drops empty and `.` segments, strips disallowed
/// characters and `*`, and resolves `..` against earlier segments. Returns
/// `None` when a `..` would climb above the root.
pub fn normalize(path: &str) -> Option<Vec<String>> {
    normalize_inner(path, false)
}

/// Like [`normalize`] but keeps `*` for wildcard patterns.
pub fn normalize_pattern(path: &str) -> Option<Vec<String>> {
    normalize_inner(path, true)
}

fn normalize_inner(path: &str, keep_wildcards: bool) -> Option<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for raw in path.split(['/', '\\']) {
        let segment: String = raw
            .chars()
            .filter(|c| !DISALLOWED.contains(c) && !c.is_control())
            .filter(|c| keep_wildcards || *c != '*')
            .collect();
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                out.pop()?;
            }
            _ => out.push(segment),
        }
    }
    Some(out)
}

/// Join segments back into a guest path with no leading slash.
pub fn combine<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `prefix` is a leading run of `segments`.
pub fn starts_with(segments: &[String], prefix: &[String]) -> bool {
    prefix.len() <= segments.len() && segments[..prefix.len()] == *prefix
}

/// Build an anchored regex for one wildcard segment: literal text with `*`
/// matching any run of characters.
pub fn wildcard_regex(segment: &str) -> Result<regex::Regex, regex::Error> {
    let body = segment
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    regex::Regex::new(&format!("^{body}$"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn collapses_dots_and_separators() {
        assert_eq!(
            normalize("/rom//./programs\\..\\apis/x.lua").unwrap(),
            vec!["rom", "apis", "x.lua"]
        );
        assert_eq!(normalize("").unwrap(), Vec::<String>::new());
        assert_eq!(normalize("/").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn escaping_the_root_fails() {
        assert!(normalize("..").is_none());
        assert!(normalize("a/../../b").is_none());
        assert!(normalize("a/b/../../..").is_none());
        assert_eq!(normalize("a/b/../..").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn disallowed_characters_are_stripped() {
        assert_eq!(normalize("we<ird>|na:me?.txt").unwrap(), vec!["weirdname.txt"]);
        assert_eq!(normalize("a*b").unwrap(), vec!["ab"]);
        assert_eq!(normalize_pattern("rom/*.lua").unwrap(), vec!["rom", "*.lua"]);
    }

    #[test]
    fn wildcard_segments_escape_regex_metacharacters() {
        let re = wildcard_regex("a+b*.lua").unwrap();
        assert!(re.is_match("a+b.lua"));
        assert!(re.is_match("a+bcd.lua"));
        assert!(!re.is_match("aab.lua"));
        assert!(!re.is_match("a+b.luax"));
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9_]{1,8}",
            Just(".".to_string()),
            Just("..".to_string()),
            Just(String::new()),
        ]
    }

    proptest! {
        #[test]
        fn normalized_segments_round_trip(parts in prop::collection::vec(segment(), 0..12)) {
            let raw = parts.join("/");
            if let Some(segs) = normalize(&raw) {
                prop_assert!(segs.iter().all(|s| !s.is_empty() && s != "." && s != ".."));
                prop_assert_eq!(normalize(&combine(&segs)), Some(segs));
            }
        }

        #[test]
        fn excess_parent_segments_never_resolve(depth in 0usize..6, extra in 1usize..4) {
            let mut parts: Vec<String> = (0..depth).map(|i| format!("d{i}")).collect();
            parts.extend(std::iter::repeat_n("..".to_string(), depth + extra));
            prop_assert!(normalize(&parts.join("/")).is_none());
        }
    }
}
