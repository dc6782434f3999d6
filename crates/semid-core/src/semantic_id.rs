//! Semantic ID text format
//!
//! A code is rendered as concatenated bracketed tags with fixed single-letter
//! level markers: `<a_223><b_80><c_216>`. Markers are drawn from `a..e`, so at
//! most [`MAX_LEVELS`] quantization levels can be rendered. Downstream
//! consumers are only guaranteed that a well-formed ID yields exactly L tags;
//! anything else is a parse error they count and skip.

use thiserror::Error;

/// Per-level markers, in level order. Caps the stack depth at 5.
pub const LEVEL_MARKERS: [char; 5] = ['a', 'b', 'c', 'd', 'e'];

/// Maximum number of renderable quantization levels
pub const MAX_LEVELS: usize = LEVEL_MARKERS.len();

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SemanticIdError {
    #[error("Code has {0} levels, at most {MAX_LEVELS} are renderable")]
    TooManyLevels(usize),

    #[error("Expected {expected} tags, found {actual}")]
    WrongLevelCount { expected: usize, actual: usize },

    #[error("Malformed tag at level {level}: {tag:?}")]
    MalformedTag { level: usize, tag: String },

    #[error("Trailing characters after final tag: {0:?}")]
    TrailingInput(String),
}

/// Render one level tag, e.g. level 1 index 80 → `<b_80>`.
pub fn render_tag(level: usize, index: u32) -> String {
    assert!(level < MAX_LEVELS, "Level {} exceeds marker table", level);
    format!("<{}_{}>", LEVEL_MARKERS[level], index)
}

/// Render a full code as its canonical semantic ID string.
pub fn render(code: &[u32]) -> String {
    assert!(
        code.len() <= MAX_LEVELS,
        "Code has {} levels, at most {} are renderable",
        code.len(),
        MAX_LEVELS
    );
    let mut out = String::with_capacity(code.len() * 7);
    for (level, &index) in code.iter().enumerate() {
        out.push('<');
        out.push(LEVEL_MARKERS[level]);
        out.push('_');
        out.push_str(&index.to_string());
        out.push('>');
    }
    out
}

/// Render a code as the ordered per-level tag list used by the index artifact.
pub fn render_tags(code: &[u32]) -> Vec<String> {
    code.iter()
        .enumerate()
        .map(|(level, &index)| render_tag(level, index))
        .collect()
}

/// Parse a semantic ID string, expecting exactly `num_levels` tags with
/// markers in level order.
pub fn parse(s: &str, num_levels: usize) -> Result<Vec<u32>, SemanticIdError> {
    if num_levels > MAX_LEVELS {
        return Err(SemanticIdError::TooManyLevels(num_levels));
    }

    let mut code = Vec::with_capacity(num_levels);
    let mut rest = s;

    for level in 0..num_levels {
        let Some(open) = rest.find('<') else {
            return Err(SemanticIdError::WrongLevelCount {
                expected: num_levels,
                actual: level,
            });
        };
        let Some(close_rel) = rest[open..].find('>') else {
            return Err(SemanticIdError::MalformedTag {
                level,
                tag: rest[open..].to_string(),
            });
        };
        let tag = &rest[open + 1..open + close_rel];
        rest = &rest[open + close_rel + 1..];

        let malformed = || SemanticIdError::MalformedTag {
            level,
            tag: tag.to_string(),
        };

        let mut parts = tag.splitn(2, '_');
        let marker = parts.next().ok_or_else(malformed)?;
        let digits = parts.next().ok_or_else(malformed)?;

        if marker.len() != 1 || marker.chars().next() != Some(LEVEL_MARKERS[level]) {
            return Err(malformed());
        }
        let index: u32 = digits.parse().map_err(|_| malformed())?;
        code.push(index);
    }

    if rest.contains('<') {
        return Err(SemanticIdError::TrailingInput(rest.to_string()));
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        assert_eq!(render(&[223, 80, 216]), "<a_223><b_80><c_216>");
    }

    #[test]
    fn test_render_five_levels() {
        assert_eq!(render(&[1, 2, 3, 4, 5]), "<a_1><b_2><c_3><d_4><e_5>");
    }

    #[test]
    #[should_panic]
    fn test_render_too_many_levels_panics() {
        render(&[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_render_tags() {
        assert_eq!(render_tags(&[12, 3]), vec!["<a_12>", "<b_3>"]);
    }

    #[test]
    fn test_parse_roundtrip() {
        let code = vec![223u32, 80, 216];
        let parsed = parse(&render(&code), 3).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn test_parse_wrong_count() {
        let result = parse("<a_1><b_2>", 3);
        assert_eq!(
            result,
            Err(SemanticIdError::WrongLevelCount {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_parse_wrong_marker_order() {
        let result = parse("<b_1><a_2>", 2);
        assert!(matches!(
            result,
            Err(SemanticIdError::MalformedTag { level: 0, .. })
        ));
    }

    #[test]
    fn test_parse_non_numeric_index() {
        let result = parse("<a_xy>", 1);
        assert!(matches!(
            result,
            Err(SemanticIdError::MalformedTag { level: 0, .. })
        ));
    }

    #[test]
    fn test_parse_trailing_tag() {
        let result = parse("<a_1><b_2><c_3>", 2);
        assert!(matches!(result, Err(SemanticIdError::TrailingInput(_))));
    }

    #[test]
    fn test_parse_tolerates_separators() {
        // Index artifacts may join tags with punctuation; only the tags count.
        let parsed = parse("['<a_1>', '<b_2>']", 2).unwrap();
        assert_eq!(parsed, vec![1, 2]);
    }
}
