use napi_derive::napi;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Characters of surrounding text captured on each side of a new anchor.
const CONTEXT_RADIUS: usize = 20;

/// Minimum combined score a fuzzy candidate must reach to be accepted.
const SCORE_FLOOR: f64 = 2.0;

/// Tail/head window used for partial context comparison.
const PARTIAL_CONTEXT_CHARS: usize = 10;

static LINK_OR_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").expect("valid link strip regex"));
static INLINE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*|~~|[#*`]").expect("valid marker strip regex"));

/// Snapshot of where a comment selection was made: the exact substring plus
/// surrounding context, used to relocate the range after edits.
///
/// `offset`/`length` are byte offsets into the UTF-8 content. They may drift
/// after edits; `resolve_offset` recovers the current position.
#[napi(object)]
#[derive(Clone, Debug, PartialEq)]
pub struct Anchor {
    pub text: String,
    #[napi(js_name = "contextBefore")]
    pub context_before: String,
    #[napi(js_name = "contextAfter")]
    pub context_after: String,
    pub offset: u32,
    pub length: u32,
}

#[napi(object)]
#[derive(Clone, Debug)]
pub struct ResolvedAnchor {
    pub offset: u32,
    pub orphaned: bool,
}

#[napi(js_name = "createAnchor")]
pub fn create_anchor_js(content: String, offset: u32, length: u32) -> Anchor {
    create_anchor(&content, offset as usize, length as usize)
}

#[napi(js_name = "resolveOffset")]
pub fn resolve_offset_js(content: String, anchor: Anchor) -> Option<u32> {
    resolve_offset(&content, &anchor).map(|offset| offset as u32)
}

#[napi(js_name = "resolveRenderedSelection")]
pub fn resolve_rendered_selection_js(content: String, anchor: Anchor) -> Option<u32> {
    resolve_rendered_selection(&content, &anchor).map(|offset| offset as u32)
}

#[napi(js_name = "resolveAll")]
pub fn resolve_all_js(content: String, anchors: Vec<Anchor>) -> Vec<ResolvedAnchor> {
    anchors
        .iter()
        .map(|anchor| match resolve_offset(&content, anchor) {
            Some(offset) => ResolvedAnchor {
                offset: offset as u32,
                orphaned: false,
            },
            None => ResolvedAnchor {
                offset: anchor.offset,
                orphaned: true,
            },
        })
        .collect()
}

/// Capture an anchor for `content[offset..offset + length]`.
///
/// Out-of-range offsets are clamped, so context degrades to shorter or empty
/// strings at document edges instead of failing.
pub fn create_anchor(content: &str, offset: usize, length: usize) -> Anchor {
    let start = floor_char_boundary(content, offset);
    let end = floor_char_boundary(content, offset.saturating_add(length)).max(start);
    let before_start = floor_char_boundary(content, start.saturating_sub(CONTEXT_RADIUS));
    let after_end = floor_char_boundary(content, end.saturating_add(CONTEXT_RADIUS)).max(end);

    Anchor {
        text: content[start..end].to_string(),
        context_before: content[before_start..start].to_string(),
        context_after: content[end..after_end].to_string(),
        offset: start as u32,
        length: (end - start) as u32,
    }
}

/// Recover the anchor's current offset in possibly-edited content.
///
/// Tries, in order: the unchanged fast path, a whitespace-tolerant fuzzy scan
/// scored by context agreement and proximity, and a plain substring search.
/// Returns `None` when the anchor cannot be relocated; the comment itself is
/// never discarded here, the caller decides how to surface an orphan.
pub fn resolve_offset(content: &str, anchor: &Anchor) -> Option<usize> {
    if let Some(offset) = resolve_unchanged(content, anchor) {
        return Some(offset);
    }
    if anchor.text.is_empty() {
        return None;
    }
    best_fuzzy_match(content, anchor, false).or_else(|| {
        debug!(offset = anchor.offset, "fuzzy relocation missed, trying plain substring");
        content.find(anchor.text.as_str())
    })
}

/// Variant of [`resolve_offset`] for anchors captured from rendered text.
///
/// Selections taken from a rendered view carry no Markdown syntax while the
/// document does, so candidate context is stripped of Markdown markers before
/// comparison.
pub fn resolve_rendered_selection(content: &str, anchor: &Anchor) -> Option<usize> {
    if let Some(offset) = resolve_unchanged(content, anchor) {
        return Some(offset);
    }
    if anchor.text.is_empty() {
        return None;
    }
    best_fuzzy_match(content, anchor, true).or_else(|| content.find(anchor.text.as_str()))
}

fn resolve_unchanged(content: &str, anchor: &Anchor) -> Option<usize> {
    let start = anchor.offset as usize;
    let end = start.checked_add(anchor.length as usize)?;
    if end > content.len() || !content.is_char_boundary(start) || !content.is_char_boundary(end) {
        return None;
    }
    (&content[start..end] == anchor.text.as_str()).then_some(start)
}

fn best_fuzzy_match(content: &str, anchor: &Anchor, rendered: bool) -> Option<usize> {
    let pattern = whitespace_tolerant_pattern(&anchor.text)?;
    let regex = Regex::new(&pattern).ok()?;

    let mut best: Option<(f64, usize)> = None;
    for found in regex.find_iter(content) {
        let score = context_score(content, found.start(), found.end(), anchor, rendered)
            + proximity_bonus(found.start(), anchor.offset as usize);
        if best.is_none_or(|(best_score, _)| score > best_score) {
            best = Some((score, found.start()));
        }
    }

    best.filter(|(score, _)| *score >= SCORE_FLOOR)
        .map(|(_, offset)| offset)
}

/// Escape the anchor text for regex use, with every whitespace run relaxed to
/// `[\s\r\n]+` so reflowed text still matches.
fn whitespace_tolerant_pattern(text: &str) -> Option<String> {
    let mut pattern = String::with_capacity(text.len() * 2);
    let mut chunk = String::new();
    let mut last_was_whitespace = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            if !chunk.is_empty() {
                pattern.push_str(&regex::escape(&chunk));
                chunk.clear();
            }
            if !last_was_whitespace {
                pattern.push_str(r"[\s\r\n]+");
            }
            last_was_whitespace = true;
        } else {
            chunk.push(ch);
            last_was_whitespace = false;
        }
    }
    if !chunk.is_empty() {
        pattern.push_str(&regex::escape(&chunk));
    }

    (!pattern.is_empty()).then_some(pattern)
}

fn context_score(
    content: &str,
    match_start: usize,
    match_end: usize,
    anchor: &Anchor,
    rendered: bool,
) -> f64 {
    before_score(content, match_start, &anchor.context_before, rendered)
        + after_score(content, match_end, &anchor.context_after, rendered)
}

fn before_score(content: &str, match_start: usize, stored: &str, rendered: bool) -> f64 {
    if stored.is_empty() {
        // An anchor captured at the document start only matches candidates
        // that also sit at the start.
        return if match_start == 0 { 2.0 } else { 0.0 };
    }
    let window = stored.len() + if rendered { CONTEXT_RADIUS } else { 0 };
    let from = floor_char_boundary(content, match_start.saturating_sub(window));
    let mut actual = content[from..match_start].to_string();
    if rendered {
        actual = strip_markdown(&actual);
    }
    let actual = tail_chars(&actual, stored.chars().count());
    side_score(&actual, stored, Side::Before)
}

fn after_score(content: &str, match_end: usize, stored: &str, rendered: bool) -> f64 {
    if stored.is_empty() {
        return if match_end == content.len() { 2.0 } else { 0.0 };
    }
    let window = stored.len() + if rendered { CONTEXT_RADIUS } else { 0 };
    let to = floor_char_boundary(content, match_end.saturating_add(window)).max(match_end);
    let mut actual = content[match_end..to].to_string();
    if rendered {
        actual = strip_markdown(&actual);
    }
    let actual = head_chars(&actual, stored.chars().count());
    side_score(&actual, stored, Side::After)
}

#[derive(Clone, Copy)]
enum Side {
    Before,
    After,
}

/// +2 for an exact context match, +1 for a partial one (the 10 characters
/// nearest the anchor agree), 0 otherwise.
fn side_score(actual: &str, stored: &str, side: Side) -> f64 {
    if actual == stored {
        return 2.0;
    }
    let (actual_edge, stored_edge) = match side {
        Side::Before => (
            tail_chars(actual, PARTIAL_CONTEXT_CHARS),
            tail_chars(stored, PARTIAL_CONTEXT_CHARS),
        ),
        Side::After => (
            head_chars(actual, PARTIAL_CONTEXT_CHARS),
            head_chars(stored, PARTIAL_CONTEXT_CHARS),
        ),
    };
    if !stored_edge.is_empty() && actual_edge == stored_edge {
        return 1.0;
    }
    0.0
}

/// Favor candidates near the last known offset: `max(0, 5 - log10(d + 1))`.
fn proximity_bonus(candidate: usize, original: usize) -> f64 {
    let distance = candidate.abs_diff(original);
    (5.0 - ((distance as f64) + 1.0).log10()).max(0.0)
}

/// Remove Markdown syntax so raw-document context can be compared against
/// context captured from rendered text.
fn strip_markdown(text: &str) -> String {
    let without_links = LINK_OR_IMAGE_RE.replace_all(text, "$1");
    INLINE_MARKER_RE.replace_all(&without_links, "").into_owned()
}

fn tail_chars(text: &str, count: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

fn head_chars(text: &str, count: usize) -> String {
    text.chars().take(count).collect()
}

fn floor_char_boundary(content: &str, index: usize) -> usize {
    let mut index = index.min(content.len());
    while index > 0 && !content.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "Alpha beta gamma delta epsilon zeta eta theta.";

    #[test]
    fn create_anchor_captures_text_and_context() {
        let anchor = create_anchor(DOC, 11, 5);
        assert_eq!(anchor.text, "gamma");
        assert_eq!(anchor.context_before, "Alpha beta ");
        assert_eq!(anchor.context_after, " delta epsilon zeta ");
        assert_eq!(anchor.offset, 11);
        assert_eq!(anchor.length, 5);
    }

    #[test]
    fn create_anchor_clamps_at_document_edges() {
        let anchor = create_anchor("short", 0, 5);
        assert_eq!(anchor.text, "short");
        assert_eq!(anchor.context_before, "");
        assert_eq!(anchor.context_after, "");

        let overshoot = create_anchor("short", 3, 99);
        assert_eq!(overshoot.text, "rt");
        assert_eq!(overshoot.length, 2);
    }

    #[test]
    fn unchanged_content_resolves_to_original_offset() {
        let anchor = create_anchor(DOC, 17, 5);
        assert_eq!(resolve_offset(DOC, &anchor), Some(17));
    }

    #[test]
    fn insertion_before_anchor_shifts_offset() {
        let anchor = create_anchor(DOC, 11, 5);
        let edited = format!("New intro line.\n{DOC}");
        assert_eq!(resolve_offset(&edited, &anchor), Some(11 + 16));
    }

    #[test]
    fn reflowed_whitespace_still_matches() {
        let content = "one two three four five";
        let anchor = create_anchor(content, 4, 9);
        assert_eq!(anchor.text, "two three");
        let reflowed = "one two\n   three four five";
        let resolved = resolve_offset(reflowed, &anchor).expect("reflowed match");
        assert_eq!(&reflowed[resolved..resolved + 3], "two");
    }

    #[test]
    fn duplicate_text_is_disambiguated_by_context() {
        let content = "aaa target bbb ... ccc target ddd";
        // Anchor whose context matches only the second occurrence.
        let second = content.rfind("target").expect("second occurrence");
        let anchor = create_anchor(content, second, "target".len());
        // Shift everything so the fast path misses, then resolve.
        let edited = format!("xx {content}");
        assert_eq!(resolve_offset(&edited, &anchor), Some(second + 3));
    }

    #[test]
    fn proximity_breaks_ties_between_identical_contexts() {
        let content = "x repeat x\ny repeat y\nx repeat x\n";
        let anchor = Anchor {
            text: "repeat".to_string(),
            context_before: "q ".to_string(),
            context_after: " q".to_string(),
            offset: 24,
            length: 6,
        };
        // Neither candidate's context agrees; the nearest occurrence wins.
        let resolved = resolve_offset(content, &anchor).expect("proximity match");
        assert_eq!(resolved, 24);
    }

    #[test]
    fn removed_text_is_orphaned() {
        let anchor = create_anchor(DOC, 11, 5);
        let edited = DOC.replace("gamma ", "");
        assert_eq!(resolve_offset(&edited, &anchor), None);
    }

    #[test]
    fn substring_fallback_recovers_distant_moves() {
        let content = "paragraph one.\nneedle-phrase\n";
        let anchor = create_anchor(content, 15, 13);
        assert_eq!(anchor.text, "needle-phrase");
        // Moved far away with entirely different context: the fuzzy score
        // stays under the floor, the substring fallback still finds it.
        let filler = "filler lines\n".repeat(400);
        let moved = format!("intro\n{filler}<<<needle-phrase>>>\n");
        let resolved = resolve_offset(&moved, &anchor).expect("substring fallback");
        assert_eq!(&moved[resolved..resolved + 13], "needle-phrase");
    }

    #[test]
    fn empty_anchor_resolves_only_in_range() {
        let anchor = create_anchor(DOC, 5, 0);
        assert_eq!(resolve_offset(DOC, &anchor), Some(5));
        assert_eq!(resolve_offset("ab", &anchor), None);
    }

    #[test]
    fn rendered_selection_ignores_markdown_markers() {
        let content = "intro **bold phrase** and [linked text](http://x) tail anchor word";
        let start = content.find("anchor").expect("anchor");
        let anchor = Anchor {
            text: "anchor".to_string(),
            // Context as it appears in rendered text, markers stripped.
            context_before: "linked text tail ".to_string(),
            context_after: " word".to_string(),
            offset: 0,
            length: 6,
        };
        let resolved = resolve_rendered_selection(content, &anchor).expect("rendered match");
        assert_eq!(resolved, start);
    }

    #[test]
    fn multibyte_offsets_are_clamped_to_char_boundaries() {
        let content = "héllo wörld";
        // Offset 2 lands inside the two-byte 'é'.
        let anchor = create_anchor(content, 2, 4);
        assert!(content.is_char_boundary(anchor.offset as usize));
        assert!(resolve_offset(content, &anchor).is_some());
    }
}
