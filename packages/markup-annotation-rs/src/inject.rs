//! Placeholder injection: converts a set of possibly-overlapping comment
//! ranges into textual placeholder tokens that survive Markdown rendering and
//! are substituted with real wrapper markup afterwards.
//!
//! Overlap is resolved into strictly nested output by a boundary-point sweep:
//! every gap between consecutive points is wrapped with a full open/close
//! token pair for each range active over that gap, so one logical range may
//! span several wrapped segments. The first segment of a range carries a
//! distinguished `first` token, later segments a `cont` token.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protect;

/// One comment range to annotate. `created_at` (RFC 3339) breaks nesting ties
/// between overlapping ranges: newer ranges nest inner.
#[derive(Clone, Debug, Default)]
pub struct AnnotationRange {
    pub offset: usize,
    pub length: usize,
    pub created_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointKind {
    Start,
    End,
}

/// A post-snap boundary point, reported back for caller bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPoint {
    pub offset: usize,
    pub kind: PointKind,
    pub thread_index: usize,
}

#[derive(Clone, Debug)]
pub struct InjectOutcome {
    pub content: String,
    pub points: Vec<ResolvedPoint>,
}

/// Matches every placeholder token this module emits. Capture 1/2 carry the
/// index and segment kind of a start token, capture 3 the index of an end
/// token.
pub static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@@comment-(?:start:(\d+):(first|cont)|end:(\d+))@@")
        .expect("valid placeholder regex")
});

pub fn start_token(index: usize, first: bool) -> String {
    let kind = if first { "first" } else { "cont" };
    format!("@@comment-start:{index}:{kind}@@")
}

pub fn end_token(index: usize) -> String {
    format!("@@comment-end:{index}@@")
}

/// Sweep-point ordering rank: ranges close before new ones open at the same
/// offset, and collapsed pairs land between the two.
const RANK_END: u8 = 0;
const RANK_COLLAPSED: u8 = 1;
const RANK_START: u8 = 2;

#[derive(Clone, Copy, Debug)]
struct SweepPoint {
    offset: usize,
    rank: u8,
    index: usize,
}

/// Inject placeholder tokens for `ranges` into `content`.
///
/// Boundary points are snapped outward over protected syntax first, so a tag,
/// link or header prefix is never split; ranges that collapse to zero width
/// after snapping emit a single empty `first`+end pair at their point.
pub fn inject(content: &str, ranges: &[AnnotationRange]) -> InjectOutcome {
    let spans: Vec<(usize, usize)> = ranges
        .iter()
        .map(|range| {
            let raw_start = floor_char_boundary(content, range.offset);
            let raw_end =
                floor_char_boundary(content, range.offset.saturating_add(range.length));
            let start = snap_point(content, raw_start, PointKind::Start);
            let end = snap_point(content, raw_end.max(raw_start), PointKind::End);
            (start, end.max(start))
        })
        .collect();

    let mut points: Vec<SweepPoint> = Vec::with_capacity(spans.len() * 2);
    for (index, (start, end)) in spans.iter().enumerate() {
        if start == end {
            points.push(SweepPoint {
                offset: *start,
                rank: RANK_COLLAPSED,
                index,
            });
        } else {
            points.push(SweepPoint {
                offset: *end,
                rank: RANK_END,
                index,
            });
            points.push(SweepPoint {
                offset: *start,
                rank: RANK_START,
                index,
            });
        }
    }
    points.sort_by(|a, b| {
        a.offset
            .cmp(&b.offset)
            .then(a.rank.cmp(&b.rank))
            .then(a.index.cmp(&b.index))
    });

    let mut output = String::with_capacity(content.len() + ranges.len() * 48);
    let mut resolved: Vec<ResolvedPoint> = Vec::with_capacity(spans.len() * 2);
    let mut last_offset = 0usize;
    let mut active: Vec<usize> = Vec::new();
    let mut first_pending: Vec<bool> = vec![true; ranges.len()];

    for point in &points {
        if point.offset > last_offset {
            emit_segment(
                &mut output,
                &content[last_offset..point.offset],
                &active,
                ranges,
                &mut first_pending,
            );
            last_offset = point.offset;
        }
        match point.rank {
            RANK_END => {
                active.retain(|index| *index != point.index);
                resolved.push(ResolvedPoint {
                    offset: point.offset,
                    kind: PointKind::End,
                    thread_index: point.index,
                });
            }
            RANK_COLLAPSED => {
                output.push_str(&start_token(point.index, true));
                output.push_str(&end_token(point.index));
                first_pending[point.index] = false;
                resolved.push(ResolvedPoint {
                    offset: point.offset,
                    kind: PointKind::Start,
                    thread_index: point.index,
                });
                resolved.push(ResolvedPoint {
                    offset: point.offset,
                    kind: PointKind::End,
                    thread_index: point.index,
                });
            }
            _ => {
                active.push(point.index);
                resolved.push(ResolvedPoint {
                    offset: point.offset,
                    kind: PointKind::Start,
                    thread_index: point.index,
                });
            }
        }
    }
    output.push_str(&content[last_offset..]);

    InjectOutcome {
        content: output,
        points: resolved,
    }
}

/// Snap a boundary point outward over a protected unit, then forward past a
/// header prefix. Start points move to a protected range's start, end points
/// to its end, so the unit is never split.
fn snap_point(content: &str, offset: usize, kind: PointKind) -> usize {
    let mut offset = offset;
    if let Some(range) = protect::protection_at(content, offset) {
        offset = match kind {
            PointKind::Start => range.start,
            PointKind::End => range.end,
        };
    }
    if let Some(prefix_end) = protect::header_prefix_end(content, offset) {
        offset = prefix_end;
    }
    offset
}

/// Wrap one gap segment with tokens for every active range, ordered outermost
/// to innermost. More specific ranges (higher original offset), then newer
/// ones, then higher indices nest inner.
fn emit_segment(
    output: &mut String,
    text: &str,
    active: &[usize],
    ranges: &[AnnotationRange],
    first_pending: &mut [bool],
) {
    if active.is_empty() {
        output.push_str(text);
        return;
    }

    let mut ordered = active.to_vec();
    ordered.sort_by(|&a, &b| {
        ranges[a]
            .offset
            .cmp(&ranges[b].offset)
            .then_with(|| ranges[a].created_at.cmp(&ranges[b].created_at))
            .then_with(|| a.cmp(&b))
    });

    for &index in &ordered {
        output.push_str(&start_token(index, first_pending[index]));
        first_pending[index] = false;
    }
    output.push_str(text);
    for &index in ordered.iter().rev() {
        output.push_str(&end_token(index));
    }
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

    fn range(offset: usize, length: usize) -> AnnotationRange {
        AnnotationRange {
            offset,
            length,
            created_at: None,
        }
    }

    #[test]
    fn single_range_gets_one_marker_pair() {
        let outcome = inject("Hello world", &[range(0, 5)]);
        assert_eq!(
            outcome.content,
            "@@comment-start:0:first@@Hello@@comment-end:0@@ world"
        );
        assert_eq!(
            outcome.points,
            vec![
                ResolvedPoint {
                    offset: 0,
                    kind: PointKind::Start,
                    thread_index: 0
                },
                ResolvedPoint {
                    offset: 5,
                    kind: PointKind::End,
                    thread_index: 0
                },
            ]
        );
    }

    #[test]
    fn non_overlapping_ranges_do_not_nest() {
        let outcome = inject("one two three", &[range(0, 3), range(8, 5)]);
        assert_eq!(
            outcome.content,
            "@@comment-start:0:first@@one@@comment-end:0@@ two \
             @@comment-start:1:first@@three@@comment-end:1@@"
        );
    }

    #[test]
    fn overlapping_ranges_nest_the_later_one_inner() {
        let outcome = inject("Hello world", &[range(0, 5), range(3, 5)]);
        assert_eq!(
            outcome.content,
            concat!(
                "@@comment-start:0:first@@Hel@@comment-end:0@@",
                "@@comment-start:0:cont@@@@comment-start:1:first@@lo@@comment-end:1@@@@comment-end:0@@",
                "@@comment-start:1:cont@@ wo@@comment-end:1@@",
                "rld",
            )
        );
    }

    #[test]
    fn identical_ranges_nest_by_index() {
        let outcome = inject("abcdef", &[range(1, 3), range(1, 3)]);
        assert_eq!(
            outcome.content,
            concat!(
                "a",
                "@@comment-start:0:first@@@@comment-start:1:first@@bcd",
                "@@comment-end:1@@@@comment-end:0@@",
                "ef",
            )
        );
    }

    #[test]
    fn newer_range_nests_inner_on_equal_offsets() {
        let mut older = range(2, 4);
        older.created_at = Some("2024-01-01T00:00:00Z".to_string());
        let mut newer = range(2, 4);
        newer.created_at = Some("2024-06-01T00:00:00Z".to_string());
        // Deliberately pass the newer one first: recency, not input order,
        // decides nesting.
        let outcome = inject("abcdefgh", &[newer, older]);
        assert_eq!(
            outcome.content,
            concat!(
                "ab",
                "@@comment-start:1:first@@@@comment-start:0:first@@cdef",
                "@@comment-end:0@@@@comment-end:1@@",
                "gh",
            )
        );
    }

    #[test]
    fn zero_length_range_emits_collapsed_pair() {
        let outcome = inject("abcdef", &[range(3, 0)]);
        assert_eq!(
            outcome.content,
            "abc@@comment-start:0:first@@@@comment-end:0@@def"
        );
        assert_eq!(outcome.points.len(), 2);
    }

    #[test]
    fn range_inside_html_tag_wraps_the_whole_tag() {
        let outcome = inject("<div>Target</div>", &[range(1, 3)]);
        assert_eq!(
            outcome.content,
            "@@comment-start:0:first@@<div>@@comment-end:0@@Target</div>"
        );
    }

    #[test]
    fn range_inside_link_text_wraps_the_whole_link() {
        let outcome = inject("Click [Here](http://url)", &[range(7, 4)]);
        assert_eq!(
            outcome.content,
            "Click @@comment-start:0:first@@[Here](http://url)@@comment-end:0@@"
        );
    }

    #[test]
    fn header_prefix_stays_unwrapped() {
        let outcome = inject("# Header", &[range(0, 1)]);
        assert!(outcome.content.starts_with("# "));
        assert_eq!(
            outcome.content,
            "# @@comment-start:0:first@@@@comment-end:0@@Header"
        );
    }

    #[test]
    fn range_over_heading_text_starts_past_the_prefix() {
        let outcome = inject("## Title here", &[range(1, 8)]);
        // Start point sits in the prefix, end point in the heading text.
        assert_eq!(
            outcome.content,
            "## @@comment-start:0:first@@Title @@comment-end:0@@here"
        );
    }

    #[test]
    fn end_point_inside_tag_snaps_past_it() {
        let outcome = inject("text <b>bold</b> tail", &[range(0, 7)]);
        assert_eq!(
            outcome.content,
            "@@comment-start:0:first@@text <b>@@comment-end:0@@bold</b> tail"
        );
    }

    #[test]
    fn out_of_range_offsets_are_clamped() {
        let outcome = inject("short", &[range(2, 99)]);
        assert_eq!(
            outcome.content,
            "sh@@comment-start:0:first@@ort@@comment-end:0@@"
        );
    }

    #[test]
    fn trailing_content_is_preserved() {
        let outcome = inject("abc def ghi", &[range(4, 3)]);
        assert!(outcome.content.ends_with(" ghi"));
    }

    #[test]
    fn placeholder_regex_matches_emitted_tokens() {
        assert!(PLACEHOLDER_RE.is_match(&start_token(3, true)));
        assert!(PLACEHOLDER_RE.is_match(&start_token(3, false)));
        assert!(PLACEHOLDER_RE.is_match(&end_token(3)));
        assert!(!PLACEHOLDER_RE.is_match("@@comment-start:x:first@@"));
    }
}
