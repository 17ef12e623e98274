//! Protection of Markdown/HTML syntactic units that must not be split by an
//! annotation boundary: HTML tags, Markdown links and images, and ATX header
//! prefixes.
//!
//! Detection is index scanning over the raw source, not a real parser. That
//! mirrors the documented behavior this module reproduces (known limits:
//! nested brackets inside link text, tags with `>` in attribute values).

/// Backward link scans and candidate link spans are capped to this many lines
/// so stray brackets in a large document are not misread as one giant link.
const MAX_LINK_SPAN_LINES: usize = 5;

/// A span that must be wrapped whole or not at all. `end` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectionRange {
    pub start: usize,
    pub end: usize,
}

/// Returns the syntactic unit enclosing `offset`, if any.
///
/// HTML tags are checked first, then Markdown links/images; header prefixes
/// are a separate, forward-only rule (see [`header_prefix_end`]).
pub fn protection_at(content: &str, offset: usize) -> Option<ProtectionRange> {
    let offset = floor_char_boundary(content, offset);
    html_tag_at(content, offset).or_else(|| link_span_at(content, offset))
}

/// If `offset` falls within a `#`-prefix of an ATX header line (the `#` run
/// plus one optional space), returns the end of that prefix. Boundary points
/// inside the prefix are nudged forward past it, never backward.
pub fn header_prefix_end(content: &str, offset: usize) -> Option<usize> {
    let offset = floor_char_boundary(content, offset);
    let line_start = content[..offset].rfind('\n').map_or(0, |pos| pos + 1);
    let bytes = content.as_bytes();

    let mut cursor = line_start;
    while cursor < bytes.len() && bytes[cursor] == b'#' {
        cursor += 1;
    }
    if cursor == line_start {
        return None;
    }
    if bytes.get(cursor) == Some(&b' ') {
        cursor += 1;
    }
    (offset < cursor).then_some(cursor)
}

/// Protect a single-line `<...>` tag span when `offset` splits it.
///
/// A `<` immediately followed by whitespace is not a tag opener, and tags
/// spanning newlines are treated as plain text.
fn html_tag_at(content: &str, offset: usize) -> Option<ProtectionRange> {
    let bytes = content.as_bytes();
    let upto = offset.min(content.len());
    let lt = if bytes.get(upto) == Some(&b'<') {
        upto
    } else {
        content[..upto].rfind('<')?
    };

    match bytes.get(lt + 1) {
        None => return None,
        Some(next) if next.is_ascii_whitespace() => return None,
        Some(_) => {}
    }

    let gt = lt + content[lt..].find('>')?;
    if lt < offset && offset <= gt && !content[lt..=gt].contains('\n') {
        Some(ProtectionRange {
            start: lt,
            end: gt + 1,
        })
    } else {
        None
    }
}

/// Protect a Markdown link `[text](url)` / `[text][ref]` or image `![...]`
/// span when `offset` splits it.
fn link_span_at(content: &str, offset: usize) -> Option<ProtectionRange> {
    let bytes = content.as_bytes();
    let scan_floor = lines_back_floor(content, offset);
    let mut cursor = offset.min(content.len());

    while cursor > scan_floor {
        let open = prev_open_bracket(bytes, scan_floor, cursor)?;
        if let Some(range) = link_span_from(content, open, offset) {
            return Some(range);
        }
        // Not link syntax (plain brackets, unclosed, or a span that does not
        // reach the offset): keep searching further back for an enclosing
        // candidate.
        cursor = open;
    }
    None
}

fn link_span_from(content: &str, open: usize, offset: usize) -> Option<ProtectionRange> {
    let bytes = content.as_bytes();
    let start = if open > 0 && bytes[open - 1] == b'!' {
        open - 1
    } else {
        open
    };

    let close = matching_close_bracket(bytes, open)?;
    let end = match bytes.get(close + 1) {
        Some(b'(') => matching_close_paren(bytes, close + 1)? + 1,
        Some(b'[') => close + 2 + content[close + 2..].find(']')? + 1,
        _ => return None,
    };

    if content[start..end].matches('\n').count() + 1 > MAX_LINK_SPAN_LINES {
        return None;
    }
    (start < offset && offset < end).then_some(ProtectionRange { start, end })
}

/// Nearest `[` before `cursor`, scanning no further back than `floor`.
fn prev_open_bracket(bytes: &[u8], floor: usize, cursor: usize) -> Option<usize> {
    let mut index = cursor;
    while index > floor {
        index -= 1;
        if bytes[index] == b'[' {
            return Some(index);
        }
    }
    None
}

fn matching_close_bracket(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, byte) in bytes.iter().enumerate().skip(open + 1) {
        match byte {
            b'[' => depth += 1,
            b']' => {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn matching_close_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, byte) in bytes.iter().enumerate().skip(open + 1) {
        match byte {
            b'(' => depth += 1,
            b')' => {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Start of the line `MAX_LINK_SPAN_LINES - 1` lines above the offset's line.
fn lines_back_floor(content: &str, offset: usize) -> usize {
    let mut floor = offset.min(content.len());
    for _ in 0..MAX_LINK_SPAN_LINES {
        match content[..floor].rfind('\n') {
            Some(pos) => floor = pos,
            None => return 0,
        }
    }
    floor + 1
}

fn floor_char_boundary(content: &str, index: usize) -> usize {
    let mut index = index.min(content.len());
    while index > 0 && !content.is_char_boundary(index) {
        index -= 1;
    }
    index
}
