//! Total parser for request paths.

use super::params::{Filter, Params};
use regex::Regex;
use std::sync::LazyLock;

/// Shortest first segment treated as a signature candidate.
///
/// Covers full HMAC-SHA1 (28 chars with padding), truncated HMAC-SHA256
/// (40) and HMAC-SHA512 (88) while never colliding with operation tokens.
/// A signer truncating below this length produces signatures the parser
/// cannot recognize, so configurations must keep truncation at or above
/// it (the server CLI rejects shorter values outright).
pub const MIN_SIGNATURE_LEN: usize = 24;

/// A signature candidate: base64url alphabet, [`MIN_SIGNATURE_LEN`]
/// characters or more.
static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^[A-Za-z0-9_=-]{{{MIN_SIGNATURE_LEN},}}$")).expect("signature regex")
});

static DIMENSIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?\d+)x(-?\d+)$").expect("dimensions regex"));

/// Parses a URL path into [`Params`].
///
/// The parser never fails: anything it does not recognize is left in
/// `path`/`image` verbatim. A leading `params/` segment (the echo
/// endpoint prefix) is stripped before parsing.
pub fn parse(path: &str) -> Params {
    let mut p = Params::default();
    let mut rest = path.trim_start_matches('/');
    if let Some(stripped) = rest.strip_prefix("params/") {
        rest = stripped;
    }

    if let Some(stripped) = rest.strip_prefix("unsafe/") {
        p.unsafe_ = true;
        rest = stripped;
    } else if let Some(slash) = rest.find('/') {
        let (seg, after) = (&rest[..slash], &rest[slash + 1..]);
        if SIGNATURE_RE.is_match(seg) {
            p.hash = seg.to_string();
            rest = after;
        }
    }

    p.path = rest.to_string();
    let mut s = rest;

    if let Some(r) = s.strip_prefix("meta/") {
        p.meta = true;
        s = r;
    }

    if let Some(r) = s.strip_prefix("trim/") {
        p.trim = true;
        s = r;
    } else if let Some(r) = s.strip_prefix("trim:top-left/") {
        p.trim = true;
        p.trim_by = "top-left".to_string();
        s = r;
    } else if let Some(r) = s.strip_prefix("trim:bottom-right/") {
        p.trim = true;
        p.trim_by = "bottom-right".to_string();
        s = r;
    }

    if let Some(r) = s.strip_prefix("fit-in/") {
        p.fit_in = true;
        s = r;
    }

    if let Some(slash) = s.find('/') {
        if let Some(caps) = DIMENSIONS_RE.captures(&s[..slash]) {
            let w: i32 = caps[1].parse().unwrap_or(0);
            let h: i32 = caps[2].parse().unwrap_or(0);
            p.h_flip = w < 0;
            p.v_flip = h < 0;
            p.width = w.abs();
            p.height = h.abs();
            s = &s[slash + 1..];
        }
    }

    for align in ["left/", "right/", "center/"] {
        if let Some(r) = s.strip_prefix(align) {
            p.h_align = align.trim_end_matches('/').to_string();
            s = r;
            break;
        }
    }
    for align in ["top/", "bottom/", "middle/"] {
        if let Some(r) = s.strip_prefix(align) {
            p.v_align = align.trim_end_matches('/').to_string();
            s = r;
            break;
        }
    }

    if let Some(r) = s.strip_prefix("smart/") {
        p.smart = true;
        s = r;
    }

    if let Some(list) = s.strip_prefix("filters:") {
        let (chunk, after) = split_at_segment_end(list);
        p.filters = parse_filters(chunk);
        s = after;
    }

    p.image = s.to_string();
    p
}

/// Splits the filters chunk from the rest of the path at the first `/`
/// outside parentheses, so filter arguments may contain URLs.
fn split_at_segment_end(s: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => return (&s[..i], &s[i + 1..]),
            _ => {}
        }
    }
    (s, "")
}

/// Parses a `name(args)[,name(args)...]` filter list. Commas inside
/// parentheses belong to the arguments; `:` is accepted as a separator
/// alongside `,` for compatibility with hand-written paths.
fn parse_filters(list: &str) -> Vec<Filter> {
    let mut filters = Vec::new();
    let mut depth = 0usize;
    let mut name_start = 0usize;
    let mut args_start = 0usize;
    let mut name = "";
    for (i, c) in list.char_indices() {
        match c {
            '(' => {
                if depth == 0 {
                    name = list[name_start..i].trim_matches(|c| c == ',' || c == ':');
                    args_start = i + 1;
                }
                depth += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && !name.is_empty() {
                    filters.push(Filter::new(name, &list[args_start..i]));
                    name = "";
                    name_start = i + 1;
                }
            }
            ',' | ':' if depth == 0 => {
                name_start = i + 1;
            }
            _ => {}
        }
    }
    filters
}
