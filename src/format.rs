//! Display formatting for log-directory strings.
//!
//! A log-directory string follows a small grammar:
//!
//! ```text
//! path    := segment (',' segment)*
//! segment := (label ':')? rawpath
//! ```
//!
//! Labels are only recognised when more than one segment is present, matching
//! how multi-log instances are configured. Each path is shown relative to the
//! workspace root when it lives under it.

/// Rendered in place of a path that is exactly the workspace root.
pub const WORKSPACE_ROOT_SENTINEL: &str = "<workspace_root>";

const SEGMENT_SEPARATOR: char = ',';
const LABEL_SEPARATOR: char = ':';
const PATH_SEPARATORS: [char; 2] = ['/', '\\'];

/// One entry of a (possibly multi-directory) log-directory string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub label: Option<&'a str>,
    pub path: &'a str,
}

/// Parsed form of a log-directory string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSpec<'a> {
    segments: Vec<Segment<'a>>,
}

impl<'a> DirSpec<'a> {
    pub fn parse(input: &'a str) -> Self {
        if !input.contains(SEGMENT_SEPARATOR) {
            return Self {
                segments: vec![Segment {
                    label: None,
                    path: input,
                }],
            };
        }
        let segments = input.split(SEGMENT_SEPARATOR).map(parse_segment).collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment<'a>] {
        &self.segments
    }

    pub fn is_multi(&self) -> bool {
        self.segments.len() > 1
    }
}

fn parse_segment(raw: &str) -> Segment<'_> {
    if let Some((label, path)) = raw.split_once(LABEL_SEPARATOR) {
        if is_label(label, path) {
            return Segment {
                label: Some(label),
                path,
            };
        }
    }
    Segment {
        label: None,
        path: raw,
    }
}

fn is_label(candidate: &str, rest: &str) -> bool {
    if candidate.is_empty() || candidate.contains(PATH_SEPARATORS) {
        return false;
    }
    // `C:\logs` is a drive letter, not a label.
    let drive_letter = candidate.len() == 1
        && candidate.chars().all(|c| c.is_ascii_alphabetic())
        && rest.starts_with(PATH_SEPARATORS);
    !drive_letter
}

/// Returns the remainder of `path` below `root`, or `None` when `path` is not
/// under `root`.
///
/// Matches only on path-component boundaries rather than as a raw string
/// prefix, so `/home/user2` is not under `/home/user`.
fn strip_root<'p>(root: &str, path: &'p str) -> Option<&'p str> {
    let root = root.trim_end_matches(PATH_SEPARATORS);
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        return Some(rest);
    }
    if rest.starts_with(PATH_SEPARATORS) {
        return Some(rest.trim_start_matches(PATH_SEPARATORS));
    }
    None
}

fn format_path(root: &str, path: &str) -> String {
    match strip_root(root, path) {
        Some(rel) => {
            let rel = rel.trim_end_matches(PATH_SEPARATORS);
            if rel.is_empty() {
                WORKSPACE_ROOT_SENTINEL.to_string()
            } else {
                rel.to_string()
            }
        }
        None => path.to_string(),
    }
}

/// Format `dir` for display relative to `root`.
///
/// With no root (static config unavailable) the input is returned unchanged.
pub fn format_dir(root: Option<&str>, dir: &str) -> String {
    let root = match root {
        Some(r) if !r.is_empty() => r,
        _ => return dir.to_string(),
    };
    let parsed = DirSpec::parse(dir);
    if !parsed.is_multi() {
        return format_path(root, dir);
    }
    parsed
        .segments()
        .iter()
        .map(|seg| {
            let formatted = format_path(root, seg.path);
            match seg.label {
                Some(label) => format!("{label}{LABEL_SEPARATOR}{formatted}"),
                None => formatted,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
