//! tb_traceback
//!
//! Detects and parses Python tracebacks pasted into chat. Two tracebacks
//! with the same exception type, the same (sanitized) message shape, and
//! the same project-local call stack are considered "the same crash" —
//! `ParsedTraceback::signature()` is the hash the matcher and the
//! fingerprint-dedup layer key off of.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TracebackError {
    /// Detection said "this looks like a traceback" but no frame could be
    /// extracted — usually a mangled paste or an unsupported traceback
    /// dialect (e.g. a non-Python stack trace that happens to contain the
    /// word "Traceback").
    #[error("traceback detected but no stack frame could be parsed")]
    ParseError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
    pub source_line: Option<String>,
}

impl StackFrame {
    /// Frames under a site-packages/stdlib-ish prefix aren't "the user's
    /// code" — used to build `project_frames` and the matcher's query.
    pub fn looks_like_dependency(&self) -> bool {
        let f = &self.file;
        f.contains("/site-packages/")
            || f.contains("\\site-packages\\")
            || f.contains("/dist-packages/")
            || f.starts_with("<")
            || is_stdlib_path(f)
    }

    pub fn basename(&self) -> &str {
        self.file.rsplit(['/', '\\']).next().unwrap_or(&self.file)
    }
}

fn is_stdlib_path(f: &str) -> bool {
    // crude heuristic: CPython installs under .../lib/python3.x/...
    // with no site-packages segment.
    f.contains("/lib/python3") && !f.contains("site-packages")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTraceback {
    pub frames: Vec<StackFrame>,
    pub exception_type: String,
    pub exception_message: String,
    pub is_chained: bool,
    pub raw_text: String,
}

impl ParsedTraceback {
    pub fn project_frames(&self) -> Vec<&StackFrame> {
        self.frames.iter().filter(|f| !f.looks_like_dependency()).collect()
    }

    pub fn innermost_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Deterministic string used both as the matcher's cache key component
    /// and as the fingerprint-dedup key (paired with the repo):
    /// `"<ExceptionType>: <first line of message>"`. Exception type plus
    /// message alone (no paths, no line numbers) is what lets two pastes of
    /// the same crash from different machines collapse to the same
    /// signature.
    pub fn signature(&self) -> String {
        let first_line = self.exception_message.lines().next().unwrap_or("");
        format!("{}: {}", self.exception_type, first_line)
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\n(.*?)```").unwrap())
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap())
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*File "(?P<file>[^"]+)", line (?P<line>\d+), in (?P<func>.+)$"#).unwrap()
    })
}

/// `SyntaxError`/`IndentationError`/`TabError` pastes have a single
/// header line with no `, in <func>` suffix (there's no call frame, just
/// the file and line the parser choked on), optionally followed by a
/// caret-pointer snippet rather than a source line.
fn syntax_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)\s*$"#).unwrap())
}

fn exception_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?P<type>[A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Warning|Interrupt|Exit))(?::\s?(?P<msg>.*))?$").unwrap()
    })
}

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";
const CHAINED_MARKERS: [&str; 2] = [
    "The above exception was the direct cause of the following exception:",
    "During handling of the above exception, another exception occurred:",
];

/// Cheap pre-check before doing any real parsing: does this text contain
/// anything that looks like a Python traceback header or a bare exception
/// tail line?
pub fn contains_traceback(text: &str) -> bool {
    text.contains(TRACEBACK_HEADER) || exception_tail_re().is_match(text)
}

/// Strip markdown code fences and ANSI color escapes, returning the plain
/// text most likely to contain a traceback. If the text contains fenced
/// code blocks, only the fenced contents are considered (chat messages
/// commonly wrap the paste in triple backticks and add commentary
/// outside them).
pub fn extract_plain_text(text: &str) -> String {
    let de_ansi = ansi_re().replace_all(text, "");
    let fenced: Vec<String> = fence_re()
        .captures_iter(&de_ansi)
        .map(|c| c[1].to_string())
        .collect();
    if fenced.is_empty() {
        de_ansi.into_owned()
    } else {
        fenced.join("\n")
    }
}

/// Parse the single traceback that starts at `text`'s first
/// `TRACEBACK_HEADER` (or at an exception tail line with no header, for
/// truncated pastes). Returns `Err(ParseError)` if detection matched but
/// no frame could be pulled out.
pub fn parse(text: &str) -> Result<ParsedTraceback, TracebackError> {
    let plain = extract_plain_text(text);
    if !contains_traceback(&plain) {
        return Err(TracebackError::ParseError);
    }
    parse_block(&plain)
}

/// Find and parse every disjoint traceback block in `text` — a single
/// chat message can legitimately contain more than one paste.
pub fn extract_all(text: &str) -> Vec<ParsedTraceback> {
    let plain = extract_plain_text(text);
    let mut out = Vec::new();
    let mut search_from = 0usize;
    while let Some(rel) = plain[search_from..].find(TRACEBACK_HEADER) {
        let start = search_from + rel;
        let next_rel = plain[start + TRACEBACK_HEADER.len()..].find(TRACEBACK_HEADER);
        let end = match next_rel {
            Some(r) => start + TRACEBACK_HEADER.len() + r,
            None => plain.len(),
        };
        if let Ok(parsed) = parse_block(&plain[start..end]) {
            out.push(parsed);
        }
        search_from = end;
        if search_from >= plain.len() {
            break;
        }
    }
    out
}

fn parse_block(block: &str) -> Result<ParsedTraceback, TracebackError> {
    let is_chained = CHAINED_MARKERS.iter().any(|m| block.contains(m));

    // A chained traceback can contain multiple "Traceback (most recent
    // call last):" headers; the one the user actually hit is the LAST
    // one, since that's what CPython prints as the final raised
    // exception.
    let last_header_pos = {
        let mut pos = None;
        let mut search = 0usize;
        while let Some(rel) = block[search..].find(TRACEBACK_HEADER) {
            pos = Some(search + rel);
            search = search + rel + TRACEBACK_HEADER.len();
        }
        pos
    };
    let body = match last_header_pos {
        Some(p) => &block[p..],
        None => block,
    };

    let mut frames = Vec::new();
    for cap in frame_re().captures_iter(body) {
        let file = cap["file"].to_string();
        let line: u32 = match cap["line"].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let function = cap["func"].trim().to_string();
        // An optional source line follows the File line, indented and
        // not itself matching the frame pattern.
        let frame_end = cap.get(0).unwrap().end();
        let source_line = body[frame_end..]
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("File \""))
            .map(str::to_string);
        frames.push(StackFrame { file, line, function, source_line });
    }

    // No `, in <func>` frames found — try the SyntaxError-class header-only
    // form (`File "...", line N` with no function, no required source line).
    if frames.is_empty() {
        if let Some(cap) = syntax_header_re().captures_iter(body).last() {
            let file = cap["file"].to_string();
            if let Ok(line) = cap["line"].parse::<u32>() {
                let frame_end = cap.get(0).unwrap().end();
                let source_line = body[frame_end..]
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string);
                frames.push(StackFrame { file, line, function: "<module>".to_string(), source_line });
            }
        }
    }

    if frames.is_empty() {
        return Err(TracebackError::ParseError);
    }

    let (exception_type, exception_message) = parse_exception_tail(body);

    Ok(ParsedTraceback {
        frames,
        exception_type,
        exception_message,
        is_chained,
        raw_text: block.trim().to_string(),
    })
}

fn parse_exception_tail(body: &str) -> (String, String) {
    // Walk backwards from the end looking for the last line matching the
    // exception-tail pattern; a truncated paste (cut off mid-traceback)
    // has no such line at all, in which case we fall back to a sentinel
    // exception type so the pipeline can still reply, just without a
    // precise signature.
    for line in body.lines().rev() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = exception_tail_re().captures(trimmed) {
            let ty = caps["type"].to_string();
            let msg = caps.name("msg").map(|m| m.as_str().to_string()).unwrap_or_default();
            return (ty, msg);
        }
        // Stop scanning once we hit a frame line without finding a tail —
        // anything past this point is source-line noise, not the
        // exception.
        if trimmed.trim_start().starts_with("File \"") {
            break;
        }
    }
    ("<truncated>".to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"Traceback (most recent call last):
  File "/app/handlers/orders.py", line 42, in process_order
    total = compute_total(order)
  File "/app/lib/pricing.py", line 17, in compute_total
    return order.items[0].price * order.quantity
IndexError: list index out of range"#;

    #[test]
    fn detects_plain_traceback() {
        assert!(contains_traceback(SIMPLE));
        assert!(!contains_traceback("just a normal chat message"));
    }

    #[test]
    fn parses_frames_and_exception() {
        let parsed = parse(SIMPLE).unwrap();
        assert_eq!(parsed.frames.len(), 2);
        assert_eq!(parsed.exception_type, "IndexError");
        assert_eq!(parsed.exception_message, "list index out of range");
        assert!(!parsed.is_chained);
    }

    #[test]
    fn strips_markdown_fences_before_parsing() {
        let wrapped = format!("here's the error:\n```\n{SIMPLE}\n```\nany ideas?");
        let parsed = parse(&wrapped).unwrap();
        assert_eq!(parsed.exception_type, "IndexError");
    }

    #[test]
    fn chained_traceback_uses_final_exception() {
        let chained = format!(
            "{SIMPLE}\n\nThe above exception was the direct cause of the following exception:\n\nTraceback (most recent call last):\n  File \"/app/main.py\", line 9, in <module>\n    run()\nRuntimeError: order processing failed"
        );
        let parsed = parse(&chained).unwrap();
        assert!(parsed.is_chained);
        assert_eq!(parsed.exception_type, "RuntimeError");
        assert_eq!(parsed.frames.len(), 1);
    }

    #[test]
    fn dependency_frames_are_excluded_from_project_frames() {
        let with_dep = format!(
            "Traceback (most recent call last):\n  File \"/usr/lib/python3.11/site-packages/requests/api.py\", line 5, in get\n    pass\n  File \"/app/fetch.py\", line 3, in run\n    get()\nConnectionError: boom"
        );
        let parsed = parse(&with_dep).unwrap();
        assert_eq!(parsed.project_frames().len(), 1);
        assert_eq!(parsed.project_frames()[0].basename(), "fetch.py");
    }

    #[test]
    fn truncated_traceback_uses_sentinel_exception_type() {
        let truncated = "Traceback (most recent call last):\n  File \"/app/x.py\", line 1, in f\n    do_thing()\n";
        let parsed = parse(truncated).unwrap();
        assert_eq!(parsed.exception_type, "<truncated>");
    }

    #[test]
    fn detection_without_frames_is_parse_error() {
        let bogus = "Traceback (most recent call last):\nnot actually a frame line";
        assert_eq!(parse(bogus), Err(TracebackError::ParseError));
    }

    #[test]
    fn extract_all_finds_multiple_disjoint_blocks() {
        let two = format!("first one:\n{SIMPLE}\n\nand a second later:\n{SIMPLE}");
        let all = extract_all(&two);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn signature_is_stable_across_absolute_path_changes() {
        let other_machine = SIMPLE.replace("/app/", "/home/ci/checkout/");
        let a = parse(SIMPLE).unwrap();
        let b = parse(&other_machine).unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_is_exception_type_colon_first_message_line() {
        let parsed = parse(SIMPLE).unwrap();
        assert_eq!(parsed.signature(), "IndexError: list index out of range");
    }

    #[test]
    fn parses_syntax_error_header_only_frame() {
        let syntax_err = "  File \"/app/handlers/orders.py\", line 12\n    def process(\n               ^\nSyntaxError: unexpected EOF while parsing";
        let parsed = parse(syntax_err).unwrap();
        assert_eq!(parsed.frames.len(), 1);
        assert_eq!(parsed.frames[0].function, "<module>");
        assert_eq!(parsed.frames[0].line, 12);
        assert_eq!(parsed.exception_type, "SyntaxError");
        assert_eq!(parsed.signature(), "SyntaxError: unexpected EOF while parsing");
    }

    #[test]
    fn parses_indentation_error_after_traceback_header() {
        let text = "Traceback (most recent call last):\n  File \"/app/main.py\", line 3, in <module>\n    import pkg\n  File \"/app/pkg/__init__.py\", line 5\n    def run():\n             ^\nIndentationError: expected an indented block";
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.exception_type, "IndentationError");
        // both the normal frame and the header-only SyntaxError-class frame
        // are captured by the regular frame path and fall through here only
        // if no `, in` frame matched; this text has one `, in` frame so the
        // header-only path is not exercised, but detection + tail parsing
        // must still succeed for this exception family.
        assert_eq!(parsed.frames.len(), 1);
    }
}
