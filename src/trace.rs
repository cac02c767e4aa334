// src/trace.rs

//! Stack-trace extraction from raw process output.
//!
//! [`extract`] is a pure function: given the captured output text, the
//! invocation's two-capture file/line pattern, and the working directory it
//! ran in, it produces structured [`StackFrame`]s plus the output trimmed
//! to start at the first traceback line. The multiplexer runs it during
//! failure post-processing; a pattern that matches nothing simply yields no
//! frames, never an error.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Optional context printed between two file references, e.g. Python's
/// `in foo` / source-line pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallingContext {
    pub function_label: String,
    pub source_snippet: String,
}

/// One parsed entry of a failure stack trace, in output order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file_path: PathBuf,
    pub line_number: u32,
    pub calling_context: Option<CallingContext>,
}

/// Opaque token invalidating stale cached frame references held by
/// surfaces. Strictly increases on every recompute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

/// The frames captured from one failing run, replaced wholesale by the
/// next failing run for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceRecord {
    pub frames: Vec<StackFrame>,
    pub generation: Generation,
    pub working_dir: PathBuf,
}

/// Secondary pattern attaching calling context to a frame: the text
/// strictly between two file references is scanned for
/// `in <label>` followed by a snippet line.
fn context_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"in\s+([^\n]+)\n[ \t]*([^\n]+)").expect("static pattern"))
}

/// Extract stack frames from `raw`.
///
/// - `file_line` must have two capture groups: group 1 the file reference,
///   group 2 the line number. Fewer groups is a caller configuration
///   error.
/// - Returns `(frames, Some(trimmed))` where `trimmed` is the suffix of
///   `raw` starting at the first match, or `(vec![], None)` when nothing
///   matches.
pub fn extract(
    raw: &str,
    file_line: &Regex,
    working_dir: &Path,
) -> (Vec<StackFrame>, Option<String>) {
    let first = match file_line.find(raw) {
        Some(m) => m,
        None => return (Vec::new(), None),
    };
    // Output printed before the first traceback line is dropped from the
    // user-facing failure panel.
    let trimmed = &raw[first.start()..];

    let matches: Vec<regex::Captures<'_>> = file_line.captures_iter(trimmed).collect();
    let mut frames = Vec::with_capacity(matches.len());

    for (i, caps) in matches.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let file_ref = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let line_number = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0);

        let segment_end = matches
            .get(i + 1)
            .and_then(|c| c.get(0))
            .map(|m| m.start())
            .unwrap_or(trimmed.len());
        let between = &trimmed[whole.end()..segment_end];

        frames.push(StackFrame {
            file_path: resolve_file_ref(working_dir, file_ref),
            line_number,
            calling_context: parse_context(between),
        });
    }

    (frames, Some(trimmed.to_string()))
}

/// Best-effort resolution of a reported file reference.
///
/// The reference is joined onto the working directory first; if that path
/// does not exist but the reference taken verbatim does, the verbatim form
/// wins. Unresolvable references keep the joined form.
fn resolve_file_ref(working_dir: &Path, file_ref: &str) -> PathBuf {
    let joined = working_dir.join(file_ref);
    if !joined.exists() && Path::new(file_ref).exists() {
        return PathBuf::from(file_ref);
    }
    joined
}

fn parse_context(between: &str) -> Option<CallingContext> {
    let caps = context_pattern().captures(between)?;
    let mut label = caps.get(1)?.as_str().trim().to_string();
    let snippet = caps.get(2)?.as_str().trim().to_string();
    if !label.ends_with('>') {
        label.push_str("()");
    }
    Some(CallingContext {
        function_label: label,
        source_snippet: snippet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn python_pattern() -> Regex {
        Regex::new(r#"File "(.*?)", line ([0-9]+)"#).unwrap()
    }

    #[test]
    fn no_match_yields_no_frames_and_no_trimmed_text() {
        let (frames, trimmed) =
            extract("all fine here\n", &python_pattern(), Path::new("/proj"));
        assert!(frames.is_empty());
        assert!(trimmed.is_none());
    }

    #[test]
    fn two_frames_in_source_order_with_trim_at_first_match() {
        let raw = "noise before\nFile \"a.py\", line 5\nmiddle\nFile \"b.py\", line 9\n";
        let (frames, trimmed) = extract(raw, &python_pattern(), Path::new("/proj"));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].file_path, PathBuf::from("/proj/a.py"));
        assert_eq!(frames[0].line_number, 5);
        assert_eq!(frames[1].file_path, PathBuf::from("/proj/b.py"));
        assert_eq!(frames[1].line_number, 9);

        let trimmed = trimmed.unwrap();
        assert!(trimmed.starts_with("File \"a.py\", line 5"));
        assert_eq!(trimmed, &raw[raw.find("File").unwrap()..]);
    }

    #[test]
    fn context_attaches_to_the_frame_it_follows() {
        let raw = "File \"a.py\", line 5\nin foo\n    x = 1\nFile \"b.py\", line 9";
        let (frames, _) = extract(raw, &python_pattern(), Path::new("/proj"));

        assert_eq!(frames.len(), 2);
        let ctx = frames[0].calling_context.as_ref().unwrap();
        assert_eq!(ctx.function_label, "foo()");
        assert_eq!(ctx.source_snippet, "x = 1");
        assert!(frames[1].calling_context.is_none());
    }

    #[test]
    fn module_level_label_keeps_angle_bracket_form() {
        let raw = "File \"a.py\", line 1\nin <module>\n    import b\n";
        let (frames, _) = extract(raw, &python_pattern(), Path::new("/proj"));
        let ctx = frames[0].calling_context.as_ref().unwrap();
        assert_eq!(ctx.function_label, "<module>");
    }

    #[test]
    fn last_frame_context_runs_to_end_of_text() {
        let raw = "File \"a.py\", line 5\nin main\n    run()\n";
        let (frames, _) = extract(raw, &python_pattern(), Path::new("/proj"));
        assert_eq!(frames.len(), 1);
        let ctx = frames[0].calling_context.as_ref().unwrap();
        assert_eq!(ctx.function_label, "main()");
        assert_eq!(ctx.source_snippet, "run()");
    }

    #[test]
    fn joined_path_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("f.py"), "x = 1\n").unwrap();

        let raw = "File \"sub/f.py\", line 1\n";
        let (frames, _) = extract(raw, &python_pattern(), dir.path());
        assert_eq!(frames[0].file_path, dir.path().join("sub/f.py"));
    }

    #[test]
    fn raw_reference_wins_when_joined_path_is_missing() {
        let work = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let abs = elsewhere.path().join("f.py");
        std::fs::write(&abs, "x = 1\n").unwrap();

        let raw = format!("File \"{}\", line 1\n", abs.display());
        let (frames, _) = extract(&raw, &python_pattern(), work.path());
        // Joining an absolute path onto the working dir yields the absolute
        // path again on Unix, so both branches agree here; the interesting
        // case is a relative ref that only resolves from the process cwd.
        assert_eq!(frames[0].file_path, abs);
    }

    #[test]
    fn unresolvable_reference_keeps_joined_form() {
        let raw = "File \"nope/missing.py\", line 3\n";
        let (frames, _) = extract(raw, &python_pattern(), Path::new("/definitely/not/here"));
        assert_eq!(
            frames[0].file_path,
            PathBuf::from("/definitely/not/here/nope/missing.py")
        );
    }

    proptest! {
        #[test]
        fn extraction_never_panics(raw in ".{0,400}") {
            let _ = extract(&raw, &python_pattern(), Path::new("/proj"));
        }

        #[test]
        fn frame_count_equals_match_count(n in 0usize..6) {
            let raw: String = (0..n)
                .map(|i| format!("File \"f{i}.py\", line {}\n", i + 1))
                .collect();
            let (frames, trimmed) = extract(&raw, &python_pattern(), Path::new("/proj"));
            prop_assert_eq!(frames.len(), n);
            prop_assert_eq!(trimmed.is_some(), n > 0);
        }
    }
}
