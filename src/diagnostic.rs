/// Build diagnostics: the entries a failed build reports.
///
/// Recognizes the two shapes most compilers print:
/// - rustc: `error[E0308]: mismatched types` followed by ` --> src/main.rs:3:5`
/// - gcc/clang/go/tsc-like: `src/main.c:3:5: error: expected ';'`
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:fatal )?error(?:\[(?P<code>[A-Za-z0-9]+)\])?:\s*(?P<text>.+)$").unwrap()
});

static ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-->\s*(?P<file>.+?):(?P<line>\d+):(?P<column>\d+)\s*$").unwrap()
});

static INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^\s:][^:]*):(?P<line>\d+):(?P<column>\d+):\s*(?:fatal )?error(?:\[(?P<code>[A-Za-z0-9]+)\])?:\s*(?P<text>.+)$",
    )
    .unwrap()
});

/// Cargo's closing summary repeats the count, not a new error.
const SUMMARY_PREFIXES: &[&str] = &["could not compile", "aborting due to"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub text: String,
    pub code: Option<String>,
    pub location: Option<Location>,
}

impl Diagnostic {
    /// A diagnostic with no code or location.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            code: None,
            location: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.location {
            write!(f, "{}:{}:{}: ", loc.file, loc.line, loc.column)?;
        }
        match &self.code {
            Some(code) => write!(f, "error[{code}]: {}", self.text),
            None => write!(f, "error: {}", self.text),
        }
    }
}

fn location_from(caps: &regex::Captures<'_>) -> Option<Location> {
    Some(Location {
        file: caps.name("file")?.as_str().to_string(),
        line: caps.name("line")?.as_str().parse().ok()?,
        column: caps.name("column")?.as_str().parse().ok()?,
    })
}

/// Extract error diagnostics from compiler output. Warnings and notes are skipped.
pub fn parse(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    // Only the line right after a header may carry its `-->` location.
    let mut awaiting_location = false;

    for line in output.lines().map(str::trim_end) {
        if let Some(caps) = INLINE.captures(line) {
            diagnostics.push(Diagnostic {
                text: caps["text"].to_string(),
                code: caps.name("code").map(|m| m.as_str().to_string()),
                location: location_from(&caps),
            });
            awaiting_location = false;
            continue;
        }

        if let Some(caps) = HEADER.captures(line) {
            let text = &caps["text"];
            if SUMMARY_PREFIXES.iter().any(|p| text.starts_with(p)) {
                awaiting_location = false;
                continue;
            }
            diagnostics.push(Diagnostic {
                text: text.to_string(),
                code: caps.name("code").map(|m| m.as_str().to_string()),
                location: None,
            });
            awaiting_location = true;
            continue;
        }

        if awaiting_location {
            if let Some(caps) = ARROW.captures(line) {
                if let Some(last) = diagnostics.last_mut() {
                    last.location = location_from(&caps);
                }
            }
            awaiting_location = false;
        }
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rustc_error_with_location() {
        let output = "\
   Compiling app v0.1.0 (/work/app)
error[E0308]: mismatched types
 --> src/main.rs:3:18
  |
3 |     let x: u32 = \"nope\";
  |            ---   ^^^^^^ expected `u32`, found `&str`

error: could not compile `app` (bin \"app\") due to 1 previous error
";
        let diagnostics = parse(output);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].text, "mismatched types");
        assert_eq!(diagnostics[0].code.as_deref(), Some("E0308"));
        assert_eq!(
            diagnostics[0].location,
            Some(Location {
                file: "src/main.rs".to_string(),
                line: 3,
                column: 18,
            })
        );
    }

    #[test]
    fn test_parse_inline_errors() {
        let output = "\
src/main.c:3:5: error: expected ';' before 'return'
src/main.c:9:1: warning: control reaches end of non-void function
lib/util.go:12:7: error: undefined: foo
";
        let diagnostics = parse(output);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].text, "expected ';' before 'return'");
        assert_eq!(diagnostics[0].location.as_ref().unwrap().line, 3);
        assert_eq!(diagnostics[1].location.as_ref().unwrap().file, "lib/util.go");
        assert_eq!(diagnostics[1].text, "undefined: foo");
    }

    #[test]
    fn test_parse_header_without_location() {
        let diagnostics = parse("error: linker `cc` not found\n");
        assert_eq!(diagnostics, vec![Diagnostic::message("linker `cc` not found")]);
    }

    #[test]
    fn test_arrow_only_attaches_to_preceding_header() {
        let output = "\
error: first
some unrelated line
 --> src/lib.rs:1:1
";
        let diagnostics = parse(output);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].location, None);
    }

    #[test]
    fn test_warnings_are_ignored() {
        let output = "\
warning: unused variable: `x`
 --> src/main.rs:2:9
";
        assert!(parse(output).is_empty());
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_display_with_location_and_code() {
        let diagnostic = Diagnostic {
            text: "mismatched types".to_string(),
            code: Some("E0308".to_string()),
            location: Some(Location {
                file: "src/main.rs".to_string(),
                line: 3,
                column: 18,
            }),
        };
        assert_eq!(
            diagnostic.to_string(),
            "src/main.rs:3:18: error[E0308]: mismatched types"
        );
    }

    #[test]
    fn test_display_plain_message() {
        assert_eq!(
            Diagnostic::message("build command exited with code 1").to_string(),
            "error: build command exited with code 1"
        );
    }
}
