//! Splits Dockerfile source into raw instructions.
//!
//! The lexer handles logical-line assembly only: backslash continuations,
//! comments, blank lines, and heredoc bodies. Keyword dispatch and argument
//! interpretation happen in the parser.

use crate::error::DockerfileError;

/// Ceiling on total Dockerfile size.
pub const MAX_BYTES: usize = 1 << 20;

/// Ceiling on a single physical line.
pub const MAX_LINE_BYTES: usize = 8192;

/// Ceiling on instruction count.
pub const MAX_INSTRUCTIONS: usize = 2048;

/// A heredoc body attached to an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heredoc {
    pub delimiter: String,

    /// Body lines joined with newlines, trailing newline included.
    pub body: String,

    /// False when the delimiter was quoted (`<<'EOF'`), which suppresses
    /// variable expansion in the body.
    pub expand: bool,
}

/// One raw instruction: an uppercased keyword, its unparsed argument text,
/// any heredoc bodies, and the 1-based source line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    pub keyword: String,
    pub args: String,
    pub heredocs: Vec<Heredoc>,
    pub line: usize,
}

/// Lex a Dockerfile into raw instructions.
pub fn lex(source: &str) -> Result<Vec<RawInstruction>, DockerfileError> {
    if source.len() > MAX_BYTES {
        return Err(DockerfileError::TooLarge { limit: MAX_BYTES });
    }

    let mut lines = source.lines().enumerate().peekable();
    let mut instructions = Vec::new();

    while let Some((idx, line)) = lines.next() {
        let lineno = idx + 1;
        if line.len() > MAX_LINE_BYTES {
            return Err(DockerfileError::LineTooLong {
                line: lineno,
                limit: MAX_LINE_BYTES,
            });
        }

        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Assemble the logical line across backslash continuations;
        // each continued line is prepended with a single space.
        let mut logical = trimmed.trim_end().to_string();
        while logical.ends_with('\\') {
            logical.pop();
            let Some((_, next)) = lines.next() else { break };
            if next.len() > MAX_LINE_BYTES {
                return Err(DockerfileError::LineTooLong {
                    line: lineno,
                    limit: MAX_LINE_BYTES,
                });
            }
            let next = next.trim();
            // Comment lines inside a continuation are skipped entirely.
            if next.starts_with('#') {
                logical.push('\\');
                continue;
            }
            if !next.is_empty() {
                logical.push(' ');
                logical.push_str(next);
            }
        }

        let (keyword, args) = match logical.split_once(char::is_whitespace) {
            Some((keyword, args)) => (keyword.to_uppercase(), args.trim().to_string()),
            None => (logical.to_uppercase(), String::new()),
        };

        // Heredoc markers in the argument text queue up body reads.
        let markers = heredoc_markers(&args);
        let mut heredocs = Vec::new();
        for marker in markers {
            let mut body = String::new();
            let mut closed = false;
            for (_, body_line) in lines.by_ref() {
                let candidate = if marker.strip_tabs {
                    body_line.trim_start_matches('\t')
                } else {
                    body_line
                };
                if candidate == marker.delimiter {
                    closed = true;
                    break;
                }
                body.push_str(candidate);
                body.push('\n');
            }
            if !closed {
                return Err(DockerfileError::UnterminatedHeredoc {
                    line: lineno,
                    delimiter: marker.delimiter,
                });
            }
            heredocs.push(Heredoc {
                delimiter: marker.delimiter,
                body,
                expand: marker.expand,
            });
        }

        instructions.push(RawInstruction {
            keyword,
            args,
            heredocs,
            line: lineno,
        });
        if instructions.len() > MAX_INSTRUCTIONS {
            return Err(DockerfileError::TooManyInstructions {
                limit: MAX_INSTRUCTIONS,
            });
        }
    }

    Ok(instructions)
}

struct Marker {
    delimiter: String,
    expand: bool,
    strip_tabs: bool,
}

/// Find `<<EOF` / `<<'EOF'` / `<<-EOF` markers in an argument string,
/// in order of appearance.
fn heredoc_markers(args: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    let mut rest = args;
    while let Some(pos) = rest.find("<<") {
        rest = &rest[pos + 2..];
        // `<<<` or a space after `<<` is shell syntax, not a heredoc.
        if rest.starts_with('<') || rest.starts_with(' ') {
            continue;
        }
        let strip_tabs = rest.starts_with('-');
        if strip_tabs {
            rest = &rest[1..];
        }

        let (quote, quoted) = match rest.chars().next() {
            Some(q @ ('\'' | '"')) => (Some(q), true),
            _ => (None, false),
        };
        if quoted {
            rest = &rest[1..];
        }

        let end = rest
            .find(|c: char| {
                if let Some(q) = quote {
                    c == q
                } else {
                    !(c.is_ascii_alphanumeric() || c == '_' || c == '.')
                }
            })
            .unwrap_or(rest.len());
        let delimiter = rest[..end].to_string();
        if delimiter.is_empty() {
            continue;
        }
        rest = &rest[end..];
        markers.push(Marker {
            delimiter,
            expand: !quoted,
            strip_tabs,
        });
    }
    markers
}
