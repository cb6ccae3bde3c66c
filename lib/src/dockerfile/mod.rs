//! Dockerfile parsing and build planning.
//!
//! The pipeline is staged: [`lexer`] assembles logical lines, this module
//! types them into [`Instruction`]s, and [`plan`] expands variables and
//! produces the ordered layer operations a build VM replays.

use serde_json as json;

use crate::error::DockerfileError;

pub mod expand;
pub mod lexer;
pub mod plan;

pub use expand::Vars;
pub use lexer::{Heredoc, RawInstruction};
pub use plan::{BuildPlan, CopySource, LayerOp, PlannedOp, Planner};

/// Arguments of RUN/CMD/ENTRYPOINT, either exec-form (`["a", "b"]`) or
/// shell-form (a single string handed to the configured SHELL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArgs {
    Exec(Vec<String>),
    Shell(String),
}

/// Flags accepted on COPY/ADD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyFlags {
    pub chown: Option<String>,
    pub chmod: Option<String>,
}

/// A typed Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From {
        image: String,
        alias: Option<String>,
    },
    Run {
        args: CommandArgs,
        heredoc: Option<Heredoc>,
    },
    Copy {
        flags: CopyFlags,
        sources: Vec<String>,
        dst: String,
        heredocs: Vec<Heredoc>,
    },
    Add {
        flags: CopyFlags,
        sources: Vec<String>,
        dst: String,
    },
    Env(Vec<(String, String)>),
    Arg {
        name: String,
        default: Option<String>,
    },
    Workdir(String),
    User(String),
    Cmd(CommandArgs),
    Entrypoint(CommandArgs),
    Shell(Vec<String>),
    StopSignal(String),
    Expose(Vec<String>),
    Label(Vec<(String, String)>),
}

/// An instruction with the source line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub instruction: Instruction,
    pub line: usize,
}

/// A parsed Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    pub instructions: Vec<Parsed>,
}

impl Dockerfile {
    /// Lex and type-check `source`.
    pub fn parse(source: &str) -> Result<Self, DockerfileError> {
        let raw = lexer::lex(source)?;
        let instructions = raw
            .into_iter()
            .map(|raw| {
                let line = raw.line;
                parse_instruction(raw).map(|instruction| Parsed { instruction, line })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { instructions })
    }

    /// Render the instruction list back to Dockerfile text. Reparsing the
    /// result produces the same instruction list.
    pub fn canonicalize(&self) -> String {
        let mut out = String::new();
        for parsed in &self.instructions {
            render(&parsed.instruction, &mut out);
            out.push('\n');
        }
        out
    }
}

fn parse_instruction(raw: RawInstruction) -> Result<Instruction, DockerfileError> {
    let line = raw.line;
    match raw.keyword.as_str() {
        "FROM" => parse_from(&raw, line),
        "RUN" => {
            let heredoc = raw.heredocs.into_iter().next();
            let args = if heredoc.is_some() && raw.args.starts_with("<<") {
                // `RUN <<EOF` runs the body as the shell script.
                CommandArgs::Shell(String::new())
            } else {
                parse_command_args(&raw.args, line, "RUN")?
            };
            Ok(Instruction::Run { args, heredoc })
        }
        "COPY" => {
            let (flags, words) = parse_copy_flags(&raw.args, line, "COPY")?;
            let (sources, dst) = split_sources(words, line, "COPY")?;
            Ok(Instruction::Copy {
                flags,
                sources,
                dst,
                heredocs: raw.heredocs,
            })
        }
        "ADD" => {
            let (flags, words) = parse_copy_flags(&raw.args, line, "ADD")?;
            let (sources, dst) = split_sources(words, line, "ADD")?;
            Ok(Instruction::Add { flags, sources, dst })
        }
        "ENV" => parse_pairs(&raw.args, line, "ENV").map(Instruction::Env),
        "LABEL" => parse_pairs(&raw.args, line, "LABEL").map(Instruction::Label),
        "MAINTAINER" => {
            // Deprecated sugar for a label.
            Ok(Instruction::Label(vec![(
                "maintainer".to_string(),
                raw.args.trim().to_string(),
            )]))
        }
        "ARG" => {
            let decl = raw.args.trim();
            if decl.is_empty() {
                return Err(malformed(line, "ARG", "missing name"));
            }
            let (name, default) = match decl.split_once('=') {
                Some((name, default)) => (name.to_string(), Some(unquote(default))),
                None => (decl.to_string(), None),
            };
            Ok(Instruction::Arg { name, default })
        }
        "WORKDIR" => Ok(Instruction::Workdir(raw.args.trim().to_string())),
        "USER" => Ok(Instruction::User(raw.args.trim().to_string())),
        "CMD" => parse_command_args(&raw.args, line, "CMD").map(Instruction::Cmd),
        "ENTRYPOINT" => parse_command_args(&raw.args, line, "ENTRYPOINT").map(Instruction::Entrypoint),
        "SHELL" => match parse_command_args(&raw.args, line, "SHELL")? {
            CommandArgs::Exec(argv) if !argv.is_empty() => Ok(Instruction::Shell(argv)),
            _ => Err(malformed(line, "SHELL", "requires JSON array form")),
        },
        "STOPSIGNAL" => Ok(Instruction::StopSignal(raw.args.trim().to_string())),
        "EXPOSE" => Ok(Instruction::Expose(
            raw.args.split_whitespace().map(str::to_string).collect(),
        )),
        "VOLUME" | "HEALTHCHECK" | "ONBUILD" => Err(DockerfileError::Unsupported {
            line,
            instruction: raw.keyword.clone(),
            detail: "not supported by this builder".to_string(),
        }),
        other => Err(DockerfileError::UnknownInstruction {
            line,
            instruction: other.to_string(),
        }),
    }
}

fn parse_from(raw: &RawInstruction, line: usize) -> Result<Instruction, DockerfileError> {
    let mut words = split_words(&raw.args);
    // `--platform` selection is the runner's job; accept and drop the flag.
    words.retain(|w| !w.starts_with("--platform="));

    match words.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.clone(),
            alias: None,
        }),
        [image, kw, alias] if kw.eq_ignore_ascii_case("as") => Ok(Instruction::From {
            image: image.clone(),
            alias: Some(alias.clone()),
        }),
        _ => Err(malformed(line, "FROM", "expected 'FROM image [AS name]'")),
    }
}

/// Exec form starts with `[` and parses as a JSON string array; anything
/// else is shell form, passed through verbatim.
fn parse_command_args(
    args: &str,
    line: usize,
    instruction: &str,
) -> Result<CommandArgs, DockerfileError> {
    let trimmed = args.trim();
    if trimmed.starts_with('[') {
        let argv: Vec<String> = json::from_str(trimmed)
            .map_err(|e| malformed(line, instruction, &format!("invalid exec form: {e}")))?;
        Ok(CommandArgs::Exec(argv))
    } else {
        Ok(CommandArgs::Shell(trimmed.to_string()))
    }
}

fn parse_copy_flags(
    args: &str,
    line: usize,
    instruction: &str,
) -> Result<(CopyFlags, Vec<String>), DockerfileError> {
    let mut flags = CopyFlags::default();
    let mut words = Vec::new();
    for word in split_words(args) {
        if let Some(value) = word.strip_prefix("--chown=") {
            flags.chown = Some(value.to_string());
        } else if let Some(value) = word.strip_prefix("--chmod=") {
            flags.chmod = Some(value.to_string());
        } else if word == "--link" {
            // Layer linking is an optimization hint; layers here are always
            // independent.
        } else if word.starts_with("--from=") {
            return Err(DockerfileError::Unsupported {
                line,
                instruction: format!("{instruction} --from"),
                detail: "cross-stage copies are not supported".to_string(),
            });
        } else if word.starts_with("--") {
            return Err(malformed(line, instruction, &format!("unknown flag {word}")));
        } else {
            words.push(word);
        }
    }
    Ok((flags, words))
}

fn split_sources(
    mut words: Vec<String>,
    line: usize,
    instruction: &str,
) -> Result<(Vec<String>, String), DockerfileError> {
    if words.len() < 2 {
        return Err(malformed(line, instruction, "expected sources and destination"));
    }
    let dst = words.pop().expect("len checked above");
    Ok((words, dst))
}

/// Parse `k=v k2="v 2"` pairs, plus the legacy one-pair `k v` form.
fn parse_pairs(
    args: &str,
    line: usize,
    instruction: &str,
) -> Result<Vec<(String, String)>, DockerfileError> {
    let words = split_words(args);
    let Some(first) = words.first() else {
        return Err(malformed(line, instruction, "missing arguments"));
    };

    if !first.contains('=') {
        // Legacy form: everything after the key is one value, verbatim.
        let value = args
            .trim()
            .strip_prefix(first.as_str())
            .unwrap_or("")
            .trim_start()
            .to_string();
        return Ok(vec![(first.clone(), value)]);
    }

    words
        .iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| malformed(line, instruction, &format!("expected k=v, got {word:?}")))
        })
        .collect()
}

/// Split on whitespace, honoring single/double quotes and backslash escapes
/// outside single quotes.
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn malformed(line: usize, instruction: &str, detail: &str) -> DockerfileError {
    DockerfileError::Malformed {
        line,
        instruction: instruction.to_string(),
        detail: detail.to_string(),
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn quote_word(word: &str) -> String {
    if word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\')
    {
        format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        word.to_string()
    }
}

fn render(instruction: &Instruction, out: &mut String) {
    use std::fmt::Write;
    match instruction {
        Instruction::From { image, alias } => {
            let _ = write!(out, "FROM {image}");
            if let Some(alias) = alias {
                let _ = write!(out, " AS {alias}");
            }
        }
        Instruction::Run { args, heredoc } => {
            match heredoc {
                Some(heredoc) => {
                    let delim = &heredoc.delimiter;
                    let quoted = if heredoc.expand {
                        delim.clone()
                    } else {
                        format!("'{delim}'")
                    };
                    let _ = write!(out, "RUN <<{quoted}\n{}{delim}", heredoc.body);
                }
                None => {
                    let _ = write!(out, "RUN {}", render_command(args));
                }
            }
        }
        Instruction::Copy {
            flags,
            sources,
            dst,
            heredocs,
        } => {
            let _ = write!(out, "COPY");
            render_copy_flags(flags, out);
            for source in sources {
                let _ = write!(out, " {}", quote_word(source));
            }
            let _ = write!(out, " {}", quote_word(dst));
            for heredoc in heredocs {
                let delim = &heredoc.delimiter;
                let _ = write!(out, "\n{}{delim}", heredoc.body);
            }
        }
        Instruction::Add { flags, sources, dst } => {
            let _ = write!(out, "ADD");
            render_copy_flags(flags, out);
            for source in sources {
                let _ = write!(out, " {}", quote_word(source));
            }
            let _ = write!(out, " {}", quote_word(dst));
        }
        Instruction::Env(pairs) => {
            let _ = write!(out, "ENV");
            for (k, v) in pairs {
                let _ = write!(out, " {k}={}", quote_word(v));
            }
        }
        Instruction::Label(pairs) => {
            let _ = write!(out, "LABEL");
            for (k, v) in pairs {
                let _ = write!(out, " {k}={}", quote_word(v));
            }
        }
        Instruction::Arg { name, default } => {
            let _ = write!(out, "ARG {name}");
            if let Some(default) = default {
                let _ = write!(out, "={}", quote_word(default));
            }
        }
        Instruction::Workdir(dir) => {
            let _ = write!(out, "WORKDIR {dir}");
        }
        Instruction::User(user) => {
            let _ = write!(out, "USER {user}");
        }
        Instruction::Cmd(args) => {
            let _ = write!(out, "CMD {}", render_command(args));
        }
        Instruction::Entrypoint(args) => {
            let _ = write!(out, "ENTRYPOINT {}", render_command(args));
        }
        Instruction::Shell(argv) => {
            let _ = write!(
                out,
                "SHELL {}",
                json::to_string(argv).unwrap_or_else(|_| "[]".to_string())
            );
        }
        Instruction::StopSignal(signal) => {
            let _ = write!(out, "STOPSIGNAL {signal}");
        }
        Instruction::Expose(ports) => {
            let _ = write!(out, "EXPOSE {}", ports.join(" "));
        }
    }
}

fn render_copy_flags(flags: &CopyFlags, out: &mut String) {
    use std::fmt::Write;
    if let Some(chown) = &flags.chown {
        let _ = write!(out, " --chown={chown}");
    }
    if let Some(chmod) = &flags.chmod {
        let _ = write!(out, " --chmod={chmod}");
    }
}

fn render_command(args: &CommandArgs) -> String {
    match args {
        CommandArgs::Exec(argv) => json::to_string(argv).unwrap_or_else(|_| "[]".to_string()),
        CommandArgs::Shell(cmd) => cmd.clone(),
    }
}
