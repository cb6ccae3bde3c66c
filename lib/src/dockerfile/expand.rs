//! Shell-style variable expansion for Dockerfile arguments.

use std::collections::BTreeMap;

use crate::error::DockerfileError;

/// Ceiling on declared variables (ARG + ENV combined).
pub const MAX_VARIABLES: usize = 512;

/// Ceiling on nested expansion while substituting defaults.
const MAX_DEPTH: usize = 16;

/// The variable table in scope during planning.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or overwrite a variable, enforcing the table ceiling.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DockerfileError> {
        self.values.insert(name.into(), value.into());
        if self.values.len() > MAX_VARIABLES {
            return Err(DockerfileError::TooManyVariables {
                limit: MAX_VARIABLES,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Expand `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR:+alt}` and `$$`
    /// in `input`. Undefined variables expand to empty.
    pub fn expand(&self, input: &str) -> Result<String, DockerfileError> {
        self.expand_depth(input, 0)
    }

    fn expand_depth(&self, input: &str, depth: usize) -> Result<String, DockerfileError> {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                // `$$` is a literal dollar.
                Some((_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some((_, '{')) => {
                    chars.next();
                    let mut body = String::new();
                    let mut nesting = 1usize;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '{' => nesting += 1,
                            '}' => {
                                nesting -= 1;
                                if nesting == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        body.push(c);
                    }
                    out.push_str(&self.expand_braced(&body, depth)?);
                }
                Some((_, c)) if is_name_start(*c) => {
                    let mut name = String::new();
                    while let Some((_, c)) = chars.peek() {
                        if is_name_char(*c) {
                            name.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(self.get(&name).unwrap_or(""));
                }
                // A dollar that starts no variable is literal.
                _ => out.push('$'),
            }
        }
        Ok(out)
    }

    /// `${VAR}`, `${VAR:-default}` or `${VAR:+alt}`; the substituted side is
    /// itself expanded, bounded to defeat cycles.
    fn expand_braced(&self, body: &str, depth: usize) -> Result<String, DockerfileError> {
        if depth >= MAX_DEPTH {
            return Err(DockerfileError::ExpansionTooDeep {
                name: body.to_string(),
            });
        }

        if let Some((name, default)) = body.split_once(":-") {
            return match self.get(name).filter(|v| !v.is_empty()) {
                Some(value) => Ok(value.to_string()),
                None => self.expand_depth(default, depth + 1),
            };
        }
        if let Some((name, alt)) = body.split_once(":+") {
            return match self.get(name).filter(|v| !v.is_empty()) {
                Some(_) => self.expand_depth(alt, depth + 1),
                None => Ok(String::new()),
            };
        }
        Ok(self.get(body).unwrap_or("").to_string())
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.set("VERSION", "3.19").expect("set");
        vars.set("EMPTY", "").expect("set");
        vars
    }

    #[test_case("alpine:$VERSION", "alpine:3.19"; "plain")]
    #[test_case("alpine:${VERSION}", "alpine:3.19"; "braced")]
    #[test_case("${MISSING}", ""; "undefined_is_empty")]
    #[test_case("${MISSING:-fallback}", "fallback"; "default_used")]
    #[test_case("${VERSION:-fallback}", "3.19"; "default_skipped")]
    #[test_case("${EMPTY:-fallback}", "fallback"; "empty_takes_default")]
    #[test_case("${VERSION:+set}", "set"; "alt_used")]
    #[test_case("${MISSING:+set}", ""; "alt_skipped")]
    #[test_case("cost: $$5", "cost: $5"; "dollar_escape")]
    #[test_case("$VERSION$VERSION", "3.193.19"; "adjacent")]
    #[test_case("a$-b", "a$-b"; "bare_dollar")]
    #[test_case("${MISSING:-$VERSION}", "3.19"; "default_expands")]
    #[test]
    fn expansion(input: &str, expected: &str) {
        pretty_assertions::assert_eq!(vars().expand(input).expect("expand"), expected);
    }

    #[test]
    fn expansion_is_idempotent() {
        let vars = vars();
        let once = vars.expand("img:${VERSION:-x}$EMPTY").expect("expand");
        let twice = vars.expand(&once).expect("expand");
        assert_eq!(once, twice);
    }

    #[test]
    fn recursion_is_bounded() {
        let mut vars = Vars::new();
        // `A` expands to a reference to itself through a default.
        vars.set("A", "").expect("set");
        let input = "${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-${A:-x}}}}}}}}}}}}}}}}}";
        assert!(matches!(
            vars.expand(input),
            Err(DockerfileError::ExpansionTooDeep { .. })
        ));
    }

    #[test]
    fn variable_ceiling() {
        let mut vars = Vars::new();
        for i in 0..MAX_VARIABLES {
            vars.set(format!("V{i}"), "x").expect("set");
        }
        assert!(matches!(
            vars.set("ONE_MORE", "x"),
            Err(DockerfileError::TooManyVariables { .. })
        ));
    }
}
