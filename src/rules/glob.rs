use regex::Regex;

/// An allowed query-parameter value.
///
/// Patterns use shell-style globbing: `*`, `?`, `[a-z]`, `[!a-z]`, `{a,b}`
/// and `\` escapes. A pattern that cannot be compiled as a glob is compared
/// for exact equality instead.
#[derive(Debug, Clone)]
pub enum ValuePattern {
    Glob(Regex),
    Exact(String),
}

impl ValuePattern {
    #[must_use]
    pub fn compile(pattern: &str) -> Self {
        glob_to_regex(pattern)
            .and_then(|source| Regex::new(&source).ok())
            .map_or_else(|| Self::Exact(pattern.to_string()), Self::Glob)
    }

    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Glob(regex) => regex.is_match(value),
            Self::Exact(expected) => expected == value,
        }
    }
}

/// Translates a glob into an anchored regex source, or `None` when the glob
/// is malformed.
fn glob_to_regex(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut pos = 0;
    let body = translate(&chars, &mut pos, false)?;
    if pos != chars.len() {
        return None;
    }
    Some(format!("^{body}$"))
}

fn translate(chars: &[char], pos: &mut usize, in_alternation: bool) -> Option<String> {
    let mut out = String::new();

    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            '*' => {
                out.push_str(".*");
                *pos += 1;
            }
            '?' => {
                out.push('.');
                *pos += 1;
            }
            '\\' => {
                let escaped = *chars.get(*pos + 1)?;
                out.push_str(&regex::escape(&escaped.to_string()));
                *pos += 2;
            }
            '[' => {
                *pos += 1;
                out.push_str(&translate_class(chars, pos)?);
            }
            '{' => {
                *pos += 1;
                let mut alternatives = Vec::new();
                loop {
                    alternatives.push(translate(chars, pos, true)?);
                    match chars.get(*pos) {
                        Some(',') => *pos += 1,
                        Some('}') => {
                            *pos += 1;
                            break;
                        }
                        _ => return None,
                    }
                }
                out.push_str("(?:");
                out.push_str(&alternatives.join("|"));
                out.push(')');
            }
            ',' | '}' if in_alternation => return Some(out),
            _ => {
                out.push_str(&regex::escape(&c.to_string()));
                *pos += 1;
            }
        }
    }

    if in_alternation { None } else { Some(out) }
}

fn translate_class(chars: &[char], pos: &mut usize) -> Option<String> {
    let mut out = String::from("[");
    if chars.get(*pos) == Some(&'!') {
        out.push('^');
        *pos += 1;
    }

    let start = *pos;
    while *pos < chars.len() {
        let c = chars[*pos];
        *pos += 1;
        match c {
            ']' if *pos - 1 > start => {
                out.push(']');
                return Some(out);
            }
            '-' => out.push('-'),
            '\\' | '[' | ']' | '^' | '&' | '~' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(pattern: &str) -> ValuePattern {
        ValuePattern::compile(pattern)
    }

    #[test]
    fn star_matches_any_suffix() {
        let pattern = glob("topsecret*");
        assert!(pattern.matches("topsecret123"));
        assert!(pattern.matches("topsecret"));
        assert!(!pattern.matches("wrong"));
        assert!(!pattern.matches("xtopsecret"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let pattern = glob("v?");
        assert!(pattern.matches("v1"));
        assert!(!pattern.matches("v10"));
    }

    #[test]
    fn character_classes() {
        assert!(glob("[abc]x").matches("bx"));
        assert!(!glob("[abc]x").matches("dx"));
        assert!(glob("[!abc]x").matches("dx"));
        assert!(glob("[0-9]").matches("7"));
    }

    #[test]
    fn alternations() {
        let pattern = glob("{main,develop}-*");
        assert!(pattern.matches("main-1"));
        assert!(pattern.matches("develop-x"));
        assert!(!pattern.matches("feature-1"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(glob("a.b").matches("a.b"));
        assert!(!glob("a.b").matches("axb"));
        assert!(glob(r"\*").matches("*"));
        assert!(!glob(r"\*").matches("x"));
    }

    #[test]
    fn malformed_glob_falls_back_to_equality() {
        let pattern = glob("[abc");
        assert!(matches!(pattern, ValuePattern::Exact(_)));
        assert!(pattern.matches("[abc"));
        assert!(!pattern.matches("a"));

        assert!(matches!(glob("{a,b"), ValuePattern::Exact(_)));
        assert!(matches!(glob("trailing\\"), ValuePattern::Exact(_)));
    }
}
