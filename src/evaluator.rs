//! Completion evaluators for submitted exercise code.

use crate::exercise::Exercise;
use std::collections::BTreeSet;

/// Decides whether submitted code completes an exercise.
///
/// Implementations give a completion signal, not a grade. They must be
/// deterministic for the same exercise and code.
pub trait CompletionEvaluator: Send + Sync {
    /// `language` is the session's editor language, e.g. `python`.
    fn evaluate(&self, exercise: &Exercise, code: &str, language: &str) -> bool;
}

/// Comment and string delimiters of a language family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syntax {
    pub line_comments: &'static [&'static str],
    pub block_comment: Option<(&'static str, &'static str)>,
    pub quotes: &'static [char],
}

impl Syntax {
    /// Every delimiter the heuristic knows; used for unknown languages.
    pub const GENERIC: Syntax = Syntax {
        line_comments: &["//", "#"],
        block_comment: Some(("/*", "*/")),
        quotes: &['"', '\'', '`'],
    };

    pub const C_LIKE: Syntax = Syntax {
        line_comments: &["//"],
        block_comment: Some(("/*", "*/")),
        quotes: &['"', '\'', '`'],
    };

    /// `'` introduces lifetimes and char literals, so only `"` strings.
    pub const RUST: Syntax = Syntax {
        line_comments: &["//"],
        block_comment: Some(("/*", "*/")),
        quotes: &['"'],
    };

    /// `//` is floor division.
    pub const PYTHON: Syntax = Syntax {
        line_comments: &["#"],
        block_comment: None,
        quotes: &['"', '\''],
    };

    pub const SHELL: Syntax = Syntax {
        line_comments: &["#"],
        block_comment: None,
        quotes: &['"', '\''],
    };

    pub fn for_language(language: &str) -> Syntax {
        match language.to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Syntax::PYTHON,
            "rust" | "rs" => Syntax::RUST,
            "bash" | "sh" | "shell" | "zsh" => Syntax::SHELL,
            "javascript" | "js" | "typescript" | "ts" | "java" | "c" | "cpp" | "c++" | "csharp"
            | "go" | "kotlin" | "swift" => Syntax::C_LIKE,
            _ => Syntax::GENERIC,
        }
    }
}

/// Language keywords ignored when comparing identifier sets.
const STOP_WORDS: &[&str] = &[
    "and", "as", "async", "await", "bool", "break", "case", "catch", "char", "class", "const",
    "continue", "def", "default", "do", "double", "elif", "else", "enum", "except", "export",
    "extends", "false", "final", "finally", "float", "fn", "for", "from", "function", "if",
    "impl", "import", "in", "include", "int", "interface", "is", "lambda", "let", "long", "match",
    "mut", "new", "none", "not", "null", "of", "or", "pass", "private", "protected", "pub",
    "public", "raise", "return", "self", "static", "string", "struct", "super", "switch", "this",
    "throw", "true", "try", "typeof", "undefined", "use", "var", "void", "while", "with", "yield",
];

/// Identifier-overlap heuristic.
///
/// With a reference solution, the submission completes the exercise when it
/// shares at least 70% (rounded up, minimum one) of the solution's
/// identifiers. Without one, any submission of three or more non-blank lines
/// counts.
#[derive(Debug, Clone, Copy)]
pub struct KeywordOverlapEvaluator {
    /// Required overlap, in tenths.
    threshold_tenths: usize,
    min_lines: usize,
}

impl Default for KeywordOverlapEvaluator {
    fn default() -> Self {
        Self {
            threshold_tenths: 7,
            min_lines: 3,
        }
    }
}

impl CompletionEvaluator for KeywordOverlapEvaluator {
    fn evaluate(&self, exercise: &Exercise, code: &str, language: &str) -> bool {
        let syntax = Syntax::for_language(language);
        let solution = exercise
            .solution_code
            .as_deref()
            .map(|solution| keywords_in(solution, syntax))
            .filter(|k| !k.is_empty());
        match solution {
            Some(expected) => {
                let required = ((expected.len() * self.threshold_tenths + 9) / 10).max(1);
                let submitted = keywords_in(code, syntax);
                expected.intersection(&submitted).count() >= required
            }
            None => code.lines().filter(|l| !l.trim().is_empty()).count() >= self.min_lines,
        }
    }
}

/// Distinct identifiers in `code`, minus comments, string literals and
/// language keywords, recognizing every known delimiter.
pub fn keywords(code: &str) -> BTreeSet<String> {
    keywords_in(code, Syntax::GENERIC)
}

pub fn keywords_in(code: &str, syntax: Syntax) -> BTreeSet<String> {
    let stripped = strip_comments_and_strings(code, syntax);
    let mut out = BTreeSet::new();
    let mut current = String::new();
    for c in stripped.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c);
            continue;
        }
        if !current.is_empty() {
            let word = std::mem::take(&mut current);
            let starts_alpha = word.chars().next().is_some_and(|f| !f.is_ascii_digit());
            if starts_alpha && !STOP_WORDS.contains(&word.to_ascii_lowercase().as_str()) {
                out.insert(word);
            }
        }
    }
    out
}

fn strip_comments_and_strings(code: &str, syntax: Syntax) -> String {
    #[derive(Clone, Copy)]
    enum State {
        Code,
        LineComment,
        BlockComment(&'static str),
        Literal(char),
    }

    let mut out = String::with_capacity(code.len());
    let mut state = State::Code;
    let mut rest = code;
    while let Some(c) = rest.chars().next() {
        let mut step = c.len_utf8();
        match state {
            State::Code => {
                if syntax.line_comments.iter().any(|t| rest.starts_with(t)) {
                    state = State::LineComment;
                } else if let Some((open, close)) =
                    syntax.block_comment.filter(|(open, _)| rest.starts_with(open))
                {
                    step = open.len();
                    state = State::BlockComment(close);
                } else if syntax.quotes.contains(&c) {
                    state = State::Literal(c);
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::BlockComment(close) => {
                if rest.starts_with(close) {
                    step = close.len();
                    out.push(' ');
                    state = State::Code;
                }
            }
            State::Literal(quote) => {
                if c == '\\' {
                    step += rest[step..].chars().next().map_or(0, char::len_utf8);
                } else if c == quote {
                    out.push(' ');
                    state = State::Code;
                }
            }
        }
        rest = &rest[step..];
    }
    out
}
