//! Quote-aware delimiter repair for machine-generated scene code.
//!
//! Generated Python routinely arrives with unbalanced or mismatched
//! brackets. The repairer walks the text with an explicit tokenizer so that
//! delimiters inside string literals are never touched, and balances the
//! remainder against a stack of open brackets. The function is total: any
//! input produces output, and a second pass over its own output is a no-op.

use tracing::trace;

/// Tokenizer state while scanning scene source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Code,
    SingleQuote,
    DoubleQuote,
    TripleSingle,
    TripleDouble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BracketKind {
    Paren,
    Square,
    Brace,
}

impl BracketKind {
    fn from_opener(ch: char) -> Option<Self> {
        match ch {
            '(' => Some(Self::Paren),
            '[' => Some(Self::Square),
            '{' => Some(Self::Brace),
            _ => None,
        }
    }

    fn from_closer(ch: char) -> Option<Self> {
        match ch {
            ')' => Some(Self::Paren),
            ']' => Some(Self::Square),
            '}' => Some(Self::Brace),
            _ => None,
        }
    }

    fn closer(self) -> char {
        match self {
            Self::Paren => ')',
            Self::Square => ']',
            Self::Brace => '}',
        }
    }
}

/// An opener awaiting its closer. Lives only on the repair stack.
#[derive(Debug, Clone, Copy)]
struct OpenBracket {
    kind: BracketKind,
    position: usize,
}

/// Balance bracket delimiters in `source`, leaving string literals intact.
///
/// Inside `Code`, a closer that does not match the innermost open bracket is
/// replaced with the expected closer (the opener stack is trusted over the
/// literal text); a stray closer with nothing open is copied verbatim since
/// there is no context to correct it against. Unresolved openers receive
/// their closers at the end of input, most recent first.
///
/// Three consecutive matching quote characters are always consumed greedily
/// as a triple-quote delimiter, so four quotes in a row open a triple-quoted
/// string whose first content character is a quote, and six quotes in a row
/// form an empty triple-quoted string.
///
/// Input that ends inside an unterminated string literal has the literal
/// terminated (a dangling trailing escape is completed first) before any
/// bracket closers are appended. Without this, appended closers would land
/// inside the literal and a second pass would append them again.
pub fn repair(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut output = String::with_capacity(source.len() + 8);
    let mut stack: Vec<OpenBracket> = Vec::new();
    let mut state = LexState::Code;
    let mut escaped = false;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        let was_escaped = escaped;
        escaped = ch == '\\' && !was_escaped;

        match state {
            LexState::Code => {
                if !was_escaped
                    && (ch == '\'' || ch == '"')
                    && chars.get(index + 1) == Some(&ch)
                    && chars.get(index + 2) == Some(&ch)
                {
                    state = if ch == '\'' {
                        LexState::TripleSingle
                    } else {
                        LexState::TripleDouble
                    };
                    output.push(ch);
                    output.push(ch);
                    output.push(ch);
                    index += 3;
                    escaped = false;
                    continue;
                }
                if !was_escaped && ch == '\'' {
                    state = LexState::SingleQuote;
                    output.push(ch);
                } else if !was_escaped && ch == '"' {
                    state = LexState::DoubleQuote;
                    output.push(ch);
                } else if let Some(kind) = BracketKind::from_opener(ch) {
                    stack.push(OpenBracket {
                        kind,
                        position: index,
                    });
                    output.push(ch);
                } else if let Some(kind) = BracketKind::from_closer(ch) {
                    match stack.last() {
                        Some(open) if open.kind == kind => {
                            stack.pop();
                            output.push(ch);
                        }
                        Some(open) => {
                            // Mismatched closer: the opener stack wins.
                            output.push(open.kind.closer());
                            stack.pop();
                        }
                        None => {
                            // Stray closer with nothing open; leave it alone.
                            output.push(ch);
                        }
                    }
                } else {
                    output.push(ch);
                }
                index += 1;
            }
            LexState::SingleQuote => {
                output.push(ch);
                if ch == '\'' && !was_escaped {
                    state = LexState::Code;
                }
                index += 1;
            }
            LexState::DoubleQuote => {
                output.push(ch);
                if ch == '"' && !was_escaped {
                    state = LexState::Code;
                }
                index += 1;
            }
            LexState::TripleSingle | LexState::TripleDouble => {
                let quote = if state == LexState::TripleSingle {
                    '\''
                } else {
                    '"'
                };
                if ch == quote
                    && !was_escaped
                    && chars.get(index + 1) == Some(&quote)
                    && chars.get(index + 2) == Some(&quote)
                {
                    output.push(quote);
                    output.push(quote);
                    output.push(quote);
                    state = LexState::Code;
                    index += 3;
                    escaped = false;
                    continue;
                }
                output.push(ch);
                index += 1;
            }
        }
    }

    if state != LexState::Code {
        if escaped {
            output.push('\\');
        }
        match state {
            LexState::SingleQuote => output.push('\''),
            LexState::DoubleQuote => output.push('"'),
            LexState::TripleSingle => output.push_str("'''"),
            LexState::TripleDouble => output.push_str("\"\"\""),
            LexState::Code => unreachable!(),
        }
    }

    if !stack.is_empty() {
        trace!(
            target = "domain::repair",
            unresolved = stack.len(),
            first_open_at = stack[0].position,
            "appending closers for unresolved openers"
        );
    }
    for open in stack.iter().rev() {
        output.push(open.kind.closer());
    }

    output
}
