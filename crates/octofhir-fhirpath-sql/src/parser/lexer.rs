//! Tokenizer for FHIRPath expressions.

use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Plain identifier or keyword.
    Identifier(String),
    /// Backtick-delimited identifier, without the backticks.
    DelimitedIdentifier(String),
    /// `$name` or `%name`, prefix included.
    Variable(String),
    String(String),
    /// Integer or decimal digits.
    Number(String),
    /// Temporal literal without the leading `@`.
    Temporal(String),
    /// Operator or punctuation.
    Symbol(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

const SYMBOLS: &[&str] = &[
    "!=", "!~", "<=", ">=", "=", "~", "<", ">", "+", "-", "*", "/", "&", "|", "(", ")", "[", "]",
    "{", "}", ",", ".",
];

struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

/// Split `input` into tokens.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, String> {
    let mut lexer = Lexer {
        input,
        chars: input.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    while let Some(spanned) = lexer.next_token()? {
        tokens.push(spanned);
    }
    Ok(tokens)
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Option<Spanned>, String> {
        self.skip_trivia()?;
        let Some(&(offset, c)) = self.chars.peek() else {
            return Ok(None);
        };

        let token = match c {
            '\'' => Token::String(self.quoted('\'')?),
            '`' => Token::DelimitedIdentifier(self.quoted('`')?),
            '@' => {
                self.chars.next();
                Token::Temporal(self.temporal(offset)?)
            }
            '$' | '%' => {
                self.chars.next();
                let name = match self.chars.peek() {
                    Some((_, '`')) => self.quoted('`')?,
                    Some((_, '\'')) => self.quoted('\'')?,
                    _ => self.word(),
                };
                if name.is_empty() {
                    return Err(format!("expected a variable name after '{c}' at {offset}"));
                }
                Token::Variable(format!("{c}{name}"))
            }
            c if c.is_ascii_digit() => Token::Number(self.number()),
            c if c.is_alphabetic() || c == '_' => Token::Identifier(self.word()),
            _ => Token::Symbol(self.symbol(offset)?),
        };
        Ok(Some(Spanned { token, offset }))
    }

    fn skip_trivia(&mut self) -> Result<(), String> {
        loop {
            match self.chars.peek() {
                Some((_, c)) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some(&(offset, '/')) => {
                    let rest = &self.input[offset..];
                    if rest.starts_with("//") {
                        while self.chars.next_if(|&(_, c)| c != '\n').is_some() {}
                    } else if rest.starts_with("/*") {
                        let end = rest[2..]
                            .find("*/")
                            .ok_or_else(|| format!("unterminated comment at {offset}"))?;
                        let stop = offset + 2 + end + 2;
                        while self.chars.next_if(|&(i, _)| i < stop).is_some() {}
                    } else {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some((_, c)) = self.chars.next_if(|&(_, c)| c.is_alphanumeric() || c == '_') {
            word.push(c);
        }
        word
    }

    fn number(&mut self) -> String {
        let mut number = String::new();
        while let Some((_, c)) = self.chars.next_if(|&(_, c)| c.is_ascii_digit()) {
            number.push(c);
        }
        // A dot is a decimal point only when digits follow.
        if let Some(&(offset, '.')) = self.chars.peek() {
            let fraction = self.input[offset + 1..].chars().next();
            if fraction.is_some_and(|c| c.is_ascii_digit()) {
                self.chars.next();
                number.push('.');
                while let Some((_, c)) = self.chars.next_if(|&(_, c)| c.is_ascii_digit()) {
                    number.push(c);
                }
            }
        }
        number
    }

    fn temporal(&mut self, start: usize) -> Result<String, String> {
        let mut value = String::new();
        while let Some(&(offset, c)) = self.chars.peek() {
            let accepted = match c {
                '0'..='9' | '-' | ':' | 'T' | 'Z' | '+' => true,
                '.' => self.input[offset + 1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if !accepted {
                break;
            }
            value.push(c);
            self.chars.next();
        }
        if value.is_empty() {
            return Err(format!("expected a date or time after '@' at {start}"));
        }
        Ok(value)
    }

    fn quoted(&mut self, delimiter: char) -> Result<String, String> {
        let (start, _) = self.chars.next().unwrap_or((self.input.len(), delimiter));
        let mut value = String::new();
        loop {
            let Some((_, c)) = self.chars.next() else {
                return Err(format!("unterminated {delimiter}-quoted text at {start}"));
            };
            match c {
                c if c == delimiter => return Ok(value),
                '\\' => {
                    let Some((offset, escaped)) = self.chars.next() else {
                        return Err(format!("unterminated escape at {start}"));
                    };
                    match escaped {
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        'f' => value.push('\u{c}'),
                        'u' => {
                            let digits: String = (0..4)
                                .filter_map(|_| self.chars.next())
                                .map(|(_, c)| c)
                                .collect();
                            let code = u32::from_str_radix(&digits, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| format!("invalid unicode escape at {offset}"))?;
                            value.push(code);
                        }
                        other => value.push(other),
                    }
                }
                c => value.push(c),
            }
        }
    }

    fn symbol(&mut self, offset: usize) -> Result<&'static str, String> {
        let rest = &self.input[offset..];
        let symbol = SYMBOLS
            .iter()
            .find(|symbol| rest.starts_with(**symbol))
            .ok_or_else(|| {
                let c = rest.chars().next().unwrap_or(' ');
                format!("unexpected character '{c}' at {offset}")
            })?;
        for _ in 0..symbol.len() {
            self.chars.next();
        }
        Ok(symbol)
    }
}
