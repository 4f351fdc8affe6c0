//! Expression tokenizer

use super::ExprError;

/// Tokens of the expression language
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
}

/// Tokenize a preprocessed expression
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::Lex {
                        pos: i,
                        message: "assignment is not allowed; use ==".to_string(),
                    });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        let next = chars[i + 1];
                        value.push(match next {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(ExprError::Lex {
                        pos: i,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Str(value));
            }
            '.' => {
                // Leading-dot number like .5 is not supported; dot is access
                tokens.push(Token::Dot);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot followed by a non-digit terminates the number (path access)
                    if chars[i] == '.' && !chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ExprError::Lex {
                    pos: start,
                    message: format!("invalid number: {}", text),
                })?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExprError::Lex {
                    pos: i,
                    message: format!("unexpected character: {}", other),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_arithmetic() {
        let tokens = tokenize("1 + 2.5 * 3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Num(1.0),
                Token::Plus,
                Token::Num(2.5),
                Token::Star,
                Token::Num(3.0)
            ]
        );
    }

    #[test]
    fn test_tokenize_path() {
        let tokens = tokenize("outputs.build._raw").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("outputs".to_string()),
                Token::Dot,
                Token::Ident("build".to_string()),
                Token::Dot,
                Token::Ident("_raw".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokenize_comparisons() {
        let tokens = tokenize("a >= 2 and b != 'x'").unwrap();
        assert!(tokens.contains(&Token::Ge));
        assert!(tokens.contains(&Token::And));
        assert!(tokens.contains(&Token::NotEq));
        assert!(tokens.contains(&Token::Str("x".to_string())));
    }

    #[test]
    fn test_tokenize_strings_both_quotes() {
        assert_eq!(tokenize("'hi'").unwrap(), vec![Token::Str("hi".to_string())]);
        assert_eq!(tokenize("\"hi\"").unwrap(), vec![Token::Str("hi".to_string())]);
    }

    #[test]
    fn test_assignment_rejected() {
        assert!(tokenize("x = 1").is_err());
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }

    #[test]
    fn test_number_then_path_dot() {
        // "2.x" must not parse 2. as a number tail
        let tokens = tokenize("2.5.x").unwrap();
        assert_eq!(
            tokens,
            vec![Token::Num(2.5), Token::Dot, Token::Ident("x".to_string())]
        );
    }

    #[test]
    fn test_keywords() {
        let tokens = tokenize("true and not false or null").unwrap();
        assert_eq!(
            tokens,
            vec![Token::True, Token::And, Token::Not, Token::False, Token::Or, Token::Null]
        );
    }
}
