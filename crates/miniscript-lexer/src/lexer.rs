use std::collections::VecDeque;

use miniscript_core::MiniscriptError;

use crate::token::{is_keyword, Token, TokenType};

/// A lazy tokenizer over MiniScript source.  Tokens are produced on
/// demand through `peek` / `dequeue`; newlines (and `;`) become explicit
/// EOL tokens, and `line_num` tracks the 1-based line of the cursor.
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    pub line_num: usize,
    pending: VecDeque<Token>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            line_num: 1,
            pending: VecDeque::new(),
        }
    }

    /// True when every token has been consumed.
    pub fn at_end(&self) -> bool {
        self.position >= self.input.len() && self.pending.is_empty()
    }

    /// Return the next token without consuming it.  At end of source,
    /// returns EOL.
    pub fn peek(&mut self) -> Result<Token, MiniscriptError> {
        if self.pending.is_empty() {
            if self.at_end() {
                return Ok(Token::eol());
            }
            let tok = self.lex_one()?;
            self.pending.push_back(tok);
        }
        Ok(self.pending.front().unwrap().clone())
    }

    /// Consume and return the next token.
    pub fn dequeue(&mut self) -> Result<Token, MiniscriptError> {
        if let Some(tok) = self.pending.pop_front() {
            return Ok(tok);
        }
        self.lex_one()
    }

    /// Whether the cursor sits on whitespace (used for the unary-minus
    /// disambiguation together with `after_space`).
    pub fn is_at_whitespace(&self) -> bool {
        matches!(self.input.get(self.position), Some(' ') | Some('\t'))
    }

    fn lex_one(&mut self) -> Result<Token, MiniscriptError> {
        let mut skipped_whitespace = false;
        while matches!(self.input.get(self.position), Some(' ') | Some('\t')) {
            self.position += 1;
            skipped_whitespace = true;
        }
        if self.position >= self.input.len() {
            let mut tok = Token::eol();
            tok.after_space = skipped_whitespace;
            return Ok(tok);
        }

        let c = self.input[self.position];
        self.position += 1;

        let mut tok = match c {
            '\n' => {
                self.line_num += 1;
                Token::new(TokenType::Eol, "\n")
            }
            '\r' => {
                if self.input.get(self.position) == Some(&'\n') {
                    self.position += 1;
                }
                self.line_num += 1;
                Token::new(TokenType::Eol, "\n")
            }
            ';' => Token::new(TokenType::Eol, ";"),
            '/' if self.input.get(self.position) == Some(&'/') => {
                // comment: skip to end of line, then lex whatever follows
                while self.position < self.input.len() && self.input[self.position] != '\n' {
                    self.position += 1;
                }
                let mut tok = self.lex_one()?;
                tok.after_space = tok.after_space || skipped_whitespace;
                return Ok(tok);
            }
            '"' => self.lex_string()?,
            '(' => Token::new(TokenType::LParen, "("),
            ')' => Token::new(TokenType::RParen, ")"),
            '[' => Token::new(TokenType::LSquare, "["),
            ']' => Token::new(TokenType::RSquare, "]"),
            '{' => Token::new(TokenType::LCurly, "{"),
            '}' => Token::new(TokenType::RCurly, "}"),
            '@' => Token::new(TokenType::AddressOf, "@"),
            ',' => Token::new(TokenType::Comma, ","),
            ':' => Token::new(TokenType::Colon, ":"),
            '+' => Token::new(TokenType::OpPlus, "+"),
            '-' => Token::new(TokenType::OpMinus, "-"),
            '*' => Token::new(TokenType::OpTimes, "*"),
            '/' => Token::new(TokenType::OpDivide, "/"),
            '%' => Token::new(TokenType::OpMod, "%"),
            '^' => Token::new(TokenType::OpPower, "^"),
            '=' => {
                if self.input.get(self.position) == Some(&'=') {
                    self.position += 1;
                    Token::new(TokenType::OpEqual, "==")
                } else {
                    Token::new(TokenType::OpAssign, "=")
                }
            }
            '!' => {
                if self.input.get(self.position) == Some(&'=') {
                    self.position += 1;
                    Token::new(TokenType::OpNotEqual, "!=")
                } else {
                    return Err(MiniscriptError::lexer("unexpected character: '!'"));
                }
            }
            '>' => {
                if self.input.get(self.position) == Some(&'=') {
                    self.position += 1;
                    Token::new(TokenType::OpGreatEqual, ">=")
                } else {
                    Token::new(TokenType::OpGreater, ">")
                }
            }
            '<' => {
                if self.input.get(self.position) == Some(&'=') {
                    self.position += 1;
                    Token::new(TokenType::OpLessEqual, "<=")
                } else {
                    Token::new(TokenType::OpLesser, "<")
                }
            }
            '.' => {
                if matches!(self.input.get(self.position), Some(d) if d.is_ascii_digit()) {
                    self.position -= 1;
                    self.lex_number()?
                } else {
                    Token::new(TokenType::Dot, ".")
                }
            }
            d if d.is_ascii_digit() => {
                self.position -= 1;
                self.lex_number()?
            }
            a if a.is_alphabetic() || a == '_' => {
                self.position -= 1;
                self.lex_word()?
            }
            other => {
                return Err(MiniscriptError::lexer(format!(
                    "unexpected character: '{other}'"
                )));
            }
        };
        tok.after_space = skipped_whitespace;
        Ok(tok)
    }

    fn lex_string(&mut self) -> Result<Token, MiniscriptError> {
        // Opening quote already consumed.  A doubled quote inside the
        // literal stands for one quote character.
        let mut text = String::new();
        loop {
            match self.input.get(self.position) {
                None => return Err(MiniscriptError::lexer("missing closing quote (\")")),
                Some('"') => {
                    self.position += 1;
                    if self.input.get(self.position) == Some(&'"') {
                        self.position += 1;
                        text.push('"');
                    } else {
                        break;
                    }
                }
                Some(&c) => {
                    if c == '\n' {
                        self.line_num += 1;
                    }
                    self.position += 1;
                    text.push(c);
                }
            }
        }
        Ok(Token::new(TokenType::String, text))
    }

    fn lex_number(&mut self) -> Result<Token, MiniscriptError> {
        let start = self.position;
        while matches!(self.input.get(self.position), Some(d) if d.is_ascii_digit()) {
            self.position += 1;
        }
        if self.input.get(self.position) == Some(&'.')
            && matches!(self.input.get(self.position + 1), Some(d) if d.is_ascii_digit())
        {
            self.position += 1;
            while matches!(self.input.get(self.position), Some(d) if d.is_ascii_digit()) {
                self.position += 1;
            }
        }
        if matches!(self.input.get(self.position), Some('e') | Some('E')) {
            self.position += 1;
            if matches!(self.input.get(self.position), Some('+') | Some('-')) {
                self.position += 1;
            }
            if !matches!(self.input.get(self.position), Some(d) if d.is_ascii_digit()) {
                return Err(MiniscriptError::lexer(format!(
                    "malformed number: {}",
                    self.input[start..self.position].iter().collect::<String>()
                )));
            }
            while matches!(self.input.get(self.position), Some(d) if d.is_ascii_digit()) {
                self.position += 1;
            }
        }
        let text: String = self.input[start..self.position].iter().collect();
        Ok(Token::new(TokenType::Number, text))
    }

    fn lex_word(&mut self) -> Result<Token, MiniscriptError> {
        let start = self.position;
        while matches!(self.input.get(self.position), Some(c) if c.is_alphanumeric() || *c == '_')
        {
            self.position += 1;
        }
        let text: String = self.input[start..self.position].iter().collect();

        if !is_keyword(&text) {
            return Ok(Token::new(TokenType::Identifier, text));
        }

        // Compound keywords are emitted as single tokens with
        // space-joined text: "end if", "end for", "end while",
        // "end function", and "else if".
        if text == "end" || text == "else" {
            let next = self.lex_one()?;
            let joinable = match text.as_str() {
                "end" => matches!(next.text.as_str(), "if" | "for" | "while" | "function"),
                _ => next.text == "if",
            };
            if next.token_type == TokenType::Keyword && joinable {
                return Ok(Token::new(TokenType::Keyword, format!("{} {}", text, next.text)));
            }
            self.pending.push_back(next);
        }
        Ok(Token::new(TokenType::Keyword, text))
    }

    /// The last token of a source string, skipping comments.  Used for
    /// line-continuation detection in the REPL.
    pub fn last_token(source: &str) -> Result<Token, MiniscriptError> {
        let mut lexer = Lexer::new(source);
        let mut last = Token::eol();
        while !lexer.at_end() {
            last = lexer.dequeue()?;
        }
        Ok(last)
    }

    /// Strip a trailing `//…` comment from one source line, respecting
    /// string literals.
    pub fn trim_comment(line: &str) -> String {
        let chars: Vec<char> = line.chars().collect();
        let mut in_string = false;
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '"' => in_string = !in_string,
                '/' if !in_string && chars.get(i + 1) == Some(&'/') => {
                    return chars[..i].iter().collect();
                }
                _ => {}
            }
            i += 1;
        }
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        while !lexer.at_end() {
            out.push(lexer.dequeue().unwrap());
        }
        out
    }

    fn types(src: &str) -> Vec<TokenType> {
        all_tokens(src).iter().map(|t| t.token_type).collect()
    }

    #[test]
    fn basic_stream() {
        let toks = all_tokens("x = 3 + 4");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["x", "=", "3", "+", "4"]);
        assert_eq!(toks[0].token_type, TokenType::Identifier);
        assert_eq!(toks[1].token_type, TokenType::OpAssign);
        assert_eq!(toks[2].token_type, TokenType::Number);
    }

    #[test]
    fn longest_match_operators() {
        assert_eq!(
            types("a == b != c >= d <= e > f < g"),
            [
                TokenType::Identifier,
                TokenType::OpEqual,
                TokenType::Identifier,
                TokenType::OpNotEqual,
                TokenType::Identifier,
                TokenType::OpGreatEqual,
                TokenType::Identifier,
                TokenType::OpLessEqual,
                TokenType::Identifier,
                TokenType::OpGreater,
                TokenType::Identifier,
                TokenType::OpLesser,
                TokenType::Identifier,
            ]
        );
    }

    #[test]
    fn newline_and_semicolon_are_eol() {
        assert_eq!(
            types("a\nb;c"),
            [
                TokenType::Identifier,
                TokenType::Eol,
                TokenType::Identifier,
                TokenType::Eol,
                TokenType::Identifier,
            ]
        );
    }

    #[test]
    fn line_num_tracks_newlines() {
        let mut lexer = Lexer::new("a\nb\nc");
        assert_eq!(lexer.line_num, 1);
        while !lexer.at_end() {
            lexer.dequeue().unwrap();
        }
        assert_eq!(lexer.line_num, 3);
    }

    #[test]
    fn keywords_and_identifiers() {
        let toks = all_tokens("while whilex if iffy");
        assert_eq!(toks[0].token_type, TokenType::Keyword);
        assert_eq!(toks[1].token_type, TokenType::Identifier);
        assert_eq!(toks[2].token_type, TokenType::Keyword);
        assert_eq!(toks[3].token_type, TokenType::Identifier);
    }

    #[test]
    fn compound_keywords() {
        let toks = all_tokens("end if\nend while\nend for\nend function\nelse if");
        let keyword_texts: Vec<&str> = toks
            .iter()
            .filter(|t| t.token_type == TokenType::Keyword)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(
            keyword_texts,
            ["end if", "end while", "end for", "end function", "else if"]
        );
    }

    #[test]
    fn end_alone_stays_single() {
        let toks = all_tokens("end x");
        assert!(toks[0].is_keyword("end"));
        assert_eq!(toks[1].token_type, TokenType::Identifier);
    }

    #[test]
    fn string_with_embedded_quotes() {
        let toks = all_tokens(r#"s = "say ""hi"" now""#);
        assert_eq!(toks[2].token_type, TokenType::String);
        assert_eq!(toks[2].text, "say \"hi\" now");
    }

    #[test]
    fn unterminated_string_fails() {
        let mut lexer = Lexer::new("s = \"oops");
        lexer.dequeue().unwrap();
        lexer.dequeue().unwrap();
        assert!(lexer.dequeue().is_err());
    }

    #[test]
    fn numbers() {
        let toks = all_tokens("3 3.25 .5 1e6 2.5E-3");
        for t in &toks {
            assert_eq!(t.token_type, TokenType::Number, "{t}");
        }
        assert_eq!(toks[2].text, ".5");
        assert_eq!(toks[4].text, "2.5E-3");
    }

    #[test]
    fn malformed_exponent_fails() {
        let mut lexer = Lexer::new("3e");
        assert!(lexer.dequeue().is_err());
    }

    #[test]
    fn dot_vs_number() {
        assert_eq!(
            types("a.b"),
            [TokenType::Identifier, TokenType::Dot, TokenType::Identifier]
        );
    }

    #[test]
    fn after_space_flag() {
        let toks = all_tokens("a -b");
        assert!(!toks[0].after_space);
        assert!(toks[1].after_space);
        assert!(!toks[2].after_space);
    }

    #[test]
    fn is_at_whitespace_lookahead() {
        let mut lexer = Lexer::new("a - b");
        lexer.dequeue().unwrap(); // a
        lexer.dequeue().unwrap(); // -
        assert!(lexer.is_at_whitespace());
        let mut lexer = Lexer::new("a -b");
        lexer.dequeue().unwrap();
        lexer.dequeue().unwrap();
        assert!(!lexer.is_at_whitespace());
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            types("a // the rest\nb"),
            [TokenType::Identifier, TokenType::Eol, TokenType::Identifier]
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("x");
        assert_eq!(lexer.peek().unwrap().text, "x");
        assert_eq!(lexer.peek().unwrap().text, "x");
        assert_eq!(lexer.dequeue().unwrap().text, "x");
        assert!(lexer.at_end());
    }

    #[test]
    fn peek_past_end_is_eol() {
        let mut lexer = Lexer::new("");
        assert_eq!(lexer.peek().unwrap().token_type, TokenType::Eol);
    }

    #[test]
    fn last_token_skips_comment() {
        let tok = Lexer::last_token("x = 3 + // trailing").unwrap();
        assert_eq!(tok.token_type, TokenType::OpPlus);
        let tok = Lexer::last_token("x = 3").unwrap();
        assert_eq!(tok.token_type, TokenType::Number);
    }

    #[test]
    fn trim_comment_respects_strings() {
        assert_eq!(Lexer::trim_comment("x = 1 // note"), "x = 1 ");
        assert_eq!(
            Lexer::trim_comment(r#"s = "http://x" // note"#),
            r#"s = "http://x" "#
        );
        assert_eq!(Lexer::trim_comment("plain"), "plain");
    }
}
