use miniscript_lexer::{Lexer, TokenType};
use proptest::prelude::*;

proptest! {
    // The lexer is total: any input either tokenizes or reports an
    // error, but never panics or loops.
    #[test]
    fn lexing_never_panics(src in ".{0,200}") {
        let mut lexer = Lexer::new(&src);
        for _ in 0..1000 {
            if lexer.at_end() {
                break;
            }
            if lexer.dequeue().is_err() {
                break;
            }
        }
    }

    #[test]
    fn integers_lex_as_single_number(n in 0u64..1_000_000_000) {
        let src = n.to_string();
        let mut lexer = Lexer::new(&src);
        let tok = lexer.dequeue().unwrap();
        prop_assert_eq!(tok.token_type, TokenType::Number);
        prop_assert_eq!(tok.text, src);
        prop_assert!(lexer.at_end());
    }

    #[test]
    fn identifiers_round_trip(name in "[a-zA-Z_][a-zA-Z0-9_]{0,20}") {
        prop_assume!(!miniscript_lexer::is_keyword(&name));
        let mut lexer = Lexer::new(&name);
        let tok = lexer.dequeue().unwrap();
        prop_assert_eq!(tok.token_type, TokenType::Identifier);
        prop_assert_eq!(tok.text, name);
    }

    #[test]
    fn string_literals_round_trip(body in "[a-zA-Z0-9 ]{0,40}") {
        let src = format!("\"{body}\"");
        let mut lexer = Lexer::new(&src);
        let tok = lexer.dequeue().unwrap();
        prop_assert_eq!(tok.token_type, TokenType::String);
        prop_assert_eq!(tok.text, body);
    }
}
