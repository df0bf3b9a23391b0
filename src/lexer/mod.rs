use logos::Logos;

fn parse_number(slice: &str) -> Option<f64> {
    if let Some(hex) = slice.strip_prefix("0x").or_else(|| slice.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok().map(|n| n as f64)
    } else {
        slice.parse::<f64>().ok()
    }
}

/// Decode the body of a quoted literal. Unknown escapes keep the escaped
/// character, the way the scripting surface treats them.
fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(c) => out.push(c),
                    None => {
                        out.push('x');
                        out.push_str(&hex);
                    }
                }
            }
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(c) => out.push(c),
                    None => {
                        out.push('u');
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn string_body(slice: &str) -> String {
    unescape(&slice[1..slice.len() - 1])
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip(r"/\*([^*]|\*[^/])*\*/", allow_greedy = true))]
pub enum Token {
    // Keywords
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("do")]
    Do,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("function")]
    Function,
    #[token("var")]
    Var,
    #[token("let")]
    Let,
    #[token("const")]
    Const,
    #[token("try")]
    Try,
    #[token("catch")]
    Catch,
    #[token("finally")]
    Finally,
    #[token("throw")]
    Throw,
    #[token("typeof")]
    Typeof,
    #[token("import")]
    Import,
    #[token("export")]
    Export,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("undefined")]
    Undefined,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token("?.")]
    OptionalDot,
    #[token("?")]
    Question,

    // Operators, longest first where prefixes overlap
    #[token("===")]
    AbsEq,
    #[token("!==")]
    AbsNotEq,
    #[token("==")]
    Eq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("??")]
    NullishCoalesce,
    #[token("!")]
    Not,
    #[token("**=")]
    PowAssign,
    #[token("**")]
    Pow,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    BitAnd,
    #[token("|")]
    BitOr,
    #[token("^")]
    BitXor,
    #[token("~")]
    BitNot,
    #[token("=")]
    Assign,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| parse_number(lex.slice()))]
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| parse_number(lex.slice()))]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| Some(string_body(lex.slice())))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| Some(string_body(lex.slice())))]
    Str(String),

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice().to_string())]
    Ident(String),
}

pub type Span = std::ops::Range<usize>;

#[derive(Debug, thiserror::Error)]
#[error("lex error at offset {position}: unexpected '{snippet}'")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
}

/// Lex source into tokens with byte spans. `/` always lexes as division;
/// the parser re-scans regex literals from source where `/` appears in
/// prefix position.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let span = lexer.span();
                return Err(LexError {
                    position: span.start,
                    snippet: source[span].to_string(),
                });
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_keywords_and_idents() {
        let toks = kinds("let $x = foo_bar;");
        assert_eq!(
            toks,
            vec![
                Token::Let,
                Token::Ident("$x".into()),
                Token::Assign,
                Token::Ident("foo_bar".into()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(kinds("0x1F"), vec![Token::Number(31.0)]);
        assert_eq!(kinds("3.5"), vec![Token::Number(3.5)]);
        assert_eq!(kinds("1e3"), vec![Token::Number(1000.0)]);
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(
            kinds(r#"'a\nb' "q\"t" 'A'"#),
            vec![
                Token::Str("a\nb".into()),
                Token::Str("q\"t".into()),
                Token::Str("A".into()),
            ]
        );
    }

    #[test]
    fn longest_match_on_operators() {
        assert_eq!(
            kinds("a === b !== c ?? d?.e ** f"),
            vec![
                Token::Ident("a".into()),
                Token::AbsEq,
                Token::Ident("b".into()),
                Token::AbsNotEq,
                Token::Ident("c".into()),
                Token::NullishCoalesce,
                Token::Ident("d".into()),
                Token::OptionalDot,
                Token::Ident("e".into()),
                Token::Pow,
                Token::Ident("f".into()),
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let toks = kinds("1 // line\n/* block\n still */ 2");
        assert_eq!(toks, vec![Token::Number(1.0), Token::Number(2.0)]);
    }
}
