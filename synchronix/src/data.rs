//! Tokens exchanged over channels and their declared types.
//!
//! Every [`Channel`](crate::channel::Channel) carries a declared element
//! [`TokenType`]. Tokens sent to a channel are converted to that type before
//! they are published, which makes it possible to broadcast a single token to
//! channels with different element types. Only lossless conversions are
//! permitted.
use std::fmt;

use thiserror::Error;

/// A value transferred during a rendezvous.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// A boolean.
    Boolean(bool),
    /// A 32-bit signed integer.
    Int(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A double-precision float.
    Double(f64),
    /// A string.
    String(String),
    /// An ordered sequence of tokens.
    Array(Vec<Token>),
}

impl Token {
    /// Returns the type of this token.
    ///
    /// The element type of an array is the type of its first element, or
    /// [`TokenType::General`] for an empty array.
    pub fn token_type(&self) -> TokenType {
        match self {
            Token::Boolean(_) => TokenType::Boolean,
            Token::Int(_) => TokenType::Int,
            Token::Long(_) => TokenType::Long,
            Token::Double(_) => TokenType::Double,
            Token::String(_) => TokenType::String,
            Token::Array(elements) => TokenType::Array(Box::new(
                elements
                    .first()
                    .map(Token::token_type)
                    .unwrap_or(TokenType::General),
            )),
        }
    }

    /// Converts this token to the specified type without loss of information.
    pub fn convert(&self, to: &TokenType) -> Result<Token, ConversionError> {
        let converted = match (self, to) {
            (_, TokenType::General) => Some(self.clone()),
            (Token::Boolean(_), TokenType::Boolean)
            | (Token::Int(_), TokenType::Int)
            | (Token::Long(_), TokenType::Long)
            | (Token::Double(_), TokenType::Double)
            | (Token::String(_), TokenType::String) => Some(self.clone()),
            (Token::Int(v), TokenType::Long) => Some(Token::Long(*v as i64)),
            (Token::Int(v), TokenType::Double) => Some(Token::Double(*v as f64)),
            (Token::Array(_), TokenType::String) => None,
            (_, TokenType::String) => Some(Token::String(self.to_string())),
            (Token::Array(elements), TokenType::Array(element_type)) => elements
                .iter()
                .map(|e| e.convert(element_type))
                .collect::<Result<Vec<_>, _>>()
                .ok()
                .map(Token::Array),
            _ => None,
        };

        converted.ok_or_else(|| ConversionError {
            from: self.token_type(),
            to: to.clone(),
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Boolean(v) => write!(f, "{}", v),
            Token::Int(v) => write!(f, "{}", v),
            Token::Long(v) => write!(f, "{}L", v),
            Token::Double(v) => write!(f, "{:?}", v),
            Token::String(v) => write!(f, "{}", v),
            Token::Array(elements) => {
                f.write_str("{")?;
                for (i, e) in elements.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Token {
    fn from(v: bool) -> Self {
        Token::Boolean(v)
    }
}
impl From<i32> for Token {
    fn from(v: i32) -> Self {
        Token::Int(v)
    }
}
impl From<i64> for Token {
    fn from(v: i64) -> Self {
        Token::Long(v)
    }
}
impl From<f64> for Token {
    fn from(v: f64) -> Self {
        Token::Double(v)
    }
}
impl From<&str> for Token {
    fn from(v: &str) -> Self {
        Token::String(v.to_owned())
    }
}
impl From<String> for Token {
    fn from(v: String) -> Self {
        Token::String(v)
    }
}

/// The declared type of the tokens carried by a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Any token; no conversion takes place.
    #[default]
    General,
    /// Booleans.
    Boolean,
    /// 32-bit signed integers.
    Int,
    /// 64-bit signed integers.
    Long,
    /// Double-precision floats.
    Double,
    /// Strings.
    String,
    /// Arrays with the specified element type.
    Array(Box<TokenType>),
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::General => f.write_str("general"),
            TokenType::Boolean => f.write_str("boolean"),
            TokenType::Int => f.write_str("int"),
            TokenType::Long => f.write_str("long"),
            TokenType::Double => f.write_str("double"),
            TokenType::String => f.write_str("string"),
            TokenType::Array(element_type) => write!(f, "{{{}}}", element_type),
        }
    }
}

/// Error returned when a token cannot be converted losslessly.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cannot convert a token of type {from} to type {to}")]
pub struct ConversionError {
    /// Type of the token.
    pub from: TokenType,
    /// Requested type.
    pub to: TokenType,
}
