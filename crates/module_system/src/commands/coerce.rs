//! Parameter descriptors and argument coercion.

use crate::error::CommandError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of a command parameter, after unwrapping `Option<T>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    Bool,
    Integer { signed: bool, bits: u8 },
    Float { bits: u8 },
    Char,
    Enum { type_name: String, members: Vec<String> },
    /// Any other type; the module parses it with `FromStr`.
    Other { type_name: String },
}

impl ParamKind {
    /// Human-readable type name used in help output and error messages.
    pub fn type_name(&self) -> String {
        match self {
            ParamKind::Text => "String".to_string(),
            ParamKind::Bool => "bool".to_string(),
            ParamKind::Integer { signed, bits } => {
                format!("{}{}", if *signed { "i" } else { "u" }, bits)
            }
            ParamKind::Float { bits } => format!("f{}", bits),
            ParamKind::Char => "char".to_string(),
            ParamKind::Enum { type_name, .. } => type_name.clone(),
            ParamKind::Other { type_name } => type_name.clone(),
        }
    }
}

/// One parameter of a command handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    /// Optional parameters may be omitted from the end of the argument list.
    #[serde(default)]
    pub optional: bool,
    /// Literal text of the declared default, coerced like operator input.
    #[serde(default)]
    pub default: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.optional = true;
        self.default = Some(default.into());
        self
    }

    /// Value used when the operator leaves this parameter out.
    pub fn default_value(&self) -> Result<Option<ArgValue>, CommandError> {
        match &self.default {
            Some(text) => coerce(text, self).map(Some),
            None => Ok(None),
        }
    }
}

/// A coerced command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    Bool(bool),
    Integer(i128),
    Float(f64),
    Char(char),
    Enum { type_name: String, member: String },
    Other(String),
}

impl ArgValue {
    /// Canonical text handed across the module boundary.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(text) | ArgValue::Other(text) => Some(text),
            ArgValue::Enum { member, .. } => Some(member),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Text(text) | ArgValue::Other(text) => write!(f, "{}", text),
            ArgValue::Bool(value) => write!(f, "{}", value),
            ArgValue::Integer(value) => write!(f, "{}", value),
            ArgValue::Float(value) => write!(f, "{}", value),
            ArgValue::Char(value) => write!(f, "{}", value),
            ArgValue::Enum { member, .. } => write!(f, "{}", member),
        }
    }
}

/// Converts one raw token to the declared type of `param`.
pub fn coerce(raw: &str, param: &ParamSpec) -> Result<ArgValue, CommandError> {
    let fail = || CommandError::ArgumentConversion {
        value: raw.to_string(),
        target: param.kind.type_name(),
    };

    match &param.kind {
        ParamKind::Text => Ok(ArgValue::Text(raw.to_string())),
        ParamKind::Enum { type_name, members } => members
            .iter()
            .find(|member| member.eq_ignore_ascii_case(raw.trim()))
            .map(|member| ArgValue::Enum {
                type_name: type_name.clone(),
                member: member.clone(),
            })
            .ok_or_else(fail),
        ParamKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(ArgValue::Bool(true)),
            "false" => Ok(ArgValue::Bool(false)),
            _ => Err(fail()),
        },
        ParamKind::Integer { signed, bits } => {
            let value: i128 = raw.trim().parse().map_err(|_| fail())?;
            if integer_fits(value, *signed, *bits) {
                Ok(ArgValue::Integer(value))
            } else {
                Err(fail())
            }
        }
        ParamKind::Float { bits } => {
            let value: f64 = raw.trim().parse().map_err(|_| fail())?;
            if *bits == 32 && value.is_finite() && value.abs() > f32::MAX as f64 {
                return Err(fail());
            }
            Ok(ArgValue::Float(value))
        }
        ParamKind::Char => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(ArgValue::Char(c)),
                _ => Err(fail()),
            }
        }
        ParamKind::Other { .. } => Ok(ArgValue::Other(raw.to_string())),
    }
}

fn integer_fits(value: i128, signed: bool, bits: u8) -> bool {
    let bits = u32::from(bits.clamp(8, 64));
    if signed {
        let max = (1i128 << (bits - 1)) - 1;
        let min = -(1i128 << (bits - 1));
        (min..=max).contains(&value)
    } else {
        let max = (1i128 << bits) - 1;
        (0..=max).contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color() -> ParamKind {
        ParamKind::Enum {
            type_name: "Color".to_string(),
            members: vec!["Red".to_string(), "DarkBlue".to_string()],
        }
    }

    #[test]
    fn test_text_passes_through_verbatim() {
        let param = ParamSpec::required("message", ParamKind::Text);
        assert_eq!(
            coerce("  Hello World ", &param).unwrap(),
            ArgValue::Text("  Hello World ".to_string())
        );
    }

    #[test]
    fn test_enum_is_case_insensitive_and_canonical() {
        let param = ParamSpec::required("color", color());
        let value = coerce("darkblue", &param).unwrap();
        assert_eq!(
            value,
            ArgValue::Enum {
                type_name: "Color".to_string(),
                member: "DarkBlue".to_string()
            }
        );
        assert_eq!(value.to_wire(), "DarkBlue");
    }

    #[test]
    fn test_enum_rejects_unknown_member() {
        let param = ParamSpec::required("color", color());
        let error = coerce("green", &param).unwrap_err();
        assert_eq!(
            error,
            CommandError::ArgumentConversion {
                value: "green".to_string(),
                target: "Color".to_string()
            }
        );
    }

    #[test]
    fn test_integer_range_follows_width() {
        let byte = ParamSpec::required("b", ParamKind::Integer { signed: false, bits: 8 });
        assert_eq!(coerce("255", &byte).unwrap(), ArgValue::Integer(255));
        assert!(coerce("256", &byte).is_err());
        assert!(coerce("-1", &byte).is_err());

        let small = ParamSpec::required("s", ParamKind::Integer { signed: true, bits: 8 });
        assert_eq!(coerce("-128", &small).unwrap(), ArgValue::Integer(-128));
        assert!(coerce("128", &small).is_err());
        assert!(coerce("twelve", &small).is_err());
    }

    #[test]
    fn test_bool_char_and_float() {
        let flag = ParamSpec::required("flag", ParamKind::Bool);
        assert_eq!(coerce("TRUE", &flag).unwrap(), ArgValue::Bool(true));
        assert!(coerce("yes", &flag).is_err());

        let letter = ParamSpec::required("c", ParamKind::Char);
        assert_eq!(coerce("x", &letter).unwrap(), ArgValue::Char('x'));
        assert!(coerce("xy", &letter).is_err());

        let ratio = ParamSpec::required("r", ParamKind::Float { bits: 64 });
        assert_eq!(coerce("0.25", &ratio).unwrap(), ArgValue::Float(0.25));
        assert!(coerce("quarter", &ratio).is_err());
    }

    #[test]
    fn test_other_types_are_left_to_the_module() {
        let param = ParamSpec::required(
            "addr",
            ParamKind::Other {
                type_name: "SocketAddr".to_string(),
            },
        );
        assert_eq!(
            coerce("127.0.0.1:80", &param).unwrap(),
            ArgValue::Other("127.0.0.1:80".to_string())
        );
    }

    #[test]
    fn test_default_value_is_coerced() {
        let param = ParamSpec::required("times", ParamKind::Integer { signed: true, bits: 64 })
            .with_default("3");
        assert!(param.optional);
        assert_eq!(param.default_value().unwrap(), Some(ArgValue::Integer(3)));

        let none = ParamSpec::optional("color", color());
        assert_eq!(none.default_value().unwrap(), None);
    }

    #[test]
    fn test_param_kind_serializes_tagged() {
        let json = serde_json::to_value(ParamKind::Integer { signed: true, bits: 32 }).unwrap();
        assert_eq!(json["kind"], "integer");
        assert_eq!(json["bits"], 32);
    }
}
