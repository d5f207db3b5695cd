#![forbid(unsafe_code)]

//! Command-line spellings of type arguments and argument values.

use miette::Diagnostic;
use slate_ast::AccountAddress;
use slate_core::{FunctionId, StructId, StructTag, Type, TypeUniverse};
use slate_interpret::{StructValue, Value};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
#[error("invalid argument `{input}`: {message}")]
#[diagnostic(code(slate::cli::argument))]
pub struct ArgError {
    pub input: String,
    pub message: String,
}

impl ArgError {
    fn new(input: &str, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

/// `Module::function`
pub fn parse_function(src: &str) -> Result<FunctionId, ArgError> {
    match src.split_once("::") {
        Some((module, name)) if !module.is_empty() && !name.is_empty() && !name.contains("::") => {
            Ok(FunctionId::new(module, name))
        }
        _ => Err(ArgError::new(src, "expected `Module::function`")),
    }
}

/// Parse a type such as `u64`, `vector<u8>` or `Bank::Box<Bank::Coin>`.
pub fn parse_type(src: &str) -> Result<Type, ArgError> {
    let mut parser = TypeParser { src, rest: src };
    let ty = parser.ty()?;
    if !parser.rest.trim().is_empty() {
        return Err(parser.error(format!("unexpected `{}`", parser.rest.trim())));
    }
    Ok(ty)
}

struct TypeParser<'a> {
    src: &'a str,
    rest: &'a str,
}

impl<'a> TypeParser<'a> {
    fn error(&self, message: impl Into<String>) -> ArgError {
        ArgError::new(self.src, message)
    }

    fn eat(&mut self, token: &str) -> bool {
        let trimmed = self.rest.trim_start();
        match trimmed.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn ident(&mut self) -> Result<&'a str, ArgError> {
        let trimmed = self.rest.trim_start();
        let end = trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        if end == 0 {
            return Err(self.error("expected a type name"));
        }
        let (ident, rest) = trimmed.split_at(end);
        self.rest = rest;
        Ok(ident)
    }

    fn args(&mut self) -> Result<Vec<Type>, ArgError> {
        let mut args = Vec::new();
        if !self.eat("<") {
            return Ok(args);
        }
        loop {
            args.push(self.ty()?);
            if self.eat(">") {
                return Ok(args);
            }
            if !self.eat(",") {
                return Err(self.error("expected `,` or `>`"));
            }
        }
    }

    fn ty(&mut self) -> Result<Type, ArgError> {
        let head = self.ident()?;
        let ty = match head {
            "bool" => Type::Bool,
            "u8" => Type::U8,
            "u64" => Type::U64,
            "u128" => Type::U128,
            "address" => Type::Address,
            "signer" => Type::Signer,
            "vector" => match self.args()?.as_slice() {
                [elem] => Type::Vector(Box::new(elem.clone())),
                _ => return Err(self.error("`vector` takes exactly one type argument")),
            },
            module => {
                if !self.eat("::") {
                    return Err(self.error(format!("unknown type `{module}`; structs are written `Module::Name`")));
                }
                let name = self.ident()?;
                let args = self.args()?;
                Type::Struct(StructTag::new(StructId::new(module, name), args))
            }
        };
        Ok(ty)
    }
}

/// Convert a command-line value to a runtime value of type `ty`.
///
/// JSON is accepted everywhere (`[1, 2]`, `{"v": 5}`); anything that is not
/// valid JSON is taken as a bare string, so `0x1` and `17` work unquoted.
pub fn parse_value(src: &str, ty: &Type, universe: &TypeUniverse) -> Result<Value, ArgError> {
    // Plain digits stay textual so u128 values beyond f64 precision survive.
    let digits = !src.is_empty() && src.bytes().all(|b| b.is_ascii_digit());
    let json = if digits {
        serde_json::Value::String(src.to_string())
    } else {
        serde_json::from_str(src).unwrap_or_else(|_| serde_json::Value::String(src.to_string()))
    };
    from_json(&json, ty, universe).map_err(|message| ArgError::new(src, message))
}

fn from_json(json: &serde_json::Value, ty: &Type, universe: &TypeUniverse) -> Result<Value, String> {
    use serde_json::Value as Json;

    let unsigned = |json: &Json| -> Result<u128, String> {
        match json {
            Json::Number(n) => n.as_u64().map(u128::from).ok_or_else(|| format!("`{n}` is not an unsigned integer")),
            Json::String(s) => s.parse().map_err(|_| format!("`{s}` is not an unsigned integer")),
            other => Err(format!("expected an integer, got {other}")),
        }
    };
    let narrow = |n: u128, max: u128| -> Result<u128, String> {
        if n > max {
            Err(format!("{n} does not fit in `{ty}`"))
        } else {
            Ok(n)
        }
    };

    Ok(match ty {
        Type::Bool => match json {
            Json::Bool(b) => Value::Bool(*b),
            Json::String(s) if s == "true" || s == "false" => Value::Bool(s == "true"),
            other => return Err(format!("expected a bool, got {other}")),
        },
        Type::U8 => Value::U8(narrow(unsigned(json)?, u8::MAX.into())? as u8),
        Type::U64 => Value::U64(narrow(unsigned(json)?, u64::MAX.into())? as u64),
        Type::U128 => Value::U128(unsigned(json)?),
        Type::Address => match json {
            Json::String(s) => Value::Address(s.parse::<AccountAddress>().map_err(|e| e.to_string())?),
            other => return Err(format!("expected an address, got {other}")),
        },
        Type::Vector(elem) => match json {
            Json::Array(items) => Value::Vector(
                items
                    .iter()
                    .map(|item| from_json(item, elem, universe))
                    .collect::<Result<_, _>>()?,
            ),
            other => return Err(format!("expected an array, got {other}")),
        },
        Type::Struct(tag) => {
            let Json::Object(map) = json else {
                return Err(format!("expected an object for `{tag}`, got {json}"));
            };
            let fields = universe
                .instantiate_fields(tag)
                .ok_or_else(|| format!("unknown struct `{tag}`"))?;
            if let Some(extra) = map.keys().find(|k| !fields.iter().any(|(name, _)| name == *k)) {
                return Err(format!("`{tag}` has no field `{extra}`"));
            }
            let mut values = Vec::with_capacity(fields.len());
            for (name, field_ty) in &fields {
                let field = map
                    .get(name)
                    .ok_or_else(|| format!("missing field `{name}` of `{tag}`"))?;
                values.push(from_json(field, field_ty, universe)?);
            }
            Value::Struct(StructValue::new(tag.clone(), values))
        }
        Type::Signer => return Err("signers are supplied by `--sender`".to_string()),
        Type::Unit | Type::Param { .. } | Type::Ref { .. } => {
            return Err(format!("values of type `{ty}` cannot be given on the command line"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_ast::{Module, StructDecl, TypeRef};

    fn universe() -> TypeUniverse {
        let module = Module::new("Bank").with_struct(StructDecl::new("Coin").field("v", TypeRef::U64));
        let (universe, errors) = TypeUniverse::build(&[module]);
        assert!(errors.is_empty());
        universe
    }

    fn coin_tag() -> StructTag {
        StructTag::new(StructId::new("Bank", "Coin"), vec![])
    }

    #[test]
    fn test_parse_function() {
        assert_eq!(parse_function("Bank::bump"), Ok(FunctionId::new("Bank", "bump")));
        assert!(parse_function("bump").is_err());
        assert!(parse_function("A::B::c").is_err());
    }

    #[test]
    fn test_parse_nested_types() {
        assert_eq!(parse_type("u64"), Ok(Type::U64));
        assert_eq!(parse_type(" vector< u8 > "), Ok(Type::Vector(Box::new(Type::U8))));
        assert_eq!(
            parse_type("Bank::Box<Bank::Coin, vector<address>>"),
            Ok(Type::Struct(StructTag::new(
                StructId::new("Bank", "Box"),
                vec![Type::Struct(coin_tag()), Type::Vector(Box::new(Type::Address))],
            )))
        );
        assert!(parse_type("Coin").is_err());
        assert!(parse_type("vector<u8, u8>").is_err());
        assert!(parse_type("u64>").is_err());
    }

    #[test]
    fn test_parse_scalar_values() {
        let u = universe();
        assert_eq!(parse_value("17", &Type::U64, &u), Ok(Value::U64(17)));
        assert_eq!(parse_value("255", &Type::U8, &u), Ok(Value::U8(255)));
        assert!(parse_value("256", &Type::U8, &u).is_err());
        assert_eq!(
            parse_value("340282366920938463463374607431768211455", &Type::U128, &u),
            Ok(Value::U128(u128::MAX))
        );
        assert_eq!(parse_value("true", &Type::Bool, &u), Ok(Value::Bool(true)));
        assert_eq!(parse_value("0x2", &Type::Address, &u), Ok(Value::Address(AccountAddress::from_u64(2))));
        assert!(parse_value("0x1", &Type::Signer, &u).is_err());
    }

    #[test]
    fn test_parse_compound_values() {
        let u = universe();
        let coins = Type::Vector(Box::new(Type::Struct(coin_tag())));
        let coin = |v| Value::Struct(StructValue::new(coin_tag(), vec![Value::U64(v)]));
        assert_eq!(
            parse_value(r#"[{"v": 1}, {"v": "2"}]"#, &coins, &u),
            Ok(Value::Vector(vec![coin(1), coin(2)]))
        );
        assert!(parse_value(r#"{"w": 1}"#, &Type::Struct(coin_tag()), &u).is_err());
        assert!(parse_value(r#"{}"#, &Type::Struct(coin_tag()), &u).is_err());
    }
}
