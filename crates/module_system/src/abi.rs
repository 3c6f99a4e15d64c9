//! The binary interface between the host and a compiled module.
//!
//! Every module image exports a fixed set of C-ABI functions, generated by the
//! compiler. The host only relies on these symbols and on the JSON manifest
//! returned by [`symbols::MANIFEST`]; it never sees module types directly.

use crate::commands::ParamSpec;
use serde::{Deserialize, Serialize};

/// Bumped whenever the exported symbols or the manifest change shape.
pub const MODULE_ABI_VERSION: u32 = 1;

/// Separates the value and the target type in an argument-conversion reply.
pub const REPLY_FIELD_SEPARATOR: char = '\u{1f}';

/// Exported symbol names, NUL-terminated for `libloading`.
pub mod symbols {
    pub const ABI_VERSION: &[u8] = b"horizon_module_abi_version\0";
    pub const MANIFEST: &[u8] = b"horizon_module_manifest\0";
    pub const CREATE: &[u8] = b"horizon_module_create\0";
    pub const DESTROY: &[u8] = b"horizon_module_destroy\0";
    pub const BIND_REF: &[u8] = b"horizon_module_bind_ref\0";
    pub const ON_LOADED: &[u8] = b"horizon_module_on_loaded\0";
    pub const ON_UNLOADING: &[u8] = b"horizon_module_on_unloading\0";
    pub const ON_SERVER: &[u8] = b"horizon_module_on_server\0";
    pub const INVOKE: &[u8] = b"horizon_module_invoke\0";
    pub const FREE_REPLY: &[u8] = b"horizon_module_free_reply\0";

    /// Name without the trailing NUL, as written in generated code.
    pub fn name(symbol: &[u8]) -> &str {
        let trimmed = symbol.strip_suffix(b"\0").unwrap_or(symbol);
        std::str::from_utf8(trimmed).unwrap_or_default()
    }
}

/// Description of a compiled module, embedded in its image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub abi_version: u32,
    pub identity: String,
    /// `ServerModule` or `ConsoleModule`.
    pub contract: String,
    /// Every public type in the compiled source implementing a module contract.
    pub module_types: Vec<String>,
    /// In the order of the module's invoke table.
    pub commands: Vec<CommandManifest>,
    /// Identities the module can receive as `ModuleRef` fields.
    #[serde(default)]
    pub module_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub method: String,
    pub params: Vec<ParamSpec>,
}

/// Passed to modules when the host creates its server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHandle {
    pub name: String,
    pub bind_address: String,
}

/// A decoded reply from `horizon_module_invoke`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The command produced no output.
    Empty,
    Output(String),
    /// The handler reported an error.
    Failed(String),
    /// The module could not parse an argument into its declared type.
    Conversion { value: String, target: String },
    /// The handler panicked; the panic was caught inside the module.
    Panicked(String),
}

impl Reply {
    pub fn decode(raw: &str) -> Reply {
        let mut chars = raw.chars();
        let tag = chars.next();
        let body = chars.as_str().to_string();
        match tag {
            Some('N') | None => Reply::Empty,
            Some('O') => Reply::Output(body),
            Some('E') => Reply::Failed(body),
            Some('A') => match body.split_once(REPLY_FIELD_SEPARATOR) {
                Some((value, target)) => Reply::Conversion {
                    value: value.to_string(),
                    target: target.to_string(),
                },
                None => Reply::Conversion {
                    value: body,
                    target: "unknown".to_string(),
                },
            },
            Some('P') => Reply::Panicked(body),
            Some(other) => Reply::Failed(format!("malformed reply tag '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ParamKind;

    #[test]
    fn test_reply_decoding() {
        assert_eq!(Reply::decode("N"), Reply::Empty);
        assert_eq!(Reply::decode(""), Reply::Empty);
        assert_eq!(Reply::decode("Ohello"), Reply::Output("hello".to_string()));
        assert_eq!(Reply::decode("Eno such user"), Reply::Failed("no such user".to_string()));
        assert_eq!(
            Reply::decode("A1.2.3.4\u{1f}SocketAddr"),
            Reply::Conversion {
                value: "1.2.3.4".to_string(),
                target: "SocketAddr".to_string()
            }
        );
        assert_eq!(Reply::decode("Pboom"), Reply::Panicked("boom".to_string()));
        assert!(matches!(Reply::decode("Z"), Reply::Failed(_)));
    }

    #[test]
    fn test_symbol_names() {
        assert_eq!(symbols::name(symbols::INVOKE), "horizon_module_invoke");
        assert_eq!(symbols::name(symbols::ABI_VERSION), "horizon_module_abi_version");
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = ModuleManifest {
            abi_version: MODULE_ABI_VERSION,
            identity: "Greeter".to_string(),
            contract: "ServerModule".to_string(),
            module_types: vec!["Greeter".to_string()],
            commands: vec![CommandManifest {
                name: "greet".to_string(),
                description: None,
                method: "greet".to_string(),
                params: vec![ParamSpec::optional("name", ParamKind::Text)],
            }],
            module_refs: vec![],
        };

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["commands"][0]["params"][0]["kind"]["kind"], "text");
        let parsed: ModuleManifest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, manifest);
    }
}
