//! Capability predicates over a server's advertised capabilities.
//!
//! The capabilities object from a backend's `initialize` response stays
//! opaque JSON; routing only ever asks the small, closed set of questions
//! below. Anything outside the table routes to the primary backend with no
//! capability check.

use crate::config::ServerConfig;
use serde_json::Value;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";
pub const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";
pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

pub const COMPLETION: &str = "textDocument/completion";
pub const COMPLETION_RESOLVE: &str = "completionItem/resolve";
pub const SIGNATURE_HELP: &str = "textDocument/signatureHelp";
pub const FORMATTING: &str = "textDocument/formatting";
pub const RANGE_FORMATTING: &str = "textDocument/rangeFormatting";
pub const CODE_ACTION: &str = "textDocument/codeAction";
pub const EXECUTE_COMMAND: &str = "workspace/executeCommand";

/// Methods whose target backend may differ from the primary and is fixed by
/// a single resolver pass (executeCommand resolves per command instead).
pub const SINGLE_TARGET_METHODS: &[&str] = &[
    COMPLETION,
    COMPLETION_RESOLVE,
    SIGNATURE_HELP,
    FORMATTING,
    RANGE_FORMATTING,
];

/// Does `capabilities` advertise support for `method`?
///
/// Methods outside the predicate table are not capability-gated and report
/// `true`.
pub fn supports(capabilities: &Value, method: &str) -> bool {
    match method {
        COMPLETION => capabilities
            .get("completionProvider")
            .is_some_and(|v| !v.is_null()),
        COMPLETION_RESOLVE => capabilities
            .pointer("/completionProvider/resolveProvider")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        SIGNATURE_HELP => capabilities
            .get("signatureHelpProvider")
            .is_some_and(|v| !v.is_null()),
        FORMATTING => truthy(capabilities.get("documentFormattingProvider")),
        RANGE_FORMATTING => truthy(capabilities.get("documentRangeFormattingProvider")),
        CODE_ACTION => truthy(capabilities.get("codeActionProvider")),
        _ => true,
    }
}

/// Does `capabilities` advertise `command` under
/// `executeCommandProvider.commands`?
pub fn supports_command(capabilities: &Value, command: &str) -> bool {
    capabilities
        .pointer("/executeCommandProvider/commands")
        .and_then(Value::as_array)
        .is_some_and(|commands| commands.iter().any(|c| c.as_str() == Some(command)))
}

/// Commands advertised under `executeCommandProvider.commands`, in order.
pub fn advertised_commands(capabilities: &Value) -> Vec<String> {
    capabilities
        .pointer("/executeCommandProvider/commands")
        .and_then(Value::as_array)
        .map(|commands| {
            commands
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// The user preference flag covering `method`, if it has one.
pub fn preference_flag(config: &ServerConfig, method: &str) -> Option<bool> {
    match method {
        COMPLETION | COMPLETION_RESOLVE => Some(config.use_completion),
        SIGNATURE_HELP => Some(config.use_signature_help),
        FORMATTING | RANGE_FORMATTING => Some(config.use_formatting),
        EXECUTE_COMMAND => Some(config.use_execute_command),
        _ => None,
    }
}

/// The provider field in the `initialize` result that advertises `method`,
/// for the features whose field moves during response synthesis.
pub fn provider_field(method: &str) -> Option<&'static str> {
    match method {
        COMPLETION => Some("completionProvider"),
        SIGNATURE_HELP => Some("signatureHelpProvider"),
        FORMATTING => Some("documentFormattingProvider"),
        RANGE_FORMATTING => Some("documentRangeFormattingProvider"),
        _ => None,
    }
}

/// LSP allows provider fields to be a bool or an options object; `false` and
/// `null` both mean unsupported.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_requires_provider() {
        assert!(supports(&json!({"completionProvider": {}}), COMPLETION));
        assert!(supports(
            &json!({"completionProvider": {"triggerCharacters": ["."]}}),
            COMPLETION
        ));
        assert!(!supports(&json!({}), COMPLETION));
        assert!(!supports(&json!({"completionProvider": null}), COMPLETION));
    }

    #[test]
    fn test_resolve_requires_flag() {
        assert!(supports(
            &json!({"completionProvider": {"resolveProvider": true}}),
            COMPLETION_RESOLVE
        ));
        assert!(!supports(
            &json!({"completionProvider": {"resolveProvider": false}}),
            COMPLETION_RESOLVE
        ));
        assert!(!supports(&json!({"completionProvider": {}}), COMPLETION_RESOLVE));
    }

    #[test]
    fn test_formatting_truthiness() {
        assert!(supports(&json!({"documentFormattingProvider": true}), FORMATTING));
        assert!(supports(&json!({"documentFormattingProvider": {}}), FORMATTING));
        assert!(!supports(&json!({"documentFormattingProvider": false}), FORMATTING));
        assert!(!supports(&json!({"documentFormattingProvider": null}), FORMATTING));
        assert!(!supports(&json!({}), FORMATTING));
    }

    #[test]
    fn test_code_action_truthiness() {
        assert!(supports(&json!({"codeActionProvider": true}), CODE_ACTION));
        assert!(supports(
            &json!({"codeActionProvider": {"codeActionKinds": ["quickfix"]}}),
            CODE_ACTION
        ));
        assert!(!supports(&json!({"codeActionProvider": false}), CODE_ACTION));
    }

    #[test]
    fn test_unlisted_method_not_gated() {
        assert!(supports(&json!({}), "textDocument/hover"));
        assert!(supports(&json!({}), "workspace/symbol"));
    }

    #[test]
    fn test_command_membership() {
        let caps = json!({"executeCommandProvider": {"commands": ["fmt", "lint"]}});
        assert!(supports_command(&caps, "fmt"));
        assert!(supports_command(&caps, "lint"));
        assert!(!supports_command(&caps, "unknown"));
        assert!(!supports_command(&json!({}), "fmt"));
    }

    #[test]
    fn test_advertised_commands_order() {
        let caps = json!({"executeCommandProvider": {"commands": ["b", "a"]}});
        assert_eq!(advertised_commands(&caps), vec!["b", "a"]);
        assert!(advertised_commands(&json!({})).is_empty());
    }

    #[test]
    fn test_preference_flags() {
        let config = ServerConfig {
            use_completion: true,
            use_formatting: true,
            ..Default::default()
        };
        assert_eq!(preference_flag(&config, COMPLETION), Some(true));
        assert_eq!(preference_flag(&config, COMPLETION_RESOLVE), Some(true));
        assert_eq!(preference_flag(&config, SIGNATURE_HELP), Some(false));
        assert_eq!(preference_flag(&config, RANGE_FORMATTING), Some(true));
        assert_eq!(preference_flag(&config, "textDocument/hover"), None);
    }
}
