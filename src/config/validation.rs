//! Structural validation of a parsed [`XiaozhiConfig`] before it seeds the
//! supervisor and registry.

use crate::config::model::{ConfigError, CustomToolHandlerConfig, ScriptHandler, XiaozhiConfig, infer_transport};

/// Validate a config document. Rejects what the core cannot safely act on:
/// services whose transport cannot be inferred, and custom tools whose
/// script handler names neither inline content nor a path.
///
/// Unrecognized handler *variants* are already rejected by serde at parse
/// time (an unknown `type` tag fails to deserialize), which is why this
/// function's `UnknownHandler` arm only guards the variant-specific shape
/// (both or neither of `content`/`path` set).
pub fn validate_config(config: &XiaozhiConfig) -> Result<(), ConfigError> {
    for (name, entry) in &config.mcp_servers {
        infer_transport(entry).map_err(|e| match e {
            ConfigError::InvalidService { reason, .. } => ConfigError::InvalidService {
                name: name.clone(),
                reason,
            },
            other => other,
        })?;
    }

    for tool in &config.custom_mcp.tools {
        if let CustomToolHandlerConfig::Script(ScriptHandler { content, path, .. }) = &tool.handler {
            match (content, path) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(ConfigError::UnknownHandler { name: tool.name.clone() });
                }
                _ => {}
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{CustomToolDecl, ScriptInterpreter};

    #[test]
    fn rejects_script_with_neither_content_nor_path() {
        let mut config = XiaozhiConfig::default();
        config.custom_mcp.tools.push(CustomToolDecl {
            name: "broken".into(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            handler: CustomToolHandlerConfig::Script(ScriptHandler {
                interpreter: ScriptInterpreter::Bash,
                content: None,
                path: None,
                timeout_ms: 30_000,
            }),
        });

        assert!(matches!(validate_config(&config), Err(ConfigError::UnknownHandler { .. })));
    }

    #[test]
    fn accepts_script_with_inline_content() {
        let mut config = XiaozhiConfig::default();
        config.custom_mcp.tools.push(CustomToolDecl {
            name: "ok".into(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            handler: CustomToolHandlerConfig::Script(ScriptHandler {
                interpreter: ScriptInterpreter::Bash,
                content: Some("echo hi".into()),
                path: None,
                timeout_ms: 30_000,
            }),
        });

        assert!(validate_config(&config).is_ok());
    }
}
