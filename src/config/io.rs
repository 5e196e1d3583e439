//! Loading `xiaozhi.config.{json,json5,jsonc}` from `XIAOZHI_CONFIG_DIR`.

use crate::config::model::{ConfigError, XiaozhiConfig};
use crate::config::validation::validate_config as validate;
use std::env;
use std::path::{Path, PathBuf};

const CANDIDATE_NAMES: &[&str] = &["xiaozhi.config.json", "xiaozhi.config.json5", "xiaozhi.config.jsonc"];

/// The directory the core looks for a config file in: `XIAOZHI_CONFIG_DIR`
/// if set, otherwise the process's current working directory.
pub fn config_dir() -> PathBuf {
    env::var("XIAOZHI_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Locate the first existing candidate config file in `dir`.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CANDIDATE_NAMES.iter().map(|name| dir.join(name)).find(|path| path.exists())
}

/// Load and validate the config document from `XIAOZHI_CONFIG_DIR`. A
/// missing file is not an error: it yields the default (empty) config, same
/// as the teacher's own `load_config_from_path` behavior for a missing path.
pub async fn load_config() -> Result<XiaozhiConfig, ConfigError> {
    let dir = config_dir();
    match find_config_file(&dir) {
        Some(path) => load_config_from_path(&path).await,
        None => Ok(XiaozhiConfig::default()),
    }
}

/// Load and validate the config document from a specific path, tolerating
/// JSON5/JSONC comments and trailing commas on read.
pub async fn load_config_from_path(path: &Path) -> Result<XiaozhiConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let stripped = strip_jsonc(&content);
    let config: XiaozhiConfig = serde_json::from_str(&stripped)?;
    validate(&config)?;
    Ok(config)
}

/// Best-effort removal of `//` and `/* */` comments and trailing commas
/// before object/array close brackets, so a hand-authored JSONC/JSON5 file
/// parses as plain JSON. This core never writes the file back, so there is
/// no need to preserve the stripped syntax — only the admin surface (out of
/// scope here) round-trips comments on write.
fn strip_jsonc(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            ',' => {
                // Drop a trailing comma: peek past whitespace for a closer.
                let lookahead = chars.clone();
                let next_non_whitespace = lookahead.filter(|c| !c.is_whitespace()).next();
                let is_trailing = matches!(next_non_whitespace, Some('}') | Some(']'));
                if !is_trailing {
                    out.push(c);
                }
            }
            other => out.push(other),
        }
    }

    out
}
