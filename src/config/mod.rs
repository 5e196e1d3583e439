//! Configuration model and loading for `xiaozhi.config.{json,json5,jsonc}`.
//!
//! The core only ever reads this file; writing it back (with comments and
//! formatting preserved) is the admin surface's job, out of scope here.

pub mod io;
pub mod model;
pub mod validation;

pub use io::{config_dir, find_config_file, load_config, load_config_from_path};
pub use model::{
    ConfigError, ConnectionConfig, CustomMcpConfig, CustomToolDecl, CustomToolHandlerConfig, McpServerEntry, ProxyHandler,
    ScriptHandler, ScriptInterpreter, ToolSettings, XiaozhiConfig, infer_transport, resolve_service_config,
};
pub use validation::validate_config;
