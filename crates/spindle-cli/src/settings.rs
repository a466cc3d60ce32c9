//! Settings loading: optional TOML file, then `SPINDLE__*` environment variables.
//!
//! Unlike the library default, the binary stores jobs under `./.spindle` so
//! that `push` and `work` run as separate processes see the same queue.

use std::path::Path;

use spindle_core::config::Settings;

pub const DEFAULT_STORE_PATH: &str = ".spindle";

/// Load settings in this order, later sources winning:
/// 0. file store at [`DEFAULT_STORE_PATH`]
/// 1. `spindle.toml` in the working directory (optional)
/// 2. `path`, when given (required)
/// 3. Environment variables with the `SPINDLE` prefix, `__` between levels
///    (`SPINDLE__SLEEP_SECS=1`, `SPINDLE__STORE__BACKEND=file`,
///    `SPINDLE__QUEUES=high,default`)
pub fn load(path: Option<&Path>) -> Result<Settings, config::ConfigError> {
    let mut builder = config::Config::builder()
        .set_default("store.backend", "file")?
        .set_default("store.path", DEFAULT_STORE_PATH)?
        .add_source(config::File::with_name("spindle").required(false));
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix("SPINDLE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("queues")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}
