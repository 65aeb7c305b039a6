mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{BrokerSettings, ClientSettings, ServerSettings, Settings};


/// Loads the configuration from an optional explicit file, the default
/// `config/default` file and environment variables, then merges the result
/// with default values.
///
/// When `path` is given the file must exist and parse; the implicit
/// `config/default` source stays optional either way.
pub fn load_config(path: Option<&Path>) -> Result<Settings, ConfigError> {
    // Pick up a .env file if one is present
    dotenvy::dotenv().ok();

    let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .add_source(Environment::default().separator("_"))
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        server: partial.server.unwrap_or_default().merge(default.server),
        broker: partial.broker.unwrap_or_default().merge(default.broker),
        client: partial.client.unwrap_or_default().merge(default.client),
    })
}
