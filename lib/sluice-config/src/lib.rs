//! Layered configuration loading for sluice.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::{FileFormat, FileProvider};

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read or parsed.
    #[snafu(display("Failed to load configuration file '{}': {}", path, reason))]
    File {
        /// Path to the file.
        path: String,

        /// Why the file could not be loaded.
        reason: String,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field, including the environment variable names that would
        /// satisfy it.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's value did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: anyhow::Error,
    },
}

/// A configuration loader that layers several sources on top of each other.
///
/// Sources take precedence in the order they are added: a value from a source added later replaces the same value from
/// any source added before it. Arrays are replaced wholesale rather than concatenated, so a list given in the
/// environment fully overrides the list from a file.
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
/// - in-memory values (see [`with_values`][Self::with_values])
#[derive(Default)]
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefixes: Vec<String>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        self.add_file(path.as_ref(), FileFormat::Yaml)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.try_add_file(path.as_ref(), FileFormat::Yaml)
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error will be returned.
    pub fn from_json<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        self.add_file(path.as_ref(), FileFormat::Json)
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    pub fn try_from_json<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.try_add_file(path.as_ref(), FileFormat::Json)
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix has an underscore appended to it if it does not already end with one, so a prefix of `sluice` matches
    /// `SLUICE_URL`, which is exposed as the key `url`. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        self.figment = self.figment.merge(Env::prefixed(&prefix));
        self.env_prefixes.push(prefix);
        Ok(self)
    }

    /// Layers the given serializable values on top of all sources added so far.
    ///
    /// Useful for command-line overrides and for tests.
    pub fn with_values<T>(mut self, values: T) -> Self
    where
        T: Serialize,
    {
        self.figment = self.figment.merge(Serialized::defaults(values));
        self
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.figment
            .extract()
            .map_err(|e| from_figment_error(&self.env_prefixes, e))
    }

    /// Consumes the loader and wraps the merged configuration in a queryable, cheaply cloneable handle.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                env_prefixes: self.env_prefixes,
            }),
        }
    }

    fn add_file(mut self, path: &Path, format: FileFormat) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::read(path, format).map_err(|e| ConfigurationError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.figment = self.figment.merge(provider);
        Ok(self)
    }

    fn try_add_file(mut self, path: &Path, format: FileFormat) -> Self {
        match FileProvider::read(path, format) {
            Ok(provider) => self.figment = self.figment.merge(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to read configuration file. Ignoring.");
            }
        }
        self
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: Vec<String>,
}

/// A generic configuration object.
///
/// Holds the merged configuration derived from [`ConfigurationLoader`]. Values can be queried by key, where keys in
/// the form of `a.b.c` address nested values.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            // Environment variables can't express nesting, so `a.b` may only be present as `a_b`.
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => self
                .inner
                .figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|e| from_figment_error(&self.inner.env_prefixes, e)),
            Err(e) => Err(from_figment_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key, or the default value of `T` if the key is missing or invalid.
    ///
    /// This swallows deserialization errors and should be used sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get_typed(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the value exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get_typed(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
    }
}

fn from_figment_error(env_prefixes: &[String], e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut candidates = vec![field.to_string()];
            candidates.extend(
                env_prefixes
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase())),
            );

            let help_text = format!("Try setting `{}`.", candidates.join("` or `"));
            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use figment::Jail;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Settings {
        url: String,
        #[serde(default)]
        buffering_count: usize,
        #[serde(default)]
        retry_delays_ms: Vec<u64>,
    }

    #[test]
    fn later_sources_take_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file("sluice.yaml", "url: http://file:8086\nbuffering_count: 10\n")?;
            jail.set_env("SLUICE_URL", "http://env:8086");

            let settings: Settings = ConfigurationLoader::default()
                .from_yaml("sluice.yaml")
                .expect("file should load")
                .from_environment("sluice")
                .expect("prefix is not empty")
                .into_typed()
                .expect("settings should deserialize");

            assert_eq!(settings.url, "http://env:8086");
            assert_eq!(settings.buffering_count, 10);
            Ok(())
        });
    }

    #[test]
    fn arrays_are_replaced_not_concatenated() {
        Jail::expect_with(|jail| {
            jail.create_file("sluice.json", r#"{"url": "http://a", "retry_delays_ms": [200, 400, 600]}"#)?;

            let settings: Settings = ConfigurationLoader::default()
                .from_json("sluice.json")
                .expect("file should load")
                .with_values(BTreeMap::from([("retry_delays_ms", vec![50u64])]))
                .into_typed()
                .expect("settings should deserialize");

            assert_eq!(settings.retry_delays_ms, vec![50]);
            Ok(())
        });
    }

    #[test]
    fn missing_optional_file_is_ignored() {
        Jail::expect_with(|_| {
            let settings: Settings = ConfigurationLoader::default()
                .try_from_yaml("does-not-exist.yaml")
                .with_values(BTreeMap::from([("url", "http://a")]))
                .into_typed()
                .expect("settings should deserialize");

            assert_eq!(settings.url, "http://a");
            Ok(())
        });
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = ConfigurationLoader::default().from_yaml("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigurationError::File { .. })));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let result = ConfigurationLoader::default().from_environment("");
        assert!(matches!(result, Err(ConfigurationError::EmptyPrefix)));
    }

    #[test]
    fn missing_field_mentions_environment_variable() {
        Jail::expect_with(|_| {
            let result = ConfigurationLoader::default()
                .from_environment("sluice")
                .expect("prefix is not empty")
                .into_typed::<Settings>();

            match result {
                Err(ConfigurationError::MissingField { help_text, field }) => {
                    assert_eq!(field, "url");
                    assert!(help_text.contains("SLUICE_URL"), "help text was: {}", help_text);
                }
                other => panic!("unexpected result: {:?}", other),
            }
            Ok(())
        });
    }

    #[test]
    fn generic_lookups() {
        Jail::expect_with(|jail| {
            jail.set_env("SLUICE_LOG_LEVEL", "debug");
            jail.set_env("SLUICE_BUFFERING_COUNT", "25");

            let config = ConfigurationLoader::default()
                .from_environment("SLUICE_")
                .expect("prefix is not empty")
                .into_generic();

            assert_eq!(config.get_typed::<String>("log_level").expect("key exists"), "debug");
            assert_eq!(config.get_typed::<usize>("buffering_count").expect("key exists"), 25);
            assert_eq!(config.try_get_typed::<String>("log_format").expect("not invalid"), None);
            assert!(!config.get_typed_or_default::<bool>("log_format_json"));
            assert!(matches!(
                config.get_typed::<usize>("log_level"),
                Err(ConfigurationError::InvalidFieldType { .. })
            ));
            Ok(())
        });
    }
}
