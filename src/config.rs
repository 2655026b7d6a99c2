//! Provider credentials loaded via `ortho-config`.
//!
//! Each backend reads its own environment prefix when it is constructed. A
//! missing credential is reported immediately with guidance on which variable
//! to set, rather than surfacing as an authentication failure on first use.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

const APP_NAME: &str = "hostwright";

/// Scaleway credentials and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Project identifier used for billing, SSH key lookup and resource
    /// scoping. This value is required.
    pub default_project_id: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// CPU architecture used when resolving image labels.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Base URL of the Scaleway API.
    #[ortho_config(default = "https://api.scaleway.com".to_owned())]
    pub api_url: String,
}

/// VirtFusion credentials.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "VIRTFUSION")]
pub struct VirtFusionConfig {
    /// Base URL of the VirtFusion API (for example
    /// `https://cp.example.com/api/v1`).
    pub api_url: String,
    /// Bearer token used for authentication.
    pub api_token: String,
    /// Numeric account identifier owning created servers.
    pub user_id: u64,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {APP_NAME}.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, for example when a
    /// required variable is absent.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        require_field(
            &self.api_url,
            &FieldMetadata::new("Scaleway API URL", "SCW_API_URL", "api_url", "scaleway"),
        )
    }
}

impl VirtFusionConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails and
    /// [`ConfigError::MissingField`] when a required value is blank.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// or the user identifier is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.api_url,
            &FieldMetadata::new(
                "VirtFusion API URL",
                "VIRTFUSION_API_URL",
                "api_url",
                "virtfusion",
            ),
        )?;
        require_field(
            &self.api_token,
            &FieldMetadata::new(
                "VirtFusion API token",
                "VIRTFUSION_API_TOKEN",
                "api_token",
                "virtfusion",
            ),
        )?;
        if self.user_id == 0 {
            return Err(FieldMetadata::new(
                "VirtFusion user ID",
                "VIRTFUSION_USER_ID",
                "user_id",
                "virtfusion",
            )
            .missing());
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn scaleway() -> ScalewayConfig {
        ScalewayConfig {
            secret_key: String::from("secret"),
            default_project_id: String::from("project"),
            default_organization_id: None,
            default_architecture: String::from("x86_64"),
            api_url: String::from("https://api.scaleway.com"),
        }
    }

    #[fixture]
    fn virtfusion() -> VirtFusionConfig {
        VirtFusionConfig {
            api_url: String::from("https://cp.example.com/api/v1"),
            api_token: String::from("token"),
            user_id: 42,
        }
    }

    #[rstest]
    fn complete_configs_validate(scaleway: ScalewayConfig, virtfusion: VirtFusionConfig) {
        assert_eq!(scaleway.validate(), Ok(()));
        assert_eq!(virtfusion.validate(), Ok(()));
    }

    #[rstest]
    fn blank_secret_names_the_environment_variable(scaleway: ScalewayConfig) {
        let config = ScalewayConfig {
            secret_key: String::from("  "),
            ..scaleway
        };
        let Err(ConfigError::MissingField(message)) = config.validate() else {
            panic!("blank secret key should be rejected");
        };
        assert!(message.contains("SCW_SECRET_KEY"), "message: {message}");
    }

    #[rstest]
    #[case::token(VirtFusionConfig { api_token: String::new(), ..virtfusion() }, "VIRTFUSION_API_TOKEN")]
    #[case::url(VirtFusionConfig { api_url: String::new(), ..virtfusion() }, "VIRTFUSION_API_URL")]
    #[case::user(VirtFusionConfig { user_id: 0, ..virtfusion() }, "VIRTFUSION_USER_ID")]
    fn virtfusion_reports_missing_fields(#[case] config: VirtFusionConfig, #[case] env_var: &str) {
        let Err(ConfigError::MissingField(message)) = config.validate() else {
            panic!("incomplete config should be rejected");
        };
        assert!(message.contains(env_var), "message: {message}");
    }
}
