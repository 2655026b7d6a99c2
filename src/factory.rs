//! Provider selection by name.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{ScalewayConfig, VirtFusionConfig};
use crate::error::ProviderError;
use crate::provider::Provider;
use crate::scaleway::ScalewayProvider;
use crate::virtfusion::VirtFusionProvider;

/// Supported provider backends.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProviderKind {
    /// Scaleway Instances.
    Scaleway,
    /// VirtFusion-managed hypervisors.
    VirtFusion,
}

impl ProviderKind {
    /// Every supported backend.
    pub const ALL: [Self; 2] = [Self::Scaleway, Self::VirtFusion];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
            Self::VirtFusion => "virtfusion",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "unknown provider {wanted:?}; expected one of: scaleway, virtfusion"
                ))
            })
    }
}

/// Configuration for one of the supported backends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderSettings {
    /// Scaleway credentials.
    Scaleway(ScalewayConfig),
    /// VirtFusion credentials.
    VirtFusion(VirtFusionConfig),
}

impl ProviderSettings {
    /// Loads the settings for `kind` from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when required variables are missing.
    pub fn from_env(kind: ProviderKind) -> Result<Self, ProviderError> {
        Ok(match kind {
            ProviderKind::Scaleway => Self::Scaleway(ScalewayConfig::load_from_env()?),
            ProviderKind::VirtFusion => Self::VirtFusion(VirtFusionConfig::load_from_env()?),
        })
    }

    /// Backend these settings configure.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Scaleway(_) => ProviderKind::Scaleway,
            Self::VirtFusion(_) => ProviderKind::VirtFusion,
        }
    }
}

/// Constructs the provider described by `settings`.
///
/// # Errors
///
/// Returns [`ProviderError::Config`] when the settings fail validation.
pub fn build_provider(settings: ProviderSettings) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider: Arc<dyn Provider> = match settings {
        ProviderSettings::Scaleway(config) => Arc::new(ScalewayProvider::new(config)?),
        ProviderSettings::VirtFusion(config) => Arc::new(VirtFusionProvider::new(config)?),
    };
    Ok(provider)
}

/// Loads credentials for `kind` from the environment and constructs the
/// provider.
///
/// # Errors
///
/// Returns [`ProviderError::Config`] when required variables are missing or
/// invalid.
pub fn provider_from_env(kind: ProviderKind) -> Result<Arc<dyn Provider>, ProviderError> {
    build_provider(ProviderSettings::from_env(kind)?)
}
