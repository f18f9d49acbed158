//! Per-provider credential schemas.
//!
//! Submitted credentials arrive as free-form JSON. [`ProviderCredentials::parse`]
//! checks the provider name and the required-field set before anything is
//! encrypted, and reports every missing field by name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    Lambda,
    Runpod,
    Oci,
    Nebius,
}

impl Provider {
    pub const ALL: [Provider; 7] = [
        Provider::Aws,
        Provider::Azure,
        Provider::Gcp,
        Provider::Lambda,
        Provider::Runpod,
        Provider::Oci,
        Provider::Nebius,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::Lambda => "lambda",
            Provider::Runpod => "runpod",
            Provider::Oci => "oci",
            Provider::Nebius => "nebius",
        }
    }

    /// Fields that must be present and non-empty.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Provider::Aws => &["access_key_id", "secret_access_key"],
            Provider::Azure => &["client_id", "client_secret", "tenant_id", "subscription_id"],
            Provider::Gcp => &["project_id", "service_account_json"],
            Provider::Lambda | Provider::Runpod => &["api_key"],
            Provider::Oci => &["user_ocid", "tenancy_ocid", "fingerprint", "private_key"],
            Provider::Nebius => &["api_key", "project_id"],
        }
    }
}

impl FromStr for Provider {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| VaultError::UnknownProvider(s.to_string()))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub subscription_id: String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct GcpCredentials {
    pub project_id: String,
    /// The service-account key file, as a JSON object.
    pub service_account_json: serde_json::Map<String, Value>,
}

/// Shape shared by the GPU marketplaces that authenticate with one API key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyCredentials {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OciCredentials {
    pub user_ocid: String,
    pub tenancy_ocid: String,
    pub fingerprint: String,
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NebiusCredentials {
    pub api_key: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Validated credentials for one provider.
///
/// `Debug` prints only the provider name.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "credentials", rename_all = "lowercase")]
pub enum ProviderCredentials {
    Aws(AwsCredentials),
    Azure(AzureCredentials),
    Gcp(GcpCredentials),
    Lambda(ApiKeyCredentials),
    Runpod(ApiKeyCredentials),
    Oci(OciCredentials),
    Nebius(NebiusCredentials),
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("provider", &self.provider().as_str())
            .finish_non_exhaustive()
    }
}

impl ProviderCredentials {
    /// Validate free-form JSON against the named provider's schema.
    pub fn parse(provider: &str, credentials: Value) -> VaultResult<Self> {
        let provider: Provider = provider.parse()?;
        let name = provider.as_str();

        let Value::Object(fields) = &credentials else {
            return Err(VaultError::InvalidCredentials {
                provider: name,
                reason: "credentials must be a JSON object".to_string(),
            });
        };

        let missing: Vec<&'static str> = provider
            .required_fields()
            .iter()
            .copied()
            .filter(|field| match fields.get(*field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(Value::Object(o)) => o.is_empty(),
                Some(_) => false,
            })
            .collect();
        if !missing.is_empty() {
            return Err(VaultError::MissingFields {
                provider: name,
                fields: missing,
            });
        }

        let invalid = |e: serde_json::Error| VaultError::InvalidCredentials {
            provider: name,
            reason: e.to_string(),
        };
        let parsed = match provider {
            Provider::Aws => Self::Aws(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Azure => Self::Azure(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Gcp => Self::Gcp(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Lambda => Self::Lambda(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Runpod => Self::Runpod(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Oci => Self::Oci(serde_json::from_value(credentials).map_err(invalid)?),
            Provider::Nebius => Self::Nebius(serde_json::from_value(credentials).map_err(invalid)?),
        };
        Ok(parsed)
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Aws(_) => Provider::Aws,
            Self::Azure(_) => Provider::Azure,
            Self::Gcp(_) => Provider::Gcp,
            Self::Lambda(_) => Provider::Lambda,
            Self::Runpod(_) => Provider::Runpod,
            Self::Oci(_) => Provider::Oci,
            Self::Nebius(_) => Provider::Nebius,
        }
    }
}
