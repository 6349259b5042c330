use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProvisionError, Result};

/// Cloud credentials handed to the external tool through its environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Credentials {
    Aws {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        session_token: Option<String>,
        #[serde(default)]
        region: Option<String>,
    },
    Azure {
        client_id: String,
        client_secret: String,
        subscription_id: String,
        tenant_id: String,
    },
    Gcp {
        /// Service account key, JSON document
        credentials_json: String,
        #[serde(default)]
        project: Option<String>,
    },
}

// Secrets never reach logs through Debug
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Parse from a JSON document; shape errors are validation errors.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| ProvisionError::Validation(format!("malformed credentials: {e}")))
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::Aws { .. } => "aws",
            Self::Azure { .. } => "azure",
            Self::Gcp { .. } => "gcp",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Aws {
                access_key_id,
                secret_access_key,
                ..
            } => {
                require("access_key_id", access_key_id)?;
                require("secret_access_key", secret_access_key)
            }
            Self::Azure {
                client_id,
                client_secret,
                subscription_id,
                tenant_id,
            } => {
                require("client_id", client_id)?;
                require("client_secret", client_secret)?;
                require("subscription_id", subscription_id)?;
                require("tenant_id", tenant_id)
            }
            Self::Gcp {
                credentials_json, ..
            } => {
                require("credentials_json", credentials_json)?;
                match serde_json::from_str::<serde_json::Value>(credentials_json) {
                    Ok(serde_json::Value::Object(_)) => Ok(()),
                    _ => Err(ProvisionError::Validation(
                        "gcp credentials_json must be a JSON object".into(),
                    )),
                }
            }
        }
    }

    /// Validated environment mapping for the tool's provider plugins.
    pub fn to_env(&self) -> Result<BTreeMap<String, String>> {
        self.validate()?;

        let mut env = BTreeMap::new();
        match self {
            Self::Aws {
                access_key_id,
                secret_access_key,
                session_token,
                region,
            } => {
                env.insert("AWS_ACCESS_KEY_ID".into(), access_key_id.clone());
                env.insert("AWS_SECRET_ACCESS_KEY".into(), secret_access_key.clone());
                insert_optional(&mut env, "AWS_SESSION_TOKEN", session_token);
                insert_optional(&mut env, "AWS_DEFAULT_REGION", region);
            }
            Self::Azure {
                client_id,
                client_secret,
                subscription_id,
                tenant_id,
            } => {
                env.insert("ARM_CLIENT_ID".into(), client_id.clone());
                env.insert("ARM_CLIENT_SECRET".into(), client_secret.clone());
                env.insert("ARM_SUBSCRIPTION_ID".into(), subscription_id.clone());
                env.insert("ARM_TENANT_ID".into(), tenant_id.clone());
            }
            Self::Gcp {
                credentials_json,
                project,
            } => {
                env.insert("GOOGLE_CREDENTIALS".into(), credentials_json.clone());
                insert_optional(&mut env, "GOOGLE_PROJECT", project);
            }
        }
        Ok(env)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(ProvisionError::Validation(format!(
            "credentials field {field} is required"
        )))
    } else {
        Ok(())
    }
}

fn insert_optional(env: &mut BTreeMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
        env.insert(key.into(), v.to_string());
    }
}
