use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// REST API generation.
///
/// Versions share dispatch semantics and differ only in endpoint layout and
/// the shape of error payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    #[default]
    V2,
    V3,
}

impl ApiVersion {
    /// Full URL for `method` relative to a base such as
    /// `https://portal.bitrix24.com/rest/1/secret/`
    pub fn endpoint(&self, base: &str, method: &str) -> String {
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        match self {
            ApiVersion::V2 => format!("{}{}.json", base, method),
            ApiVersion::V3 => {
                let base = match base.find("/rest/") {
                    Some(pos) if !base[pos..].starts_with("/rest/api/") => {
                        format!("{}/rest/api/{}", &base[..pos], &base[pos + "/rest/".len()..])
                    }
                    Some(_) => base,
                    None => format!("{}api/", base),
                };
                format!("{}{}", base, method)
            }
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V2 => write!(f, "v2"),
            ApiVersion::V3 => write!(f, "v3"),
        }
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(ApiVersion::V2),
            "v3" | "3" => Ok(ApiVersion::V3),
            other => Err(format!("unknown API version '{}'", other)),
        }
    }
}
