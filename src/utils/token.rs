use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use url::Url;

const SCAN_PURPOSE: &str = "scan";
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CorrelationClaims {
    pub sub: String, // stored object path
    pub purpose: String,
    pub exp: usize,
    pub jti: String,
}

/// Opaque token embedded in callback URLs to match a reply to its upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Signs and checks correlation tokens
#[derive(Clone)]
pub struct CallbackTokens {
    secret: String,
    ttl: Duration,
}

impl CallbackTokens {
    pub fn new(secret: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
        }
    }

    pub fn issue(&self, subject: &str) -> Result<CorrelationToken> {
        let expiration = Utc::now()
            .checked_add_signed(self.ttl)
            .ok_or_else(|| anyhow!("token lifetime overflows the clock"))?
            .timestamp();

        let claims = CorrelationClaims {
            sub: subject.to_owned(),
            purpose: SCAN_PURPOSE.to_string(),
            exp: expiration as usize,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )?;
        Ok(CorrelationToken(token))
    }

    /// Returns the subject the token was issued for.
    pub fn verify(&self, token: &str) -> Result<String> {
        let data = decode::<CorrelationClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::default(),
        )?;
        if data.claims.purpose != SCAN_PURPOSE {
            return Err(anyhow!("token was not issued for scan callbacks"));
        }
        Ok(data.claims.sub)
    }
}

/// The two addresses handed to the scanning service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    pub download_uri: String,
    pub callback_uri: String,
}

impl CallbackUrls {
    pub fn build(base: &str, token: &CorrelationToken) -> Result<Self> {
        let mut base = Url::parse(base).map_err(|e| anyhow!("invalid service base URL '{}': {}", base, e))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let download = base.join(&format!("files/{}/download", token.as_str()))?;
        let callback = base.join(&format!("files/{}/scan-result", token.as_str()))?;
        Ok(Self {
            download_uri: download.to_string(),
            callback_uri: callback.to_string(),
        })
    }
}
