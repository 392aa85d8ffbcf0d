use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// JWKS document served at `/.well-known/jwks.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Public key in JWK form.
///
/// Only RSA members are typed; members of other key types (`crv`, `x`, `y`)
/// are kept as-is so the document is served back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl Jwk {
    /// Modulus and exponent, when this is a complete RSA key.
    #[must_use]
    pub fn rsa_components(&self) -> Option<(&str, &str)> {
        match (self.kty.as_str(), &self.n, &self.e) {
            ("RSA", Some(n), Some(e)) => Some((n, e)),
            _ => None,
        }
    }
}

impl JwkSet {
    /// Parse a JWKS document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the document does not parse.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::ConfigurationMissing(format!("JWKS: {e}")))
    }

    /// Read and parse a JWKS file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the file cannot be read or
    /// does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigurationMissing(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixture_and_finds_by_kid() {
        let set = JwkSet::from_json(include_str!("../tests/fixtures/jwks.json")).unwrap();
        let key = set.find("test-kid-1").unwrap();
        assert_eq!(key.kty, "RSA");
        assert_eq!(key.e.as_deref(), Some("AQAB"));
        assert!(key.rsa_components().is_some());
        assert_eq!(key.key_use.as_deref(), Some("sig"));
        assert!(set.find("other").is_none());
    }

    #[test]
    fn serializes_use_field_name() {
        let set = JwkSet::from_json(include_str!("../tests/fixtures/jwks.json")).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["keys"][0]["use"], "sig");
        assert_eq!(json["keys"][0]["alg"], "RS256");
    }

    #[test]
    fn non_rsa_keys_parse_and_round_trip() {
        let set = JwkSet::from_json(
            r#"{"keys": [
                {"kty": "EC", "kid": "ec-1", "crv": "P-256", "x": "f83O", "y": "x_FE"},
                {"kty": "RSA", "kid": "partial", "n": "0vx7"}
            ]}"#,
        )
        .unwrap();

        let ec = set.find("ec-1").unwrap();
        assert!(ec.rsa_components().is_none());
        assert!(set.find("partial").unwrap().rsa_components().is_none());

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["keys"][0]["crv"], "P-256");
        assert_eq!(json["keys"][0]["x"], "f83O");
        assert!(json["keys"][0].get("n").is_none());
    }

    #[test]
    fn from_file_reads_and_reports_missing_files() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/jwks.json");
        assert!(JwkSet::from_file(path).unwrap().find("test-kid-1").is_some());

        assert!(matches!(
            JwkSet::from_file("/nonexistent/jwks.json"),
            Err(Error::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn empty_set_serializes_to_empty_keys() {
        let json = serde_json::to_value(JwkSet::default()).unwrap();
        assert_eq!(json, serde_json::json!({"keys": []}));
    }
}
