//! Macaroon record, caveat handling, and the opaque wire codec.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin_hashes::hex::ToHex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mac;

/// A single `"<key> = <value>"` caveat recognized during verification.
/// Unrecognized keys are carried but ignored during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    ExpiresAt(i64),
    Endpoint(String),
    Method(String),
    Context(String),
    Agent(String),
    MaxActions(i64),
    Other(String, String),
}

impl Caveat {
    fn key_value(&self) -> (String, String) {
        match self {
            Caveat::ExpiresAt(v) => ("expires_at".to_string(), v.to_string()),
            Caveat::Endpoint(v) => ("endpoint".to_string(), v.clone()),
            Caveat::Method(v) => ("method".to_string(), v.clone()),
            Caveat::Context(v) => ("context".to_string(), v.clone()),
            Caveat::Agent(v) => ("agent".to_string(), v.clone()),
            Caveat::MaxActions(v) => ("max_actions".to_string(), v.to_string()),
            Caveat::Other(k, v) => (k.clone(), v.clone()),
        }
    }

    /// Serializes to the exact on-wire string form `"<key> = <value>"`.
    pub fn to_wire_string(&self) -> String {
        let (k, v) = self.key_value();
        format!("{k} = {v}")
    }

    fn from_wire_string(s: &str) -> Option<Caveat> {
        let (key, value) = s.split_once(" = ")?;
        if value.is_empty() {
            return None;
        }
        Some(match key {
            "expires_at" => Caveat::ExpiresAt(value.parse().ok()?),
            "endpoint" => Caveat::Endpoint(value.to_string()),
            "method" => Caveat::Method(value.to_string()),
            "context" => Caveat::Context(value.to_string()),
            "agent" => Caveat::Agent(value.to_string()),
            "max_actions" => Caveat::MaxActions(value.parse().ok()?),
            other => Caveat::Other(other.to_string(), value.to_string()),
        })
    }
}

/// Request-shape context a macaroon is verified against.
#[derive(Debug, Clone)]
pub struct VerifyContext<'a> {
    pub endpoint: &'a str,
    pub method: &'a str,
    pub context_id: &'a str,
    pub agent_id: &'a str,
}

/// The macaroon record, serialized as `{ id, caveats, signature }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Macaroon {
    pub id: String,
    pub caveats: Vec<String>,
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacaroonError {
    #[error("Invalid macaroon encoding")]
    InvalidEncoding,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Macaroon expired")]
    Expired,
    #[error("Endpoint mismatch: expected {0}")]
    EndpointMismatch(String),
    #[error("Method mismatch: expected {0}")]
    MethodMismatch(String),
    #[error("Context mismatch: expected {0}")]
    ContextMismatch(String),
    #[error("Agent mismatch: expected {0}")]
    AgentMismatch(String),
}

impl Macaroon {
    /// Builds and signs a macaroon for `payment_hash` with the given caveats.
    /// Caveat order is the order of `caveats`.
    pub fn create(secret: &str, payment_hash: &str, caveats: Vec<Caveat>) -> Macaroon {
        let caveat_strings: Vec<String> = caveats.iter().map(Caveat::to_wire_string).collect();
        let sig = mac::chain(secret, payment_hash, &caveat_strings);
        Macaroon {
            id: payment_hash.to_string(),
            caveats: caveat_strings,
            signature: sig.to_hex(),
        }
    }

    /// Recomputes the chained MAC and checks every caveat against `ctx`.
    pub fn verify(&self, secret: &str, ctx: &VerifyContext) -> Result<(), MacaroonError> {
        let expected = mac::chain(secret, &self.id, &self.caveats).to_hex();
        if !mac::signatures_equal(expected.as_bytes(), self.signature.as_bytes()) {
            return Err(MacaroonError::InvalidSignature);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;

        for raw in &self.caveats {
            let Some(caveat) = Caveat::from_wire_string(raw) else {
                continue;
            };
            match caveat {
                Caveat::ExpiresAt(expires_at) => {
                    if now > expires_at {
                        return Err(MacaroonError::Expired);
                    }
                }
                Caveat::Endpoint(v) => {
                    if ctx.endpoint != v {
                        return Err(MacaroonError::EndpointMismatch(v));
                    }
                }
                Caveat::Method(v) => {
                    if !ctx.method.eq_ignore_ascii_case(&v) {
                        return Err(MacaroonError::MethodMismatch(v));
                    }
                }
                Caveat::Context(v) => {
                    if ctx.context_id != v {
                        return Err(MacaroonError::ContextMismatch(v));
                    }
                }
                Caveat::Agent(v) => {
                    if ctx.agent_id != v {
                        return Err(MacaroonError::AgentMismatch(v));
                    }
                }
                Caveat::MaxActions(_) | Caveat::Other(_, _) => {}
            }
        }
        Ok(())
    }

    /// JSON, then standard Base64, as an opaque wire token.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("macaroon always serializes");
        base64::encode(json)
    }

    /// Inverse of [`Macaroon::encode`]; returns `None` on any parse failure.
    pub fn decode(encoded: &str) -> Result<Macaroon, MacaroonError> {
        let bytes = base64::decode(encoded).map_err(|_| MacaroonError::InvalidEncoding)?;
        serde_json::from_slice(&bytes).map_err(|_| MacaroonError::InvalidEncoding)
    }
}
