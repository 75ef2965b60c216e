//! Token authentication - Verifica dei bearer token JWT
//!
//! Il server non emette credenziali: le verifica soltanto contro un segreto
//! condiviso con la dashboard che le rilascia.

use crate::core::error::AuthError;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, instrument, warn};

// struct che codifica il contenuto del token jwt
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize, // Expiry time of the token
    pub iat: usize, // Issued at time of the token
}

/// Identità ricavata da un token verificato (claim `sub`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verifica di un bearer token.
///
/// Nessun effetto collaterale: in caso di successo ritorna il principal,
/// altrimenti il motivo del rifiuto.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Verificatore HS256 basato su segreto condiviso
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    #[instrument(skip_all)]
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }

        debug!("Decoding JWT token");
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    warn!("Expired JWT token");
                    AuthError::Expired
                }
                ErrorKind::InvalidToken
                | ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName
                | ErrorKind::MissingRequiredClaim(_)
                | ErrorKind::ImmatureSignature
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => {
                    warn!("Invalid JWT token: {:?}", e);
                    AuthError::Invalid
                }
                _ => {
                    error!("Unexpected error while decoding JWT token: {:?}", e);
                    AuthError::Internal(e.to_string())
                }
            }
        })?;

        if data.claims.sub.is_empty() {
            warn!("JWT token has an empty subject");
            return Err(AuthError::Invalid);
        }

        debug!("JWT token decoded successfully for subject: {}", data.claims.sub);
        Ok(Principal::new(data.claims.sub))
    }
}

/// Firma un token per `subject` valido per `ttl`.
///
/// Usato dalla dashboard che rilascia le credenziali e dai test.
pub fn encode_jwt(subject: &str, secret: &str, ttl: Duration) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to encode JWT token: {:?}", e);
        AuthError::Internal(e.to_string())
    })
}
