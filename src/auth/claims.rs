use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Claims the client reads from an access credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String, // user ID
    pub exp: i64,    // expires at (unix timestamp)
}

impl AccessClaims {
    /// `true` while the credential is still usable at `now`, treating it as
    /// expired `skew_secs` early.
    pub fn is_live_at(&self, now: i64, skew_secs: i64) -> bool {
        self.exp.saturating_sub(skew_secs.max(0)) > now
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Subject,
    exp: i64,
}

/// Reads subject and expiry from a bearer token without checking its
/// signature. Anything that is not a three-segment token with a JSON payload
/// carrying both claims yields `None`.
pub fn decode_claims(token: &str) -> Option<AccessClaims> {
    if token.split('.').count() != 3 {
        debug!("access credential is not a three-segment token");
        return None;
    }

    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<RawClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => {
            let sub = match data.claims.sub {
                Subject::Text(s) => s,
                Subject::Number(n) => n.to_string(),
            };
            Some(AccessClaims {
                sub,
                exp: data.claims.exp,
            })
        }
        Err(e) => {
            debug!(error = %e, "access credential payload not decodable");
            None
        }
    }
}
