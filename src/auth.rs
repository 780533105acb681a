//! JWT bearer-token construction, caching, and rotation (C2), plus the
//! verification path the mock server uses to play the role of APNs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PushyError, Result};

/// How long a cached token is reused before a fresh one is minted. APNs
/// rejects tokens older than roughly an hour; refreshing at 55 minutes
/// leaves margin for clock skew and in-flight requests.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(55 * 60);

/// An ES256 signing key for minting provider tokens.
///
/// Validated once at construction (invariant I5: signing keys are immutable;
/// rotating a key means constructing a new one).
#[derive(Clone)]
pub struct SigningKey {
    team_id: String,
    key_id: String,
    encoding_key: Arc<EncodingKey>,
}

impl SigningKey {
    /// Parse a PKCS#8 PEM-encoded P-256 private key (`BEGIN PRIVATE KEY`).
    ///
    /// `key_id` and `team_id` are the ten-character identifiers Apple issues
    /// alongside the key. Fails fast if the PEM does not decode to a valid
    /// P-256 key, before the key is ever used on the wire.
    pub fn from_pkcs8_pem(
        team_id: impl Into<String>,
        key_id: impl Into<String>,
        pem: &str,
    ) -> Result<Self> {
        // p256 parses and range-checks the scalar; jsonwebtoken's EncodingKey
        // does not validate the curve point on its own, so we lean on p256
        // here purely to fail fast on malformed key material.
        use p256::pkcs8::DecodePrivateKey;
        p256::SecretKey::from_pkcs8_pem(pem)
            .map_err(|_| PushyError::InvalidKey("not a valid P-256 private key".into()))?;

        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| PushyError::InvalidKey(e.to_string()))?;

        Ok(Self {
            team_id: team_id.into(),
            key_id: key_id.into(),
            encoding_key: Arc::new(encoding_key),
        })
    }

    /// The ten-character key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The ten-character team id.
    pub fn team_id(&self) -> &str {
        &self.team_id
    }
}

/// The verification counterpart of [`SigningKey`], used by the mock server
/// (§4.2) to authenticate bearer tokens the way APNs itself would.
#[derive(Clone)]
pub struct VerificationKey {
    team_id: String,
    key_id: String,
    decoding_key: Arc<DecodingKey>,
}

impl VerificationKey {
    /// Parse a PKIX PEM-encoded P-256 public key (`BEGIN PUBLIC KEY`).
    pub fn from_public_pem(
        team_id: impl Into<String>,
        key_id: impl Into<String>,
        pem: &str,
    ) -> Result<Self> {
        use p256::pkcs8::DecodePublicKey;
        p256::PublicKey::from_public_key_pem(pem)
            .map_err(|_| PushyError::InvalidKey("not a valid P-256 public key".into()))?;

        let decoding_key = DecodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| PushyError::InvalidKey(e.to_string()))?;

        Ok(Self {
            team_id: team_id.into(),
            key_id: key_id.into(),
            decoding_key: Arc::new(decoding_key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }
}

#[derive(Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: i64,
}

/// A minted provider token: `authorization: bearer <token>`.
#[derive(Debug, Clone)]
pub struct AuthToken {
    token: String,
    key_id: String,
    iat: SystemTime,
}

impl AuthToken {
    /// The full `header.claims.signature` JWT, as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// The key id this token was signed with.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// When this token was issued (the `iat` claim, as an `Instant`).
    pub fn issued_at(&self) -> SystemTime {
        self.iat
    }

    fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.iat)
            .unwrap_or_default()
    }

    /// Split the base64url JWT into its three decoded components. Exists so
    /// callers (and tests) can verify the encode/decode round-trip (§8) —
    /// header bytes, claims bytes, and raw signature bytes.
    pub fn decompose(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut parts = self.token.split('.');
        let (header, claims, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s)) => (h, c, s),
            _ => return Err(PushyError::Fatal("malformed JWT".into())),
        };
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        Ok((
            engine
                .decode(header)
                .map_err(|e| PushyError::Fatal(e.to_string()))?,
            engine
                .decode(claims)
                .map_err(|e| PushyError::Fatal(e.to_string()))?,
            engine
                .decode(sig)
                .map_err(|e| PushyError::Fatal(e.to_string()))?,
        ))
    }
}

struct Cached {
    token: AuthToken,
}

/// Caches and rotates [`AuthToken`]s for a single [`SigningKey`].
///
/// Builds are serialized through an async mutex so that concurrent callers
/// racing a cache miss produce at most one fresh token (§4.2), and
/// `invalidate` lets a server rejection (`ExpiredProviderToken`,
/// `InvalidProviderToken`) force the next `token()` call to mint a new one.
pub struct TokenProvider {
    key: SigningKey,
    refresh_threshold: Duration,
    cached: Mutex<Option<Cached>>,
}

impl TokenProvider {
    /// Create a provider for `key`, refreshing cached tokens older than
    /// `refresh_threshold`.
    pub fn new(key: SigningKey, refresh_threshold: Duration) -> Self {
        Self {
            key,
            refresh_threshold,
            cached: Mutex::new(None),
        }
    }

    /// Create a provider using the default 55-minute refresh threshold.
    pub fn with_default_threshold(key: SigningKey) -> Self {
        Self::new(key, DEFAULT_REFRESH_THRESHOLD)
    }

    /// The signing key this provider mints tokens for.
    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Return a token valid for use right now, minting a fresh one if the
    /// cache is empty or stale.
    pub async fn token(&self) -> Result<AuthToken> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.token.age() < self.refresh_threshold {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.mint()?;
        *guard = Some(Cached {
            token: fresh.clone(),
        });
        Ok(fresh)
    }

    /// Force the next `token()` call to mint a fresh token, regardless of
    /// the cached token's age. Called when the server rejects the current
    /// token (§7 kind 5).
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn mint(&self) -> Result<AuthToken> {
        let iat = SystemTime::now();
        let iat_secs = iat
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key.key_id.clone());

        let claims = Claims {
            iss: self.key.team_id.clone(),
            iat: iat_secs,
        };

        let token = jsonwebtoken::encode(&header, &claims, &self.key.encoding_key)?;

        Ok(AuthToken {
            token,
            key_id: self.key.key_id.clone(),
            iat,
        })
    }
}

/// How a token failed server-side verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    /// The signature did not verify, or the JWT was malformed.
    InvalidSignature,
    /// The `kid` in the header did not match any known verification key.
    UnknownKey,
    /// The `iss` claim did not match the key's team id.
    TeamMismatch,
    /// The `iat` claim is outside the acceptable clock-skew window.
    Expired,
}

/// Verify `token` against `key`, the way the mock server authenticates
/// bearer tokens (§4.2). `max_age` bounds how old `iat` may be; a small
/// positive `skew` tolerates minor clock drift in the other direction.
pub fn verify(
    token: &str,
    key: &VerificationKey,
    max_age: Duration,
    skew: Duration,
) -> std::result::Result<(), VerificationFailure> {
    let mut validation = jsonwebtoken::Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let header =
        jsonwebtoken::decode_header(token).map_err(|_| VerificationFailure::InvalidSignature)?;
    match header.kid {
        Some(ref kid) if kid == key.key_id() => {}
        _ => return Err(VerificationFailure::UnknownKey),
    }

    let data = jsonwebtoken::decode::<Claims>(token, &key.decoding_key, &validation)
        .map_err(|_| VerificationFailure::InvalidSignature)?;

    if data.claims.iss != key.team_id() {
        return Err(VerificationFailure::TeamMismatch);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let age = now - data.claims.iat;
    if age > max_age.as_secs() as i64 || age < -(skew.as_secs() as i64) {
        return Err(VerificationFailure::Expired);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem_pair() -> (String, String) {
        use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let private_pem = secret
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = secret
            .public_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        (private_pem, public_pem)
    }

    #[tokio::test]
    async fn mints_and_caches_a_token() {
        let (private_pem, _) = pem_pair();
        let key = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &private_pem).unwrap();
        let provider = TokenProvider::with_default_threshold(key);

        let first = provider.token().await.unwrap();
        let second = provider.token().await.unwrap();
        assert_eq!(first.as_str(), second.as_str(), "cached token is reused");
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_mint_with_a_later_iat() {
        let (private_pem, _) = pem_pair();
        let key = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &private_pem).unwrap();
        let provider = TokenProvider::new(key, Duration::from_secs(0));

        let first = provider.token().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        provider.invalidate().await;
        let second = provider.token().await.unwrap();

        assert!(second.issued_at() > first.issued_at());
    }

    #[test]
    fn rejects_malformed_key_material() {
        let result = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", "not a pem");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn verification_accepts_a_freshly_minted_token() {
        let (private_pem, public_pem) = pem_pair();
        let signing = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &private_pem).unwrap();
        let verifying =
            VerificationKey::from_public_pem("TEAM1234AB", "KEYID6789A", &public_pem).unwrap();

        let provider = TokenProvider::with_default_threshold(signing);
        let token = provider.token().await.unwrap();

        assert!(verify(
            token.as_str(),
            &verifying,
            Duration::from_secs(3600),
            Duration::from_secs(60)
        )
        .is_ok());
    }

    #[tokio::test]
    async fn verification_rejects_a_token_from_a_different_key() {
        let (private_pem, _) = pem_pair();
        let (_, other_public_pem) = pem_pair();
        let signing = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &private_pem).unwrap();
        let verifying =
            VerificationKey::from_public_pem("TEAM1234AB", "KEYID6789A", &other_public_pem)
                .unwrap();

        let provider = TokenProvider::with_default_threshold(signing);
        let token = provider.token().await.unwrap();

        assert_eq!(
            verify(
                token.as_str(),
                &verifying,
                Duration::from_secs(3600),
                Duration::from_secs(60)
            ),
            Err(VerificationFailure::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn decompose_round_trips_through_base64() {
        let (private_pem, _) = pem_pair();
        let key = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &private_pem).unwrap();
        let provider = TokenProvider::with_default_threshold(key);
        let token = provider.token().await.unwrap();

        let (header_bytes, claims_bytes, signature) = token.decompose().unwrap();

        let header: Header = serde_json::from_slice(&header_bytes).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid.as_deref(), Some("KEYID6789A"));

        let claims: Claims = serde_json::from_slice(&claims_bytes).unwrap();
        assert_eq!(claims.iss, "TEAM1234AB");

        assert!(!signature.is_empty());
    }
}
