//! Feed keys and head signatures.
//!
//! A feed is named by the ed25519 [`PublicKey`] of its writer. Whoever holds the matching
//! [`SecretKey`] can append, everybody else verifies [`Signature`]s over the feed's head.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

/// The public key of a feed.
///
/// Always a valid curve point: every constructor checks it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// The length of a public key, in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// The raw key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Checks that `bytes` are a valid ed25519 public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        VerifyingKey::from_bytes(bytes).context(PointSnafu)?;
        Ok(Self(*bytes))
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureSnafu.build())?;
        key.verify_strict(message, &signature.0)
            .map_err(|_| SignatureSnafu.build())
    }

    /// The lowercase hex encoding, which also names the feed's storage namespace.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// The first five bytes in hex, for logs.
    pub fn fmt_short(&self) -> impl Display + 'static {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyParsingError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| LengthSnafu { len: bytes.len() }.build())?;
        Self::from_bytes(bytes)
    }
}

impl TryFrom<[u8; 32]> for PublicKey {
    type Error = KeyParsingError;

    fn try_from(bytes: [u8; 32]) -> Result<Self, Self::Error> {
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for [u8; 32] {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

/// Parses the hex form produced by [`Display`].
impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(s.len() == Self::LENGTH * 2, LengthSnafu { len: s.len() / 2 });
        let mut bytes = [0u8; 32];
        data_encoding::HEXLOWER_PERMISSIVE
            .decode_mut(s.as_bytes(), &mut bytes)
            .map_err(|partial| partial.error)
            .context(HexSnafu)?;
        Self::from_bytes(&bytes)
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// Why a string or byte slice is not a [`PublicKey`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyParsingError {
    /// The string is not hex.
    #[snafu(display("invalid hex"))]
    Hex { source: data_encoding::DecodeError },
    /// The key has the wrong length.
    #[snafu(display("expected 32 bytes, got {len}"))]
    Length { len: usize },
    /// The bytes are not a point on the curve.
    #[snafu(display("not an ed25519 public key"))]
    Point {
        source: ed25519_dalek::SignatureError,
    },
}

/// The secret key of a feed. Holding it makes the feed writable.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Generates a new key pair.
    ///
    /// ```rust
    /// let secret = feedbee_base::SecretKey::generate(&mut rand::rngs::OsRng);
    /// let _feed = secret.public();
    /// ```
    pub fn generate<R: CryptoRngCore + ?Sized>(csprng: &mut R) -> Self {
        Self(SigningKey::generate(csprng))
    }

    /// The matching public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Signs `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    /// The secret scalar seed.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({}..)", self.public().fmt_short())
    }
}

/// An ed25519 signature over a feed head.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(ed25519_dalek::Signature);

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(")?;
        data_encoding::HEXLOWER.encode_write(&self.0.to_bytes()[..8], f)?;
        write!(f, "..)")
    }
}

/// A signature did not verify.
#[derive(Debug, Snafu)]
#[snafu(display("invalid signature"))]
pub struct SignatureError {
    backtrace: Option<snafu::Backtrace>,
}
