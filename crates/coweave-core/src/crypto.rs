//! Cryptographic capability for the CoValue engine.
//!
//! Wraps Blake3 hashing (one-shot and streaming), Ed25519 signing and X25519
//! sealing keys with strong types. Agent identities bundle one signing key and
//! one sealing key.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

use crate::canonical::canonical_transaction_bytes;
use crate::error::CoreError;
use crate::transaction::Transaction;

/// Domain prefix for signatures over session hashes.
const SIGN_DOMAIN: &[u8] = b"coweave-session-v0:";

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash_z{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental hash over a session's transactions.
///
/// The chain is a left fold: `digest()` after feeding transactions `t0..tn`
/// is identical no matter how the updates were batched.
#[derive(Clone)]
pub struct StreamingHash {
    hasher: blake3::Hasher,
}

impl StreamingHash {
    /// Start an empty chain.
    pub fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"coweave-chain-v0:");
        Self { hasher }
    }

    /// Extend the chain with one transaction.
    pub fn update(&mut self, tx: &Transaction) {
        let bytes = canonical_transaction_bytes(tx);
        self.hasher.update(&(bytes.len() as u64).to_be_bytes());
        self.hasher.update(&bytes);
    }

    /// The hash of everything fed so far. Does not consume the state.
    pub fn digest(&self) -> Hash {
        Hash(*self.hasher.finalize().as_bytes())
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamingHash({:?})", self.digest())
    }
}

/// Serde helper for fixed-size byte arrays larger than serde's built-in limit.
pub mod byte_array {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} bytes", N)
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                v.try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = [0u8; N];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(i, &self))?;
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(ArrayVisitor::<N>)
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "byte_array")] pub [u8; 64]);

impl Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

/// Public half of a signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerID(pub [u8; 32]);

impl SignerID {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over a session hash.
    pub fn verify(&self, hash: &Hash, signature: &Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(&signed_message(hash), &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for SignerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerID({})", &self.to_hex()[..16])
    }
}

/// Secret half of a signing key.
#[derive(Clone)]
pub struct SignerSecret {
    signing_key: SigningKey,
}

impl SignerSecret {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The public signer identity.
    pub fn signer_id(&self) -> SignerID {
        SignerID(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a session hash.
    pub fn sign(&self, hash: &Hash) -> Signature {
        Signature(self.signing_key.sign(&signed_message(hash)).to_bytes())
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerSecret({:?})", self.signer_id())
    }
}

fn signed_message(hash: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGN_DOMAIN.len() + 32);
    message.extend_from_slice(SIGN_DOMAIN);
    message.extend_from_slice(&hash.0);
    message
}

/// Public half of a sealing (X25519) key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SealerID(pub [u8; 32]);

impl SealerID {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to x25519-dalek PublicKey.
    pub fn to_dalek(&self) -> XPublicKey {
        XPublicKey::from(self.0)
    }
}

impl fmt::Debug for SealerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerID({})", &self.to_hex()[..16])
    }
}

/// Secret half of a sealing key.
#[derive(Clone)]
pub struct SealerSecret(StaticSecret);

impl SealerSecret {
    /// Generate a new random sealing key.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::thread_rng()))
    }

    /// Create from seed bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// The public sealer identity.
    pub fn sealer_id(&self) -> SealerID {
        SealerID(*XPublicKey::from(&self.0).as_bytes())
    }

    /// Raw X25519 agreement with a peer's public key.
    pub fn diffie_hellman(&self, peer: &SealerID) -> [u8; 32] {
        *self.0.diffie_hellman(&peer.to_dalek()).as_bytes()
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerSecret({:?})", self.sealer_id())
    }
}

/// Public identity of an agent: one sealer and one signer.
///
/// Textual form: `sealer_z<hex>/signer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentID {
    pub sealer: SealerID,
    pub signer: SignerID,
}

impl fmt::Display for AgentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sealer_z{}/signer_z{}",
            self.sealer.to_hex(),
            self.signer.to_hex()
        )
    }
}

impl fmt::Debug for AgentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentID({}..)", &self.signer.to_hex()[..16])
    }
}

impl FromStr for AgentID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedId(s.to_string());
        let (sealer, signer) = s.split_once('/').ok_or_else(malformed)?;
        let sealer = sealer.strip_prefix("sealer_z").ok_or_else(malformed)?;
        let signer = signer.strip_prefix("signer_z").ok_or_else(malformed)?;
        Ok(Self {
            sealer: SealerID(decode_32(sealer).ok_or_else(malformed)?),
            signer: SignerID(decode_32(signer).ok_or_else(malformed)?),
        })
    }
}

impl Serialize for AgentID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub(crate) fn decode_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Secret keys of an agent.
#[derive(Clone)]
pub struct AgentSecret {
    pub signer: SignerSecret,
    pub sealer: SealerSecret,
}

impl AgentSecret {
    /// Generate a fresh agent.
    pub fn generate() -> Self {
        Self {
            signer: SignerSecret::generate(),
            sealer: SealerSecret::generate(),
        }
    }

    /// Derive both halves deterministically from one seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signer_seed = blake3::derive_key("coweave-agent-v0 signer", seed);
        let sealer_seed = blake3::derive_key("coweave-agent-v0 sealer", seed);
        Self {
            signer: SignerSecret::from_seed(&signer_seed),
            sealer: SealerSecret::from_bytes(sealer_seed),
        }
    }

    /// The public agent identity.
    pub fn agent_id(&self) -> AgentID {
        AgentID {
            sealer: self.sealer.sealer_id(),
            signer: self.signer.signer_id(),
        }
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({:?})", self.agent_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let secret = SignerSecret::generate();
        let hash = Hash::of(b"hello world");
        let signature = secret.sign(&hash);

        secret
            .signer_id()
            .verify(&hash, &signature)
            .expect("valid signature should verify");

        let tampered = Hash::of(b"hello worlD");
        assert!(secret.signer_id().verify(&tampered, &signature).is_err());
    }

    #[test]
    fn test_agent_deterministic_from_seed() {
        let a = AgentSecret::from_seed(&[0x42; 32]);
        let b = AgentSecret::from_seed(&[0x42; 32]);
        assert_eq!(a.agent_id(), b.agent_id());
    }

    #[test]
    fn test_agent_id_text_roundtrip() {
        let agent = AgentSecret::generate().agent_id();
        let text = agent.to_string();
        assert!(text.starts_with("sealer_z"));
        let parsed: AgentID = text.parse().unwrap();
        assert_eq!(agent, parsed);
    }

    #[test]
    fn test_agent_id_rejects_garbage() {
        assert!("sealer_zabc/signer_zdef".parse::<AgentID>().is_err());
        assert!("co_z1234".parse::<AgentID>().is_err());
    }

    #[test]
    fn test_streaming_hash_is_batch_independent() {
        let txs: Vec<Transaction> = (0..4)
            .map(|i| Transaction::trusting(i, format!("[{}]", i)))
            .collect();

        let mut one_by_one = StreamingHash::new();
        for tx in &txs {
            one_by_one.update(tx);
        }

        let mut prefix = StreamingHash::new();
        prefix.update(&txs[0]);
        prefix.update(&txs[1]);
        let mut resumed = prefix.clone();
        resumed.update(&txs[2]);
        resumed.update(&txs[3]);

        assert_eq!(one_by_one.digest(), resumed.digest());
        assert_ne!(prefix.digest(), resumed.digest());
    }

    #[test]
    fn test_signature_cbor_roundtrip() {
        let signature = SignerSecret::from_seed(&[7; 32]).sign(&Hash::of(b"x"));
        let mut buf = Vec::new();
        ciborium::into_writer(&signature, &mut buf).unwrap();
        let decoded: Signature = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(signature, decoded);
    }
}
