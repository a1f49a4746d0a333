//! Signed values.

use crate::encoding::hash_value;
use crate::{Hash, KeyPair, PeerKey, Signature};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// An immutable value with a detached signature by its signer.
///
/// The signature covers the hash of the value's canonical encoding. `Signed`
/// is a cheap handle: clones share the value and the memoized hash and
/// verification result, so a block or order received from many peers is
/// hashed and verified at most once.
pub struct Signed<T> {
    inner: Arc<SignedInner<T>>,
}

struct SignedInner<T> {
    value: T,
    signer: PeerKey,
    signature: Signature,
    /// Hash of the value alone (the signed message).
    value_hash: OnceLock<Hash>,
    /// Hash of value, signer and signature (content identity).
    hash: OnceLock<Hash>,
    verified: OnceLock<bool>,
}

impl<T: Serialize> Signed<T> {
    /// Sign `value` with `keypair`.
    pub fn sign(keypair: &KeyPair, value: T) -> Self {
        let value_hash = hash_value(&value);
        let signature = keypair.sign(value_hash.as_bytes());
        let signed = Self::from_parts(value, keypair.public_key(), signature);
        let _ = signed.inner.value_hash.set(value_hash);
        // Locally produced signatures need no verification.
        let _ = signed.inner.verified.set(true);
        signed
    }

    /// Assemble from untrusted parts. Nothing is checked until
    /// [`Signed::verify`] is called.
    pub fn from_parts(value: T, signer: PeerKey, signature: Signature) -> Self {
        Signed {
            inner: Arc::new(SignedInner {
                value,
                signer,
                signature,
                value_hash: OnceLock::new(),
                hash: OnceLock::new(),
                verified: OnceLock::new(),
            }),
        }
    }

    /// Content hash, identifying this signed value.
    pub fn hash(&self) -> Hash {
        *self.inner.hash.get_or_init(|| {
            Hash::from_parts(&[
                self.value_hash().as_bytes(),
                self.inner.signer.as_bytes(),
                &self.inner.signature.to_bytes(),
            ])
        })
    }

    /// Hash of the unsigned value.
    pub fn value_hash(&self) -> Hash {
        *self.inner.value_hash.get_or_init(|| hash_value(&self.inner.value))
    }

    /// Check the signature, memoizing the outcome.
    pub fn verify(&self) -> bool {
        *self.inner.verified.get_or_init(|| {
            self.inner
                .signer
                .verify(self.value_hash().as_bytes(), &self.inner.signature)
        })
    }

    /// Whether the signature has already been checked.
    pub fn is_verified(&self) -> bool {
        self.inner.verified.get().is_some()
    }
}

impl<T> Signed<T> {
    pub fn value(&self) -> &T {
        &self.inner.value
    }

    pub fn signer(&self) -> PeerKey {
        self.inner.signer
    }

    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    /// True when both handles share the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Signed<T> {
    fn clone(&self) -> Self {
        Signed {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Serialize> PartialEq for Signed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.hash() == other.hash()
    }
}

impl<T: Serialize> Eq for Signed<T> {}

impl<T: Serialize> std::hash::Hash for Signed<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash().hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Signed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signed")
            .field("signer", &self.inner.signer)
            .field("value", &self.inner.value)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SignedRef<'a, T> {
    value: &'a T,
    signer: &'a PeerKey,
    signature: &'a Signature,
}

#[derive(Deserialize)]
struct SignedRepr<T> {
    value: T,
    signer: PeerKey,
    signature: Signature,
}

impl<T: Serialize> Serialize for Signed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SignedRef {
            value: &self.inner.value,
            signer: &self.inner.signer,
            signature: &self.inner.signature,
        }
        .serialize(serializer)
    }
}

impl<'de, T: Serialize + Deserialize<'de>> Deserialize<'de> for Signed<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = SignedRepr::<T>::deserialize(deserializer)?;
        Ok(Signed::from_parts(repr.value, repr.signer, repr.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};

    #[test]
    fn test_signed_value_verifies() {
        let keypair = KeyPair::from_seed([3u8; 32]);
        let signed = Signed::sign(&keypair, 42u64);
        assert!(signed.verify());
        assert_eq!(signed.signer(), keypair.public_key());
    }

    #[test]
    fn test_decoded_value_is_verified_lazily() {
        let keypair = KeyPair::from_seed([3u8; 32]);
        let signed = Signed::sign(&keypair, "order".to_string());
        let decoded: Signed<String> = decode(&encode(&signed).unwrap()).unwrap();

        assert!(!decoded.is_verified());
        assert!(decoded.verify());
        assert!(decoded.is_verified());
        assert_eq!(decoded, signed);
    }

    #[test]
    fn test_forged_signer_fails_verification() {
        let alice = KeyPair::from_seed([1u8; 32]);
        let mallory = KeyPair::from_seed([2u8; 32]);
        let genuine = Signed::sign(&alice, 7u32);
        let forged = Signed::from_parts(7u32, mallory.public_key(), *genuine.signature());

        assert!(!forged.verify());
        assert_ne!(forged.hash(), genuine.hash());
    }

    #[test]
    fn test_clones_share_cache() {
        let keypair = KeyPair::from_seed([9u8; 32]);
        let signed = Signed::from_parts(1u8, keypair.public_key(), keypair.sign(b"x"));
        let copy = signed.clone();
        assert!(!signed.verify());
        assert!(copy.is_verified());
        assert!(copy.ptr_eq(&signed));
    }
}
