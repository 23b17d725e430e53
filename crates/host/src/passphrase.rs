//! Passphrase generation, hashing and verification.
//!
//! Sessions are admitted with a short diceware-style passphrase the operator
//! reads out to viewers. Only its bcrypt hash is kept for comparison.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::error::{HostError, Result};

const WORDLIST: &str = include_str!("../assets/wordlist.txt");

/// Default number of words in a passphrase.
pub const DEFAULT_WORDS: usize = 6;

/// Generates, hashes and checks admission passphrases.
///
/// Hashing and verification are deliberately slow; call them from a
/// blocking context.
pub trait PassphraseAuthority: Send + Sync + 'static {
    /// Creates a fresh passphrase.
    fn generate(&self) -> Result<String>;

    /// Returns a one-way digest of `passphrase`.
    fn hash(&self, passphrase: &str) -> Result<String>;

    /// Checks `candidate` against `digest`.
    fn verify(&self, digest: &str, candidate: &str) -> bool;
}

/// Random words from an embedded list, hashed with bcrypt.
#[derive(Debug, Clone)]
pub struct DicewareAuthority {
    words: usize,
    cost: u32,
}

impl DicewareAuthority {
    /// Creates an authority producing `words`-word passphrases hashed at
    /// bcrypt `cost`.
    pub fn new(words: usize, cost: u32) -> Self {
        Self { words, cost }
    }
}

impl Default for DicewareAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_WORDS, bcrypt::DEFAULT_COST)
    }
}

impl PassphraseAuthority for DicewareAuthority {
    fn generate(&self) -> Result<String> {
        let list: Vec<&str> = WORDLIST.split_whitespace().collect();
        let mut rng = rand::thread_rng();

        let words = (0..self.words.max(1))
            .map(|_| {
                list.choose(&mut rng)
                    .copied()
                    .ok_or_else(|| HostError::Passphrase("word list is empty".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(words.join(" "))
    }

    fn hash(&self, passphrase: &str) -> Result<String> {
        bcrypt::hash(passphrase, self.cost).map_err(|e| HostError::Passphrase(e.to_string()))
    }

    fn verify(&self, digest: &str, candidate: &str) -> bool {
        bcrypt::verify(candidate, digest).unwrap_or(false)
    }
}

/// A passphrase together with its digest.
#[derive(Clone)]
pub struct Secret {
    /// The plain passphrase shown to the operator.
    pub passphrase: String,
    /// Its digest, used to check viewers.
    pub digest: String,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("passphrase", &"<redacted>")
            .field("digest", &self.digest)
            .finish()
    }
}

/// Generates and hashes a new secret on a blocking thread.
pub async fn fresh_secret(authority: Arc<dyn PassphraseAuthority>) -> Result<Secret> {
    tokio::task::spawn_blocking(move || {
        let passphrase = authority.generate()?;
        let digest = authority.hash(&passphrase)?;
        Ok(Secret { passphrase, digest })
    })
    .await
    .map_err(|e| HostError::Passphrase(format!("hashing task failed: {}", e)))?
}

/// Checks `candidate` against `digest` on a blocking thread.
pub async fn verify_async(
    authority: Arc<dyn PassphraseAuthority>,
    digest: String,
    candidate: String,
) -> bool {
    tokio::task::spawn_blocking(move || authority.verify(&digest, &candidate))
        .await
        .unwrap_or(false)
}
