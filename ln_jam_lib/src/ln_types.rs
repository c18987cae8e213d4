// External modules
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// Standard modules
use std::fmt;
use std::str::FromStr;

/*
 * Errors for the string forms of keys, hashes and channel points.
 */
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid channel point: {0}")]
    ChannelPoint(String),
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let bytes = hex::decode(s)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ParseError::Length { expected: N, actual })
}

/*
 * The 33 byte compressed public key that identifies a node on the network.
 */
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePubkey([u8; 33]);

impl NodePubkey {
    pub fn from_bytes(bytes: [u8; 33]) -> Self {
        NodePubkey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /*
     * Short form used in log lines: first and last six hex characters.
     */
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...{}", &full[..6], &full[full.len() - 6..])
    }
}

impl fmt::Display for NodePubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodePubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePubkey({})", self.short())
    }
}

impl FromStr for NodePubkey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodePubkey(decode_fixed::<33>(s.trim())?))
    }
}

impl TryFrom<String> for NodePubkey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodePubkey> for String {
    fn from(key: NodePubkey) -> Self {
        key.to_string()
    }
}

/// Hash that locks a payment, sha256 of its [`Preimage`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentHash([u8; 32]);

impl PaymentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PaymentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for PaymentHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PaymentHash(decode_fixed::<32>(s.trim())?))
    }
}

impl TryFrom<String> for PaymentHash {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PaymentHash> for String {
    fn from(hash: PaymentHash) -> Self {
        hash.to_string()
    }
}

/*
 * The secret revealed by the receiver to settle a payment. A fresh one is drawn from the OS rng for
 * every payment and it only leaves the process when the receivable is settled.
 */
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub fn random() -> Result<Self, rand::Error> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Preimage(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Preimage(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hash(&self) -> PaymentHash {
        PaymentHash(Sha256::digest(self.0).into())
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage(..)")
    }
}

/*
 * Funding outpoint of a channel, written as "txid:index".
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub txid: String,
    pub output_index: u32,
}

impl fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.output_index)
    }
}

impl FromStr for ChannelPoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s
            .split_once(':')
            .ok_or_else(|| ParseError::ChannelPoint(s.to_string()))?;

        decode_fixed::<32>(txid)?;
        let output_index = index
            .parse::<u32>()
            .map_err(|_| ParseError::ChannelPoint(s.to_string()))?;

        Ok(ChannelPoint {
            txid: txid.to_string(),
            output_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_hashes_to_payment_hash() {
        let preimage = Preimage::from_bytes([7u8; 32]);
        let expected: [u8; 32] = Sha256::digest([7u8; 32]).into();
        assert_eq!(preimage.hash(), PaymentHash::from_bytes(expected));

        let fresh_a = Preimage::random().unwrap();
        let fresh_b = Preimage::random().unwrap();
        assert_ne!(fresh_a, fresh_b);
        assert_ne!(fresh_a.hash(), fresh_b.hash());
    }

    #[test]
    fn pubkey_parses_and_prints_hex() {
        let key = NodePubkey::from_bytes([2u8; 33]);
        let parsed: NodePubkey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);

        assert_eq!(
            "0202".parse::<NodePubkey>(),
            Err(ParseError::Length { expected: 33, actual: 2 })
        );
        assert_eq!(
            "zz".parse::<NodePubkey>(),
            Err(ParseError::Hex(hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 }))
        );
    }

    #[test]
    fn channel_point_parsing() {
        let txid = "ab".repeat(32);
        let point: ChannelPoint = format!("{}:3", txid).parse().unwrap();
        assert_eq!(point.output_index, 3);
        assert_eq!(point.to_string(), format!("{}:3", txid));

        assert!("no-colon".parse::<ChannelPoint>().is_err());
        assert!(format!("{}:x", txid).parse::<ChannelPoint>().is_err());
        assert!("abcd:1".parse::<ChannelPoint>().is_err());
    }
}
