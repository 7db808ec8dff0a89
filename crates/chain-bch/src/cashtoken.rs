//! CashToken output encoding.
//!
//! Tokens ride directly on an output: the output's script field carries a
//! token prefix (`0xEF`, category, bitfield, optional commitment, optional
//! fungible amount) followed by the ordinary locking bytecode.

use serde::{Deserialize, Serialize};

use crate::error::BchError;
use crate::script::{compact_size_len, write_compact_size, LockingBytecode, Reader};

pub const PREFIX_TOKEN: u8 = 0xEF;
pub const MAX_COMMITMENT_LEN: usize = 40;
pub const MAX_FUNGIBLE_AMOUNT: u64 = i64::MAX as u64;

const HAS_COMMITMENT_LENGTH: u8 = 0x40;
const HAS_NFT: u8 = 0x20;
const HAS_AMOUNT: u8 = 0x10;
const RESERVED_BIT: u8 = 0x80;

/// Capability of a non-fungible token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NftCapability {
    #[default]
    None,
    Mutable,
    Minting,
}

impl NftCapability {
    fn to_nibble(self) -> u8 {
        match self {
            NftCapability::None => 0x00,
            NftCapability::Mutable => 0x01,
            NftCapability::Minting => 0x02,
        }
    }

    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x00 => Some(NftCapability::None),
            0x01 => Some(NftCapability::Mutable),
            0x02 => Some(NftCapability::Minting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nft {
    pub capability: NftCapability,
    #[serde(with = "hex_bytes", default)]
    pub commitment: Vec<u8>,
}

/// Token data attached to an output.
///
/// `category` is the 32-byte category id as 64 hex characters in display
/// (txid) order. `amount` is the fungible amount; zero means no fungible tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenDatum {
    pub category: String,
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub nft: Option<Nft>,
}

impl TokenDatum {
    pub fn fungible(category: impl Into<String>, amount: u64) -> Self {
        Self {
            category: category.into(),
            amount,
            nft: None,
        }
    }

    pub fn nft(category: impl Into<String>, capability: NftCapability, commitment: Vec<u8>) -> Self {
        Self {
            category: category.into(),
            amount: 0,
            nft: Some(Nft {
                capability,
                commitment,
            }),
        }
    }

    /// Check category format, commitment length and amount range.
    pub fn validate(&self) -> Result<(), BchError> {
        parse_category_id(&self.category)?;
        if self.amount > MAX_FUNGIBLE_AMOUNT {
            return Err(BchError::InvalidToken(format!(
                "fungible amount {} exceeds {MAX_FUNGIBLE_AMOUNT}",
                self.amount
            )));
        }
        match &self.nft {
            Some(nft) if nft.commitment.len() > MAX_COMMITMENT_LEN => {
                Err(BchError::InvalidToken(format!(
                    "commitment of {} bytes exceeds {MAX_COMMITMENT_LEN}",
                    nft.commitment.len()
                )))
            }
            None if self.amount == 0 => Err(BchError::InvalidToken(
                "token carries neither an amount nor an nft".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Encode the token prefix.
    pub fn encode_prefix(&self) -> Result<Vec<u8>, BchError> {
        self.validate()?;
        let (category, _) = parse_category_id(&self.category)?;

        let mut out = Vec::with_capacity(self.prefix_len());
        out.push(PREFIX_TOKEN);
        // Internal byte order, as in outpoints.
        out.extend(category.iter().rev());

        let mut bitfield = 0u8;
        if let Some(nft) = &self.nft {
            bitfield |= HAS_NFT | nft.capability.to_nibble();
            if !nft.commitment.is_empty() {
                bitfield |= HAS_COMMITMENT_LENGTH;
            }
        }
        if self.amount > 0 {
            bitfield |= HAS_AMOUNT;
        }
        out.push(bitfield);

        if let Some(nft) = self.nft.as_ref().filter(|n| !n.commitment.is_empty()) {
            write_compact_size(&mut out, nft.commitment.len() as u64);
            out.extend_from_slice(&nft.commitment);
        }
        if self.amount > 0 {
            write_compact_size(&mut out, self.amount);
        }
        Ok(out)
    }

    /// Serialized size of the token prefix.
    pub fn prefix_len(&self) -> usize {
        let commitment = self
            .nft
            .as_ref()
            .filter(|n| !n.commitment.is_empty())
            .map(|n| compact_size_len(n.commitment.len() as u64) as usize + n.commitment.len())
            .unwrap_or(0);
        let amount = if self.amount > 0 {
            compact_size_len(self.amount) as usize
        } else {
            0
        };
        1 + 32 + 1 + commitment + amount
    }

    pub fn has_nft(&self) -> bool {
        self.nft.is_some()
    }
}

/// Parse a category id: 64 hex characters, optionally followed by one
/// capability suffix byte (`00` none, `01` mutable, `02` minting).
pub fn parse_category_id(id: &str) -> Result<([u8; 32], Option<NftCapability>), BchError> {
    let bytes = hex::decode(id)
        .map_err(|e| BchError::InvalidToken(format!("category id is not hex: {e}")))?;
    let capability = match bytes.len() {
        32 => None,
        33 => Some(NftCapability::from_nibble(bytes[32]).ok_or_else(|| {
            BchError::InvalidToken(format!("unknown capability suffix {:#04x}", bytes[32]))
        })?),
        n => {
            return Err(BchError::InvalidToken(format!(
                "category id must be 32 bytes, got {n}"
            )))
        }
    };
    let mut category = [0u8; 32];
    category.copy_from_slice(&bytes[..32]);
    Ok((category, capability))
}

/// Prepend the token prefix (if any) to the locking bytecode, yielding the
/// bytes stored in an output's script field.
pub fn encode_output_script(
    token: Option<&TokenDatum>,
    locking: &LockingBytecode,
) -> Result<Vec<u8>, BchError> {
    match token {
        Some(token) => {
            let mut out = token.encode_prefix()?;
            out.extend_from_slice(locking.as_bytes());
            Ok(out)
        }
        None => Ok(locking.as_bytes().to_vec()),
    }
}

/// Split an output's script field into its token data and locking bytecode.
pub fn decode_output_script(
    script: &[u8],
) -> Result<(Option<TokenDatum>, LockingBytecode), BchError> {
    if script.first() != Some(&PREFIX_TOKEN) {
        return Ok((None, LockingBytecode::from_bytes(script.to_vec())));
    }

    let mut r = Reader::new(&script[1..]);
    let mut category: Vec<u8> = r.take(32)?.to_vec();
    category.reverse();
    let bitfield = r.u8()?;
    if bitfield & RESERVED_BIT != 0 {
        return Err(BchError::InvalidToken("reserved token bit set".into()));
    }

    let has_nft = bitfield & HAS_NFT != 0;
    let nft = if has_nft {
        let capability = NftCapability::from_nibble(bitfield & 0x0F).ok_or_else(|| {
            BchError::InvalidToken(format!("unknown capability {:#04x}", bitfield & 0x0F))
        })?;
        let commitment = if bitfield & HAS_COMMITMENT_LENGTH != 0 {
            let len = r.compact_size()? as usize;
            if len == 0 || len > MAX_COMMITMENT_LEN {
                return Err(BchError::InvalidToken(format!("bad commitment length {len}")));
            }
            r.take(len)?.to_vec()
        } else {
            Vec::new()
        };
        Some(Nft {
            capability,
            commitment,
        })
    } else {
        if bitfield & (HAS_COMMITMENT_LENGTH | 0x0F) != 0 {
            return Err(BchError::InvalidToken(
                "commitment or capability without an nft".into(),
            ));
        }
        None
    };

    let amount = if bitfield & HAS_AMOUNT != 0 {
        let amount = r.compact_size()?;
        if amount == 0 || amount > MAX_FUNGIBLE_AMOUNT {
            return Err(BchError::InvalidToken(format!("bad fungible amount {amount}")));
        }
        amount
    } else {
        0
    };

    let token = TokenDatum {
        category: hex::encode(category),
        amount,
        nft,
    };
    token.validate()?;
    Ok((Some(token), LockingBytecode::from_bytes(r.remaining().to_vec())))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
