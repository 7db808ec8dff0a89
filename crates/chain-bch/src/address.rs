use crate::error::BchError;
use crate::network::BchNetwork;
use crate::script::{hash160, LockingBytecode, ScriptKind};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Payload type encoded in the CashAddr version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    P2pkh,
    P2sh,
    /// Token-aware P2PKH (CashTokens, version type 2).
    TokenP2pkh,
    /// Token-aware P2SH (CashTokens, version type 3).
    TokenP2sh,
}

impl AddressKind {
    fn type_bits(self) -> u8 {
        match self {
            AddressKind::P2pkh => 0,
            AddressKind::P2sh => 1,
            AddressKind::TokenP2pkh => 2,
            AddressKind::TokenP2sh => 3,
        }
    }

    fn from_type_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(AddressKind::P2pkh),
            1 => Some(AddressKind::P2sh),
            2 => Some(AddressKind::TokenP2pkh),
            3 => Some(AddressKind::TokenP2sh),
            _ => None,
        }
    }

    pub fn is_token_aware(self) -> bool {
        matches!(self, AddressKind::TokenP2pkh | AddressKind::TokenP2sh)
    }
}

/// A decoded CashAddr with a 160-bit hash payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashAddress {
    pub network: BchNetwork,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl CashAddress {
    /// Parse a CashAddr string. The prefix may be omitted, in which case every
    /// known network prefix is tried against the checksum.
    pub fn parse(address: &str) -> Result<Self, BchError> {
        let has_lower = address.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = address.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            return Err(BchError::InvalidAddress("mixed case".into()));
        }
        let lowered = address.to_ascii_lowercase();

        match lowered.split_once(':') {
            Some((prefix, payload)) => {
                let network = BchNetwork::from_cashaddr_prefix(prefix).ok_or_else(|| {
                    BchError::InvalidAddress(format!("unknown prefix {prefix}"))
                })?;
                decode_payload(network, payload)
            }
            None => [BchNetwork::Mainnet, BchNetwork::Testnet, BchNetwork::Regtest]
                .into_iter()
                .find_map(|network| decode_payload(network, &lowered).ok())
                .ok_or_else(|| BchError::InvalidAddress("invalid checksum".into())),
        }
    }

    /// Encode as `prefix:payload`.
    pub fn encode(&self) -> String {
        let prefix = self.network.cashaddr_prefix();
        let mut raw = Vec::with_capacity(21);
        // Size code 0 = 160-bit hash.
        raw.push(self.kind.type_bits() << 3);
        raw.extend_from_slice(&self.hash);

        let mut data = convert_bits(&raw, 8, 5, true);
        let checksum = create_checksum(prefix, &data);
        data.extend_from_slice(&checksum);

        let mut out = String::with_capacity(prefix.len() + 1 + data.len());
        out.push_str(prefix);
        out.push(':');
        out.extend(data.iter().map(|&v| CHARSET[v as usize] as char));
        out
    }

    pub fn locking_bytecode(&self) -> LockingBytecode {
        match self.kind {
            AddressKind::P2pkh | AddressKind::TokenP2pkh => LockingBytecode::p2pkh(&self.hash),
            AddressKind::P2sh | AddressKind::TokenP2sh => LockingBytecode::p2sh(&self.hash),
        }
    }

    /// Build the address paying to `script`. Only P2PKH and P2SH are addressable.
    pub fn from_locking_bytecode(
        script: &LockingBytecode,
        network: BchNetwork,
        token_aware: bool,
    ) -> Result<Self, BchError> {
        let (kind, hash) = match (script.kind(), token_aware) {
            (ScriptKind::P2pkh(h), false) => (AddressKind::P2pkh, h),
            (ScriptKind::P2pkh(h), true) => (AddressKind::TokenP2pkh, h),
            (ScriptKind::P2sh(h), false) => (AddressKind::P2sh, h),
            (ScriptKind::P2sh(h), true) => (AddressKind::TokenP2sh, h),
            _ => {
                return Err(BchError::InvalidAddress(
                    "locking bytecode has no address form".into(),
                ))
            }
        };
        Ok(Self { network, kind, hash })
    }

    /// The same destination, signalling (or not) CashToken support.
    pub fn with_token_support(mut self, token_aware: bool) -> Self {
        self.kind = match (self.kind, token_aware) {
            (AddressKind::P2pkh | AddressKind::TokenP2pkh, true) => AddressKind::TokenP2pkh,
            (AddressKind::P2pkh | AddressKind::TokenP2pkh, false) => AddressKind::P2pkh,
            (AddressKind::P2sh | AddressKind::TokenP2sh, true) => AddressKind::TokenP2sh,
            (AddressKind::P2sh | AddressKind::TokenP2sh, false) => AddressKind::P2sh,
        };
        self
    }
}

/// Translates between addresses and output locking bytecode.
pub trait AddressCodec: Send + Sync {
    fn decode(&self, address: &str) -> Result<LockingBytecode, BchError>;

    fn encode(&self, script: &LockingBytecode, network: BchNetwork) -> Result<String, BchError>;
}

/// CashAddr implementation of [`AddressCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CashAddrCodec;

impl AddressCodec for CashAddrCodec {
    fn decode(&self, address: &str) -> Result<LockingBytecode, BchError> {
        Ok(CashAddress::parse(address)?.locking_bytecode())
    }

    fn encode(&self, script: &LockingBytecode, network: BchNetwork) -> Result<String, BchError> {
        Ok(CashAddress::from_locking_bytecode(script, network, false)?.encode())
    }
}

/// Derive the P2PKH CashAddr of a 33-byte compressed secp256k1 public key.
pub fn pubkey_to_cashaddr(pubkey: &[u8; 33], network: BchNetwork) -> Result<String, BchError> {
    if pubkey[0] != 0x02 && pubkey[0] != 0x03 {
        return Err(BchError::InvalidPublicKey(
            "compressed key must start with 0x02 or 0x03".into(),
        ));
    }
    Ok(CashAddress {
        network,
        kind: AddressKind::P2pkh,
        hash: hash160(pubkey),
    }
    .encode())
}

fn decode_payload(network: BchNetwork, payload: &str) -> Result<CashAddress, BchError> {
    let prefix = network.cashaddr_prefix();
    let mut data = Vec::with_capacity(payload.len());
    for c in payload.bytes() {
        let v = CHARSET
            .iter()
            .position(|&x| x == c)
            .ok_or_else(|| BchError::InvalidAddress(format!("invalid character {}", c as char)))?;
        data.push(v as u8);
    }
    if data.len() < 8 {
        return Err(BchError::InvalidAddress("payload too short".into()));
    }
    if polymod_with_prefix(prefix, &data) != 0 {
        return Err(BchError::InvalidAddress("invalid checksum".into()));
    }

    let raw = convert_bits(&data[..data.len() - 8], 5, 8, false);
    if raw.len() != 21 {
        return Err(BchError::InvalidAddress(format!(
            "expected 21 payload bytes, got {}",
            raw.len()
        )));
    }
    let version = raw[0];
    if version & 0x07 != 0 {
        return Err(BchError::InvalidAddress("only 160-bit hashes are supported".into()));
    }
    let kind = AddressKind::from_type_bits(version >> 3)
        .ok_or_else(|| BchError::InvalidAddress(format!("unknown version byte {version:#04x}")))?;

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&raw[1..]);
    Ok(CashAddress { network, kind, hash })
}

fn create_checksum(prefix: &str, data: &[u8]) -> [u8; 8] {
    let mut values = data.to_vec();
    values.extend_from_slice(&[0u8; 8]);
    let poly = polymod_with_prefix(prefix, &values);
    let mut out = [0u8; 8];
    for (i, v) in out.iter_mut().enumerate() {
        *v = ((poly >> (5 * (7 - i))) & 0x1F) as u8;
    }
    out
}

fn polymod_with_prefix(prefix: &str, data: &[u8]) -> u64 {
    let mut values: Vec<u8> = prefix.bytes().map(|b| b & 0x1F).collect();
    values.push(0);
    values.extend_from_slice(data);
    polymod(&values)
}

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_FFFF_FFFF) << 5) ^ d as u64;
        if c0 & 0x01 != 0 {
            c ^= 0x98_F2BC_8E61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_B76D_99E2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xF3_3E5F_B3C4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xAE_2EAB_E2A8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1E_4F43_E470;
        }
    }
    c ^ 1
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Vec<u8> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for &value in data {
        acc = (acc << from) | value as u32;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad && bits > 0 {
        out.push(((acc << (to - bits)) & max) as u8);
    }
    out
}
