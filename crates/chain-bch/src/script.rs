use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::BchError;

pub const OP_RETURN: u8 = 0x6A;
pub const OP_PUSHDATA1: u8 = 0x4C;
pub const OP_PUSHDATA2: u8 = 0x4D;
pub const OP_PUSHDATA4: u8 = 0x4E;
pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xA9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xAC;

/// Serialized length of a P2PKH locking script.
pub const P2PKH_SCRIPT_LEN: usize = 25;
/// Serialized length of a P2SH (20-byte) locking script.
pub const P2SH_SCRIPT_LEN: usize = 23;

/// The recognizable shapes of a locking script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    DataCarrier,
    Other,
}

/// Raw locking bytecode (scriptPubKey) of an output, without any token prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockingBytecode(Vec<u8>);

impl LockingBytecode {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// OP_DUP OP_HASH160 <20-byte hash> OP_EQUALVERIFY OP_CHECKSIG
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        let mut script = Vec::with_capacity(P2PKH_SCRIPT_LEN);
        script.push(OP_DUP);
        script.push(OP_HASH160);
        script.push(0x14);
        script.extend_from_slice(pubkey_hash);
        script.push(OP_EQUALVERIFY);
        script.push(OP_CHECKSIG);
        Self(script)
    }

    /// OP_HASH160 <20-byte hash> OP_EQUAL
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        let mut script = Vec::with_capacity(P2SH_SCRIPT_LEN);
        script.push(OP_HASH160);
        script.push(0x14);
        script.extend_from_slice(script_hash);
        script.push(OP_EQUAL);
        Self(script)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kind(&self) -> ScriptKind {
        let s = &self.0;
        if s.len() == P2PKH_SCRIPT_LEN
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == 0x14
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&s[3..23]);
            ScriptKind::P2pkh(hash)
        } else if s.len() == P2SH_SCRIPT_LEN
            && s[0] == OP_HASH160
            && s[1] == 0x14
            && s[22] == OP_EQUAL
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&s[2..22]);
            ScriptKind::P2sh(hash)
        } else if s.first() == Some(&OP_RETURN) {
            ScriptKind::DataCarrier
        } else {
            ScriptKind::Other
        }
    }
}

/// Append a data push using the SLP-compatible encoding: an empty push is
/// `OP_PUSHDATA1 0x00`, never `OP_0`.
pub fn push_data(buf: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => {
            buf.push(OP_PUSHDATA1);
            buf.push(0x00);
        }
        n @ 1..=75 => buf.push(n as u8),
        n @ 76..=0xFF => {
            buf.push(OP_PUSHDATA1);
            buf.push(n as u8);
        }
        n @ 0x100..=0xFFFF => {
            buf.push(OP_PUSHDATA2);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => {
            buf.push(OP_PUSHDATA4);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
    buf.extend_from_slice(data);
}

/// Build an `OP_RETURN <chunk> <chunk> ...` data-carrier script.
pub fn op_return(chunks: &[Vec<u8>]) -> LockingBytecode {
    let mut script = vec![OP_RETURN];
    for chunk in chunks {
        push_data(&mut script, chunk);
    }
    LockingBytecode(script)
}

/// Hash160: RIPEMD-160(SHA-256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Write a Bitcoin-style CompactSize (variable-length integer).
pub fn write_compact_size(buf: &mut Vec<u8>, val: u64) {
    if val < 0xFD {
        buf.push(val as u8);
    } else if val <= 0xFFFF {
        buf.push(0xFD);
        buf.extend_from_slice(&(val as u16).to_le_bytes());
    } else if val <= 0xFFFF_FFFF {
        buf.push(0xFE);
        buf.extend_from_slice(&(val as u32).to_le_bytes());
    } else {
        buf.push(0xFF);
        buf.extend_from_slice(&val.to_le_bytes());
    }
}

/// Number of bytes `write_compact_size` emits for `val`.
pub fn compact_size_len(val: u64) -> u64 {
    match val {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Forward-only reader over serialized bytes.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], BchError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                BchError::MalformedTransaction(format!(
                    "unexpected end of data at offset {}",
                    self.pos
                ))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, BchError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32_le(&mut self) -> Result<u32, BchError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub(crate) fn u64_le(&mut self) -> Result<u64, BchError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    pub(crate) fn compact_size(&mut self) -> Result<u64, BchError> {
        match self.u8()? {
            0xFD => {
                let mut b = [0u8; 2];
                b.copy_from_slice(self.take(2)?);
                Ok(u16::from_le_bytes(b) as u64)
            }
            0xFE => Ok(self.u32_le()? as u64),
            0xFF => self.u64_le(),
            n => Ok(n as u64),
        }
    }
}
