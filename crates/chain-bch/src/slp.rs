//! Simple Ledger Protocol (SLP) data-carrier encoding.
//!
//! Every SLP message is a single `OP_RETURN` output at vout 0:
//! `OP_RETURN <'SLP\0'> <token type> <'GENESIS'|'MINT'|'SEND'> <fields...>`.
//! Third-party indexers parse these bytes, so the layout here is exact.

use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;
use crate::error::BchError;
use crate::script::{push_data, LockingBytecode, OP_PUSHDATA1, OP_PUSHDATA2, OP_RETURN};

/// Lokad id `SLP\0`.
pub const LOKAD_ID: &[u8; 4] = b"SLP\x00";
/// Network-enforced ceiling on SEND output quantities.
pub const MAX_SEND_QUANTITIES: usize = 19;
/// Output index that receives a continuing mint baton.
pub const BATON_VOUT: u8 = 2;
pub const MAX_DECIMALS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SlpTokenType {
    #[default]
    Type1,
    NftParent,
    NftChild,
}

impl SlpTokenType {
    pub fn to_byte(self) -> u8 {
        match self {
            SlpTokenType::Type1 => 0x01,
            SlpTokenType::NftParent => 0x81,
            SlpTokenType::NftChild => 0x41,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SlpTokenType::Type1),
            0x81 => Some(SlpTokenType::NftParent),
            0x41 => Some(SlpTokenType::NftChild),
            _ => None,
        }
    }
}

/// An `OP_RETURN` output. Always carries zero satoshis and is exempt from
/// dust rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCarrierOutput {
    pub bytecode: LockingBytecode,
    pub satoshis: u64,
}

impl DataCarrierOutput {
    pub fn new(bytecode: LockingBytecode) -> Self {
        Self {
            bytecode,
            satoshis: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenesisParams {
    pub token_type: SlpTokenType,
    pub ticker: String,
    pub name: String,
    pub document_url: String,
    /// 64 hex characters, or empty.
    pub document_hash: String,
    pub decimals: u8,
    pub end_baton: bool,
    pub initial_amount: TokenAmount,
}

#[derive(Debug, Clone)]
pub struct MintParams {
    pub token_type: SlpTokenType,
    pub token_id: String,
    pub decimals: u8,
    pub end_baton: bool,
    pub amount: TokenAmount,
}

/// SEND quantities, already in raw base units.
#[derive(Debug, Clone)]
pub struct SendParams {
    pub token_type: SlpTokenType,
    pub token_id: String,
    pub amounts: Vec<u64>,
    /// Raw amount held by the token inputs being spent.
    pub available: u64,
}

impl SendParams {
    pub fn spend(&self) -> Result<u64, BchError> {
        self.amounts
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(*a))
            .ok_or_else(|| BchError::InvalidAmount("token spend overflows 64 bits".into()))
    }

    /// Token change returned to the sender, if any.
    pub fn change(&self) -> Result<Option<u64>, BchError> {
        let spend = self.spend()?;
        Ok((self.available > spend).then(|| self.available - spend))
    }
}

/// Build the GENESIS message.
pub fn encode_genesis(params: &GenesisParams) -> Result<DataCarrierOutput, BchError> {
    if params.decimals > MAX_DECIMALS {
        return Err(BchError::InvalidAmount(format!(
            "decimals must be between 0 and {MAX_DECIMALS}, got {}",
            params.decimals
        )));
    }
    if params.initial_amount.is_zero() {
        return Err(BchError::InvalidAmount(
            "initial genesis token amount should be greater than zero".into(),
        ));
    }
    let raw = params.initial_amount.to_raw(params.decimals)?;
    let document_hash = decode_document_hash(&params.document_hash)?;

    let mut script = header(params.token_type, b"GENESIS");
    push_data(&mut script, params.ticker.as_bytes());
    push_data(&mut script, params.name.as_bytes());
    push_data(&mut script, params.document_url.as_bytes());
    push_data(&mut script, &document_hash);
    push_data(&mut script, &[params.decimals]);
    push_baton(&mut script, params.end_baton);
    push_data(&mut script, &raw.to_be_bytes());
    Ok(DataCarrierOutput::new(LockingBytecode::from_bytes(script)))
}

/// Build the MINT message.
pub fn encode_mint(params: &MintParams) -> Result<DataCarrierOutput, BchError> {
    let token_id = decode_token_id(&params.token_id)?;
    let raw = params.amount.to_raw(params.decimals)?;

    let mut script = header(params.token_type, b"MINT");
    push_data(&mut script, &token_id);
    push_baton(&mut script, params.end_baton);
    push_data(&mut script, &raw.to_be_bytes());
    Ok(DataCarrierOutput::new(LockingBytecode::from_bytes(script)))
}

/// Build the SEND message. A change quantity is appended when the inputs hold
/// more than is spent.
pub fn encode_send(params: &SendParams) -> Result<DataCarrierOutput, BchError> {
    let token_id = decode_token_id(&params.token_id)?;
    if params.amounts.is_empty() {
        return Err(BchError::InvalidRequest("empty token send requests".into()));
    }
    let spend = params.spend()?;
    if spend == 0 {
        return Err(BchError::InvalidAmount("refusing to spend 0 tokens".into()));
    }
    if spend > params.available {
        return Err(BchError::InsufficientTokens {
            category: params.token_id.clone(),
            required: spend,
            available: params.available,
        });
    }

    let change = params.change()?;
    let count = params.amounts.len() + usize::from(change.is_some());
    if count > MAX_SEND_QUANTITIES {
        return Err(BchError::TooManyOutputs {
            count,
            max: MAX_SEND_QUANTITIES,
        });
    }

    let mut script = header(params.token_type, b"SEND");
    push_data(&mut script, &token_id);
    for amount in params.amounts.iter().chain(change.iter()) {
        push_data(&mut script, &amount.to_be_bytes());
    }

    parse_message(&script)?;
    Ok(DataCarrierOutput::new(LockingBytecode::from_bytes(script)))
}

/// A decoded SLP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlpMessage {
    Genesis {
        token_type: SlpTokenType,
        ticker: Vec<u8>,
        name: Vec<u8>,
        document_url: Vec<u8>,
        document_hash: Vec<u8>,
        decimals: u8,
        baton_vout: Option<u8>,
        quantity: u64,
    },
    Mint {
        token_type: SlpTokenType,
        token_id: String,
        baton_vout: Option<u8>,
        quantity: u64,
    },
    Send {
        token_type: SlpTokenType,
        token_id: String,
        amounts: Vec<u64>,
    },
}

/// Parse an SLP `OP_RETURN` script.
pub fn parse_message(script: &[u8]) -> Result<SlpMessage, BchError> {
    let bad = |msg: &str| BchError::InvalidToken(format!("not an slp message: {msg}"));
    if script.first() != Some(&OP_RETURN) {
        return Err(bad("missing OP_RETURN"));
    }
    let chunks = read_pushes(&script[1..]).ok_or_else(|| bad("malformed push"))?;
    if chunks.len() < 3 || chunks[0] != LOKAD_ID {
        return Err(bad("missing lokad id"));
    }
    let token_type = match chunks[1].as_slice() {
        [b] => SlpTokenType::from_byte(*b).ok_or_else(|| bad("unknown token type"))?,
        _ => return Err(bad("token type must be one byte")),
    };
    let fields = &chunks[3..];
    let quantity = |bytes: &[u8]| -> Result<u64, BchError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| bad("quantity must be 8 bytes"))?;
        Ok(u64::from_be_bytes(arr))
    };
    let baton = |bytes: &[u8]| -> Result<Option<u8>, BchError> {
        match bytes {
            [] => Ok(None),
            [v] if *v >= 2 => Ok(Some(*v)),
            _ => Err(bad("invalid mint baton vout")),
        }
    };
    let token_id = |bytes: &[u8]| -> Result<String, BchError> {
        if bytes.len() != 32 {
            return Err(bad("token id must be 32 bytes"));
        }
        Ok(hex::encode(bytes))
    };

    match chunks[2].as_slice() {
        b"GENESIS" => {
            if fields.len() != 7 {
                return Err(bad("genesis needs 7 fields"));
            }
            if !(fields[3].is_empty() || fields[3].len() == 32) {
                return Err(bad("document hash must be 0 or 32 bytes"));
            }
            let decimals = match fields[4].as_slice() {
                [d] if *d <= MAX_DECIMALS => *d,
                _ => return Err(bad("invalid decimals")),
            };
            Ok(SlpMessage::Genesis {
                token_type,
                ticker: fields[0].clone(),
                name: fields[1].clone(),
                document_url: fields[2].clone(),
                document_hash: fields[3].clone(),
                decimals,
                baton_vout: baton(&fields[5])?,
                quantity: quantity(&fields[6])?,
            })
        }
        b"MINT" => {
            if fields.len() != 3 {
                return Err(bad("mint needs 3 fields"));
            }
            Ok(SlpMessage::Mint {
                token_type,
                token_id: token_id(&fields[0])?,
                baton_vout: baton(&fields[1])?,
                quantity: quantity(&fields[2])?,
            })
        }
        b"SEND" => {
            if fields.len() < 2 || fields.len() > MAX_SEND_QUANTITIES + 1 {
                return Err(bad("send needs 1 to 19 quantities"));
            }
            Ok(SlpMessage::Send {
                token_type,
                token_id: token_id(&fields[0])?,
                amounts: fields[1..]
                    .iter()
                    .map(|f| quantity(f))
                    .collect::<Result<_, _>>()?,
            })
        }
        _ => Err(bad("unknown transaction type")),
    }
}

fn header(token_type: SlpTokenType, kind: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    push_data(&mut script, LOKAD_ID);
    push_data(&mut script, &[token_type.to_byte()]);
    push_data(&mut script, kind);
    script
}

fn push_baton(script: &mut Vec<u8>, end_baton: bool) {
    if end_baton {
        push_data(script, &[]);
    } else {
        push_data(script, &[BATON_VOUT]);
    }
}

fn decode_document_hash(hash: &str) -> Result<Vec<u8>, BchError> {
    if hash.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = hex::decode(hash)
        .map_err(|e| BchError::InvalidDocumentHash(format!("not hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(BchError::InvalidDocumentHash(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode a 64-character hex token id as stored (no byte reversal).
pub fn decode_token_id(token_id: &str) -> Result<[u8; 32], BchError> {
    let bytes = hex::decode(token_id).ok().filter(|b| b.len() == 32).ok_or_else(|| {
        BchError::InvalidToken(format!(
            "invalid token id {token_id:?}, must be a 64 character hexadecimal string"
        ))
    })?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn read_pushes(mut data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut chunks = Vec::new();
    while let Some((&op, rest)) = data.split_first() {
        let (len, rest) = match op {
            1..=75 => (op as usize, rest),
            OP_PUSHDATA1 => {
                let (&len, rest) = rest.split_first()?;
                (len as usize, rest)
            }
            OP_PUSHDATA2 => {
                let len = u16::from_le_bytes([*rest.first()?, *rest.get(1)?]);
                (len as usize, &rest[2..])
            }
            _ => return None,
        };
        if rest.len() < len {
            return None;
        }
        chunks.push(rest[..len].to_vec());
        data = &rest[len..];
    }
    Some(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_ID: &str = "550d19eb820e616a54b8a73372c4420b5a0567d8dc00f613b71c5234dc884b35";

    fn hex_of(out: &DataCarrierOutput) -> String {
        hex::encode(out.bytecode.as_bytes())
    }

    #[test]
    fn genesis_tether_fixture() {
        let out = encode_genesis(&GenesisParams {
            ticker: "USDT".into(),
            name: "Tether Ltd. US dollar backed tokens".into(),
            document_url: "https://tether.to/wp-content/uploads/2016/06/TetherWhitePaper.pdf"
                .into(),
            document_hash: "db4451f11eda33950670aaf59e704da90117ff7057283b032cfaec7779313916"
                .into(),
            decimals: 8,
            initial_amount: TokenAmount::from(100_000_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(out.satoshis, 0);
        assert_eq!(
            hex_of(&out),
            "6a04534c500001010747454e45534953045553445423546574686572204c74642e20555320646f6c6c6172206261636b656420746f6b656e734168747470733a2f2f7465746865722e746f2f77702d636f6e74656e742f75706c6f6164732f323031362f30362f546574686572576869746550617065722e70646620db4451f11eda33950670aaf59e704da90117ff7057283b032cfaec77793139160108010208002386f26fc10000"
        );
    }

    #[test]
    fn genesis_empty_strings_fixture() {
        let out = encode_genesis(&GenesisParams {
            decimals: 5,
            initial_amount: TokenAmount::from(1_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            hex_of(&out),
            "6a04534c500001010747454e455349534c004c004c004c0001050102080000000005f5e100"
        );
    }

    #[test]
    fn genesis_utf8_fixture() {
        let out = encode_genesis(&GenesisParams {
            ticker: "🎵".into(),
            name: "Music 🎵".into(),
            document_url: "http://tiny.cc/gcmzcz".into(),
            decimals: 0,
            initial_amount: TokenAmount::from(100_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            hex_of(&out),
            "6a04534c500001010747454e4553495304f09f8eb50a4d7573696320f09f8eb515687474703a2f2f74696e792e63632f67636d7a637a4c00010001020800000000000186a0"
        );
    }

    #[test]
    fn genesis_end_baton_and_nft_type() {
        let out = encode_genesis(&GenesisParams {
            token_type: SlpTokenType::NftParent,
            end_baton: true,
            initial_amount: TokenAmount::from(1),
            ..Default::default()
        })
        .unwrap();
        match parse_message(out.bytecode.as_bytes()).unwrap() {
            SlpMessage::Genesis {
                token_type,
                baton_vout,
                quantity,
                ..
            } => {
                assert_eq!(token_type, SlpTokenType::NftParent);
                assert_eq!(baton_vout, None);
                assert_eq!(quantity, 1);
            }
            other => panic!("expected genesis, got {other:?}"),
        }
    }

    #[test]
    fn genesis_rejects_bad_document_hash() {
        let err = encode_genesis(&GenesisParams {
            document_hash: "abcd".into(),
            initial_amount: TokenAmount::from(1),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, BchError::InvalidDocumentHash(_)));
    }

    #[test]
    fn genesis_rejects_zero_and_oversized_amounts() {
        let zero = encode_genesis(&GenesisParams::default());
        assert!(matches!(zero, Err(BchError::InvalidAmount(_))));

        let huge = encode_genesis(&GenesisParams {
            decimals: 9,
            initial_amount: TokenAmount::from(u64::MAX / 100),
            ..Default::default()
        });
        assert!(matches!(huge, Err(BchError::InvalidAmount(_))));
    }

    #[test]
    fn genesis_rejects_ten_decimals() {
        let err = encode_genesis(&GenesisParams {
            decimals: 10,
            initial_amount: TokenAmount::from(1),
            ..Default::default()
        });
        assert!(matches!(err, Err(BchError::InvalidAmount(_))));
    }

    #[test]
    fn send_fixture() {
        let decimals = 8;
        let out = encode_send(&SendParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            amounts: vec![TokenAmount::from(1_000_000).to_raw(decimals).unwrap()],
            available: TokenAmount::from(100_000_000).to_raw(decimals).unwrap(),
        })
        .unwrap();
        assert_eq!(
            hex_of(&out),
            "6a04534c500001010453454e4420550d19eb820e616a54b8a73372c4420b5a0567d8dc00f613b71c5234dc884b350800005af3107a40000800232bff5f46c000"
        );
    }

    #[test]
    fn send_without_change_when_spending_everything() {
        let params = SendParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            amounts: vec![40, 60],
            available: 100,
        };
        assert_eq!(params.change().unwrap(), None);
        let out = encode_send(&params).unwrap();
        match parse_message(out.bytecode.as_bytes()).unwrap() {
            SlpMessage::Send { amounts, .. } => assert_eq!(amounts, vec![40, 60]),
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn send_limits_quantities() {
        let exact = SendParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            amounts: vec![1; 19],
            available: 19,
        };
        assert!(encode_send(&exact).is_ok());

        // 19 requests plus a change quantity is one too many.
        let with_change = SendParams {
            available: 20,
            ..exact.clone()
        };
        assert!(matches!(
            encode_send(&with_change),
            Err(BchError::TooManyOutputs { count: 20, max: 19 })
        ));
    }

    #[test]
    fn send_rejects_overspend_and_zero() {
        let over = SendParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            amounts: vec![101],
            available: 100,
        };
        assert!(matches!(encode_send(&over), Err(BchError::InsufficientTokens { .. })));

        let zero = SendParams {
            amounts: vec![0],
            ..over
        };
        assert!(matches!(encode_send(&zero), Err(BchError::InvalidAmount(_))));
    }

    #[test]
    fn send_rejects_bad_token_id() {
        let params = SendParams {
            token_type: SlpTokenType::Type1,
            token_id: "1234".into(),
            amounts: vec![1],
            available: 1,
        };
        assert!(matches!(encode_send(&params), Err(BchError::InvalidToken(_))));
    }

    #[test]
    fn mint_fixture() {
        let out = encode_mint(&MintParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            decimals: 8,
            end_baton: false,
            amount: TokenAmount::from(100_000_000),
        })
        .unwrap();
        assert_eq!(
            hex_of(&out),
            "6a04534c50000101044d494e5420550d19eb820e616a54b8a73372c4420b5a0567d8dc00f613b71c5234dc884b35010208002386f26fc10000"
        );
    }

    #[test]
    fn mint_end_baton_pushes_empty() {
        let out = encode_mint(&MintParams {
            token_type: SlpTokenType::Type1,
            token_id: TOKEN_ID.into(),
            decimals: 0,
            end_baton: true,
            amount: TokenAmount::from(5),
        })
        .unwrap();
        let hex = hex_of(&out);
        assert!(hex.contains(&format!("{TOKEN_ID}4c0008")));
    }

    #[test]
    fn parse_rejects_non_slp() {
        assert!(parse_message(&[0x6A, 0x04, b'A', b'B', b'C', 0x00]).is_err());
        assert!(parse_message(&[0x76, 0xA9]).is_err());
    }
}
