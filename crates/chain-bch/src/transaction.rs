use k256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};

use crate::cashtoken::{decode_output_script, encode_output_script, TokenDatum};
use crate::error::BchError;
use crate::script::{hash160, sha256d, write_compact_size, LockingBytecode, Reader};

pub const TX_VERSION: u32 = 2;

/// Final sequence: no relative locktime, no replacement.
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

const SIGHASH_ALL: u8 = 0x01;
const SIGHASH_FORKID: u8 = 0x40;

/// SIGHASH_ALL | SIGHASH_FORKID, the only sighash type this crate signs with.
pub const SIGHASH_ALL_FORKID: u8 = SIGHASH_ALL | SIGHASH_FORKID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Previous transaction hash (32 bytes, internal byte order).
    pub prev_txid: [u8; 32],
    pub prev_vout: u32,
    /// Unlocking script; empty until signed.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub satoshis: u64,
    pub script: LockingBytecode,
    pub token: Option<TokenDatum>,
}

impl TxOutput {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), BchError> {
        buf.extend_from_slice(&self.satoshis.to_le_bytes());
        let script = encode_output_script(self.token.as_ref(), &self.script)?;
        write_compact_size(buf, script.len() as u64);
        buf.extend_from_slice(&script);
        Ok(())
    }
}

/// The output an input spends, as needed for the signature digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub satoshis: u64,
    pub script: LockingBytecode,
    pub token: Option<TokenDatum>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Standard wire serialization. Unsigned inputs serialize with empty scriptSigs.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BchError> {
        let mut buf = Vec::with_capacity(10 + self.inputs.len() * 148 + self.outputs.len() * 34);
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_compact_size(&mut buf, self.inputs.len() as u64);
        for inp in &self.inputs {
            buf.extend_from_slice(&inp.prev_txid);
            buf.extend_from_slice(&inp.prev_vout.to_le_bytes());
            write_compact_size(&mut buf, inp.script_sig.len() as u64);
            buf.extend_from_slice(&inp.script_sig);
            buf.extend_from_slice(&inp.sequence.to_le_bytes());
        }

        write_compact_size(&mut buf, self.outputs.len() as u64);
        for out in &self.outputs {
            out.write(&mut buf)?;
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        Ok(buf)
    }

    /// Parse the wire format; trailing bytes are an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BchError> {
        let mut r = Reader::new(bytes);
        let version = r.u32_le()?;

        let input_count = r.compact_size()? as usize;
        // Each input is at least 41 bytes.
        let mut inputs = Vec::with_capacity(input_count.min(r.remaining().len() / 41));
        for _ in 0..input_count {
            let mut prev_txid = [0u8; 32];
            prev_txid.copy_from_slice(r.take(32)?);
            let prev_vout = r.u32_le()?;
            let len = r.compact_size()? as usize;
            let script_sig = r.take(len)?.to_vec();
            let sequence = r.u32_le()?;
            inputs.push(TxInput {
                prev_txid,
                prev_vout,
                script_sig,
                sequence,
            });
        }

        let output_count = r.compact_size()? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(r.remaining().len() / 9));
        for _ in 0..output_count {
            let satoshis = r.u64_le()?;
            let len = r.compact_size()? as usize;
            let (token, script) = decode_output_script(r.take(len)?)?;
            outputs.push(TxOutput {
                satoshis,
                script,
                token,
            });
        }

        let lock_time = r.u32_le()?;
        if !r.is_empty() {
            return Err(BchError::MalformedTransaction(format!(
                "{} trailing bytes after locktime",
                r.remaining().len()
            )));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Transaction id: reversed double SHA-256 of the serialization, as hex.
    pub fn txid(&self) -> Result<String, BchError> {
        let mut hash = sha256d(&self.to_bytes()?);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    /// BIP-143 style digest with the fork id, covering the spent output's
    /// token prefix when it carries tokens.
    pub fn sighash(&self, input_index: usize, spent: &SpentOutput) -> Result<[u8; 32], BchError> {
        let inp = self
            .inputs
            .get(input_index)
            .ok_or_else(|| BchError::SigningError("input index out of bounds".into()))?;

        let hash_prevouts = {
            let mut data = Vec::with_capacity(self.inputs.len() * 36);
            for i in &self.inputs {
                data.extend_from_slice(&i.prev_txid);
                data.extend_from_slice(&i.prev_vout.to_le_bytes());
            }
            sha256d(&data)
        };

        let hash_sequence = {
            let mut data = Vec::with_capacity(self.inputs.len() * 4);
            for i in &self.inputs {
                data.extend_from_slice(&i.sequence.to_le_bytes());
            }
            sha256d(&data)
        };

        let hash_outputs = {
            let mut data = Vec::new();
            for out in &self.outputs {
                out.write(&mut data)?;
            }
            sha256d(&data)
        };

        let mut preimage = Vec::with_capacity(256);
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&hash_prevouts);
        preimage.extend_from_slice(&hash_sequence);
        preimage.extend_from_slice(&inp.prev_txid);
        preimage.extend_from_slice(&inp.prev_vout.to_le_bytes());
        if let Some(token) = &spent.token {
            preimage.extend_from_slice(&token.encode_prefix()?);
        }
        write_compact_size(&mut preimage, spent.script.len() as u64);
        preimage.extend_from_slice(spent.script.as_bytes());
        preimage.extend_from_slice(&spent.satoshis.to_le_bytes());
        preimage.extend_from_slice(&inp.sequence.to_le_bytes());
        preimage.extend_from_slice(&hash_outputs);
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&u32::from(SIGHASH_ALL_FORKID).to_le_bytes());

        Ok(sha256d(&preimage))
    }
}

/// Produces unlocking scripts for inputs.
pub trait Signer {
    fn unlocking_script(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &SpentOutput,
    ) -> Result<Vec<u8>, BchError>;
}

/// ECDSA P2PKH signer for a single secp256k1 key.
pub struct P2pkhSigner {
    signing_key: SigningKey,
    public_key: [u8; 33],
}

impl P2pkhSigner {
    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, BchError> {
        let signing_key = SigningKey::from_bytes(private_key.into())
            .map_err(|e| BchError::InvalidPrivateKey(format!("invalid secp256k1 key: {e}")))?;
        let public_key: [u8; 33] = signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .try_into()
            .map_err(|_| BchError::InvalidPublicKey("invalid public key".into()))?;
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &[u8; 33] {
        &self.public_key
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key)
    }
}

impl Signer for P2pkhSigner {
    fn unlocking_script(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &SpentOutput,
    ) -> Result<Vec<u8>, BchError> {
        let digest = tx.sighash(input_index, spent)?;
        let sig: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|e| BchError::SigningError(format!("ECDSA signing failed: {e}")))?;
        let sig = sig.normalize_s().unwrap_or(sig);

        let mut sig_with_hashtype = sig.to_der().as_bytes().to_vec();
        sig_with_hashtype.push(SIGHASH_ALL_FORKID);

        // <sig_len> <sig+hashtype> <pubkey_len> <pubkey>
        let mut script_sig = Vec::with_capacity(sig_with_hashtype.len() + 35);
        script_sig.push(sig_with_hashtype.len() as u8);
        script_sig.extend_from_slice(&sig_with_hashtype);
        script_sig.push(33);
        script_sig.extend_from_slice(&self.public_key);
        Ok(script_sig)
    }
}

/// Sign every input of `tx`; `spent[i]` must describe the output input `i` spends.
pub fn sign_transaction(
    tx: &Transaction,
    spent: &[SpentOutput],
    signer: &dyn Signer,
) -> Result<Transaction, BchError> {
    if spent.len() != tx.inputs.len() {
        return Err(BchError::SigningError(format!(
            "{} inputs but {} spent outputs",
            tx.inputs.len(),
            spent.len()
        )));
    }
    let mut script_sigs = Vec::with_capacity(tx.inputs.len());
    for (index, prevout) in spent.iter().enumerate() {
        script_sigs.push(signer.unlocking_script(tx, index, prevout)?);
    }
    let mut signed = tx.clone();
    for (input, script_sig) in signed.inputs.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }
    Ok(signed)
}

/// Parse a hex txid string (big-endian display) to internal byte order (little-endian).
pub fn parse_txid(txid_hex: &str) -> Result<[u8; 32], BchError> {
    let bytes = hex::decode(txid_hex)
        .map_err(|e| BchError::TransactionBuildError(format!("invalid txid hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(BchError::TransactionBuildError(format!(
            "txid must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut result = [0u8; 32];
    for (i, &b) in bytes.iter().rev().enumerate() {
        result[i] = b;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cashtoken::NftCapability;
    use crate::script::op_return;
    use k256::ecdsa::{signature::hazmat::PrehashVerifier, VerifyingKey};

    fn privkey_one() -> [u8; 32] {
        let mut key = [0u8; 32];
        key[31] = 1;
        key
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: vec![
                TxInput {
                    prev_txid: parse_txid(&"a".repeat(64)).unwrap(),
                    prev_vout: 0,
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                },
                TxInput {
                    prev_txid: parse_txid(&"b".repeat(64)).unwrap(),
                    prev_vout: 7,
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                },
            ],
            outputs: vec![
                TxOutput {
                    satoshis: 0,
                    script: op_return(&[b"hello".to_vec()]),
                    token: None,
                },
                TxOutput {
                    satoshis: 1_000,
                    script: LockingBytecode::p2pkh(&[0x42; 20]),
                    token: Some(TokenDatum::nft(
                        "cd".repeat(32),
                        NftCapability::Minting,
                        vec![1, 2, 3],
                    )),
                },
                TxOutput {
                    satoshis: 50_000,
                    script: LockingBytecode::p2sh(&[0x17; 20]),
                    token: None,
                },
            ],
            lock_time: 0,
        }
    }

    fn spent_p2pkh(signer: &P2pkhSigner, satoshis: u64) -> SpentOutput {
        SpentOutput {
            satoshis,
            script: LockingBytecode::p2pkh(&signer.pubkey_hash()),
            token: None,
        }
    }

    #[test]
    fn wire_roundtrip_with_tokens() {
        let tx = sample_tx();
        let bytes = tx.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &TX_VERSION.to_le_bytes());
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn from_bytes_rejects_trailing_and_truncated() {
        let mut bytes = sample_tx().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            Transaction::from_bytes(&bytes),
            Err(BchError::MalformedTransaction(_))
        ));
        bytes.truncate(bytes.len() - 10);
        assert!(Transaction::from_bytes(&bytes).is_err());
    }

    #[test]
    fn txid_is_reversed_double_sha() {
        let tx = sample_tx();
        let mut expected = sha256d(&tx.to_bytes().unwrap());
        expected.reverse();
        assert_eq!(tx.txid().unwrap(), hex::encode(expected));
    }

    #[test]
    fn signer_pubkey_for_key_one() {
        let signer = P2pkhSigner::from_bytes(&privkey_one()).unwrap();
        assert_eq!(
            hex::encode(signer.public_key()),
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
    }

    #[test]
    fn invalid_key_rejected() {
        assert!(P2pkhSigner::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn signatures_verify_and_carry_forkid() {
        let signer = P2pkhSigner::from_bytes(&privkey_one()).unwrap();
        let tx = sample_tx();
        let spent = vec![spent_p2pkh(&signer, 30_000), spent_p2pkh(&signer, 30_000)];
        let signed = sign_transaction(&tx, &spent, &signer).unwrap();

        let vk = VerifyingKey::from_sec1_bytes(signer.public_key()).unwrap();
        for (index, input) in signed.inputs.iter().enumerate() {
            let script = &input.script_sig;
            let sig_len = script[0] as usize;
            assert_eq!(script[sig_len], SIGHASH_ALL_FORKID);
            assert_eq!(script[sig_len + 1], 33);
            assert_eq!(&script[sig_len + 2..], signer.public_key());

            let sig = Signature::from_der(&script[1..sig_len]).unwrap();
            let digest = tx.sighash(index, &spent[index]).unwrap();
            vk.verify_prehash(&digest, &sig).unwrap();
        }
        // Signing does not change the outputs or outpoints.
        let reparsed = Transaction::from_bytes(&signed.to_bytes().unwrap()).unwrap();
        assert_eq!(reparsed.outputs, tx.outputs);
        assert_eq!(reparsed.inputs[1].prev_vout, 7);
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = P2pkhSigner::from_bytes(&privkey_one()).unwrap();
        let tx = sample_tx();
        let spent = vec![spent_p2pkh(&signer, 1), spent_p2pkh(&signer, 2)];
        let a = sign_transaction(&tx, &spent, &signer).unwrap();
        let b = sign_transaction(&tx, &spent, &signer).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sighash_commits_to_spent_value_and_token() {
        let signer = P2pkhSigner::from_bytes(&privkey_one()).unwrap();
        let tx = sample_tx();
        let plain = spent_p2pkh(&signer, 1_000);
        let richer = spent_p2pkh(&signer, 1_001);
        let tokened = SpentOutput {
            token: Some(TokenDatum::fungible("ef".repeat(32), 5)),
            ..plain.clone()
        };
        let base = tx.sighash(0, &plain).unwrap();
        assert_ne!(base, tx.sighash(0, &richer).unwrap());
        assert_ne!(base, tx.sighash(0, &tokened).unwrap());
        assert_ne!(base, tx.sighash(1, &plain).unwrap());
    }

    #[test]
    fn sign_requires_matching_spent_outputs() {
        let signer = P2pkhSigner::from_bytes(&privkey_one()).unwrap();
        let spent = vec![spent_p2pkh(&signer, 1)];
        assert!(sign_transaction(&sample_tx(), &spent, &signer).is_err());
        assert!(sample_tx().sighash(5, &spent[0]).is_err());
    }

    #[test]
    fn parse_txid_reverses_bytes() {
        let hex = "0100000000000000000000000000000000000000000000000000000000000002";
        let result = parse_txid(hex).unwrap();
        assert_eq!(result[0], 0x02);
        assert_eq!(result[31], 0x01);
    }

    #[test]
    fn parse_txid_invalid() {
        assert!(parse_txid("not_hex").is_err());
        assert!(parse_txid("0102").is_err());
    }
}
