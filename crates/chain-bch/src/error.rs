use thiserror::Error;

/// Bitcoin Cash engine errors.
#[derive(Debug, Error)]
pub enum BchError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid document hash: {0}")]
    InvalidDocumentHash(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many outputs: {count} quantities requested, at most {max} allowed")]
    TooManyOutputs { count: usize, max: usize },

    #[error("ambiguous token: {0}")]
    AmbiguousToken(String),

    #[error("insufficient funds: need {required} satoshi, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("insufficient tokens of {category}: need {required}, have {available}")]
    InsufficientTokens {
        category: String,
        required: u64,
        available: u64,
    },

    #[error("output of {satoshis} satoshi is below the dust threshold of {threshold}")]
    DustOutputRequested { satoshis: u64, threshold: u64 },

    #[error("utxo {0} not found among spendable outputs")]
    UtxoNotFound(String),

    #[error("utxo {0} carries tokens and cannot fund a plain send")]
    TokenInputRejected(String),

    #[error("coinbase utxo {0} is not mature")]
    ImmatureCoinbase(String),

    #[error("transaction build error: {0}")]
    TransactionBuildError(String),

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("signing error: {0}")]
    SigningError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_private_key() {
        let err = BchError::InvalidPrivateKey("key too short".into());
        assert_eq!(err.to_string(), "invalid private key: key too short");
    }

    #[test]
    fn display_insufficient_funds() {
        let err = BchError::InsufficientFunds {
            required: 100_000,
            available: 50_000,
        };
        assert!(err.to_string().contains("100000"));
        assert!(err.to_string().contains("50000"));
    }

    #[test]
    fn display_too_many_outputs() {
        let err = BchError::TooManyOutputs { count: 20, max: 19 };
        assert_eq!(
            err.to_string(),
            "too many outputs: 20 quantities requested, at most 19 allowed"
        );
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: Box<dyn std::error::Error> =
            Box::new(BchError::InvalidAddress("bad".into()));
        assert!(err.to_string().contains("bad"));
    }
}
