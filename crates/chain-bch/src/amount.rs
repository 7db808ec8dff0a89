use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BchError;

/// Satoshis in one BCH.
pub const SATS_PER_BCH: u64 = 100_000_000;

/// Largest amount that can exist on chain (21M BCH).
pub const MAX_MONEY: u64 = 21_000_000 * SATS_PER_BCH;

/// Denomination of a user-supplied amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Bch,
    Sat,
    Usd,
}

impl FromStr for Unit {
    type Err = BchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bch" => Ok(Unit::Bch),
            "sat" | "sats" | "satoshi" | "satoshis" => Ok(Unit::Sat),
            "usd" => Ok(Unit::Usd),
            other => Err(BchError::InvalidAmount(format!("unknown unit {other}"))),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Bch => write!(f, "bch"),
            Unit::Sat => write!(f, "sat"),
            Unit::Usd => write!(f, "usd"),
        }
    }
}

/// A value in some [`Unit`], resolved to satoshis before it reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub value: f64,
    pub unit: Unit,
}

impl Amount {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn sat(value: u64) -> Self {
        Self::new(value as f64, Unit::Sat)
    }

    pub fn bch(value: f64) -> Self {
        Self::new(value, Unit::Bch)
    }

    pub fn usd(value: f64) -> Self {
        Self::new(value, Unit::Usd)
    }

    /// Convert to satoshis. `usd_rate` is the price of one BCH in USD and is
    /// only consulted for [`Unit::Usd`].
    pub fn to_satoshis(&self, usd_rate: Option<f64>) -> Result<u64, BchError> {
        if !self.value.is_finite() || self.value < 0.0 {
            return Err(BchError::InvalidAmount(format!(
                "{} {} is not a spendable amount",
                self.value, self.unit
            )));
        }

        let sats = match self.unit {
            Unit::Bch => (self.value * SATS_PER_BCH as f64).round(),
            Unit::Sat => {
                if self.value.fract() != 0.0 {
                    return Err(BchError::InvalidAmount(format!(
                        "cannot send {} satoshis, fractional satoshis do not exist",
                        self.value
                    )));
                }
                self.value
            }
            Unit::Usd => {
                let rate = usable_rate(usd_rate)?;
                (self.value * SATS_PER_BCH as f64 / rate).round()
            }
        };

        if sats > MAX_MONEY as f64 {
            return Err(BchError::InvalidAmount(format!(
                "{sats} satoshis exceeds the money supply"
            )));
        }
        Ok(sats as u64)
    }
}

/// Express `sats` in `unit`.
pub fn satoshis_to_unit(sats: u64, unit: Unit, usd_rate: Option<f64>) -> Result<f64, BchError> {
    match unit {
        Unit::Sat => Ok(sats as f64),
        Unit::Bch => Ok(sats as f64 / SATS_PER_BCH as f64),
        Unit::Usd => Ok(sats as f64 * usable_rate(usd_rate)? / SATS_PER_BCH as f64),
    }
}

fn usable_rate(rate: Option<f64>) -> Result<f64, BchError> {
    match rate {
        Some(r) if r.is_finite() && r > 0.0 => Ok(r),
        Some(r) => Err(BchError::InvalidAmount(format!("unusable exchange rate {r}"))),
        None => Err(BchError::InvalidAmount(
            "usd amount requires an exchange rate".into(),
        )),
    }
}

/// An exact decimal token quantity in display units (e.g. `"12.5"`).
///
/// Stored as `mantissa / 10^scale` so scaling by token decimals never goes
/// through floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenAmount {
    mantissa: u128,
    scale: u32,
}

impl TokenAmount {
    /// Wrap a raw base-unit amount of a token with `decimals` places.
    pub fn from_raw(raw: u64, decimals: u8) -> Self {
        Self {
            mantissa: raw as u128,
            scale: decimals as u32,
        }
        .normalized()
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Scale to the token's raw base units: `display * 10^decimals`.
    pub fn to_raw(&self, decimals: u8) -> Result<u64, BchError> {
        let decimals = decimals as u32;
        if self.scale > decimals {
            return Err(BchError::InvalidAmount(format!(
                "{self} has more than {decimals} decimal places"
            )));
        }
        let raw = 10u128
            .checked_pow(decimals - self.scale)
            .and_then(|factor| self.mantissa.checked_mul(factor))
            .filter(|raw| *raw <= u64::MAX as u128)
            .ok_or_else(|| {
                BchError::InvalidAmount(format!(
                    "{self} with {decimals} decimals does not fit in 64 bits"
                ))
            })?;
        Ok(raw as u64)
    }

    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        self
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self {
            mantissa: value as u128,
            scale: 0,
        }
    }
}

impl FromStr for TokenAmount {
    type Err = BchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BchError::InvalidAmount(format!("invalid token amount {s:?}"));
        let (int_part, frac_part) = match s.trim().split_once('.') {
            Some((i, f)) => (i, f),
            None => (s.trim(), ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let mut mantissa: u128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let digit = c.to_digit(10).ok_or_else(invalid)?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(digit as u128))
                .ok_or_else(invalid)?;
        }
        Ok(Self {
            mantissa,
            scale: frac_part.len() as u32,
        }
        .normalized())
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let digits = format!("{:0>width$}", self.mantissa, width = self.scale as usize + 1);
        let (int_part, frac_part) = digits.split_at(digits.len() - self.scale as usize);
        write!(f, "{int_part}.{frac_part}")
    }
}
