//! Exact fixed-point valuation of raw token amounts.
//!
//! Prices are integers scaled by [`PRICE_PRECISION`]. Stored USD and BTC
//! figures are integers scaled by [`VALUATION_SCALE`]. Every conversion
//! multiplies first and performs a single truncating division at the end,
//! so folding the same cumulative amount always yields the same figure no
//! matter how many incremental passes produced it.

use alloy::primitives::U256;
use rust_decimal::Decimal;

/// Scale of every price figure (`1 USD == 100_000_000`).
pub const PRICE_PRECISION: u64 = 100_000_000;

/// Scale of stored USD/BTC valuations (`1 USD == 10_000`).
pub const VALUATION_SCALE: u64 = 10_000;

const VALUATION_SCALE_DIGITS: u32 = 4;

/// Highest decimal precision a token may declare.
pub const MAX_DECIMALS: u8 = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValuationError {
    #[error("overflow valuing {amount} at {decimals} decimals")]
    Overflow { amount: U256, decimals: u8 },
    #[error("precision of {0} decimals exceeds the supported maximum")]
    PrecisionTooLarge(u8),
    #[error("reference price is zero")]
    ZeroReferencePrice,
}

/// USD and BTC valuation of one cumulative amount, both scaled by
/// [`VALUATION_SCALE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Valuation {
    pub usd: U256,
    pub btc: U256,
}

/// `10^decimals` as a `U256`.
pub(crate) fn ten_pow(decimals: u8) -> Result<U256, ValuationError> {
    if decimals > MAX_DECIMALS {
        return Err(ValuationError::PrecisionTooLarge(decimals));
    }

    Ok(U256::from(10u8).pow(U256::from(decimals)))
}

/// `amount * price * VALUATION_SCALE / (10^decimals * PRICE_PRECISION)`.
pub fn usd_scaled(amount: U256, decimals: u8, price: u64) -> Result<U256, ValuationError> {
    scaled_ratio(amount, decimals, price, PRICE_PRECISION)
}

/// Value `amount` in units of the BTC reference asset. Both prices share
/// the same scale so it cancels out.
pub fn btc_scaled(
    amount: U256,
    decimals: u8,
    price: u64,
    btc_price: u64,
) -> Result<U256, ValuationError> {
    if btc_price == 0 {
        return Err(ValuationError::ZeroReferencePrice);
    }

    scaled_ratio(amount, decimals, price, btc_price)
}

/// Values a cumulative amount. `btc_price` of `None` leaves the BTC
/// figure at zero.
pub fn valuate(
    amount: U256,
    decimals: u8,
    price: u64,
    btc_price: Option<u64>,
) -> Result<Valuation, ValuationError> {
    let usd = usd_scaled(amount, decimals, price)?;

    let btc = match btc_price {
        Some(btc_price) => btc_scaled(amount, decimals, price, btc_price)?,
        None => U256::ZERO,
    };

    Ok(Valuation { usd, btc })
}

/// Converts an amount between two decimal precisions, truncating when
/// precision is lost.
pub fn rescale(amount: U256, from_decimals: u8, to_decimals: u8) -> Result<U256, ValuationError> {
    if from_decimals == to_decimals {
        return Ok(amount);
    }

    if to_decimals > from_decimals {
        let factor = ten_pow(to_decimals - from_decimals)?;
        return amount
            .checked_mul(factor)
            .ok_or(ValuationError::Overflow {
                amount,
                decimals: from_decimals,
            });
    }

    Ok(amount / ten_pow(from_decimals - to_decimals)?)
}

/// Human-facing USD value (with four fractional digits). Values too large
/// for `Decimal` saturate at `Decimal::MAX`.
pub fn usd_decimal(amount: U256, decimals: u8, price: u64) -> Result<Decimal, ValuationError> {
    let scaled = usd_scaled(amount, decimals, price)?;

    let value = i128::try_from(scaled)
        .ok()
        .and_then(|mantissa| Decimal::try_from_i128_with_scale(mantissa, VALUATION_SCALE_DIGITS).ok())
        .unwrap_or(Decimal::MAX);

    Ok(value)
}

fn scaled_ratio(
    amount: U256,
    decimals: u8,
    price: u64,
    denominator_price: u64,
) -> Result<U256, ValuationError> {
    let overflow = || ValuationError::Overflow { amount, decimals };

    let numerator = amount
        .checked_mul(U256::from(price))
        .and_then(|value| value.checked_mul(U256::from(VALUATION_SCALE)))
        .ok_or_else(overflow)?;

    let denominator = ten_pow(decimals)?
        .checked_mul(U256::from(denominator_price))
        .ok_or_else(overflow)?;

    Ok(numerator / denominator)
}
