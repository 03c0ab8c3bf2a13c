//! Conversion of policy rates and weights into hardware coefficients.

use ceetm_qman::{TokenRate, WeightCode};
use thiserror::Error;

/// Largest WBFS weight an operator may request.
pub const MAX_WBFS_WEIGHT: u32 = 248;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateError {
    #[error("rate {rate_bps} bps exceeds the {max_bps} bps the shaper can represent")]
    OutOfRange { rate_bps: u64, max_bps: u64 },

    #[error("WBFS weight {weight} outside 1..={max}")]
    WeightOutOfRange { weight: u32, max: u32 },
}

/// Maps bits-per-second rates onto the shaper's 11.13 fixed-point token rate.
///
/// The shaper credits `whole + fraction / 8192` bytes per update tick, so a
/// rate is converted as `rate_bps / 8 / ticks_per_sec` with the remainder
/// truncated into the fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConverter {
    ticks_per_sec: u64,
}

impl Default for RateConverter {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl RateConverter {
    pub fn new(ticks_per_sec: u64) -> Self {
        Self {
            ticks_per_sec: ticks_per_sec.max(1),
        }
    }

    pub fn ticks_per_sec(&self) -> u64 {
        self.ticks_per_sec
    }

    /// Highest rate that still fits in the token-rate registers.
    pub fn max_rate_bps(&self) -> u64 {
        let max_scaled = u128::from(TokenRate {
            whole: TokenRate::MAX_WHOLE,
            fraction: TokenRate::MAX_FRACTION,
        }
        .as_scaled());
        let bps = (max_scaled * 8 * u128::from(self.ticks_per_sec)) >> TokenRate::FRACTION_BITS;
        u64::try_from(bps).unwrap_or(u64::MAX)
    }

    pub fn to_token_rate(&self, rate_bps: u64) -> Result<TokenRate, RateError> {
        let scaled = (u128::from(rate_bps) << TokenRate::FRACTION_BITS)
            / (8 * u128::from(self.ticks_per_sec));
        let whole = scaled >> TokenRate::FRACTION_BITS;
        if whole > u128::from(TokenRate::MAX_WHOLE) {
            return Err(RateError::OutOfRange {
                rate_bps,
                max_bps: self.max_rate_bps(),
            });
        }
        Ok(TokenRate {
            whole: whole as u16,
            fraction: (scaled & u128::from(TokenRate::MAX_FRACTION)) as u16,
        })
    }

    /// Rate represented by a token rate, rounded down.
    pub fn to_rate_bps(&self, rate: TokenRate) -> u64 {
        let bps = (u128::from(rate.as_scaled()) * 8 * u128::from(self.ticks_per_sec))
            >> TokenRate::FRACTION_BITS;
        u64::try_from(bps).unwrap_or(u64::MAX)
    }

    /// Token-bucket depth for a shaper: one full frame plus the fractional credit.
    pub fn token_limit(mtu: u16, fraction: u16) -> u16 {
        mtu.saturating_add(fraction)
    }

    /// Encodes a WBFS weight as the nearest log-scale code.
    pub fn to_weight_code(weight: u32) -> Result<WeightCode, RateError> {
        if weight == 0 || weight > MAX_WBFS_WEIGHT {
            return Err(RateError::WeightOutOfRange {
                weight,
                max: MAX_WBFS_WEIGHT,
            });
        }
        let mut y = 31 - weight.leading_zeros();
        // mantissa in sixteenths, rounded to the nearest eighth
        let mut x = (((weight << 4) >> y) + 1) / 2 - 8;
        if x == 8 {
            y += 1;
            x = 0;
        }
        if y > u32::from(WeightCode::MAX_Y) {
            return Ok(WeightCode {
                y: WeightCode::MAX_Y,
                x: WeightCode::MAX_X,
            });
        }
        Ok(WeightCode {
            y: y as u8,
            x: x as u8,
        })
    }
}
