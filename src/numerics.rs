//! Fixed-point numerics shared by every component.
//!
//! Prices are integer tick multiples and quantities integer multiples of the
//! smallest quote unit; `rust_decimal` appears only at the ingress/egress
//! boundary. Every financial ratio in the engine flows through
//! [`safe_divide`] so results are deterministic across platforms and a zero
//! denominator can never poison an accumulator.

use crate::error::ParseError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// Denominators with magnitude below this are treated as zero.
pub const EPSILON: f64 = 1e-9;

/// `a / b` when the denominator is usable, `default` otherwise.
///
/// Never returns NaN or infinity: a non-finite quotient also folds to
/// `default`.
#[inline]
pub fn safe_divide(a: f64, b: f64, default: f64) -> f64 {
    if b.abs() < EPSILON {
        return default;
    }
    let q = a / b;
    if q.is_finite() {
        q
    } else {
        default
    }
}

/// Checked addition, saturating on overflow with a warning.
#[inline]
pub fn safe_add(a: i64, b: i64) -> i64 {
    a.checked_add(b).unwrap_or_else(|| {
        warn!(a, b, "fixed-point addition overflow, saturating");
        if (a > 0) == (b > 0) && a > 0 {
            i64::MAX
        } else {
            i64::MIN
        }
    })
}

/// Checked subtraction, saturating on overflow with a warning.
#[inline]
pub fn safe_sub(a: i64, b: i64) -> i64 {
    a.checked_sub(b).unwrap_or_else(|| {
        warn!(a, b, "fixed-point subtraction overflow, saturating");
        if a >= 0 {
            i64::MAX
        } else {
            i64::MIN
        }
    })
}

/// Checked multiplication, saturating on overflow with a warning.
#[inline]
pub fn safe_mul(a: i64, b: i64) -> i64 {
    a.checked_mul(b).unwrap_or_else(|| {
        warn!(a, b, "fixed-point multiplication overflow, saturating");
        if (a > 0) == (b > 0) {
            i64::MAX
        } else {
            i64::MIN
        }
    })
}

/// Rejects NaN and infinities before they reach an accumulator.
#[inline]
pub fn is_valid(x: f64) -> bool {
    x.is_finite()
}

/// Euclidean-floor division: the zone bucket of a tick price.
///
/// Floors toward negative infinity so that prices straddling zero (never
/// expected, but possible on a parse bug) still bucket consistently.
#[inline]
pub fn calculate_zone(price_ticks: i64, zone_ticks: i64) -> i64 {
    debug_assert!(zone_ticks > 0);
    price_ticks.div_euclid(zone_ticks)
}

/// Arithmetic mean, `0.0` on an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median over a copy of the slice, `0.0` when empty.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Nearest-rank percentile, `p` in `[0, 100]`. `0.0` when empty.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p = p.clamp(0.0, 100.0);
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Two-pass population standard deviation for accuracy on long streams.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Decimal <-> fixed-point conversion for one symbol.
///
/// Carries the tick size and precision budget; all ingress strings pass
/// through here exactly once, and egress formatting round-trips modulo
/// trailing-zero normalization.
#[derive(Debug, Clone)]
pub struct SymbolScale {
    tick_size: Decimal,
    price_precision: u32,
    quantity_precision: u32,
    qty_unit: Decimal,
}

impl SymbolScale {
    pub fn new(tick_size: Decimal, price_precision: u32, quantity_precision: u32) -> Self {
        let qty_unit = Decimal::new(1, quantity_precision);
        Self {
            tick_size,
            price_precision,
            quantity_precision,
            qty_unit,
        }
    }

    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    pub fn price_precision(&self) -> u32 {
        self.price_precision
    }

    pub fn quantity_precision(&self) -> u32 {
        self.quantity_precision
    }

    /// Parse a decimal price string into tick multiples.
    pub fn parse_price(&self, s: &str) -> Result<i64, ParseError> {
        let price =
            Decimal::from_str(s.trim()).map_err(|_| ParseError::InvalidPrice(s.to_string()))?;
        self.price_to_ticks(price)
    }

    /// Convert an already-parsed price into tick multiples.
    pub fn price_to_ticks(&self, price: Decimal) -> Result<i64, ParseError> {
        if price <= Decimal::ZERO {
            return Err(ParseError::NonPositivePrice(price.to_string()));
        }
        if price.normalize().scale() > self.price_precision {
            return Err(ParseError::PrecisionExceeded {
                value: price.to_string(),
                precision: self.price_precision,
            });
        }
        let ratio = price / self.tick_size;
        let ticks = ratio.round();
        if ratio != ticks {
            return Err(ParseError::TickMisaligned {
                price: price.to_string(),
                tick_size: self.tick_size.to_string(),
            });
        }
        ticks
            .to_i64()
            .ok_or_else(|| ParseError::Overflow(price.to_string()))
    }

    /// Parse a decimal quantity string into smallest-unit multiples.
    pub fn parse_qty(&self, s: &str) -> Result<i64, ParseError> {
        let qty =
            Decimal::from_str(s.trim()).map_err(|_| ParseError::InvalidQuantity(s.to_string()))?;
        self.qty_to_units(qty)
    }

    /// Convert an already-parsed quantity into smallest-unit multiples.
    pub fn qty_to_units(&self, qty: Decimal) -> Result<i64, ParseError> {
        if qty < Decimal::ZERO {
            return Err(ParseError::NegativeQuantity(qty.to_string()));
        }
        if qty.normalize().scale() > self.quantity_precision {
            return Err(ParseError::PrecisionExceeded {
                value: qty.to_string(),
                precision: self.quantity_precision,
            });
        }
        (qty / self.qty_unit)
            .round()
            .to_i64()
            .ok_or_else(|| ParseError::Overflow(qty.to_string()))
    }

    /// Tick multiples back to a normalized decimal price.
    pub fn ticks_to_price(&self, ticks: i64) -> Decimal {
        (Decimal::from(ticks) * self.tick_size).normalize()
    }

    /// Smallest-unit multiples back to a normalized decimal quantity.
    pub fn units_to_qty(&self, units: i64) -> Decimal {
        (Decimal::from(units) * self.qty_unit).normalize()
    }

    /// Tick price as f64 for ratio math. Precision loss is acceptable here:
    /// ratios are bounded and clamped downstream.
    pub fn ticks_to_f64(&self, ticks: i64) -> f64 {
        self.ticks_to_price(ticks).to_f64().unwrap_or(0.0)
    }

    /// Unit quantity as f64 for ratio math.
    pub fn units_to_f64(&self, units: i64) -> f64 {
        self.units_to_qty(units).to_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale() -> SymbolScale {
        SymbolScale::new(Decimal::new(1, 2), 2, 8)
    }

    #[test]
    fn test_safe_divide_zero_denominator() {
        assert_eq!(safe_divide(10.0, 0.0, -1.0), -1.0);
        assert_eq!(safe_divide(10.0, 1e-12, 0.5), 0.5);
        assert_eq!(safe_divide(10.0, 2.0, 0.0), 5.0);
    }

    #[test]
    fn test_safe_divide_never_nan() {
        let q = safe_divide(f64::MAX, 1e-8, 0.0);
        assert!(q.is_finite());
        assert_eq!(safe_divide(0.0, 0.0, 0.25), 0.25);
    }

    #[test]
    fn test_safe_arithmetic_saturates() {
        assert_eq!(safe_add(i64::MAX, 1), i64::MAX);
        assert_eq!(safe_sub(i64::MIN, 1), i64::MIN);
        assert_eq!(safe_mul(i64::MAX, 2), i64::MAX);
        assert_eq!(safe_mul(i64::MAX, -2), i64::MIN);
        assert_eq!(safe_add(2, 3), 5);
    }

    #[test]
    fn test_calculate_zone_floor_division() {
        assert_eq!(calculate_zone(8905, 10), 890);
        assert_eq!(calculate_zone(8900, 10), 890);
        assert_eq!(calculate_zone(8899, 10), 889);
        // Euclidean floor for negative inputs
        assert_eq!(calculate_zone(-5, 10), -1);
    }

    #[test]
    fn test_median_even_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), 3.0);
        assert_eq!(percentile(&v, 100.0), 5.0);
        assert_eq!(percentile(&v, 0.0), 1.0);
    }

    #[test]
    fn test_std_dev_two_pass() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&v) - 2.0).abs() < 1e-12);
        assert_eq!(std_dev(&[1.0]), 0.0);
    }

    #[test]
    fn test_parse_price_to_ticks() {
        let s = scale();
        assert_eq!(s.parse_price("89.05").unwrap(), 8905);
        assert_eq!(s.parse_price("89.00").unwrap(), 8900);
        assert!(matches!(
            s.parse_price("abc"),
            Err(ParseError::InvalidPrice(_))
        ));
        assert!(matches!(
            s.parse_price("-1.00"),
            Err(ParseError::NonPositivePrice(_))
        ));
        assert!(matches!(
            s.parse_price("89.005"),
            Err(ParseError::PrecisionExceeded { .. })
        ));
    }

    #[test]
    fn test_parse_qty_to_units() {
        let s = scale();
        assert_eq!(s.parse_qty("1.25000000").unwrap(), 125_000_000);
        assert_eq!(s.parse_qty("0").unwrap(), 0);
        assert!(matches!(
            s.parse_qty("-0.5"),
            Err(ParseError::NegativeQuantity(_))
        ));
    }

    /// Scenario: parse a price and quantity string to fixed-point and format back.
    /// Expected: the round trip yields the original strings modulo trailing zeros.
    #[test]
    fn test_round_trip_modulo_trailing_zeros() {
        let s = scale();
        for (input, expect) in [("89.05", "89.05"), ("89.50", "89.5"), ("100.00", "100")] {
            let ticks = s.parse_price(input).unwrap();
            assert_eq!(s.ticks_to_price(ticks).to_string(), expect);
        }
        let units = s.parse_qty("1.25000000").unwrap();
        assert_eq!(s.units_to_qty(units).to_string(), "1.25");
    }

    #[test]
    fn test_is_valid_rejects_non_finite() {
        assert!(is_valid(1.5));
        assert!(!is_valid(f64::NAN));
        assert!(!is_valid(f64::INFINITY));
        assert!(!is_valid(f64::NEG_INFINITY));
    }
}
