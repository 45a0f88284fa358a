//! Return-on-investment of a resolved ATH.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// `(ath - entry) / entry * 100`, floored at zero.
///
/// A token that only declined after the call reports 0 here while its real,
/// lower post-call high is still kept as the ATH price.
pub fn roi_percent(entry_price: Decimal, ath_price: Decimal) -> Decimal {
    if entry_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    (ath_price - entry_price)
        .checked_div(entry_price)
        .and_then(|ratio| ratio.checked_mul(dec!(100)))
        .map(|roi| roi.max(Decimal::ZERO))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roi_on_gain() {
        assert_eq!(roi_percent(dec!(0.001), dec!(0.0115)), dec!(1050.0));
        assert_eq!(roi_percent(dec!(2), dec!(3)), dec!(50));
    }

    #[test]
    fn test_roi_floors_at_zero() {
        assert_eq!(roi_percent(dec!(1), dec!(0.4)), Decimal::ZERO);
    }

    #[test]
    fn test_roi_flat() {
        assert_eq!(roi_percent(dec!(5), dec!(5)), Decimal::ZERO);
    }

    #[test]
    fn test_roi_with_non_positive_entry() {
        assert_eq!(roi_percent(Decimal::ZERO, dec!(1)), Decimal::ZERO);
        assert_eq!(roi_percent(dec!(-1), dec!(1)), Decimal::ZERO);
    }
}
