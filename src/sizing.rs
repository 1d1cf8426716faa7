use rust_decimal::Decimal;

use crate::error::EntryError;
use crate::types::InstrumentRules;

/// Round `value` down to a multiple of `step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Round `value` to the nearest multiple of `step`.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).round() * step).normalize()
}

/// Quantity for a fixed USD notional at `price`, conformed down to the venue's
/// quantity step. Fails if the result is below the venue minimum.
pub fn size_for_notional(
    notional_usd: Decimal,
    price: Decimal,
    rules: &InstrumentRules,
) -> Result<Decimal, EntryError> {
    if price <= Decimal::ZERO {
        return Err(EntryError::NoReferencePrice);
    }
    let qty = floor_to_step(notional_usd / price, rules.qty_step);
    if qty < rules.min_qty || qty.is_zero() {
        return Err(EntryError::BelowMinimum {
            qty,
            min_qty: rules.min_qty,
        });
    }
    Ok(qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules(step: Decimal, min: Decimal) -> InstrumentRules {
        InstrumentRules {
            tick_size: dec!(0.01),
            qty_step: step,
            min_qty: min,
        }
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(1.2345), dec!(0.01)), dec!(1.23));
        assert_eq!(floor_to_step(dec!(17), dec!(5)), dec!(15));
        assert_eq!(floor_to_step(dec!(3.3), dec!(0)), dec!(3.3));
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(0.12346), dec!(0.0001)), dec!(0.1235));
    }

    #[test]
    fn test_size_for_notional_conforms_down() {
        // 100 / 30000 = 0.00333.. -> 0.003
        let qty = size_for_notional(dec!(100), dec!(30000), &rules(dec!(0.001), dec!(0.001))).unwrap();
        assert_eq!(qty, dec!(0.003));
    }

    #[test]
    fn test_size_below_minimum_is_rejected() {
        let err = size_for_notional(dec!(100), dec!(30000), &rules(dec!(0.001), dec!(0.01)))
            .unwrap_err();
        assert!(matches!(err, EntryError::BelowMinimum { .. }));
    }

    #[test]
    fn test_size_rounding_to_zero_is_rejected() {
        let err = size_for_notional(dec!(5), dec!(30000), &rules(dec!(0.001), dec!(0)))
            .unwrap_err();
        assert!(matches!(err, EntryError::BelowMinimum { .. }));
    }
}
