//! Capacity estimation from disk-usage output.
//!
//! The measured size is doubled and kept in the unit the measuring tool printed. There is
//! no unit normalisation: `1G` becomes `2G`, `421M` becomes `842M`.

use imgcust_error::{ImageError, ImageResult};
use std::fmt;

/// Doubled used space, in the unit reported by `du`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityEstimate {
    pub value: u64,
    pub unit: char,
}

impl CapacityEstimate {
    /// Block size argument for `dd` so that `count=value` allocates the estimate.
    pub fn dd_block_size(&self) -> String {
        format!("1{}", self.unit)
    }
}

impl fmt::Display for CapacityEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

/// Parse `<number><unit>\t<path>` and return twice the number in the same unit.
///
/// The size field ends at the first tab. Its last character is the unit and must be a
/// letter; everything before it must be a whole number.
pub fn estimate(du_output: &str) -> ImageResult<CapacityEstimate> {
    let fail = |reason: &str| ImageError::CapacityEstimation {
        input: du_output.to_string(),
        reason: reason.to_string(),
    };

    let size = du_output
        .lines()
        .next()
        .and_then(|line| line.split('\t').next())
        .ok_or_else(|| fail("no size field"))?;

    let unit = size
        .chars()
        .last()
        .filter(|c| c.is_ascii_alphabetic())
        .ok_or_else(|| fail("size has no unit suffix"))?;
    let digits = &size[..size.len() - unit.len_utf8()];
    let value: u64 = digits
        .parse()
        .map_err(|_| fail("size is not a whole number"))?;
    let value = value
        .checked_mul(2)
        .ok_or_else(|| fail("size overflows"))?;

    Ok(CapacityEstimate { value, unit })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_megabytes() {
        let est = estimate("421M\t/build/ro-rootfs\n").unwrap();
        assert_eq!(est, CapacityEstimate { value: 842, unit: 'M' });
        assert_eq!(est.to_string(), "842M");
        assert_eq!(est.dd_block_size(), "1M");
    }

    #[test]
    fn keeps_unit_without_normalising() {
        let est = estimate("1G\t/build/ro-rootfs").unwrap();
        assert_eq!(est, CapacityEstimate { value: 2, unit: 'G' });
    }

    #[test]
    fn rejects_unparseable_output() {
        for input in ["", "\n", "abcM\t/x", "1.5G\t/x", "421\t/x", "M\t/x", "421M /x"] {
            let err = estimate(input).unwrap_err();
            assert!(
                matches!(err, ImageError::CapacityEstimation { .. }),
                "{input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn only_first_line_counts() {
        let est = estimate("10M\t/a\n999G\t/b\n").unwrap();
        assert_eq!(est.value, 20);
        assert_eq!(est.unit, 'M');
    }
}
