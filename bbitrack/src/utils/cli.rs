//! Implementations of the `bbitrack` subcommands.

pub mod bbiinfo;
pub mod bbiintervals;
pub mod bigwigstats;

/// Formats `num` with a comma between each group of three digits.
pub(crate) fn num_with_commas(num: u64) -> String {
    let digits = num.to_string();
    let mut formatted = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            formatted.push(',');
        }
        formatted.push(c);
    }
    formatted
}

#[test]
fn test_num_with_commas() {
    assert_eq!("0", num_with_commas(0));
    assert_eq!("987", num_with_commas(987));
    assert_eq!("1,000", num_with_commas(1000));
    assert_eq!("12,987", num_with_commas(12987));
    assert_eq!("123,987", num_with_commas(123987));
    assert_eq!("4,023,987", num_with_commas(4023987));
    assert_eq!("9,456,000,987", num_with_commas(9456000987));
}
