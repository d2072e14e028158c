//! Self-verifying user ids.
//!
//! A user id is a positive decimal number whose last digit is a Luhn check
//! digit. Clients mint their own id from a device fingerprint, so there is no
//! identity provider to ask. The check digit catches any single corrupted
//! digit. It does not make ids unique: registration compares fingerprints to
//! deal with collisions.

/// Largest payload [`id_from_fingerprint`] produces (15 digits).
const MAX_PAYLOAD: u64 = 999_999_999_999_999;

/// Luhn digit sum of `n`, doubling the rightmost digit when `double_first`.
fn luhn_sum(mut n: u64, double_first: bool) -> u64 {
    let mut sum = 0;
    let mut double = double_first;
    while n > 0 {
        let mut digit = n % 10;
        if double {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
        double = !double;
        n /= 10;
    }
    sum
}

/// The digit that, appended to `payload`, makes the Luhn sum divisible by 10.
pub fn derive_check_digit(payload: u64) -> u8 {
    // Once appended, the payload's rightmost digit sits in an even position.
    ((10 - luhn_sum(payload, true) % 10) % 10) as u8
}

pub fn is_valid(id: i64) -> bool {
    id > 0 && luhn_sum(id as u64, false) % 10 == 0
}

/// `payload` followed by its check digit, or `None` if that overflows an id.
pub fn append_check_digit(payload: u64) -> Option<i64> {
    let id = payload
        .checked_mul(10)?
        .checked_add(u64::from(derive_check_digit(payload)))?;
    i64::try_from(id).ok()
}

/// Folds a fingerprint (ip, hardware address...) into a valid id.
pub fn id_from_fingerprint(fingerprint: &str) -> i64 {
    // FNV-1a
    let hash = fingerprint
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |acc, byte| {
            (acc ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        });
    let payload = hash % MAX_PAYLOAD + 1;

    (payload * 10 + u64::from(derive_check_digit(payload))) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_luhn_number() {
        assert!(is_valid(79_927_398_713));
        assert!(!is_valid(79_927_398_710));
        assert_eq!(derive_check_digit(7_992_739_871), 3);
    }

    #[test]
    fn test_non_positive_ids_are_invalid() {
        assert!(!is_valid(0));
        assert!(!is_valid(-18));
    }

    #[test]
    fn test_derived_ids_are_valid() {
        for payload in [1_u64, 7, 42, 1234, 99_999, 5_000_000_001, MAX_PAYLOAD] {
            let id = append_check_digit(payload).unwrap();
            assert!(is_valid(id), "{id} should be valid");
            assert_eq!(id / 10, payload as i64);
        }
    }

    #[test]
    fn test_single_digit_corruption_is_detected() {
        let id = append_check_digit(3_141_592_653).unwrap();
        let digits: Vec<u8> = id.to_string().bytes().map(|b| b - b'0').collect();

        for position in 0..digits.len() {
            for replacement in 0..10 {
                if replacement == digits[position] {
                    continue;
                }
                let mut corrupted = digits.clone();
                corrupted[position] = replacement;
                let corrupted: i64 = corrupted
                    .iter()
                    .fold(0, |acc, d| acc * 10 + i64::from(*d));
                assert!(!is_valid(corrupted), "{corrupted} should be invalid");
            }
        }
    }

    #[test]
    fn test_append_overflow() {
        assert_eq!(append_check_digit(u64::MAX), None);
        assert_eq!(append_check_digit(i64::MAX as u64), None);
    }

    #[test]
    fn test_fingerprint_ids() {
        let a = id_from_fingerprint("192.168.1.20");
        let b = id_from_fingerprint("192.168.1.21");

        assert!(is_valid(a));
        assert!(is_valid(b));
        assert_ne!(a, b);
        assert_eq!(a, id_from_fingerprint("192.168.1.20"));
        assert!(is_valid(id_from_fingerprint("")));
    }
}
