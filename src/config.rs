//! Build-time platform configuration.
//!
//! The thread table and the core-local records are statically sized, so their sizes come from the build environment rather than from the
//! runtime options string.

use static_assertions::const_assert;

/// Number of secure thread slots, from `TEE_NUM_THREADS` (default 4).
pub const NUM_THREADS: usize = parse_or(option_env!("TEE_NUM_THREADS"), 4);

/// Number of cores that may enter the secure world, from `TEE_NUM_CPUS` (default 4).
pub const NUM_CPUS: usize = parse_or(option_env!("TEE_NUM_CPUS"), 4);

const_assert!(NUM_THREADS > 0);
const_assert!(NUM_CPUS > 0);

// Thread ids travel in a 32-bit call argument word and two values are reserved for the pseudo stack ids.
const_assert!(NUM_THREADS < (u32::MAX - 1) as usize);

const fn parse_or(val: Option<&str>, default: usize) -> usize {
    let bytes = match val {
        Some(val) => val.as_bytes(),
        None => return default
    };

    if bytes.is_empty() {
        panic!("empty numeric configuration value");
    }

    let mut n = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if !b.is_ascii_digit() {
            panic!("numeric configuration value contains a non-digit");
        }

        n = n * 10 + (b - b'0') as usize;
        i += 1;
    }

    n
}

#[cfg(test)]
mod test {
    use super::parse_or;

    #[test]
    fn test_parse_default() {
        assert_eq!(7, parse_or(None, 7));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(16, parse_or(Some("16"), 4));
        assert_eq!(0, parse_or(Some("0"), 4));
    }

    #[test]
    #[should_panic]
    fn test_parse_garbage() {
        parse_or(Some("4x"), 4);
    }
}
