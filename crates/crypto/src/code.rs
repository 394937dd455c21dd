//! Numeric transfer-code generation.

use firma_types::CryptoError;
use rand::rngs::OsRng;
use rand::RngCore;

/// Longest code this generator will produce.
pub const MAX_CODE_DIGITS: usize = 32;

/// Largest byte value usable for an unbiased decimal digit: bytes in
/// `250..=255` would favor digits 0-5 under `% 10` and are resampled.
const REJECT_ABOVE: u8 = 249;

/// Generates an `n`-digit numeric code from the OS CSPRNG.
///
/// Digits are drawn with rejection sampling so the distribution is uniform;
/// a plain `byte % 10` would be biased toward the low digits.
pub fn generate_transfer_code(n: usize) -> Result<String, CryptoError> {
    if n == 0 || n > MAX_CODE_DIGITS {
        return Err(CryptoError::InvalidInput(format!(
            "code length must be 1..={MAX_CODE_DIGITS}, got {n}"
        )));
    }
    let mut code = String::with_capacity(n);
    let mut buf = [0u8; 16];
    while code.len() < n {
        OsRng.fill_bytes(&mut buf);
        for byte in buf {
            if byte > REJECT_ABOVE {
                continue;
            }
            code.push(char::from(b'0' + byte % 10));
            if code.len() == n {
                break;
            }
        }
    }
    Ok(code)
}
