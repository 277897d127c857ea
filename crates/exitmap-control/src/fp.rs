//! Relay fingerprints, as they appear in control-port commands and
//! events.

use crate::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// A relay's identity: the 20-byte SHA-1 digest of its signing key.
///
/// Shown and parsed as 40 hex digits.  Control-port commands accept the
/// digest with a leading `$`, which [`Fingerprint::from_str`] tolerates.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Construct a fingerprint from its raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Fingerprint(bytes)
    }

    /// Return the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Return the first eight hex digits, the customary short form for
    /// log messages.
    pub fn short(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('$').unwrap_or(s);
        if digits.len() != 40 {
            return Err(Error::BadFingerprint(s.to_owned()));
        }
        let mut bytes = [0_u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| Error::BadFingerprint(s.to_owned()))?;
        Ok(Fingerprint(bytes))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const FP: &str = "ABCDEF0123456789ABCDEF0123456789ABCDEF12";

    #[test]
    fn roundtrip() {
        let fp: Fingerprint = FP.parse().unwrap();
        assert_eq!(fp.to_string(), FP);
        assert_eq!(fp.short(), "ABCDEF01");
    }

    #[test]
    fn dollar_prefix_and_case() {
        let a: Fingerprint = format!("${}", FP).parse().unwrap();
        let b: Fingerprint = FP.to_lowercase().parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_junk() {
        assert!("".parse::<Fingerprint>().is_err());
        assert!("ABCD".parse::<Fingerprint>().is_err());
        assert!("G".repeat(40).parse::<Fingerprint>().is_err());
    }
}
