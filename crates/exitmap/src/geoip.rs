//! Minimal GeoIP lookups over C Tor's `geoip` database format.
//!
//! The database is a CSV of inclusive IPv4 ranges:
//!
//! ```text
//! 16777216,16777471,AU
//! ```
//!
//! The scanner only needs enough of this to honor the `-C` country
//! filter, so there is no ASN handling and no IPv6 table.

use crate::err::{Error, Result};
use rangemap::RangeInclusiveMap;
use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

/// A two-letter country code: a purported ISO 3166-1 alpha-2 value.
///
/// We do not check that it names a real country, only that it is two
/// printable ASCII characters; the sentinel `??` ("unknown") is
/// rejected.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CountryCode {
    /// The code, stored uppercase.
    inner: [u8; 2],
}

impl FromStr for CountryCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let up = s.to_ascii_uppercase();
        let inner: [u8; 2] = up
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Config(format!("bad country code {:?}", s)))?;
        if !inner.iter().all(|b| b.is_ascii_graphic()) || &inner == b"??" {
            return Err(Error::Config(format!("bad country code {:?}", s)));
        }
        Ok(CountryCode { inner })
    }
}

impl Display for CountryCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Always two printable ASCII bytes, by construction.
        write!(f, "{}", String::from_utf8_lossy(&self.inner))
    }
}

/// An in-memory country lookup table.
pub struct GeoipDb {
    /// Inclusive address ranges, keyed by the u32 form of the address.
    map: RangeInclusiveMap<u32, CountryCode>,
}

impl GeoipDb {
    /// Parse a database from its text form.
    ///
    /// Unparseable lines are skipped: the file format has grown columns
    /// over the years and we only need the ranges we understand.
    pub fn parse(text: &str) -> Self {
        let mut map = RangeInclusiveMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split(',');
            let (lo, hi, cc) = match (cols.next(), cols.next(), cols.next()) {
                (Some(lo), Some(hi), Some(cc)) => (lo, hi, cc),
                _ => continue,
            };
            let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) else {
                continue;
            };
            let Ok(cc) = cc.trim().parse::<CountryCode>() else {
                continue;
            };
            if lo <= hi {
                map.insert(lo..=hi, cc);
            }
        }
        GeoipDb { map }
    }

    /// Load a database from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::CacheIo {
            path: path.to_owned(),
            err,
        })?;
        Ok(Self::parse(&text))
    }

    /// Look up the country for an address.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<CountryCode> {
        self.map.get(&u32::from(addr)).copied()
    }

    /// Number of ranges in the table.
    pub fn len(&self) -> usize {
        self.map.iter().count()
    }

    /// True if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.map.iter().next().is_none()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn country_codes() {
        let cc: CountryCode = "de".parse().unwrap();
        assert_eq!(cc.to_string(), "DE");
        assert!("".parse::<CountryCode>().is_err());
        assert!("???".parse::<CountryCode>().is_err());
        assert!("??".parse::<CountryCode>().is_err());
    }

    #[test]
    fn lookup_ranges() {
        // 1.0.0.0 = 16777216
        let db = GeoipDb::parse(
            "# a comment\n\
             16777216,16777471,AU\n\
             16777472,16778239,CN\n\
             bogus line\n",
        );
        assert_eq!(db.len(), 2);
        assert_eq!(
            db.lookup("1.0.0.1".parse().unwrap()).unwrap().to_string(),
            "AU"
        );
        assert_eq!(
            db.lookup("1.0.1.0".parse().unwrap()).unwrap().to_string(),
            "CN"
        );
        assert!(db.lookup("9.9.9.9".parse().unwrap()).is_none());
    }
}
