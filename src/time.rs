//! Time primitives: high-resolution timestamps, the NTP 64-bit fixed-point
//! wire format, the compact 32-bit floating wire format, and IP address
//! reference-id derivation.

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const JAN_1970: u32 = 0x83aa7e80;

/// A high-resolution timestamp: signed seconds (wide enough for post-2038
/// values) plus nanoseconds normalised to `[0, 1_000_000_000)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }.normalised()
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        let whole = secs.floor();
        let frac = secs - whole;
        Self::new(whole as i64, (frac * 1e9).round() as u32)
    }

    pub fn to_secs_f64(self) -> f64 {
        self.secs as f64 + self.nanos as f64 / 1e9
    }

    /// Reduce `nanos` to `[0, 1e9)`, carrying/borrowing seconds as needed.
    pub fn normalised(mut self) -> Self {
        const BILLION: i64 = 1_000_000_000;
        let mut nanos = self.nanos as i64;
        if nanos >= BILLION {
            self.secs += nanos / BILLION;
            nanos %= BILLION;
        } else if nanos < 0 {
            let borrow = (-nanos + BILLION - 1) / BILLION;
            self.secs -= borrow;
            nanos += borrow * BILLION;
        }
        self.nanos = nanos as u32;
        self
    }

    /// `self - other`, as a real number of seconds (positive if `self` is later).
    pub fn diff_seconds(self, other: Timestamp) -> f64 {
        (self.secs - other.secs) as f64 + (self.nanos as f64 - other.nanos as f64) / 1e9
    }

    pub fn add_seconds(self, delta: f64) -> Timestamp {
        Timestamp::from_secs_f64(self.to_secs_f64() + delta)
    }
}

/// Encode a microsecond count into the fractional field of an NTP-64
/// timestamp, using the classic low-cost shift-and-subtract approximation
/// to `usec * 2^32 / 1e6` (worst case error ~0.1us).
fn encode_frac_from_usec(usec: u32) -> u32 {
    let usec = usec as i64;
    (4295 * usec - (usec >> 5) - (usec >> 9)) as u32
}

fn decode_usec_from_frac(frac: u32) -> u32 {
    // Round rather than truncate: the multiply-shift is exact only for
    // fractions that are themselves multiples of 2^32/1e6, so truncating
    // can lose a full microsecond.
    (((frac as u64) * 1_000_000 + (1u64 << 31)) >> 32) as u32
}

/// NTP 64-bit fixed-point timestamp: two big-endian 32-bit words, seconds
/// since the NTP epoch and a binary fraction of a second. Zero means
/// "unknown" (RFC 5905 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const UNKNOWN: NtpTimestamp = NtpTimestamp {
        seconds: 0,
        fraction: 0,
    };

    pub fn is_unknown(self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }

    pub fn from_timestamp(ts: Timestamp) -> Self {
        let seconds = (ts.secs as i128 + JAN_1970 as i128) as u32;
        let usec = ts.nanos / 1000;
        Self {
            seconds,
            fraction: encode_frac_from_usec(usec),
        }
    }

    pub fn to_timestamp(self) -> Timestamp {
        let secs = self.seconds as i64 - JAN_1970 as i64;
        let usec = decode_usec_from_frac(self.fraction);
        Timestamp::new(secs, usec * 1000)
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            seconds: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            fraction: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        out
    }
}

const FLOAT_EXP_BITS: u32 = 7;
const FLOAT_COEF_BITS: u32 = 25;
const FLOAT_EXP_MAX: i32 = (1 << (FLOAT_EXP_BITS - 1)) - 1; // 63
const FLOAT_EXP_MIN: i32 = -(1 << (FLOAT_EXP_BITS - 1)); // -64
const FLOAT_COEF_MAX: i32 = (1 << (FLOAT_COEF_BITS - 1)) - 1; // 2^24 - 1
const FLOAT_COEF_MIN: i32 = -(1 << (FLOAT_COEF_BITS - 1)); // -2^24

/// Compact 32-bit floating-point wire value: a 7-bit signed exponent and a
/// 25-bit signed coefficient, `value = coef * 2^(exp - 25)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactFloat(pub u32);

fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    let exponent = raw_exp - 1022;
    let mantissa_bits = (bits & 0x000f_ffff_ffff_ffff) | (1023u64 << 52);
    let mantissa = f64::from_bits(mantissa_bits) / 2.0;
    (mantissa, exponent)
}

impl CompactFloat {
    /// Encode a (possibly negative) finite value, saturating to the
    /// representable range.
    pub fn encode(mut value: f64) -> Self {
        if value == 0.0 || !value.is_finite() {
            return CompactFloat(0);
        }

        let neg = value < 0.0;
        if neg {
            value = -value;
        }

        let (mantissa, mut exponent) = frexp(value);
        // mantissa is in [0.5, 1.0); scale into the 24-bit magnitude range
        // (25-bit signed coefficient has 24 magnitude bits).
        let mut coef = (mantissa * (1i64 << (FLOAT_COEF_BITS - 1)) as f64).round() as i64;
        if coef >= 1i64 << (FLOAT_COEF_BITS - 1) {
            coef >>= 1;
            exponent += 1;
        }
        // value = coef * 2^(exponent - (FLOAT_COEF_BITS - 1)); wire exp field
        // is offset by one further bit (see decode for the matching shift).
        let mut exp_field = exponent + 1;

        if exp_field > FLOAT_EXP_MAX {
            exp_field = FLOAT_EXP_MAX;
            coef = if neg {
                FLOAT_COEF_MIN as i64
            } else {
                FLOAT_COEF_MAX as i64
            };
        } else if exp_field < FLOAT_EXP_MIN {
            return CompactFloat(0);
        }

        let mut signed_coef = coef as i32;
        if neg {
            signed_coef = -signed_coef;
        }

        let word = ((exp_field as u32) & 0x7f) << 25 | (signed_coef as u32 & 0x01ff_ffff);
        CompactFloat(word)
    }

    pub fn decode(self) -> f64 {
        let word = self.0;
        let mut exp_field = ((word >> 25) & 0x7f) as i32;
        if exp_field >= 64 {
            exp_field -= 128;
        }
        let mut coef = (word & 0x01ff_ffff) as i32;
        if coef >= 1 << 24 {
            coef -= 1 << 25;
        }
        coef as f64 * 2f64.powi(exp_field - 25)
    }
}

/// A tagged union of IP address kinds, as used for reference identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddr {
    Unspec,
    Inet4(u32),
    Inet6([u8; 16]),
}

impl IpAddr {
    /// Derive the four-byte reference identifier for this address: the raw
    /// address itself for IPv4, or the first four bytes of the MD5 digest of
    /// the raw 16-byte address for IPv6.
    pub fn refid(&self) -> [u8; 4] {
        match self {
            IpAddr::Unspec => [0; 4],
            IpAddr::Inet4(a) => a.to_be_bytes(),
            IpAddr::Inet6(bytes) => {
                let digest = md5::compute(bytes);
                [digest[0], digest[1], digest[2], digest[3]]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_normalisation_carries_and_borrows() {
        let t = Timestamp::new(5, 1_500_000_000);
        assert_eq!(t.secs, 6);
        assert_eq!(t.nanos, 500_000_000);

        let t = Timestamp { secs: 5, nanos: 0 }.normalised();
        assert_eq!((t.secs, t.nanos), (5, 0));
    }

    #[test]
    fn ntp_timestamp_roundtrip_within_half_microsecond() {
        for usec in [0u32, 1, 7, 12345, 500_000, 999_999] {
            let ts = Timestamp::new(1_800_000_000, usec * 1000);
            let ntp = NtpTimestamp::from_timestamp(ts);
            let back = ntp.to_timestamp();
            let err = (back.diff_seconds(ts)).abs();
            assert!(err < 0.5e-6, "usec={usec} err={err}");
        }
    }

    #[test]
    fn ntp_timestamp_wire_roundtrip() {
        let ntp = NtpTimestamp {
            seconds: 0xE0000000,
            fraction: 0x12345678,
        };
        let bytes = ntp.to_bytes();
        assert_eq!(NtpTimestamp::from_bytes(&bytes), ntp);
    }

    #[test]
    fn ntp_timestamp_zero_is_unknown() {
        assert!(NtpTimestamp::UNKNOWN.is_unknown());
        assert!(!NtpTimestamp::from_bytes(&[0, 0, 0, 1, 0, 0, 0, 0]).is_unknown());
    }

    #[test]
    fn compact_float_roundtrip_representable_range() {
        // The 7-bit exponent / 25-bit coefficient layout represents
        // magnitudes roughly within [2^-66, 2^62]; this covers every value
        // that appears on the wire in practice (offsets, delays, dispersions
        // are at most a few thousand seconds).
        for exp in (-65..=55).step_by(5) {
            let value = 2f64.powi(exp) * 1.23456;
            let encoded = CompactFloat::encode(value);
            let decoded = encoded.decode();
            let rel_err = ((decoded - value) / value).abs();
            assert!(rel_err < 2f64.powi(-24), "exp={exp} rel_err={rel_err}");

            let encoded_neg = CompactFloat::encode(-value);
            let decoded_neg = encoded_neg.decode();
            assert!(((decoded_neg + value) / value).abs() < 2f64.powi(-24));
        }
    }

    #[test]
    fn compact_float_zero_roundtrips_to_zero() {
        assert_eq!(CompactFloat::encode(0.0).decode(), 0.0);
    }

    #[test]
    fn compact_float_saturates_out_of_range() {
        let huge = CompactFloat::encode(2f64.powi(200));
        assert!(huge.decode().is_finite());
        assert!(huge.decode() > 0.0);

        let tiny = CompactFloat::encode(2f64.powi(-200));
        assert_eq!(tiny.decode(), 0.0);
    }

    #[test]
    fn refid_inet4_is_the_address_itself() {
        let addr = IpAddr::Inet4(0x01020304);
        assert_eq!(addr.refid(), [1, 2, 3, 4]);
    }

    #[test]
    fn refid_inet6_is_md5_prefix() {
        let bytes = [0u8; 16];
        let addr = IpAddr::Inet6(bytes);
        let digest = md5::compute(bytes);
        assert_eq!(addr.refid(), [digest[0], digest[1], digest[2], digest[3]]);
    }
}
