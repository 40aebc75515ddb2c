//! Handshake and queue sizing parameters.
//!
//! Defaults reproduce the fixed values the RC handshake has always used. Override
//! via environment variables (prefixed `RCQP_`) or by constructing a custom
//! `QpConfig`. Every value is sanitized before it reaches hardware.

use std::num::NonZeroU8;

/// Largest retry count that is still bounded; 7 means "retry forever".
pub const MAX_BOUNDED_RETRY: u8 = 6;

/// Upper bound of the 5-bit timer fields (`timeout`, `min_rnr_timer`).
const MAX_TIMER: u8 = 31;

/// Path MTU negotiated in the ready-to-receive transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl PathMtu {
    pub const fn bytes(self) -> u32 {
        match self {
            PathMtu::Mtu256 => 256,
            PathMtu::Mtu512 => 512,
            PathMtu::Mtu1024 => 1024,
            PathMtu::Mtu2048 => 2048,
            PathMtu::Mtu4096 => 4096,
        }
    }

    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            256 => Some(PathMtu::Mtu256),
            512 => Some(PathMtu::Mtu512),
            1024 => Some(PathMtu::Mtu1024),
            2048 => Some(PathMtu::Mtu2048),
            4096 => Some(PathMtu::Mtu4096),
            _ => None,
        }
    }

    pub(crate) fn to_raw(self) -> ibverbs_sys::ibv_mtu {
        match self {
            PathMtu::Mtu256 => ibverbs_sys::IBV_MTU_256,
            PathMtu::Mtu512 => ibverbs_sys::IBV_MTU_512,
            PathMtu::Mtu1024 => ibverbs_sys::IBV_MTU_1024,
            PathMtu::Mtu2048 => ibverbs_sys::IBV_MTU_2048,
            PathMtu::Mtu4096 => ibverbs_sys::IBV_MTU_4096,
        }
    }
}

/// Tuning parameters for queue pair creation and the connection handshake.
#[derive(Debug, Clone)]
pub struct QpConfig {
    /// Path MTU used once the queue pair is ready to receive.
    pub path_mtu: PathMtu,

    /// Minimum RNR NAK timer, encoded (0..=31).
    pub min_rnr_timer: u8,

    /// Local ack timeout exponent: 4.096µs * 2^timeout.
    pub ack_timeout: u8,

    /// Transport retry count. Clamped to `MAX_BOUNDED_RETRY`.
    pub retry_count: u8,

    /// Receiver-not-ready retry count. Clamped to `MAX_BOUNDED_RETRY`.
    pub rnr_retry: u8,

    /// Outstanding RDMA reads/atomics this side may initiate.
    pub max_rd_atomic: u8,

    /// Outstanding RDMA reads/atomics the peer may target at this side.
    pub max_dest_rd_atomic: u8,

    /// Inline payload capacity requested at creation.
    pub max_inline_data: u32,

    /// Partition key index bound in INIT.
    pub pkey_index: u16,

    /// Hop limit used when the peer is addressed through a GRH.
    pub hop_limit: u8,
}

impl Default for QpConfig {
    fn default() -> Self {
        Self {
            path_mtu: PathMtu::Mtu2048,
            min_rnr_timer: 26,
            ack_timeout: 14, // ~67 ms
            retry_count: MAX_BOUNDED_RETRY,
            rnr_retry: MAX_BOUNDED_RETRY,
            max_rd_atomic: 1,
            max_dest_rd_atomic: 1,
            max_inline_data: 64,
            pkey_index: 0,
            hop_limit: 64,
        }
    }
}

impl QpConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// The source GID index is not configured here: it is the index the
    /// [`RdmaContext`](crate::RdmaContext) was opened with, so the address a
    /// queue pair advertises and the one it sends from always agree.
    ///
    /// Recognized variables:
    /// - `RCQP_PATH_MTU` (bytes: 256, 512, 1024, 2048, 4096)
    /// - `RCQP_MIN_RNR_TIMER`
    /// - `RCQP_ACK_TIMEOUT`
    /// - `RCQP_RETRY_COUNT`
    /// - `RCQP_RNR_RETRY`
    /// - `RCQP_MAX_RD_ATOMIC`
    /// - `RCQP_MAX_DEST_RD_ATOMIC`
    /// - `RCQP_MAX_INLINE_DATA`
    /// - `RCQP_HOP_LIMIT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`QpConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        let mut cfg = Self::default();

        if let Some(mtu) = parse::<u32>(&lookup, "RCQP_PATH_MTU").and_then(PathMtu::from_bytes) {
            cfg.path_mtu = mtu;
        }
        if let Some(v) = parse(&lookup, "RCQP_MIN_RNR_TIMER") {
            cfg.min_rnr_timer = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_ACK_TIMEOUT") {
            cfg.ack_timeout = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_RETRY_COUNT") {
            cfg.retry_count = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_RNR_RETRY") {
            cfg.rnr_retry = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_MAX_RD_ATOMIC") {
            cfg.max_rd_atomic = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_MAX_DEST_RD_ATOMIC") {
            cfg.max_dest_rd_atomic = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_MAX_INLINE_DATA") {
            cfg.max_inline_data = v;
        }
        if let Some(v) = parse(&lookup, "RCQP_HOP_LIMIT") {
            cfg.hop_limit = v;
        }

        cfg
    }

    pub(crate) fn min_rnr_timer(&self) -> u8 {
        self.min_rnr_timer.min(MAX_TIMER)
    }

    pub(crate) fn ack_timeout(&self) -> u8 {
        self.ack_timeout.min(MAX_TIMER)
    }

    pub(crate) fn retry_count(&self) -> u8 {
        self.retry_count.min(MAX_BOUNDED_RETRY)
    }

    pub(crate) fn rnr_retry(&self) -> u8 {
        self.rnr_retry.min(MAX_BOUNDED_RETRY)
    }

    // A zero depth makes the responder reject the first RDMA read with
    // IBV_WC_REM_INV_REQ_ERR.
    pub(crate) fn max_rd_atomic(&self) -> NonZeroU8 {
        NonZeroU8::new(self.max_rd_atomic).unwrap_or(NonZeroU8::MIN)
    }

    pub(crate) fn max_dest_rd_atomic(&self) -> NonZeroU8 {
        NonZeroU8::new(self.max_dest_rd_atomic).unwrap_or(NonZeroU8::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_handshake_constants() {
        let cfg = QpConfig::default();
        assert_eq!(cfg.path_mtu, PathMtu::Mtu2048);
        assert_eq!(cfg.min_rnr_timer(), 26);
        assert_eq!(cfg.ack_timeout(), 14);
        assert_eq!(cfg.retry_count(), 6);
        assert_eq!(cfg.rnr_retry(), 6);
        assert_eq!(cfg.max_rd_atomic().get(), 1);
        assert_eq!(cfg.max_dest_rd_atomic().get(), 1);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = QpConfig::from_lookup(lookup_from(&[
            ("RCQP_PATH_MTU", "4096"),
            ("RCQP_ACK_TIMEOUT", "18"),
            ("RCQP_MAX_INLINE_DATA", "220"),
            ("RCQP_HOP_LIMIT", " 255 "),
        ]));
        assert_eq!(cfg.path_mtu, PathMtu::Mtu4096);
        assert_eq!(cfg.ack_timeout(), 18);
        assert_eq!(cfg.max_inline_data, 220);
        assert_eq!(cfg.hop_limit, 255);
        assert_eq!(cfg.min_rnr_timer(), 26);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = QpConfig::from_lookup(lookup_from(&[
            ("RCQP_PATH_MTU", "3000"),
            ("RCQP_RETRY_COUNT", "many"),
            ("RCQP_MAX_RD_ATOMIC", "-1"),
        ]));
        assert_eq!(cfg.path_mtu, PathMtu::Mtu2048);
        assert_eq!(cfg.retry_count, MAX_BOUNDED_RETRY);
        assert_eq!(cfg.max_rd_atomic, 1);
    }

    #[test]
    fn test_retries_never_unbounded() {
        let cfg = QpConfig {
            retry_count: 7,
            rnr_retry: 200,
            ..QpConfig::default()
        };
        assert_eq!(cfg.retry_count(), MAX_BOUNDED_RETRY);
        assert_eq!(cfg.rnr_retry(), MAX_BOUNDED_RETRY);
    }

    #[test]
    fn test_zero_rd_atomic_is_raised_to_one() {
        let cfg = QpConfig::from_lookup(lookup_from(&[
            ("RCQP_MAX_RD_ATOMIC", "0"),
            ("RCQP_MAX_DEST_RD_ATOMIC", "0"),
        ]));
        assert_eq!(cfg.max_rd_atomic().get(), 1);
        assert_eq!(cfg.max_dest_rd_atomic().get(), 1);
    }

    #[test]
    fn test_timers_clamped_to_five_bits() {
        let cfg = QpConfig {
            min_rnr_timer: 40,
            ack_timeout: 99,
            ..QpConfig::default()
        };
        assert_eq!(cfg.min_rnr_timer(), 31);
        assert_eq!(cfg.ack_timeout(), 31);
    }

    #[test]
    fn test_path_mtu_bytes_roundtrip() {
        for mtu in [
            PathMtu::Mtu256,
            PathMtu::Mtu512,
            PathMtu::Mtu1024,
            PathMtu::Mtu2048,
            PathMtu::Mtu4096,
        ] {
            assert_eq!(PathMtu::from_bytes(mtu.bytes()), Some(mtu));
        }
        assert_eq!(PathMtu::from_bytes(0), None);
    }
}
