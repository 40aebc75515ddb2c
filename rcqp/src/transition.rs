//! The RC connection handshake: RESET → INIT → RTR → RTS.
//!
//! Each step is one [`Transition`] value carrying only the attributes that step
//! sets. [`Transition::to_raw`] derives the `ibv_qp_attr` and its attribute mask
//! from the same match arm, so a field is written exactly when its mask bit is
//! set.

use crate::config::{MAX_BOUNDED_RETRY, PathMtu, QpConfig};
use crate::endpoint::{ConnectionParameters, LocalPort};
use crate::error::{QpError, Result};
use crate::psn::Psn;
use ibverbs_sys::{ibv_access_flags, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_state};
use std::num::NonZeroU8;

/// Access rights granted to the remote side once the queue pair is initialized.
pub(crate) fn qp_access_flags() -> ibv_access_flags {
    ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
}

/// Lifecycle state of a queue pair as tracked on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Closed,
}

impl QpState {
    pub const fn name(self) -> &'static str {
        match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::ReadyToReceive => "RTR",
            QpState::ReadyToSend => "RTS",
            QpState::Closed => "CLOSED",
        }
    }

    /// Send-shaped work requests are only accepted once the handshake is complete.
    pub const fn accepts_sends(self) -> bool {
        matches!(self, QpState::ReadyToSend)
    }

    /// Receives may be pre-posted as soon as the queue pair is initialized.
    pub const fn accepts_receives(self) -> bool {
        matches!(
            self,
            QpState::Init | QpState::ReadyToReceive | QpState::ReadyToSend
        )
    }

    /// Fails unless `transition` may be applied from this state.
    pub(crate) fn check(self, transition: &Transition) -> Result<()> {
        if self == QpState::Closed {
            return Err(QpError::Closed);
        }
        if self != transition.source() {
            return Err(QpError::InvalidTransition {
                current: self,
                attempted: transition.target(),
                required: transition.source(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for QpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// RESET → INIT: bind the port and grant access rights.
    Init { port: u8, pkey_index: u16 },

    /// INIT → RTR: point the receive side at the peer.
    ReadyToReceive {
        port: u8,
        dest: ConnectionParameters,
        path_mtu: PathMtu,
        max_dest_rd_atomic: NonZeroU8,
        min_rnr_timer: u8,
        sgid_index: u8,
        hop_limit: u8,
    },

    /// RTR → RTS: arm the send side.
    ReadyToSend {
        sq_psn: Psn,
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
        max_rd_atomic: NonZeroU8,
    },
}

impl Transition {
    pub fn init(port: u8, config: &QpConfig) -> Self {
        Transition::Init {
            port,
            pkey_index: config.pkey_index,
        }
    }

    /// The GRH source index is the GID index `local` was opened with.
    pub fn ready_to_receive(
        local: LocalPort,
        dest: ConnectionParameters,
        config: &QpConfig,
    ) -> Self {
        Transition::ReadyToReceive {
            port: local.port,
            dest,
            path_mtu: config.path_mtu,
            max_dest_rd_atomic: config.max_dest_rd_atomic(),
            min_rnr_timer: config.min_rnr_timer(),
            sgid_index: local.gid_index,
            hop_limit: config.hop_limit,
        }
    }

    pub fn ready_to_send(sq_psn: Psn, config: &QpConfig) -> Self {
        Transition::ReadyToSend {
            sq_psn,
            timeout: config.ack_timeout(),
            retry_count: config.retry_count(),
            rnr_retry: config.rnr_retry(),
            max_rd_atomic: config.max_rd_atomic(),
        }
    }

    /// State the queue pair must be in for this transition to apply.
    pub const fn source(&self) -> QpState {
        match self {
            Transition::Init { .. } => QpState::Reset,
            Transition::ReadyToReceive { .. } => QpState::Init,
            Transition::ReadyToSend { .. } => QpState::ReadyToReceive,
        }
    }

    /// State the queue pair is in once the transition succeeds.
    pub const fn target(&self) -> QpState {
        match self {
            Transition::Init { .. } => QpState::Init,
            Transition::ReadyToReceive { .. } => QpState::ReadyToReceive,
            Transition::ReadyToSend { .. } => QpState::ReadyToSend,
        }
    }

    /// Checks parameters that came from outside the process.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Transition::ReadyToReceive { dest, .. } => dest.validate(),
            Transition::Init { port, .. } if *port == 0 => {
                Err(QpError::invalid("port numbers start at 1"))
            }
            _ => Ok(()),
        }
    }

    /// Build the attribute struct and mask passed to `ibv_modify_qp`.
    pub fn to_raw(&self) -> (ibv_qp_attr, ibv_qp_attr_mask) {
        let mut attr = ibv_qp_attr::default();
        let mask = match *self {
            Transition::Init { port, pkey_index } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.pkey_index = pkey_index;
                attr.port_num = port;
                attr.qp_access_flags = qp_access_flags().0;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            Transition::ReadyToReceive {
                port,
                dest,
                path_mtu,
                max_dest_rd_atomic,
                min_rnr_timer,
                sgid_index,
                hop_limit,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = path_mtu.to_raw();
                attr.dest_qp_num = dest.qp_num;
                attr.rq_psn = dest.psn.get();
                attr.max_dest_rd_atomic = max_dest_rd_atomic.get();
                attr.min_rnr_timer = min_rnr_timer.min(31);

                attr.ah_attr.dlid = dest.lid;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = port;
                if dest.uses_grh() {
                    attr.ah_attr.is_global = 1;
                    attr.ah_attr.grh.dgid.raw = dest.gid.raw();
                    attr.ah_attr.grh.sgid_index = sgid_index;
                    attr.ah_attr.grh.hop_limit = hop_limit;
                    attr.ah_attr.grh.traffic_class = 0;
                } else {
                    attr.ah_attr.is_global = 0;
                }

                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            Transition::ReadyToSend {
                sq_psn,
                timeout,
                retry_count,
                rnr_retry,
                max_rd_atomic,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.timeout = timeout.min(31);
                attr.retry_cnt = retry_count.min(MAX_BOUNDED_RETRY);
                attr.rnr_retry = rnr_retry.min(MAX_BOUNDED_RETRY);
                attr.sq_psn = sq_psn.get();
                attr.max_rd_atomic = max_rd_atomic.get();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        (attr, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Gid;

    fn peer(gid: Gid) -> ConnectionParameters {
        ConnectionParameters {
            qp_num: 0x2a,
            psn: Psn::truncate(0x00beef),
            lid: 3,
            gid,
        }
    }

    fn mask_bits(mask: ibv_qp_attr_mask) -> u32 {
        mask.0
    }

    #[test]
    fn test_init_attr_and_mask() {
        let (attr, mask) = Transition::init(1, &QpConfig::default()).to_raw();
        assert_eq!(attr.qp_state, ibv_qp_state::IBV_QPS_INIT);
        assert_eq!(attr.port_num, 1);
        assert_eq!(attr.pkey_index, 0);
        assert_eq!(attr.qp_access_flags, qp_access_flags().0);
        assert_eq!(
            mask_bits(mask),
            mask_bits(
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            )
        );
        // Nothing from later steps leaks into the INIT update.
        assert_eq!(attr.sq_psn, 0);
        assert_eq!(attr.dest_qp_num, 0);
    }

    #[test]
    fn test_rtr_attr_and_mask() {
        let dest = peer(Gid::ZERO);
        let (attr, mask) =
            Transition::ready_to_receive(LocalPort::new(1), dest, &QpConfig::default()).to_raw();
        assert_eq!(attr.qp_state, ibv_qp_state::IBV_QPS_RTR);
        assert_eq!(attr.path_mtu, ibverbs_sys::IBV_MTU_2048);
        assert_eq!(attr.dest_qp_num, 0x2a);
        assert_eq!(attr.rq_psn, 0x00beef);
        assert_eq!(attr.max_dest_rd_atomic, 1);
        assert_eq!(attr.min_rnr_timer, 26);
        assert_eq!(attr.ah_attr.dlid, 3);
        assert_eq!(attr.ah_attr.port_num, 1);
        assert_eq!(attr.ah_attr.is_global, 0);
        assert_eq!(attr.ah_attr.sl, 0);
        assert_eq!(attr.ah_attr.src_path_bits, 0);
        assert_eq!(
            mask_bits(mask),
            mask_bits(
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            )
        );
        assert_eq!(attr.sq_psn, 0);
        assert_eq!(attr.retry_cnt, 0);
    }

    #[test]
    fn test_rtr_uses_full_width_gid() {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[15] = 0x09;
        let local = LocalPort {
            port: 2,
            gid_index: 3,
        };
        let (attr, _) =
            Transition::ready_to_receive(local, peer(Gid(raw)), &QpConfig::default()).to_raw();
        assert_eq!(attr.ah_attr.is_global, 1);
        assert_eq!(attr.ah_attr.grh.sgid_index, 3);
        assert_eq!(attr.ah_attr.grh.hop_limit, 64);
        assert_eq!(attr.ah_attr.port_num, 2);
        let dgid = unsafe { attr.ah_attr.grh.dgid.raw };
        assert_eq!(dgid, raw);
    }

    #[test]
    fn test_rts_attr_and_mask() {
        let (attr, mask) =
            Transition::ready_to_send(Psn::truncate(0x123456), &QpConfig::default()).to_raw();
        assert_eq!(attr.qp_state, ibv_qp_state::IBV_QPS_RTS);
        assert_eq!(attr.timeout, 14);
        assert_eq!(attr.retry_cnt, 6);
        assert_eq!(attr.rnr_retry, 6);
        assert_eq!(attr.sq_psn, 0x123456);
        assert_eq!(attr.max_rd_atomic, 1);
        assert_eq!(
            mask_bits(mask),
            mask_bits(
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            )
        );
        assert_eq!(attr.rq_psn, 0);
        assert_eq!(attr.dest_qp_num, 0);
    }

    #[test]
    fn test_rd_atomic_never_zero() {
        let cfg = QpConfig {
            max_rd_atomic: 0,
            max_dest_rd_atomic: 0,
            ..QpConfig::default()
        };
        let (rtr, _) =
            Transition::ready_to_receive(LocalPort::new(1), peer(Gid::ZERO), &cfg).to_raw();
        let (rts, _) = Transition::ready_to_send(Psn::default(), &cfg).to_raw();
        assert_eq!(rtr.max_dest_rd_atomic, 1);
        assert_eq!(rts.max_rd_atomic, 1);
    }

    #[test]
    fn test_hand_built_rts_still_bounded() {
        let t = Transition::ReadyToSend {
            sq_psn: Psn::default(),
            timeout: 14,
            retry_count: 7,
            rnr_retry: 7,
            max_rd_atomic: NonZeroU8::MIN,
        };
        let (attr, _) = t.to_raw();
        assert_eq!(attr.retry_cnt, MAX_BOUNDED_RETRY);
        assert_eq!(attr.rnr_retry, MAX_BOUNDED_RETRY);
    }

    #[test]
    fn test_state_order() {
        let cfg = QpConfig::default();
        let init = Transition::init(1, &cfg);
        let rtr = Transition::ready_to_receive(LocalPort::new(1), peer(Gid::ZERO), &cfg);
        let rts = Transition::ready_to_send(Psn::default(), &cfg);

        assert!(QpState::Reset.check(&init).is_ok());
        assert!(QpState::Init.check(&rtr).is_ok());
        assert!(QpState::ReadyToReceive.check(&rts).is_ok());

        assert!(matches!(
            QpState::Reset.check(&rtr),
            Err(QpError::InvalidTransition {
                current: QpState::Reset,
                attempted: QpState::ReadyToReceive,
                required: QpState::Init,
            })
        ));
        assert!(QpState::Init.check(&rts).is_err());
        assert!(QpState::Init.check(&init).is_err());
        assert!(QpState::ReadyToSend.check(&rts).is_err());
        assert!(matches!(QpState::Closed.check(&init), Err(QpError::Closed)));
    }

    #[test]
    fn test_validate_rejects_bad_destination() {
        let cfg = QpConfig::default();
        let bad = ConnectionParameters {
            qp_num: 0,
            ..peer(Gid::ZERO)
        };
        assert!(
            Transition::ready_to_receive(LocalPort::new(1), bad, &cfg)
                .validate()
                .is_err()
        );
        assert!(Transition::init(0, &cfg).validate().is_err());
        assert!(Transition::init(1, &cfg).validate().is_ok());
    }

    #[test]
    fn test_posting_readiness() {
        assert!(!QpState::Reset.accepts_receives());
        assert!(QpState::Init.accepts_receives());
        assert!(!QpState::ReadyToReceive.accepts_sends());
        assert!(QpState::ReadyToSend.accepts_sends());
        assert!(!QpState::Closed.accepts_receives());
    }
}
