//! Connection parameters exchanged out of band before the handshake.

use crate::error::{QpError, Result};
use crate::psn::{PSN_MASK, Psn};

/// A 128-bit port address (InfiniBand GID / RoCE IPv6-mapped address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub const ZERO: Gid = Gid([0; 16]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn raw(&self) -> [u8; 16] {
        self.0
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// The local side of a connection: the physical port and the GID table entry
/// its address was read from. The same index is the GRH source GID once the
/// peer is routed globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPort {
    pub port: u8,
    pub gid_index: u8,
}

impl LocalPort {
    /// `port` with GID index 0.
    pub const fn new(port: u8) -> Self {
        Self { port, gid_index: 0 }
    }
}

/// Everything a peer must know to drive its queue pair to ready-to-receive.
///
/// `gid` selects routing: a non-zero GID addresses the peer through a global
/// route header (required on RoCE); a zero GID falls back to LID routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub qp_num: u32,
    pub psn: Psn,
    pub lid: u16,
    pub gid: Gid,
}

/// Serialized size: qp_num(4) + psn(4) + lid(2) + gid(16).
pub const CONNECTION_PARAMETERS_SIZE: usize = 26;

impl ConnectionParameters {
    /// Checks the fields a ready-to-receive transition consumes.
    pub fn validate(&self) -> Result<()> {
        if self.qp_num == 0 {
            return Err(QpError::invalid("destination qp_num must be non-zero"));
        }
        if self.qp_num & !PSN_MASK != 0 {
            return Err(QpError::invalid(format!(
                "destination qp_num {:#x} exceeds 24 bits",
                self.qp_num
            )));
        }
        if self.lid == 0 && self.gid.is_zero() {
            return Err(QpError::invalid(
                "destination needs a LID or a GID to be addressable",
            ));
        }
        Ok(())
    }

    pub(crate) fn uses_grh(&self) -> bool {
        !self.gid.is_zero()
    }

    pub fn to_bytes(&self) -> [u8; CONNECTION_PARAMETERS_SIZE] {
        let mut buf = [0u8; CONNECTION_PARAMETERS_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..8].copy_from_slice(&self.psn.get().to_le_bytes());
        buf[8..10].copy_from_slice(&self.lid.to_le_bytes());
        buf[10..26].copy_from_slice(&self.gid.0);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != CONNECTION_PARAMETERS_SIZE {
            return Err(QpError::invalid(format!(
                "connection parameters are {CONNECTION_PARAMETERS_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let raw_psn = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let psn = Psn::new(raw_psn)
            .ok_or_else(|| QpError::invalid(format!("psn {raw_psn:#x} exceeds 24 bits")))?;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[10..26]);
        let params = Self {
            qp_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            psn,
            lid: u16::from_le_bytes([buf[8], buf[9]]),
            gid: Gid(gid),
        };
        params.validate()?;
        Ok(params)
    }
}
