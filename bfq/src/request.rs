//! Request representation.
//!
//! The block layer owns request payloads; the scheduler tracks the
//! geometry and classification it needs: starting sector, length,
//! direction, metadata marking, and the FIFO deadline stamped at
//! insertion time.

use bitflags::bitflags;

use crate::entity::QueueId;
use crate::ioctx::Pid;

/// 512-byte sector address.
pub type Sector = u64;

/// Handle of a request while the scheduler tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

bitflags! {
    /// Request classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// Read or explicitly synchronous write.
        const SYNC = 1 << 0;
        /// Filesystem metadata.
        const META = 1 << 1;
    }
}

/// A request under scheduler control.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub sector: Sector,
    pub nr_sectors: u32,
    pub flags: RequestFlags,
    pub pid: Pid,
    /// FIFO aging deadline, in ticks; stamped at insertion.
    pub fifo_deadline: u64,
    /// Owning queue while queued or dispatched.
    pub queue: Option<QueueId>,
    /// Inserted into the scheduler (as opposed to only allocated).
    pub queued: bool,
}

impl Request {
    pub fn is_sync(&self) -> bool {
        self.flags.contains(RequestFlags::SYNC)
    }

    pub fn is_meta(&self) -> bool {
        self.flags.contains(RequestFlags::META)
    }

    /// First sector past the end of the request.
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors as u64
    }

    /// Sectors charged against a budget when the request is served.
    pub fn serv_to_charge(&self) -> u64 {
        self.nr_sectors as u64
    }

    /// Direction index for `[async, sync]` counters.
    pub fn dir(&self) -> usize {
        self.is_sync() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let rq = Request {
            id: RequestId(1),
            sector: 100,
            nr_sectors: 8,
            flags: RequestFlags::SYNC,
            pid: 1,
            fifo_deadline: 0,
            queue: None,
            queued: false,
        };
        assert_eq!(rq.end_sector(), 108);
        assert_eq!(rq.serv_to_charge(), 8);
        assert_eq!(rq.dir(), 1);
        assert!(!rq.is_meta());
    }
}
