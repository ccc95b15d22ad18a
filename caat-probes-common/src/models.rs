use crate::{ADDR_LEN, COMM_LEN, PATH_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CaatEventKind {
    Exec = 0,
    Exit = 1,
    Open = 2,
    Connect = 3,
    Accept = 4,
    Syscall = 5,
    SchedSwitch = 6,
}

impl CaatEventKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        let kind = match v {
            0 => CaatEventKind::Exec,
            1 => CaatEventKind::Exit,
            2 => CaatEventKind::Open,
            3 => CaatEventKind::Connect,
            4 => CaatEventKind::Accept,
            5 => CaatEventKind::Syscall,
            6 => CaatEventKind::SchedSwitch,
            _ => return None,
        };
        Some(kind)
    }
}

/// Fixed-layout record pushed by the kernel program into the buffer maps.
///
/// `arg0` and `arg1` are interpreted per kind:
/// open (flags, -), exit (-, exit code), connect/accept (protocol, port),
/// syscall (nr, ret), sched_switch (prev pid, next pid).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CaatRecord {
    pub kind: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tgid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: [u8; COMM_LEN],
    pub arg0: u64,
    pub arg1: i64,
    pub addr: [u8; ADDR_LEN],
    pub family: u16,
    pub path_len: u16,
    pub _pad: [u8; 4],
    pub path: [u8; PATH_LEN],
}

impl CaatRecord {
    pub const EMPTY: CaatRecord = CaatRecord {
        kind: 0,
        cpu: 0,
        timestamp_ns: 0,
        pid: 0,
        tgid: 0,
        uid: 0,
        gid: 0,
        comm: [0; COMM_LEN],
        arg0: 0,
        arg1: 0,
        addr: [0; ADDR_LEN],
        family: 0,
        path_len: 0,
        _pad: [0; 4],
        path: [0; PATH_LEN],
    };

    pub fn new(kind: CaatEventKind) -> Self {
        CaatRecord {
            kind: kind as u32,
            ..Self::EMPTY
        }
    }

    pub fn to_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}
