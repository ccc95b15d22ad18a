use crate::errors::DecodeError;
use crate::kernel::RawEventRecord;
use bytes::Buf;
use caat_probes_common::utils::str_from_buf_nul;
use caat_probes_common::{
    CaatEventKind, ADDR_LEN, COMM_LEN, FAMILY_INET, FAMILY_INET6, PATH_LEN, RECORD_SIZE,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use caat_probes_common::CaatEventKind as EventKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetail {
    Exec { filename: String },
    Exit { code: i64 },
    Open { path: String, flags: u64 },
    Network { addr: SocketAddr, protocol: u16 },
    Syscall { nr: u64, ret: i64 },
    SchedSwitch { prev_pid: u32, next_pid: u32 },
}

/// Decoded kernel event handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Kernel monotonic clock, nanoseconds.
    pub timestamp_ns: u64,
    pub cpu: u32,
    pub pid: u32,
    pub tgid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub detail: EventDetail,
}

pub trait RecordDecoder: Send + Sync + 'static {
    fn decode(&self, raw: &RawEventRecord) -> Result<Event, DecodeError>;
}

impl<F> RecordDecoder for F
where
    F: Fn(&RawEventRecord) -> Result<Event, DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, raw: &RawEventRecord) -> Result<Event, DecodeError> {
        self(raw)
    }
}

/// Decoder for the `CaatRecord` layout written by the CAAT probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaatDecoder;

impl RecordDecoder for CaatDecoder {
    fn decode(&self, raw: &RawEventRecord) -> Result<Event, DecodeError> {
        if raw.data.len() != RECORD_SIZE {
            return Err(DecodeError::Length {
                actual: raw.data.len(),
                expected: RECORD_SIZE,
            });
        }

        let mut buf = &raw.data[..];
        let kind_raw = buf.get_u32_ne();
        let kind = CaatEventKind::from_u32(kind_raw).ok_or(DecodeError::UnknownKind(kind_raw))?;
        let record_cpu = buf.get_u32_ne();
        let timestamp_ns = buf.get_u64_ne();
        let pid = buf.get_u32_ne();
        let tgid = buf.get_u32_ne();
        let uid = buf.get_u32_ne();
        let gid = buf.get_u32_ne();
        let mut comm = [0u8; COMM_LEN];
        buf.copy_to_slice(&mut comm);
        let arg0 = buf.get_u64_ne();
        let arg1 = buf.get_i64_ne();
        let mut addr = [0u8; ADDR_LEN];
        buf.copy_to_slice(&mut addr);
        let family = buf.get_u16_ne();
        let path_len = buf.get_u16_ne();
        buf.advance(4);
        let mut path = [0u8; PATH_LEN];
        buf.copy_to_slice(&mut path);

        let detail = match kind {
            EventKind::Exec => EventDetail::Exec {
                filename: path_str(&path, path_len)?,
            },
            EventKind::Exit => EventDetail::Exit { code: arg1 },
            EventKind::Open => EventDetail::Open {
                path: path_str(&path, path_len)?,
                flags: arg0,
            },
            EventKind::Connect | EventKind::Accept => EventDetail::Network {
                addr: socket_addr(family, &addr, arg1 as u16)?,
                protocol: arg0 as u16,
            },
            EventKind::Syscall => EventDetail::Syscall { nr: arg0, ret: arg1 },
            EventKind::SchedSwitch => EventDetail::SchedSwitch {
                prev_pid: arg0 as u32,
                next_pid: arg1 as u32,
            },
        };

        let comm = match str_from_buf_nul(&comm) {
            Ok(s) => s.to_string(),
            Err(_) => String::from_utf8_lossy(&comm)
                .trim_end_matches('\0')
                .to_string(),
        };

        Ok(Event {
            kind,
            timestamp_ns,
            cpu: raw.cpu.unwrap_or(record_cpu),
            pid,
            tgid,
            uid,
            gid,
            comm,
            detail,
        })
    }
}

fn path_str(path: &[u8; PATH_LEN], len: u16) -> Result<String, DecodeError> {
    if len as usize > PATH_LEN {
        return Err(DecodeError::PathLength(len));
    }
    let s = str_from_buf_nul(&path[..len as usize]).map_err(|_| DecodeError::Utf8)?;
    Ok(s.to_string())
}

fn socket_addr(family: u16, addr: &[u8; ADDR_LEN], port: u16) -> Result<SocketAddr, DecodeError> {
    let ip = match family {
        FAMILY_INET => IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
        FAMILY_INET6 => IpAddr::V6(Ipv6Addr::from(*addr)),
        f => return Err(DecodeError::AddressFamily(f)),
    };
    Ok(SocketAddr::new(ip, port))
}
