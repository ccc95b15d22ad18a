#![cfg_attr(not(test), no_std)]

pub mod models;
pub mod utils;

pub use models::{CaatEventKind, CaatRecord};

pub const COMM_LEN: usize = 16;
pub const PATH_LEN: usize = 256;
pub const ADDR_LEN: usize = 16;

/// Size in bytes of one record as written by the kernel program.
pub const RECORD_SIZE: usize = 344;

pub const FAMILY_INET: u16 = 2;
pub const FAMILY_INET6: u16 = 10;

const _: () = assert!(core::mem::size_of::<CaatRecord>() == RECORD_SIZE);
