//! Shared-memory policy table reader (§6.1).
//!
//! A separate load-balancing agent (not part of this crate) publishes a
//! `shm_servers` header followed by a trailing array of `server_info`
//! entries into a shared-memory segment; client processes map it
//! read-only and consult it to pick an upstream. This module is only
//! the reading half: a `#[repr(C)]` mirror of that layout plus a
//! bounds-checked view over an arbitrary byte slice. JSON ingestion,
//! weight/policy validation and writing the table are the agent's job,
//! not this core's — see spec §6.

use thiserror::Error;

/// Maximum ports a single `server_info` entry carries.
pub const PORT_MAX: usize = 8;
/// Sanity ceiling on `server_num`, matching the agent's own limit.
pub const MAX_SERVERS: usize = 1024;

/// Mirrors `struct shm_servers`'s fixed header (everything before the
/// trailing `svrs[server_num]` array).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShmHeader {
    pub version: u32,
    pub policy: u32,
    pub server_num: u32,
    pub weight_static_total: u32,
    pub shaping_request_min: i32,
    pub success_ratio_base: f32,
    pub success_ratio_min: f32,
    pub resume_weight_ratio: f32,
    pub dead_retry_ratio: f32,
    pub weight_low_watermark: f32,
    pub weight_low_ratio: f32,
    pub weight_incr_ratio: f32,
}

/// Mirrors `struct server_info`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ServerInfo {
    pub server_ip: u32,
    pub weight_static: u16,
    pub port_type: u8,
    pub port_num: u8,
    pub port: [u16; PORT_MAX],
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    #[error("buffer too small for the fixed shm_servers header")]
    HeaderTruncated,
    #[error("server_num {0} exceeds the sanity ceiling of {1}")]
    TooManyServers(u32, usize),
    #[error("buffer too small for {0} trailing server_info entries")]
    ServersTruncated(u32),
}

/// A validated, read-only view over a `shm_servers` table living
/// somewhere in a byte slice — typically a `mmap`'d shared-memory
/// segment the embedder owns; this type borrows from it rather than
/// copying.
pub struct PolicyTable<'a> {
    header: &'a ShmHeader,
    servers: &'a [ServerInfo],
}

impl<'a> PolicyTable<'a> {
    /// Validate `data` as a `shm_servers` table and borrow a view over
    /// it. Checks only what's needed to never read out of bounds;
    /// semantic validation of weights/ratios is the agent's
    /// responsibility before it ever publishes the table.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, ShmError> {
        let header_size = std::mem::size_of::<ShmHeader>();
        if data.len() < header_size {
            return Err(ShmError::HeaderTruncated);
        }

        // SAFETY: length checked above; `ShmHeader` is a `repr(C)` bag
        // of plain integers and floats, so every bit pattern is a valid
        // value, and shared-memory mappings are always page-aligned,
        // far past `align_of::<ShmHeader>()`.
        let header = unsafe { &*(data.as_ptr() as *const ShmHeader) };

        if header.server_num as usize > MAX_SERVERS {
            return Err(ShmError::TooManyServers(header.server_num, MAX_SERVERS));
        }

        let servers_size = header.server_num as usize * std::mem::size_of::<ServerInfo>();
        if data.len() - header_size < servers_size {
            return Err(ShmError::ServersTruncated(header.server_num));
        }

        // SAFETY: `servers_size` bytes are available starting right
        // after the header, verified above; `ServerInfo` has the same
        // "plain data, any bit pattern valid" property as `ShmHeader`.
        let servers = unsafe {
            std::slice::from_raw_parts(
                data[header_size..].as_ptr() as *const ServerInfo,
                header.server_num as usize,
            )
        };

        Ok(PolicyTable { header, servers })
    }

    pub fn header(&self) -> &ShmHeader {
        self.header
    }

    pub fn servers(&self) -> &[ServerInfo] {
        self.servers
    }
}
