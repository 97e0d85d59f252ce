//! Worker address packing.
//!
//! A published worker address carries the worker uuid, its name and one
//! opaque, length-prefixed address blob per open interface, tagged by
//! (transport, device). The core frames the blobs and never looks inside.

use crate::error::{Error, Result};
use crate::transport::{pack_blob, unpack_blob};

/// One interface's entry in a packed worker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSegment {
    /// Transport name the blob belongs to.
    pub tl_name: String,
    /// Device name within the transport.
    pub dev_name: String,
    /// Driver-opaque interface address.
    pub iface_addr: Vec<u8>,
}

/// A worker's published address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    /// Unique id of the publishing worker.
    pub uuid: u64,
    /// Worker name, `host:pid`.
    pub name: String,
    /// One segment per open interface.
    pub segments: Vec<AddressSegment>,
}

impl WorkerAddress {
    /// Serialize into the wire blob.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.uuid.to_le_bytes());
        pack_blob(&mut out, self.name.as_bytes());
        out.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for seg in &self.segments {
            pack_blob(&mut out, seg.tl_name.as_bytes());
            pack_blob(&mut out, seg.dev_name.as_bytes());
            pack_blob(&mut out, &seg.iface_addr);
        }
        out
    }

    /// Parse a blob produced by [`WorkerAddress::pack`].
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        let mut view = buf;
        if view.len() < 8 {
            return Err(Error::InvalidParam("truncated worker address"));
        }
        let uuid = u64::from_le_bytes(view[..8].try_into().unwrap());
        view = &view[8..];

        let name = String::from_utf8(unpack_blob(&mut view)?.to_vec())
            .map_err(|_| Error::InvalidParam("worker name is not utf-8"))?;

        if view.len() < 4 {
            return Err(Error::InvalidParam("truncated worker address"));
        }
        let count = u32::from_le_bytes(view[..4].try_into().unwrap()) as usize;
        view = &view[4..];

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let tl_name = String::from_utf8(unpack_blob(&mut view)?.to_vec())
                .map_err(|_| Error::InvalidParam("transport name is not utf-8"))?;
            let dev_name = String::from_utf8(unpack_blob(&mut view)?.to_vec())
                .map_err(|_| Error::InvalidParam("device name is not utf-8"))?;
            let iface_addr = unpack_blob(&mut view)?.to_vec();
            segments.push(AddressSegment {
                tl_name,
                dev_name,
                iface_addr,
            });
        }

        Ok(Self {
            uuid,
            name,
            segments,
        })
    }

    /// First segment published by the named transport.
    pub fn segment_for(&self, tl_name: &str) -> Option<&AddressSegment> {
        self.segments.iter().find(|s| s.tl_name == tl_name)
    }
}
