//! MTU fragmentation and per-link reassembly.
//!
//! Every transport packet is a fragment:
//! `[ fragment_id u32 BE | index u16 BE | count u16 BE | data ]`.
//! Frames that fit in one packet are sent as `count == 1`.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Duration, Utc};

use crate::error::ProtoError;

pub const FRAGMENT_HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_PARTIAL: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub fragment_id: u32,
    pub index: u16,
    pub count: u16,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + self.data.len());
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.index);
        buf.put_u16(self.count);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, ProtoError> {
        if input.remaining() < FRAGMENT_HEADER_LEN {
            return Err(ProtoError::Truncated("fragment header"));
        }
        let fragment_id = input.get_u32();
        let index = input.get_u16();
        let count = input.get_u16();
        if count == 0 || index >= count {
            return Err(ProtoError::MalformedFragment(format!(
                "index {index} of {count}"
            )));
        }
        Ok(Self {
            fragment_id,
            index,
            count,
            data: input.to_vec(),
        })
    }
}

/// Split an encoded frame into packets no larger than `mtu`.
pub fn split(frame: &[u8], mtu: usize, fragment_id: u32) -> Result<Vec<Vec<u8>>, ProtoError> {
    if mtu <= FRAGMENT_HEADER_LEN {
        return Err(ProtoError::MtuTooSmall(mtu));
    }
    let chunk = mtu - FRAGMENT_HEADER_LEN;
    let count = frame.len().div_ceil(chunk).max(1);
    let count = u16::try_from(count).map_err(|_| ProtoError::FieldTooLong("fragment count"))?;

    if frame.is_empty() {
        return Ok(vec![Fragment {
            fragment_id,
            index: 0,
            count: 1,
            data: Vec::new(),
        }
        .encode()]);
    }
    Ok(frame
        .chunks(chunk)
        .enumerate()
        .map(|(i, data)| {
            Fragment {
                fragment_id,
                index: i as u16,
                count,
                data: data.to_vec(),
            }
            .encode()
        })
        .collect())
}

#[derive(Debug)]
struct Partial {
    count: u16,
    parts: Vec<Option<Vec<u8>>>,
    received: u16,
    started_at: DateTime<Utc>,
}

/// Reassembles fragments for one link.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<u32, Partial>,
    max_partial: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_partial: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_partial: max_partial.max(1),
            timeout,
        }
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Feed one packet; returns the complete frame once every piece arrived.
    /// Duplicate fragments are ignored.
    pub fn push(&mut self, packet: &[u8], now: DateTime<Utc>) -> Result<Option<Vec<u8>>, ProtoError> {
        let frag = Fragment::decode(packet)?;
        if frag.count == 1 {
            return Ok(Some(frag.data));
        }

        if !self.partial.contains_key(&frag.fragment_id) && self.partial.len() >= self.max_partial {
            if let Some(oldest) = self
                .partial
                .iter()
                .min_by_key(|(_, p)| p.started_at)
                .map(|(id, _)| *id)
            {
                self.partial.remove(&oldest);
            }
        }

        let entry = self.partial.entry(frag.fragment_id).or_insert_with(|| Partial {
            count: frag.count,
            parts: vec![None; frag.count as usize],
            received: 0,
            started_at: now,
        });
        if entry.count != frag.count {
            return Err(ProtoError::MalformedFragment(format!(
                "fragment {} count changed from {} to {}",
                frag.fragment_id, entry.count, frag.count
            )));
        }
        let slot = &mut entry.parts[frag.index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(frag.data);
        entry.received += 1;

        if entry.received < entry.count {
            return Ok(None);
        }
        let done = self
            .partial
            .remove(&frag.fragment_id)
            .map(|p| p.parts.into_iter().flatten().flatten().collect::<Vec<u8>>());
        Ok(done)
    }

    /// Drop partial messages older than the reassembly timeout; returns how many.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.partial.len();
        let timeout = self.timeout;
        self.partial.retain(|_, p| now - p.started_at < timeout);
        before - self.partial.len()
    }
}
