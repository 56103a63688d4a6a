//! Minimal DNS client messages
//!
//! Just enough of RFC 1035 to ask a resolver for an A record through a
//! userspace stack and read the first address back.

use std::net::Ipv4Addr;

const FLAG_RECURSION_DESIRED: u8 = 0x01;
const FLAG_RESPONSE: u8 = 0x80;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// A/IN query for `name`, or `None` if the name is not encodable
pub(crate) fn build_query(id: u16, name: &str) -> Option<Vec<u8>> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return None;
    }

    let mut query = Vec::with_capacity(18 + name.len());
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&[FLAG_RECURSION_DESIRED, 0x00]);
    // One question, no answer/authority/additional records
    query.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&TYPE_A.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());

    Some(query)
}

/// First A record in a successful response to query `id`
pub(crate) fn first_address(id: u16, message: &[u8]) -> Option<Ipv4Addr> {
    let header = message.get(..12)?;
    if u16::from_be_bytes([header[0], header[1]]) != id {
        return None;
    }
    if header[2] & FLAG_RESPONSE == 0 || header[3] & 0x0f != 0 {
        return None;
    }

    let questions = u16::from_be_bytes([header[4], header[5]]);
    let answers = u16::from_be_bytes([header[6], header[7]]);

    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(message, pos)? + 4;
    }

    for _ in 0..answers {
        pos = skip_name(message, pos)?;
        let record = message.get(pos..pos + 10)?;
        let rtype = u16::from_be_bytes([record[0], record[1]]);
        let length = u16::from_be_bytes([record[8], record[9]]) as usize;
        let data = message.get(pos + 10..pos + 10 + length)?;

        if rtype == TYPE_A && length == 4 {
            return Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
        }
        pos += 10 + length;
    }

    None
}

/// Offset just past the (possibly compressed) name at `pos`
fn skip_name(message: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *message.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            message.get(pos + 1)?;
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}
