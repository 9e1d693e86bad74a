//! AD structure encoding and walking
//!
//! Advertising data is a sequence of `[length][type][payload]` structures
//! where `length` counts the type byte and the payload.

use thiserror::Error;

/// Mesh Provisioning bearer (PB-ADV)
pub const MESH_AD_TYPE_PROVISION: u8 = 0x29;
/// Mesh Network PDU
pub const MESH_AD_TYPE_NETWORK: u8 = 0x2a;
/// Mesh Beacon
pub const MESH_AD_TYPE_BEACON: u8 = 0x2b;

/// Whether an AD type is carried by the mesh advertising bearer
pub fn is_mesh_ad_type(ad_type: u8) -> bool {
    (MESH_AD_TYPE_PROVISION..=MESH_AD_TYPE_BEACON).contains(&ad_type)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdError {
    #[error("AD payload too long: {0} bytes (max 254)")]
    PayloadTooLong(usize),
}

/// Append one AD structure
pub fn encode_ad_structure(ad_type: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<(), AdError> {
    if payload.len() > u8::MAX as usize - 1 {
        return Err(AdError::PayloadTooLong(payload.len()));
    }
    out.push(payload.len() as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(payload);
    Ok(())
}

/// Encode a list of `(type, payload)` pairs back to back
pub fn encode_ad_structures(fields: &[(u8, &[u8])]) -> Result<Vec<u8>, AdError> {
    let mut out = Vec::new();
    for (ad_type, payload) in fields {
        encode_ad_structure(*ad_type, payload, &mut out)?;
    }
    Ok(out)
}

/// One AD structure borrowed from advertising data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdField<'a> {
    raw: &'a [u8],
}

impl<'a> AdField<'a> {
    pub fn ad_type(&self) -> u8 {
        self.raw[0]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.raw[1..]
    }

    /// Type byte followed by the payload; this is what receivers see
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

/// Iterator over the AD structures of advertising data.
///
/// Stops at a zero length byte, or before a structure whose declared length
/// runs past the end of the data.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = AdField<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 1 >= self.data.len() {
            return None;
        }
        let field_len = self.data[self.pos] as usize;
        if field_len == 0 {
            self.pos = self.data.len();
            return None;
        }
        let start = self.pos + 1;
        let end = start + field_len;
        if end > self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = end;
        Some(AdField {
            raw: &self.data[start..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_and_walk() {
        let data = encode_ad_structures(&[(0x2b, b"abc"), (0x16, b"")]).unwrap();
        assert_eq!(data, vec![0x04, 0x2b, b'a', b'b', b'c', 0x01, 0x16]);

        let fields: Vec<_> = AdStructures::new(&data).collect();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].ad_type(), 0x2b);
        assert_eq!(fields[0].payload(), b"abc");
        assert_eq!(fields[1].ad_type(), 0x16);
        assert!(fields[1].payload().is_empty());
    }

    #[test]
    fn test_walk_stops_at_zero_length() {
        let data = [0x02, 0x2a, 0x01, 0x00, 0x02, 0x2b, 0x02];
        let fields: Vec<_> = AdStructures::new(&data).map(|f| f.as_bytes().to_vec()).collect();
        assert_eq!(fields, vec![vec![0x2a, 0x01]]);
    }

    #[test]
    fn test_walk_stops_before_overlong_field() {
        let data = [0x02, 0x2a, 0x01, 0x09, 0x2b, 0x02];
        let fields: Vec<_> = AdStructures::new(&data).collect();
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_walk_ignores_trailing_byte() {
        let data = [0x02, 0x2a, 0x01, 0x05];
        assert_eq!(AdStructures::new(&data).count(), 1);
        assert_eq!(AdStructures::new(&[]).count(), 0);
        assert_eq!(AdStructures::new(&[0x01]).count(), 0);
    }

    #[test]
    fn test_mesh_ad_types() {
        assert!(is_mesh_ad_type(MESH_AD_TYPE_PROVISION));
        assert!(is_mesh_ad_type(MESH_AD_TYPE_NETWORK));
        assert!(is_mesh_ad_type(MESH_AD_TYPE_BEACON));
        assert!(!is_mesh_ad_type(0x28));
        assert!(!is_mesh_ad_type(0x2c));
        assert!(!is_mesh_ad_type(0x16));
    }

    #[test]
    fn test_payload_too_long() {
        let mut out = Vec::new();
        assert_eq!(
            encode_ad_structure(0x2a, &[0u8; 255], &mut out),
            Err(AdError::PayloadTooLong(255))
        );
        assert!(encode_ad_structure(0x2a, &[0u8; 254], &mut out).is_ok());
    }
}
