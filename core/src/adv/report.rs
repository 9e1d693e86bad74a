//! LE Advertising Report decoding
//!
//! Parameters of the LE Advertising Report sub-event:
//! `[num_reports]` followed by each report as
//! `[event_type][addr_type][addr:6][data_len][data:data_len][rssi]`.

use super::ad_structure::AdStructures;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Report event type of non-connectable undirected advertising
pub const REPORT_TYPE_NONCONN_IND: u8 = 0x03;

/// Channel reported for every received field; the controller does not say
pub const RX_CHANNEL: u8 = 7;

const REPORT_HEADER_LEN: usize = 9;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Advertising report event is empty")]
    Empty,

    #[error("Malformed advertising report {index}: need {needed} bytes, have {available}")]
    MalformedReport {
        index: usize,
        needed: usize,
        available: usize,
    },
}

/// Metadata delivered with every received field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvInfo {
    pub instant: u32,
    pub addr: [u8; 6],
    pub addr_type: u8,
    pub channel: u8,
    pub rssi: i8,
}

impl fmt::Display for RecvInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Addresses travel little endian; print them the usual way round
        let addr: Vec<String> = self.addr.iter().rev().map(|b| format!("{:02X}", b)).collect();
        write!(
            f,
            "{} rssi {} ch {} @{}",
            addr.join(":"),
            self.rssi,
            self.channel,
            self.instant
        )
    }
}

/// One report of an LE Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport<'a> {
    pub event_type: u8,
    pub addr_type: u8,
    pub addr: [u8; 6],
    pub data: &'a [u8],
    pub rssi: i8,
}

impl<'a> AdvReport<'a> {
    pub fn fields(&self) -> AdStructures<'a> {
        AdStructures::new(self.data)
    }
}

/// A decoded AD structure (`type` + payload) with its reception metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvField {
    pub info: RecvInfo,
    pub data: Vec<u8>,
}

/// Split an LE Advertising Report event into its reports. Any report that
/// does not fit in the buffer invalidates the whole event.
pub fn parse_reports(params: &[u8]) -> Result<Vec<AdvReport<'_>>, DecodeError> {
    let (&num_reports, mut rest) = params.split_first().ok_or(DecodeError::Empty)?;

    let mut reports = Vec::with_capacity(num_reports as usize);
    for index in 0..num_reports as usize {
        if rest.len() < REPORT_HEADER_LEN {
            return Err(DecodeError::MalformedReport {
                index,
                needed: REPORT_HEADER_LEN,
                available: rest.len(),
            });
        }
        let data_len = rest[8] as usize;
        let needed = REPORT_HEADER_LEN + data_len + 1;
        if rest.len() < needed {
            return Err(DecodeError::MalformedReport {
                index,
                needed,
                available: rest.len(),
            });
        }

        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        reports.push(AdvReport {
            event_type: rest[0],
            addr_type: rest[1],
            addr,
            data: &rest[REPORT_HEADER_LEN..REPORT_HEADER_LEN + data_len],
            rssi: rest[REPORT_HEADER_LEN + data_len] as i8,
        });
        rest = &rest[needed..];
    }

    Ok(reports)
}

/// Decode the mesh-relevant fields of an LE Advertising Report event.
/// Only non-connectable undirected reports are considered.
pub fn decode_adv_report(params: &[u8], instant: u32) -> Result<Vec<RecvField>, DecodeError> {
    let mut out = Vec::new();
    for report in parse_reports(params)? {
        if report.event_type != REPORT_TYPE_NONCONN_IND {
            trace!("Skipping advertising report type {:#04x}", report.event_type);
            continue;
        }
        let info = RecvInfo {
            instant,
            addr: report.addr,
            addr_type: report.addr_type,
            channel: RX_CHANNEL,
            rssi: report.rssi,
        };
        out.extend(report.fields().map(|field| RecvField {
            info,
            data: field.as_bytes().to_vec(),
        }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(event_type: u8, data: &[u8], rssi: i8) -> Vec<u8> {
        let mut out = vec![event_type, 0x01, 1, 2, 3, 4, 5, 6, data.len() as u8];
        out.extend_from_slice(data);
        out.push(rssi as u8);
        out
    }

    fn event(reports: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![reports.len() as u8];
        for r in reports {
            out.extend_from_slice(r);
        }
        out
    }

    #[test]
    fn test_decode_single_report() {
        let params = event(&[report(0x03, &[0x03, 0x2b, 0x00, 0x01, 0x02, 0x2a, 0xff], -60)]);
        let fields = decode_adv_report(&params, 1000).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].data, vec![0x2b, 0x00, 0x01]);
        assert_eq!(fields[1].data, vec![0x2a, 0xff]);
        assert_eq!(fields[0].info.rssi, -60);
        assert_eq!(fields[0].info.channel, RX_CHANNEL);
        assert_eq!(fields[0].info.instant, 1000);
        assert_eq!(fields[0].info.addr, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_other_event_types_are_ignored() {
        let params = event(&[report(0x00, &[0x02, 0x2a, 0x01], -50)]);
        assert!(decode_adv_report(&params, 0).unwrap().is_empty());
    }

    #[test]
    fn test_multiple_reports_decoded_back_to_back() {
        let params = event(&[
            report(0x03, &[0x02, 0x2a, 0x01], -10),
            report(0x04, &[0x02, 0x2a, 0x02], -20),
            report(0x03, &[0x02, 0x2b, 0x03], -30),
        ]);
        let fields = decode_adv_report(&params, 5).unwrap();
        let rssi: Vec<i8> = fields.iter().map(|f| f.info.rssi).collect();
        assert_eq!(rssi, vec![-10, -30]);
    }

    #[test]
    fn test_truncated_report_produces_nothing() {
        let mut params = event(&[report(0x03, &[0x02, 0x2a, 0x01], -10)]);
        params.pop(); // drop rssi
        assert!(matches!(
            decode_adv_report(&params, 0),
            Err(DecodeError::MalformedReport { index: 0, .. })
        ));

        assert_eq!(decode_adv_report(&[], 0), Err(DecodeError::Empty));
        assert!(decode_adv_report(&[1, 0x03, 0x01], 0).is_err());
    }

    #[test]
    fn test_second_report_malformed_drops_event() {
        let mut params = event(&[
            report(0x03, &[0x02, 0x2a, 0x01], -10),
            report(0x03, &[0x02, 0x2a, 0x02], -20),
        ]);
        params.truncate(params.len() - 3);
        assert!(decode_adv_report(&params, 0).is_err());
    }

    #[test]
    fn test_recv_info_display() {
        let info = RecvInfo {
            instant: 12,
            addr: [0x06, 0x05, 0x04, 0x03, 0x02, 0xc1],
            addr_type: 1,
            channel: 7,
            rssi: -42,
        };
        assert_eq!(info.to_string(), "C1:02:03:04:05:06 rssi -42 ch 7 @12");
    }
}
