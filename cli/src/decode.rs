// Decoding of LE Advertising Report events given as hex

use anyhow::{Context, Result};
use meshio_core::adv::{parse_reports, report::REPORT_TYPE_NONCONN_IND};
use meshio_core::hci::event::{H4_EVENT_PKT, EVT_LE_META, LE_SUBEVT_ADV_REPORT};
use meshio_core::hci::HciEvent;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DecodedReport {
    pub event_type: u8,
    pub addr_type: u8,
    pub addr: String,
    pub rssi: i8,
    /// Only non-connectable reports reach mesh receivers
    pub delivered: bool,
    pub fields: Vec<DecodedField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedField {
    pub ad_type: u8,
    pub name: &'static str,
    pub payload: String,
}

pub fn ad_type_name(ad_type: u8) -> &'static str {
    match ad_type {
        0x01 => "Flags",
        0x08 => "Shortened Local Name",
        0x09 => "Complete Local Name",
        0x16 => "Service Data",
        0x29 => "Mesh Provisioning",
        0x2a => "Mesh Message",
        0x2b => "Mesh Beacon",
        0xff => "Manufacturer Specific",
        _ => "Other",
    }
}

/// Decode a full LE Meta event (optionally H4 framed) or bare report
/// parameters starting with the report count
pub fn decode_hex(input: &str) -> Result<Vec<DecodedReport>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(&cleaned).context("Input is not valid hex")?;

    let params = match bytes.first() {
        Some(&H4_EVENT_PKT) | Some(&EVT_LE_META) => match HciEvent::parse(&bytes)? {
            HciEvent::LeMeta { subevent, params } if subevent == LE_SUBEVT_ADV_REPORT => params,
            other => anyhow::bail!("Not an LE Advertising Report event: {:?}", other),
        },
        _ => bytes,
    };

    let reports = parse_reports(&params)?;
    Ok(reports
        .iter()
        .map(|report| {
            let mut addr = report.addr;
            addr.reverse();
            DecodedReport {
                event_type: report.event_type,
                addr_type: report.addr_type,
                addr: addr
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(":"),
                rssi: report.rssi,
                delivered: report.event_type == REPORT_TYPE_NONCONN_IND,
                fields: report
                    .fields()
                    .map(|field| DecodedField {
                        ad_type: field.ad_type(),
                        name: ad_type_name(field.ad_type()),
                        payload: hex::encode(field.payload()),
                    })
                    .collect(),
            }
        })
        .collect())
}
