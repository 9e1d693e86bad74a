//! Advertising data: AD structures and LE Advertising Report decoding

pub mod ad_structure;
pub mod report;

pub use ad_structure::{
    encode_ad_structure, encode_ad_structures, is_mesh_ad_type, AdError, AdField, AdStructures,
    MESH_AD_TYPE_BEACON, MESH_AD_TYPE_NETWORK, MESH_AD_TYPE_PROVISION,
};
pub use report::{decode_adv_report, parse_reports, AdvReport, DecodeError, RecvField, RecvInfo};
