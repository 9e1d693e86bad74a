//! HCI event parsing
//!
//! Events arrive without the H4 indicator byte: `[code][param_len][params]`.

use thiserror::Error;

pub const EVT_COMMAND_COMPLETE: u8 = 0x0e;
pub const EVT_COMMAND_STATUS: u8 = 0x0f;
pub const EVT_LE_META: u8 = 0x3e;

/// LE Meta sub-event carrying legacy advertising reports
pub const LE_SUBEVT_ADV_REPORT: u8 = 0x02;

/// H4 packet indicator for HCI events
pub const H4_EVENT_PKT: u8 = 0x04;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Event truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Parameter length {declared} exceeds buffer ({available} bytes)")]
    LengthMismatch { declared: usize, available: usize },
}

/// A parsed controller event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    /// Command finished; `return_params[0]` is the status for every command we issue
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_params: Vec<u8>,
    },
    /// Command accepted (or rejected) for asynchronous processing
    CommandStatus {
        status: u8,
        num_packets: u8,
        opcode: u16,
    },
    LeMeta { subevent: u8, params: Vec<u8> },
    Other { code: u8, params: Vec<u8> },
}

impl HciEvent {
    /// Parse one event. A leading H4 event indicator is tolerated.
    pub fn parse(buf: &[u8]) -> Result<Self, EventError> {
        let buf = match buf {
            [H4_EVENT_PKT, rest @ ..] if rest.len() >= 2 && rest[1] as usize == rest.len() - 2 => rest,
            _ => buf,
        };

        if buf.len() < 2 {
            return Err(EventError::Truncated {
                needed: 2,
                available: buf.len(),
            });
        }

        let code = buf[0];
        let declared = buf[1] as usize;
        let params = &buf[2..];
        if declared > params.len() {
            return Err(EventError::LengthMismatch {
                declared,
                available: params.len(),
            });
        }
        let params = &params[..declared];

        match code {
            EVT_COMMAND_COMPLETE => {
                if params.len() < 3 {
                    return Err(EventError::Truncated {
                        needed: 3,
                        available: params.len(),
                    });
                }
                Ok(HciEvent::CommandComplete {
                    num_packets: params[0],
                    opcode: u16::from_le_bytes([params[1], params[2]]),
                    return_params: params[3..].to_vec(),
                })
            }
            EVT_COMMAND_STATUS => {
                if params.len() < 4 {
                    return Err(EventError::Truncated {
                        needed: 4,
                        available: params.len(),
                    });
                }
                Ok(HciEvent::CommandStatus {
                    status: params[0],
                    num_packets: params[1],
                    opcode: u16::from_le_bytes([params[2], params[3]]),
                })
            }
            EVT_LE_META => {
                let (subevent, rest) = params.split_first().ok_or(EventError::Truncated {
                    needed: 1,
                    available: 0,
                })?;
                Ok(HciEvent::LeMeta {
                    subevent: *subevent,
                    params: rest.to_vec(),
                })
            }
            _ => Ok(HciEvent::Other {
                code,
                params: params.to_vec(),
            }),
        }
    }

    /// Status byte of a Command Complete; commands without return parameters report success
    pub fn status(&self) -> Option<u8> {
        match self {
            HciEvent::CommandComplete { return_params, .. } => {
                Some(return_params.first().copied().unwrap_or(0))
            }
            HciEvent::CommandStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Serialize a Command Complete event (used by the virtual controller)
    pub fn command_complete(opcode: u16, status: u8) -> Vec<u8> {
        let op = opcode.to_le_bytes();
        vec![EVT_COMMAND_COMPLETE, 4, 1, op[0], op[1], status]
    }

    /// Serialize an LE Meta event
    pub fn le_meta(subevent: u8, params: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + params.len());
        out.push(EVT_LE_META);
        out.push((params.len() + 1) as u8);
        out.push(subevent);
        out.extend_from_slice(params);
        out
    }
}
