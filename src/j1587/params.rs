//! J1587 parameter (PID) parsing.
//!
//! J1587 encodes the length of a parameter's value in the PID number itself: PIDs 0-127
//! carry one data byte, PIDs 128-191 two data bytes, and PIDs 192-253 a variable length
//! region preceded by a count byte. Data byte 255 is the page escape: every PID that
//! follows it is on the second parameter page (PID + 256).

use crate::j1587::error::Error;
use strum_macros::FromRepr;

/// Well-known J1587 device classes, keyed by MID. Messages from these MIDs get their data
/// region parsed into parameters; all other MIDs pass through unparsed.
#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceClass {
    Engine = 128,
    TurbochargerUnit = 129,
    Transmission = 130,
    PowerTakeoff = 131,
    AxlePowerUnit = 132,
    Brakes = 136,
    BrakesTrailer1 = 137,
    InstrumentCluster = 140,
    VehicleManagementSystem = 142,
    FuelSystem = 143,
    CabClimateControl = 146,
    VehicleSecurity = 150,
    Suspension = 152,
    DiagnosticSystem = 172,
    OffBoardDiagnostics = 248,
}

/// A single decoded J1587 parameter.
#[derive(Clone, PartialEq, Debug)]
pub struct Parameter {
    /// Parameter identifier. Values above 255 are second-page PIDs.
    pub pid: u16,
    pub data: Vec<u8>,
}

/// Whether the data region of frames from this MID follows the J1587 parameter encoding.
pub fn is_parameter_mid(mid: u8) -> bool {
    DeviceClass::from_repr(mid).is_some()
}

/// Split a J1587 data region into parameters.
///
/// Fails with [`Error::TruncatedParameter`] when a parameter announces more value bytes
/// than the region holds.
pub fn parse_parameters(data: &[u8]) -> Result<Vec<Parameter>, Error> {
    let mut parameters = Vec::new();
    let mut page: u16 = 0;
    let mut rest = data;

    while let Some((&pid_byte, tail)) = rest.split_first() {
        if pid_byte == 255 {
            page = 256;
            rest = tail;
            continue;
        }

        let pid = page + pid_byte as u16;
        let value_len = match pid_byte {
            0..=127 => 1,
            128..=191 => 2,
            _ => *tail.first().ok_or(Error::TruncatedParameter)? as usize,
        };

        // Variable length parameters spend one extra byte on the count
        let skip = if pid_byte >= 192 { 1 } else { 0 };
        if tail.len() < skip + value_len {
            return Err(Error::TruncatedParameter);
        }

        parameters.push(Parameter {
            pid,
            data: tail[skip..skip + value_len].to_vec(),
        });
        rest = &tail[skip + value_len..];
    }

    Ok(parameters)
}
