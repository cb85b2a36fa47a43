//! Request/response contract of the heating controller.
//!
//! Every call is one half-duplex exchange over the serial link; callers must
//! hold the [`crate::gate::DeviceGate`] while talking to the device.

pub mod serial;

use crate::models::device::*;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Serial open/read/write failure. Fatal for the current operation.
    Transport(String),
    /// Recoverable protocol condition (value out of range, skip item, no update).
    Warning { code: i32, message: String },
    /// Response frame could not be understood. Treated like a transport failure.
    Protocol(String),
}

impl DeviceError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeviceError::Warning { .. })
    }
}

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceError::Transport(s) => write!(f, "transport error: {}", s),
            DeviceError::Warning { code, message } => write!(f, "device warning {}: {}", code, message),
            DeviceError::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(value: std::io::Error) -> Self {
        DeviceError::Transport(value.to_string())
    }
}

/// Enumerations return `Ok(None)` once the device reports the "last" sentinel.
pub trait DeviceProtocol {
    fn open(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    fn check(&mut self) -> Result<(), DeviceError>;
    fn get_status(&mut self) -> Result<DeviceStatus, DeviceError>;
    /// Raw (unscaled) measured value.
    fn get_value(&mut self, address: i32) -> Result<i32, DeviceError>;
    fn get_digital_in(&mut self, address: i32) -> Result<IoValue, DeviceError>;
    fn get_digital_out(&mut self, address: i32) -> Result<IoValue, DeviceError>;
    fn get_analog_out(&mut self, address: i32) -> Result<IoValue, DeviceError>;
    fn get_parameter(&mut self, address: i32) -> Result<ConfigParameter, DeviceError>;
    /// Writes `parameter.value`; returns the parameter as the device stored it.
    fn set_parameter(&mut self, parameter: &ConfigParameter) -> Result<ConfigParameter, DeviceError>;
    fn sync_time(&mut self) -> Result<(), DeviceError>;

    fn first_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError>;
    fn next_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError>;
    fn first_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError>;
    fn next_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError>;
    fn first_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError>;
    fn next_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError>;
    fn first_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError>;
    fn next_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError>;
}

type Step<D, T> = fn(&mut D) -> Result<Option<T>, DeviceError>;

/// Walks a `first_*`/`next_*` enumeration to the end.
///
/// Warnings skip the current item and continue with the next one; a fatal
/// error aborts the walk.
pub fn collect_all<D, T>(device: &mut D, first: Step<D, T>, next: Step<D, T>) -> Result<Vec<T>, DeviceError>
where
    D: DeviceProtocol + ?Sized,
{
    let mut items = Vec::new();
    let mut step = first(device);
    loop {
        match step {
            Ok(Some(item)) => items.push(item),
            Ok(None) => return Ok(items),
            Err(DeviceError::Warning { code, message }) => {
                log::debug!("Enumeration: skipping item (warning {}: {})", code, message);
            }
            Err(e) => return Err(e),
        }
        step = next(device);
    }
}
