//! Serial client for the controller bridge.
//!
//! - Blocking I/O via `serialport`, one request line out, one reply line in.
//! - Frames are JSON objects; the controller's proprietary byte codec runs on
//!   the adapter at the far end of the link.
//! - Every exchange is bounded by the configured port timeout.
//!
//! Reply shape: `{"status":"ok","data":...}`, `{"status":"warning","code":N}`,
//! `{"status":"last"}` or `{"status":"error","message":"..."}`.

use super::{DeviceError, DeviceProtocol};
use crate::models::device::*;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum Request<'a> {
    Check,
    GetStatus,
    GetValue { address: i32 },
    GetDigitalIn { address: i32 },
    GetDigitalOut { address: i32 },
    GetAnalogOut { address: i32 },
    GetParameter { address: i32 },
    SetParameter { parameter: &'a ConfigParameter },
    SyncTime { time: DateTime<Utc> },
    FirstTimeRanges,
    NextTimeRanges,
    FirstMenuItem,
    NextMenuItem,
    FirstValueSpec,
    NextValueSpec,
    FirstError,
    NextError,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Reply {
    Ok {
        #[serde(default)]
        data: serde_json::Value,
    },
    Warning {
        code: i32,
        #[serde(default)]
        message: String,
    },
    Last,
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Deserialize)]
struct RawValue {
    value: i32,
}

pub struct SerialDevice {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<BufReader<Box<dyn serialport::SerialPort>>>,
}

impl SerialDevice {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        SerialDevice {
            path: path.into(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    fn exchange(&mut self, request: &Request<'_>) -> Result<Reply, DeviceError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| DeviceError::Transport(format!("{} is not open", self.path)))?;

        let mut line = serde_json::to_vec(request).map_err(|e| DeviceError::Protocol(e.to_string()))?;
        line.push(b'\n');
        port.get_mut().write_all(&line)?;
        port.get_mut().flush()?;

        let mut reply = String::new();
        let read = port.read_line(&mut reply)?;
        if read == 0 {
            return Err(DeviceError::Transport("link closed by peer".to_string()));
        }
        log::trace!("Serial: {:?} -> {}", request, reply.trim_end());

        serde_json::from_str(reply.trim_end()).map_err(|e| DeviceError::Protocol(format!("bad reply frame: {}", e)))
    }

    fn call<T: DeserializeOwned>(&mut self, request: Request<'_>) -> Result<Option<T>, DeviceError> {
        match self.exchange(&request)? {
            Reply::Ok { data } => serde_path_to_error::deserialize(data)
                .map(Some)
                .map_err(|e| DeviceError::Protocol(format!("decoding {:?} reply failed at {}", request, e))),
            Reply::Last => Ok(None),
            Reply::Warning { code, message } => Err(DeviceError::Warning { code, message }),
            Reply::Error { message } => Err(DeviceError::Transport(message)),
        }
    }

    fn call_one<T: DeserializeOwned>(&mut self, request: Request<'_>) -> Result<T, DeviceError> {
        self.call(request)?
            .ok_or_else(|| DeviceError::Protocol("unexpected end-of-list reply".to_string()))
    }

    fn call_unit(&mut self, request: Request<'_>) -> Result<(), DeviceError> {
        match self.exchange(&request)? {
            Reply::Ok { .. } | Reply::Last => Ok(()),
            Reply::Warning { code, message } => Err(DeviceError::Warning { code, message }),
            Reply::Error { message } => Err(DeviceError::Transport(message)),
        }
    }
}

impl DeviceProtocol for SerialDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.close();
        let builder = serialport::new(&self.path, self.baud_rate).timeout(self.timeout);
        let failed = |e: serialport::Error| DeviceError::Transport(format!("opening {} failed: {}", self.path, e));
        // The link lock serializes processes; TIOCEXCL would lock out the other one entirely.
        #[cfg(unix)]
        let port: Box<dyn serialport::SerialPort> = {
            let mut native = builder.open_native().map_err(failed)?;
            native.set_exclusive(false).map_err(failed)?;
            Box::new(native)
        };
        #[cfg(not(unix))]
        let port = builder.open().map_err(failed)?;
        self.port = Some(BufReader::new(port));
        log::info!("Opened serial device {} at {} baud", self.path, self.baud_rate);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("Closed serial device {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn check(&mut self) -> Result<(), DeviceError> {
        self.call_unit(Request::Check)
    }

    fn get_status(&mut self) -> Result<DeviceStatus, DeviceError> {
        self.call_one(Request::GetStatus)
    }

    fn get_value(&mut self, address: i32) -> Result<i32, DeviceError> {
        self.call_one::<RawValue>(Request::GetValue { address }).map(|v| v.value)
    }

    fn get_digital_in(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.call_one(Request::GetDigitalIn { address })
    }

    fn get_digital_out(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.call_one(Request::GetDigitalOut { address })
    }

    fn get_analog_out(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.call_one(Request::GetAnalogOut { address })
    }

    fn get_parameter(&mut self, address: i32) -> Result<ConfigParameter, DeviceError> {
        self.call_one(Request::GetParameter { address })
    }

    fn set_parameter(&mut self, parameter: &ConfigParameter) -> Result<ConfigParameter, DeviceError> {
        self.call_one(Request::SetParameter { parameter })
    }

    fn sync_time(&mut self) -> Result<(), DeviceError> {
        self.call_unit(Request::SyncTime { time: Utc::now() })
    }

    fn first_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError> {
        self.call(Request::FirstTimeRanges)
    }

    fn next_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError> {
        self.call(Request::NextTimeRanges)
    }

    fn first_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError> {
        self.call(Request::FirstMenuItem)
    }

    fn next_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError> {
        self.call(Request::NextMenuItem)
    }

    fn first_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError> {
        self.call(Request::FirstValueSpec)
    }

    fn next_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError> {
        self.call(Request::NextValueSpec)
    }

    fn first_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError> {
        self.call(Request::FirstError)
    }

    fn next_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError> {
        self.call(Request::NextError)
    }
}
