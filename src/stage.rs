//! Serial client for the GRBL stage controller

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::{debug, info, instrument};

use crate::error::StageError;
use crate::StageConfig;

/// A serial port and the text it describes itself with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub description: String,
}

/// First candidate whose description contains any keyword, ignoring case.
pub fn match_port<'a>(candidates: &'a [PortCandidate], keywords: &[String]) -> Option<&'a PortCandidate> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    candidates.iter().find(|c| {
        let description = c.description.to_lowercase();
        keywords
            .iter()
            .any(|k| !k.is_empty() && description.contains(k.as_str()))
    })
}

/// Lists serial ports with product and manufacturer strings for USB ports.
pub fn list_ports() -> Result<Vec<PortCandidate>, StageError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match &port.port_type {
                SerialPortType::UsbPort(usb) => [usb.product.as_deref(), usb.manufacturer.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => String::new(),
            };
            PortCandidate {
                name: port.port_name,
                description,
            }
        })
        .collect())
}

pub fn discover_port(keywords: &[String]) -> Result<String, StageError> {
    let candidates = list_ports()?;
    for c in &candidates {
        debug!("Serial port {}: {:?}", c.name, c.description);
    }
    match_port(&candidates, keywords)
        .map(|c| c.name.clone())
        .ok_or_else(|| StageError::PortNotFound {
            keywords: keywords.to_vec(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Axis plus sign, written as `x+`, `y-` and so on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct JogDirection {
    pub axis: Axis,
    pub positive: bool,
}

impl FromStr for JogDirection {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let mut chars = lower.chars();
        let (Some(axis), Some(sign), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(StageError::InvalidJog(format!("bad direction {:?}", s)));
        };
        let axis = match axis {
            'x' => Axis::X,
            'y' => Axis::Y,
            'z' => Axis::Z,
            _ => return Err(StageError::InvalidJog(format!("bad axis in {:?}", s))),
        };
        let positive = match sign {
            '+' => true,
            '-' => false,
            _ => return Err(StageError::InvalidJog(format!("bad sign in {:?}", s))),
        };
        Ok(Self { axis, positive })
    }
}

impl TryFrom<String> for JogDirection {
    type Error = StageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for JogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}", self.axis, if self.positive { '+' } else { '-' })
    }
}

/// Relative metric jog, e.g. `$J=G91 G21 X-0.5 F1000\n`
pub fn jog_command(direction: JogDirection, step_mm: f64, feed: f64) -> Result<String, StageError> {
    if !step_mm.is_finite() || step_mm <= 0.0 {
        return Err(StageError::InvalidJog(format!("step must be positive, got {}", step_mm)));
    }
    if !feed.is_finite() || feed <= 0.0 {
        return Err(StageError::InvalidJog(format!("feed must be positive, got {}", feed)));
    }
    let step = if direction.positive { step_mm } else { -step_mm };
    Ok(format!("$J=G91 G21 {:?}{} F{}\n", direction.axis, step, feed))
}

/// Write-only connection to the motion controller
pub struct StageClient {
    port_name: String,
    port: Mutex<Box<dyn Write + Send>>,
}

impl StageClient {
    /// Opens the configured port, or the first port matching the keywords.
    #[instrument(skip_all)]
    pub fn connect(config: &StageConfig) -> Result<Self, StageError> {
        let port_name = match &config.port {
            Some(port) => port.clone(),
            None => discover_port(&config.port_keywords)?,
        };
        let port = serialport::new(&port_name, config.baud_rate)
            .timeout(config.timeout())
            .open()?;
        info!("Stage connected on {} at {} baud", port_name, config.baud_rate);
        Ok(Self::from_writer(port_name, port))
    }

    pub fn from_writer(port_name: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            port_name: port_name.into(),
            port: Mutex::new(Box::new(writer)),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Writes raw bytes to the controller.
    pub fn send(&self, bytes: &[u8]) -> Result<(), StageError> {
        let mut port = self.lock();
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    pub fn jog(&self, direction: JogDirection, step_mm: f64, feed: f64) -> Result<(), StageError> {
        let command = jog_command(direction, step_mm, feed)?;
        debug!("Jog {}: {}", direction, command.trim_end());
        self.send(command.as_bytes())
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.port.lock().unwrap_or_else(|e| e.into_inner())
    }
}
