//! Request/response contract for the optical bench around the detectors.
//!
//! Calibration workflows drive an attenuator, a tunable laser and a power
//! meter alongside the WebSQ system. Those drivers live outside this crate;
//! they only need to set and read named physical quantities, which is what
//! [`Instrument`] describes.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// Physical quantity addressed on an external instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Attenuation in dB
    Attenuation,
    /// Laser wavelength in nm
    Wavelength,
    /// Optical power in W
    OpticalPower,
}

impl Quantity {
    /// Unit the value is expressed in.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Attenuation => "dB",
            Self::Wavelength => "nm",
            Self::OpticalPower => "W",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attenuation => "attenuation",
            Self::Wavelength => "wavelength",
            Self::OpticalPower => "optical power",
        };
        write!(f, "{name} [{}]", self.unit())
    }
}

/// An external instrument that can set and report physical quantities.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Human readable instrument name
    fn name(&self) -> &str;

    /// Set `quantity` to `value`.
    async fn set(&self, quantity: Quantity, value: f64) -> Result<()>;

    /// Read the current value of `quantity`.
    async fn get(&self, quantity: Quantity) -> Result<f64>;
}
