use crate::error::BusError;

/// Bus interface of one string.
///
/// Implementations perform a single blocking transfer per call. Chip select
/// and isoSPI timing are the implementation's concern.
pub trait BusTransport {
    /// Transmits a frame and ignores what comes back.
    fn transmit_command(&mut self, frame: &[u8]) -> Result<(), BusError>;

    /// Transmits `frame` and fills `rx`, which has the same length.
    fn transmit_receive(&mut self, frame: &[u8], rx: &mut [u8]) -> Result<(), BusError>;

    /// Wakes up every device of the chain.
    fn transmit_wake_up(&mut self) -> Result<(), BusError>;

    /// Transmits STCOMM followed by the clock bytes for the I2C bridge.
    fn transmit_i2c_bridge_clock(&mut self, strobe: &[u8]) -> Result<(), BusError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn transmit_command(&mut self, frame: &[u8]) -> Result<(), BusError> {
        (**self).transmit_command(frame)
    }

    fn transmit_receive(&mut self, frame: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        (**self).transmit_receive(frame, rx)
    }

    fn transmit_wake_up(&mut self) -> Result<(), BusError> {
        (**self).transmit_wake_up()
    }

    fn transmit_i2c_bridge_clock(&mut self, strobe: &[u8]) -> Result<(), BusError> {
        (**self).transmit_i2c_bridge_clock(strobe)
    }
}
