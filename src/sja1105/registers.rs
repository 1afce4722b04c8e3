//! Register-level operations on the SJA1105 PTP/Qbv block. The original
//! implementation of this surface lived in a vendor register library
//! outside this codebase; only its interface is reproduced here, against a
//! small fixed-layout SPI read/write encoding.

use super::spi::SpiDevice;
use crate::error::ClockError;

const CMD_READ: u8 = 0x00;
const CMD_WRITE: u8 = 0x40;

const REG_PTP_CLK_VAL: u32 = 0x18;
const REG_PTP_CLK_RATE: u32 = 0x1B;
const REG_PTP_CLK_ADD: u32 = 0x1C;
const REG_RESET_CTRL: u32 = 0x04;
const REG_QBV_CTRL: u32 = 0x30;
const REG_QBV_START_TIME: u32 = 0x31;
const REG_QBV_CYCLE_TIME: u32 = 0x33;
const REG_QBV_STATUS: u32 = 0x35;

pub trait Sja1105Registers {
    fn ptp_clk_get(&self) -> Result<(i64, u32), ClockError>;
    fn ptp_clk_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError>;
    fn ptp_clk_add(&mut self, delta_ns: i64) -> Result<(), ClockError>;
    fn ptp_rate_set(&mut self, ratio_scaled: u32) -> Result<(), ClockError>;
    fn reset(&mut self) -> Result<(), ClockError>;
    fn qbv_start(&mut self) -> Result<(), ClockError>;
    fn qbv_stop(&mut self) -> Result<(), ClockError>;
    fn qbv_running(&self) -> Result<bool, ClockError>;
    fn qbv_start_time_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError>;
    fn qbv_cycle_time_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError>;
}

pub struct Sja1105Spi {
    spi: SpiDevice,
}

impl Sja1105Spi {
    pub fn new(spi: SpiDevice) -> Self {
        Self { spi }
    }

    fn read_reg(&self, addr: u32, len: usize) -> Result<Vec<u8>, ClockError> {
        let mut tx = vec![0u8; 4 + len];
        tx[0] = CMD_READ;
        tx[1..4].copy_from_slice(&addr.to_be_bytes()[1..]);
        let rx = self.spi.transfer(&tx)?;
        Ok(rx[4..].to_vec())
    }

    fn write_reg(&mut self, addr: u32, data: &[u8]) -> Result<(), ClockError> {
        let mut tx = vec![0u8; 4 + data.len()];
        tx[0] = CMD_WRITE;
        tx[1..4].copy_from_slice(&addr.to_be_bytes()[1..]);
        tx[4..].copy_from_slice(data);
        self.spi.transfer(&tx)?;
        Ok(())
    }
}

impl Sja1105Registers for Sja1105Spi {
    fn ptp_clk_get(&self) -> Result<(i64, u32), ClockError> {
        let raw = self.read_reg(REG_PTP_CLK_VAL, 12)?;
        let sec = i64::from_be_bytes(raw[0..8].try_into().unwrap());
        let nsec = u32::from_be_bytes(raw[8..12].try_into().unwrap());
        Ok((sec, nsec))
    }

    fn ptp_clk_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError> {
        let mut data = [0u8; 12];
        data[0..8].copy_from_slice(&sec.to_be_bytes());
        data[8..12].copy_from_slice(&nsec.to_be_bytes());
        self.write_reg(REG_PTP_CLK_VAL, &data)
    }

    fn ptp_clk_add(&mut self, delta_ns: i64) -> Result<(), ClockError> {
        self.write_reg(REG_PTP_CLK_ADD, &delta_ns.to_be_bytes())
    }

    fn ptp_rate_set(&mut self, ratio_scaled: u32) -> Result<(), ClockError> {
        self.write_reg(REG_PTP_CLK_RATE, &ratio_scaled.to_be_bytes())
    }

    fn reset(&mut self) -> Result<(), ClockError> {
        self.write_reg(REG_RESET_CTRL, &[0x01])
    }

    fn qbv_start(&mut self) -> Result<(), ClockError> {
        self.write_reg(REG_QBV_CTRL, &[0x01])
    }

    fn qbv_stop(&mut self) -> Result<(), ClockError> {
        self.write_reg(REG_QBV_CTRL, &[0x00])
    }

    fn qbv_running(&self) -> Result<bool, ClockError> {
        let raw = self.read_reg(REG_QBV_STATUS, 1)?;
        Ok(raw[0] & 0x01 != 0)
    }

    fn qbv_start_time_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError> {
        let mut data = [0u8; 12];
        data[0..8].copy_from_slice(&sec.to_be_bytes());
        data[8..12].copy_from_slice(&nsec.to_be_bytes());
        self.write_reg(REG_QBV_START_TIME, &data)
    }

    fn qbv_cycle_time_set(&mut self, sec: i64, nsec: u32) -> Result<(), ClockError> {
        let mut data = [0u8; 12];
        data[0..8].copy_from_slice(&sec.to_be_bytes());
        data[8..12].copy_from_slice(&nsec.to_be_bytes());
        self.write_reg(REG_QBV_CYCLE_TIME, &data)
    }
}
