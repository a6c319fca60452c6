// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Bus width and speed mode negotiation, and the register reads they need.
//!
//! A negotiation only reprograms the host once the card confirmed the new
//! setting. If any step fails the host keeps its previous (working) width,
//! timing and clock.
//!
//! Switching on MMC cards (and SD high speed) ends with two separate busy
//! waits on CMD13: first until the card has left `Programming`, i.e. the
//! switch was accepted, then until it is back in `Transfer` and ready for
//! data.

use log::debug;

use crate::card::{
    ext_csd, CardMode, CardState, ExtendedCsd, SdConfiguration, SdStatus, LOGICAL_BLOCK_SIZE,
};
use crate::command::{self, acmd, cmd};
use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::{
    BusWidth, Command, DataTransfer, Direction, ResponseType, SdioHost, SpeedMode, TransferMode,
};
use crate::registers::{self, CARD_STATUS};
use crate::sdmmc::SdmmcCard;
use crate::transfer::DATA_TIMEOUT_EXPONENT;

/// CMD13 polls waiting for a switch to be accepted.
pub const SWITCH_ACCEPT_POLLS: u32 = 0xFFFF;
/// CMD13 polls waiting for the card to be ready for data.
pub const READY_FOR_DATA_POLLS: u32 = 0xFFFF;

/// Time allowed for a register data block (SCR, SD Status, EXT_CSD, switch
/// status) to arrive.
const REGISTER_READ_TIMEOUT_MS: u32 = 100;

/// Command class of the SD switch function.
const CLASS_SWITCH: u16 = 10;
/// Length of the SD switch function status block.
const SWITCH_STATUS_LEN: usize = 64;
/// Length of the SD status block.
const SD_STATUS_LEN: usize = 64;

impl<'a, H: SdioHost> SdmmcCard<'a, H> {
    /// Change the data bus width.
    ///
    /// SD cards support 1 and 4 bits (4 only if their SCR says so), MMC
    /// cards 1, 4 and 8 bits (4 and 8 from version 4 on).
    pub fn set_bus_width(&self, width: BusWidth) -> Result<(), ErrorCode> {
        self.begin()?;
        self.ready_info()?;
        self.configure_bus_width(width)
    }

    /// Change the bus timing and reprogram the host clock to match.
    pub fn set_speed_mode(&self, mode: SpeedMode) -> Result<(), ErrorCode> {
        self.begin()?;
        self.ready_info()?;
        self.configure_speed_mode(mode)
    }

    /// Read the 512 bit SD Status with ACMD13.
    pub fn sd_status(&self) -> Result<SdStatus, ErrorCode> {
        self.begin()?;
        let info = self.ready_info()?;
        if info.card_type.mode() != CardMode::Sd {
            return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
        }
        let mut block = [0u8; SD_STATUS_LEN];
        self.read_register(
            Command::with_data(acmd::SD_STATUS, 0, ResponseType::R1),
            Some(info.rca),
            &mut block,
        )?;
        Ok(SdStatus::decode(&block))
    }

    pub(crate) fn configure_bus_width(&self, width: BusWidth) -> Result<(), ErrorCode> {
        let info = self.ready_info()?;
        match info.card_type.mode() {
            CardMode::Sd => {
                let argument = match width {
                    BusWidth::One => 0,
                    BusWidth::Four => 2,
                    BusWidth::Eight => return Err(self.fail(CardErrors::INVALID_PARAMETER)),
                };
                let scr = SdConfiguration::decode(self.read_scr(info.rca)?);
                let supported = match width {
                    BusWidth::One => scr.bus_width_1,
                    _ => scr.bus_width_4,
                };
                if !supported {
                    return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
                }
                self.check(command::app_cmd(self.host, info.rca))?;
                self.check(command::send_r1(
                    self.host,
                    Command::new(acmd::SET_BUS_WIDTH, argument, ResponseType::R1),
                ))?;
            }
            CardMode::Mmc => {
                let value = match width {
                    BusWidth::One => 0,
                    BusWidth::Four => 1,
                    BusWidth::Eight => 2,
                };
                // Cards older than version 4 have no SWITCH and only a 1 bit bus.
                if self.ext_csd.get().is_none() {
                    if width != BusWidth::One {
                        return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
                    }
                } else {
                    self.mmc_switch(info.rca, ext_csd::BUS_WIDTH, value)?;
                }
            }
        }
        self.host.set_bus_width(width);
        debug!("sdmmc: bus width {:?}", width);
        Ok(())
    }

    pub(crate) fn configure_speed_mode(&self, mode: SpeedMode) -> Result<(), ErrorCode> {
        let info = self.ready_info()?;
        let config = self.config.get();
        match info.card_type.mode() {
            CardMode::Sd => {
                let function = match mode {
                    SpeedMode::Default => 0,
                    SpeedMode::High => 1,
                };
                let scr = match self.raw_scr.get() {
                    Some(raw) => raw,
                    None => self.read_scr(info.rca)?,
                };
                if !SdConfiguration::decode(scr).supports_switch()
                    || !info.supports_class(CLASS_SWITCH)
                {
                    return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
                }
                self.sd_switch(info.rca, function)?;
            }
            CardMode::Mmc => {
                let value = match mode {
                    SpeedMode::Default => 0,
                    SpeedMode::High => 1,
                };
                match self.ext_csd.get() {
                    Some(ext) if mode == SpeedMode::Default || ext.supports_high_speed() => {
                        self.mmc_switch(info.rca, ext_csd::HS_TIMING, value)?;
                        let ext = self.read_ext_csd()?;
                        self.ext_csd.set(Some(ext));
                        if ext.hs_timing != value {
                            return Err(self.fail(CardErrors::SWITCH_ERR));
                        }
                    }
                    // Cards before version 4 only know default timing.
                    None if mode == SpeedMode::Default => {}
                    _ => return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE)),
                }
            }
        }
        self.host.set_speed_mode(mode);
        self.host.set_clock_divider(match mode {
            SpeedMode::Default => config.clock_divider,
            SpeedMode::High => config.high_speed_clock_divider,
        });
        debug!("sdmmc: speed mode {:?}", mode);
        Ok(())
    }

    /// Select `function` in SD function group 1 (access mode): first check
    /// the card supports it, then switch and verify the card granted it.
    fn sd_switch(&self, rca: u16, function: u8) -> Result<(), ErrorCode> {
        let mut status = [0u8; SWITCH_STATUS_LEN];

        self.read_register(
            Command::with_data(
                cmd::SWITCH,
                command::sd_switch_argument(false, function),
                ResponseType::R1,
            ),
            None,
            &mut status,
        )?;
        // Bits 415:400, group 1 support.
        let supported = u16::from_be_bytes([status[12], status[13]]);
        if supported & (1 << function) == 0 {
            return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
        }

        self.read_register(
            Command::with_data(
                cmd::SWITCH,
                command::sd_switch_argument(true, function),
                ResponseType::R1,
            ),
            None,
            &mut status,
        )?;
        // Bits 379:376, group 1 selection.
        if status[16] & 0xF != function {
            return Err(self.fail(CardErrors::SWITCH_ERR));
        }
        self.wait_ready_for_data(rca)
    }

    /// Write one EXT_CSD byte with the MMC SWITCH command.
    fn mmc_switch(&self, rca: u16, index: usize, value: u8) -> Result<(), ErrorCode> {
        self.check(command::send_r1(
            self.host,
            Command::new(
                cmd::SWITCH,
                command::mmc_switch_argument(index, value),
                ResponseType::R1b,
            ),
        ))?;
        self.wait_switch_complete(rca)?;
        self.wait_ready_for_data(rca)
    }

    /// Poll until the card has left the programming state of a switch.
    /// A `SWITCH_ERROR` in the status fails the wait.
    pub(crate) fn wait_switch_complete(&self, rca: u16) -> Result<(), ErrorCode> {
        for _ in 0..SWITCH_ACCEPT_POLLS {
            let status = self.check(command::send_status(self.host, rca))?;
            if CardState::from_status(status) != CardState::Programming {
                return Ok(());
            }
        }
        Err(self.fail(CardErrors::BUSY))
    }

    /// Poll until the card is in `Transfer` with `READY_FOR_DATA` set.
    pub(crate) fn wait_ready_for_data(&self, rca: u16) -> Result<(), ErrorCode> {
        for _ in 0..READY_FOR_DATA_POLLS {
            let status = self.check(command::send_status(self.host, rca))?;
            if status.is_set(CARD_STATUS::READY_FOR_DATA)
                && CardState::from_status(status) == CardState::Transfer
            {
                return Ok(());
            }
        }
        Err(self.fail(CardErrors::BUSY))
    }

    /// Read the SCR with ACMD51 and cache it.
    pub(crate) fn read_scr(&self, rca: u16) -> Result<u64, ErrorCode> {
        let mut bytes = [0u8; 8];
        self.read_register(
            Command::with_data(acmd::SEND_SCR, 0, ResponseType::R1),
            Some(rca),
            &mut bytes,
        )?;
        let raw = SdConfiguration::raw_from_bytes(&bytes);
        self.raw_scr.set(Some(raw));
        Ok(raw)
    }

    /// Read the 512 byte MMC extended CSD with CMD8.
    pub(crate) fn read_ext_csd(&self) -> Result<ExtendedCsd, ErrorCode> {
        let mut block = [0u8; LOGICAL_BLOCK_SIZE as usize];
        self.read_register(
            Command::with_data(cmd::SEND_EXT_CSD, 0, ResponseType::R1),
            None,
            &mut block,
        )?;
        Ok(ExtendedCsd::decode(&block))
    }

    /// Read a single data block returned by a register command, polling.
    /// `app_rca` sends the command as an application command for that RCA.
    fn read_register(
        &self,
        command: Command,
        app_rca: Option<u16>,
        dest: &mut [u8],
    ) -> Result<(), ErrorCode> {
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.configure_data(&DataTransfer {
            block_size: dest.len() as u16,
            block_count: 1,
            direction: Direction::Read,
            mode: TransferMode::Single,
            timeout_exponent: DATA_TIMEOUT_EXPONENT,
        });
        if let Some(rca) = app_rca {
            self.check(command::app_cmd(self.host, rca))?;
        }
        self.check(command::send_r1(self.host, command))?;
        let block_size = dest.len();
        self.poll_read(dest, block_size, self.poll_budget(REGISTER_READ_TIMEOUT_MS))
    }
}
