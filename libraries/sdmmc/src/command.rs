// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Command indices and response checking.
//!
//! Every helper sends exactly one command (two for application commands)
//! and translates whatever went wrong into [`CardErrors`]. Recording the
//! errors on the card is left to the caller.

use crate::card::CardState;
use crate::errorcode::CardErrors;
use crate::hil::{Command, CommandError, ResponseType, SdioHost};
use crate::registers::{CardStatus, IfCond, Ocr, PublishedRca, CARD_STATUS, PUBLISHED_RCA};

/// Basic and block oriented commands shared by SD and MMC.
pub mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    /// MMC only.
    pub const SEND_OP_COND: u8 = 1;
    pub const ALL_SEND_CID: u8 = 2;
    /// SEND_RELATIVE_ADDR on SD, SET_RELATIVE_ADDR on MMC.
    pub const RELATIVE_ADDR: u8 = 3;
    /// SWITCH_FUNC on SD, SWITCH on MMC.
    pub const SWITCH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    /// SEND_IF_COND on SD.
    pub const SEND_IF_COND: u8 = 8;
    /// SEND_EXT_CSD on MMC.
    pub const SEND_EXT_CSD: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    /// SD erase range start.
    pub const ERASE_WR_BLK_START: u8 = 32;
    /// SD erase range end.
    pub const ERASE_WR_BLK_END: u8 = 33;
    /// MMC erase range start.
    pub const ERASE_GROUP_START: u8 = 35;
    /// MMC erase range end.
    pub const ERASE_GROUP_END: u8 = 36;
    pub const ERASE: u8 = 38;
    pub const APP_CMD: u8 = 55;
}

/// SD application commands, sent after APP_CMD.
pub mod acmd {
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SD_STATUS: u8 = 13;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const SEND_SCR: u8 = 51;
}

/// SEND_IF_COND argument: 2.7-3.6V and check pattern 0xAA.
pub const IF_COND_ARGUMENT: u32 = 0x1AA;
/// ACMD41 argument: busy polling with the 3.2-3.4V window.
pub const SD_OCR_VOLTAGE_WINDOW: u32 = 0x8010_0000;
/// ACMD41 host capacity support.
pub const SD_OCR_HCS: u32 = 0x4000_0000;
/// CMD1 argument: sector mode and the 2.7-3.6V window.
pub const MMC_OCR_ARGUMENT: u32 = 0x40FF_8000;

/// Argument of the MMC SWITCH command writing `value` to EXT_CSD byte
/// `index`.
pub const fn mmc_switch_argument(index: usize, value: u8) -> u32 {
    const WRITE_BYTE: u32 = 3;
    (WRITE_BYTE << 24) | ((index as u32 & 0xFF) << 16) | ((value as u32) << 8)
}

/// Argument of the SD SWITCH_FUNC command selecting `function` in group 1
/// and leaving the other groups unchanged.
pub const fn sd_switch_argument(set: bool, function: u8) -> u32 {
    let mode: u32 = if set { 1 << 31 } else { 0 };
    mode | 0x00FF_FFF0 | (function as u32 & 0xF)
}

/// Relative address argument for addressed commands.
pub const fn rca_argument(rca: u16) -> u32 {
    (rca as u32) << 16
}

/// Send a command and report host level failures.
pub fn send<H: SdioHost>(host: &H, command: Command) -> Result<(), CardErrors> {
    host.send_command(command).map_err(CardErrors::from)
}

/// Send a command answered with R1 or R1b and check the card status.
pub fn send_r1<H: SdioHost>(host: &H, command: Command) -> Result<CardStatus, CardErrors> {
    send(host, command)?;
    let status = CardStatus::new(host.response()[0]);
    let errors = CardErrors::from_card_status(status);
    if errors.is_empty() {
        Ok(status)
    } else {
        Err(errors)
    }
}

/// Send a command answered with R2 and return the 128 bit register.
pub fn send_r2<H: SdioHost>(host: &H, command: Command) -> Result<u128, CardErrors> {
    send(host, command)?;
    let words = host.response();
    Ok(words
        .iter()
        .rev()
        .fold(0u128, |acc, word| (acc << 32) | u128::from(*word)))
}

/// Send a command answered with R3. The OCR is not protected by a CRC, so
/// CRC failures reported by the host are ignored.
pub fn send_r3<H: SdioHost>(host: &H, command: Command) -> Result<Ocr, CardErrors> {
    match host.send_command(command) {
        Ok(()) | Err(CommandError::Crc) => Ok(Ocr::new(host.response()[0])),
        Err(e) => Err(e.into()),
    }
}

/// Send SEND_RELATIVE_ADDR and return the published RCA.
pub fn send_r6<H: SdioHost>(host: &H, command: Command) -> Result<u16, CardErrors> {
    send(host, command)?;
    let response = PublishedRca::new(host.response()[0]);
    let mut errors = CardErrors::empty();
    if response.is_set(PUBLISHED_RCA::COM_CRC_ERROR) {
        errors |= CardErrors::COM_CRC_FAILED;
    }
    if response.is_set(PUBLISHED_RCA::ILLEGAL_COMMAND) {
        errors |= CardErrors::ILLEGAL_CMD;
    }
    if response.is_set(PUBLISHED_RCA::ERROR) {
        errors |= CardErrors::GENERAL_UNKNOWN_ERR;
    }
    if response.is_set(PUBLISHED_RCA::AKE_SEQ_ERROR) {
        errors |= CardErrors::AKE_SEQ_ERR;
    }
    if errors.is_empty() {
        Ok(response.read(PUBLISHED_RCA::RCA) as u16)
    } else {
        Err(errors)
    }
}

/// Send a command answered with R7.
pub fn send_r7<H: SdioHost>(host: &H, command: Command) -> Result<IfCond, CardErrors> {
    send(host, command)?;
    Ok(IfCond::new(host.response()[0]))
}

/// Send APP_CMD for `rca`. The application command itself follows with
/// the helper matching its response type.
pub fn app_cmd<H: SdioHost>(host: &H, rca: u16) -> Result<CardStatus, CardErrors> {
    let status = send_r1(
        host,
        Command::new(cmd::APP_CMD, rca_argument(rca), ResponseType::R1),
    )?;
    if status.is_set(CARD_STATUS::APP_CMD) {
        Ok(status)
    } else {
        Err(CardErrors::REQUEST_NOT_APPLICABLE)
    }
}

/// CMD12.
pub fn stop_transmission<H: SdioHost>(host: &H) -> Result<CardStatus, CardErrors> {
    send_r1(
        host,
        Command::new(cmd::STOP_TRANSMISSION, 0, ResponseType::R1b),
    )
}

/// CMD13.
pub fn send_status<H: SdioHost>(host: &H, rca: u16) -> Result<CardStatus, CardErrors> {
    send_r1(
        host,
        Command::new(cmd::SEND_STATUS, rca_argument(rca), ResponseType::R1),
    )
}

/// CMD13, for the state only. Error bits in the status belong to earlier
/// commands and are not checked.
pub fn current_state<H: SdioHost>(host: &H, rca: u16) -> Result<CardState, CardErrors> {
    send(
        host,
        Command::new(cmd::SEND_STATUS, rca_argument(rca), ResponseType::R1),
    )?;
    Ok(CardState::from_status(CardStatus::new(host.response()[0])))
}
