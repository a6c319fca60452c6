// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Power up and identification.
//!
//! SD cards:
//!
//! ```text
//! CMD0 -> CMD8 --(R7)--------> [CMD55, ACMD41(HCS)]* -> CCS ? SDHC : SD 2.0
//!            \--(no response)-> [CMD55, ACMD41]*      -> SD 1.x
//! ```
//!
//! MMC cards: `CMD0 -> [CMD1]*`, with the access mode bits of the OCR
//! telling byte from sector addressing.
//!
//! Both then go through `CMD2 -> CMD3 -> CMD9 -> CMD7`, MMC cards of version
//! 4 or later additionally through `CMD8` (EXT_CSD), and standard capacity
//! cards through `CMD16`.

use log::{debug, warn};

use crate::card::{CardInfo, CardMode, CardSpecificData, CardType, Geometry, LOGICAL_BLOCK_SIZE};
use crate::command::{self, acmd, cmd};
use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::{Command, ResponseType, SdioHost};
use crate::registers::{Ocr, CARD_STATUS, IF_COND, OCR};
use crate::sdmmc::SdmmcCard;

/// Number of operating condition queries before giving up on a card that
/// stays busy.
pub const MAX_VOLT_TRIAL: u32 = 0xFFFF;

/// Check pattern echoed in the R7 response.
const IF_COND_CHECK_PATTERN: u32 = 0xAA;
/// R7 `VOLTAGE_ACCEPTED` for 2.7-3.6V.
const IF_COND_VOLTAGE_27_36: u32 = 0x1;

/// RCA the driver assigns to MMC cards.
pub const MMC_RCA: u16 = 1;

impl<'a, H: SdioHost> SdmmcCard<'a, H> {
    /// Reset the card and negotiate its operating conditions.
    pub(crate) fn power_up(&self, mode: CardMode) -> Result<CardType, ErrorCode> {
        self.check(command::send(
            self.host,
            Command::new(cmd::GO_IDLE_STATE, 0, ResponseType::None),
        ))?;
        match mode {
            CardMode::Sd => self.power_up_sd(),
            CardMode::Mmc => self.power_up_mmc(),
        }
    }

    fn power_up_sd(&self) -> Result<CardType, ErrorCode> {
        let if_cond = command::send_r7(
            self.host,
            Command::new(
                cmd::SEND_IF_COND,
                command::IF_COND_ARGUMENT,
                ResponseType::R7,
            ),
        );
        let v2 = match if_cond {
            Ok(r7) => {
                if r7.read(IF_COND::CHECK_PATTERN) != IF_COND_CHECK_PATTERN
                    || r7.read(IF_COND::VOLTAGE_ACCEPTED) != IF_COND_VOLTAGE_27_36
                {
                    return Err(self.fail(CardErrors::INVALID_VOLTAGE_RANGE));
                }
                true
            }
            // Cards older than 2.0 do not know CMD8.
            Err(e) if e == CardErrors::CMD_TIMEOUT => false,
            Err(e) => return Err(self.fail(e)),
        };

        let mut argument = command::SD_OCR_VOLTAGE_WINDOW;
        if v2 {
            argument |= command::SD_OCR_HCS;
        }
        let ocr = self.negotiate_ocr(|| {
            command::app_cmd(self.host, 0)?;
            command::send_r3(
                self.host,
                Command::new(acmd::SD_SEND_OP_COND, argument, ResponseType::R3),
            )
        })?;

        let card_type = if v2 && ocr.is_set(OCR::CCS) {
            CardType::SdHighCapacity
        } else if v2 {
            CardType::SdV2
        } else {
            CardType::SdV1
        };
        debug!("sdmmc: powered up {:?}, ocr {:#010x}", card_type, ocr.get());
        Ok(card_type)
    }

    fn power_up_mmc(&self) -> Result<CardType, ErrorCode> {
        let ocr = self.negotiate_ocr(|| {
            command::send_r3(
                self.host,
                Command::new(
                    cmd::SEND_OP_COND,
                    command::MMC_OCR_ARGUMENT,
                    ResponseType::R3,
                ),
            )
        })?;
        let card_type = if ocr.matches_all(OCR::ACCESS_MODE::Sector) {
            CardType::MmcHighCapacity
        } else {
            CardType::Mmc
        };
        debug!("sdmmc: powered up {:?}, ocr {:#010x}", card_type, ocr.get());
        Ok(card_type)
    }

    /// Repeat an operating condition query until the card reports power up
    /// done, at most `MAX_VOLT_TRIAL` times.
    fn negotiate_ocr<F>(&self, query: F) -> Result<Ocr, ErrorCode>
    where
        F: Fn() -> Result<Ocr, CardErrors>,
    {
        for _ in 0..MAX_VOLT_TRIAL {
            let ocr = self.check(query())?;
            if ocr.is_set(OCR::BUSY) {
                return Ok(ocr);
            }
        }
        warn!("sdmmc: card still busy after {} trials", MAX_VOLT_TRIAL);
        Err(self.fail(CardErrors::INVALID_VOLTAGE_RANGE))
    }

    /// Read CID and CSD, assign the RCA, derive the geometry and select the
    /// card. Nothing is published until the caller stores the returned info.
    pub(crate) fn identify(&self, card_type: CardType) -> Result<CardInfo, ErrorCode> {
        let mode = card_type.mode();
        let cid = self.check(command::send_r2(
            self.host,
            Command::new(cmd::ALL_SEND_CID, 0, ResponseType::R2),
        ))?;
        self.raw_cid.set(cid);

        let rca = match mode {
            CardMode::Sd => self.check(command::send_r6(
                self.host,
                Command::new(cmd::RELATIVE_ADDR, 0, ResponseType::R6),
            ))?,
            CardMode::Mmc => {
                self.check(command::send_r1(
                    self.host,
                    Command::new(
                        cmd::RELATIVE_ADDR,
                        command::rca_argument(MMC_RCA),
                        ResponseType::R1,
                    ),
                ))?;
                MMC_RCA
            }
        };

        let csd = self.check(command::send_r2(
            self.host,
            Command::new(cmd::SEND_CSD, command::rca_argument(rca), ResponseType::R2),
        ))?;
        self.raw_csd.set(csd);
        let decoded = CardSpecificData::decode(csd, card_type);

        let status = self.check(command::send_r1(
            self.host,
            Command::new(
                cmd::SELECT_CARD,
                command::rca_argument(rca),
                ResponseType::R1b,
            ),
        ))?;
        if status.is_set(CARD_STATUS::CARD_IS_LOCKED) {
            debug!("sdmmc: card is password locked");
        }

        if mode == CardMode::Mmc && decoded.spec_version >= 4 {
            let ext_csd = self.read_ext_csd()?;
            self.ext_csd.set(Some(ext_csd));
        }

        let geometry = if card_type == CardType::MmcHighCapacity {
            match self.ext_csd.get() {
                Some(ext_csd) if ext_csd.sector_count != 0 => {
                    Geometry::from_sectors(ext_csd.sector_count)
                }
                _ => return Err(self.fail(CardErrors::UNSUPPORTED_FEATURE)),
            }
        } else {
            self.check(Geometry::from_csd(card_type, &decoded))?
        };

        if !card_type.is_high_capacity() {
            self.check(command::send_r1(
                self.host,
                Command::new(cmd::SET_BLOCKLEN, LOGICAL_BLOCK_SIZE, ResponseType::R1),
            ))?;
        }

        Ok(CardInfo {
            card_type,
            rca,
            class: decoded.card_command_classes,
            geometry,
        })
    }
}
