// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Card metadata: kinds, states, decoded registers and block geometry.
//!
//! Everything in here is pure decoding of values the card already returned;
//! nothing talks to the host. The 128 bit registers arrive as `u128` with
//! bit 0 of the register in bit 0, the SCR as a `u64` assembled from its 8
//! bytes MSB first, the SD Status and EXT_CSD as raw data blocks.

use crate::errorcode::CardErrors;
use crate::registers::{
    CardStatus, CidRegister, CsdRegister, ScrRegister, CARD_STATUS, CID, CSD, SCR,
};

/// Size of the blocks every read, write and erase address refers to.
pub const LOGICAL_BLOCK_SIZE: u32 = 512;

/// Protocol family of the card in the slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardMode {
    Sd,
    Mmc,
}

/// Card generation and capacity class, settled during power up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardType {
    /// SD physical layer 1.x, standard capacity, byte addressed.
    SdV1,
    /// SD physical layer 2.0 or later, standard capacity, byte addressed.
    SdV2,
    /// SDHC or SDXC, block addressed.
    SdHighCapacity,
    /// MMC up to 2GB, byte addressed.
    Mmc,
    /// MMC above 2GB, sector addressed.
    MmcHighCapacity,
}

impl CardType {
    pub fn mode(self) -> CardMode {
        match self {
            CardType::SdV1 | CardType::SdV2 | CardType::SdHighCapacity => CardMode::Sd,
            CardType::Mmc | CardType::MmcHighCapacity => CardMode::Mmc,
        }
    }

    /// High capacity cards take block numbers as data addresses, standard
    /// capacity cards take byte offsets.
    pub fn is_high_capacity(self) -> bool {
        matches!(self, CardType::SdHighCapacity | CardType::MmcHighCapacity)
    }
}

/// Card state machine position, as reported in `CURRENT_STATE` of the card
/// status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Identification,
    Standby,
    Transfer,
    SendingData,
    ReceivingData,
    Programming,
    Disconnect,
    /// A reserved state value.
    Reserved(u8),
}

impl CardState {
    pub fn from_status(status: CardStatus) -> CardState {
        match status.read_as_enum(CARD_STATUS::CURRENT_STATE) {
            Some(CARD_STATUS::CURRENT_STATE::Value::Idle) => CardState::Idle,
            Some(CARD_STATUS::CURRENT_STATE::Value::Ready) => CardState::Ready,
            Some(CARD_STATUS::CURRENT_STATE::Value::Identification) => CardState::Identification,
            Some(CARD_STATUS::CURRENT_STATE::Value::Standby) => CardState::Standby,
            Some(CARD_STATUS::CURRENT_STATE::Value::Transfer) => CardState::Transfer,
            Some(CARD_STATUS::CURRENT_STATE::Value::SendingData) => CardState::SendingData,
            Some(CARD_STATUS::CURRENT_STATE::Value::ReceivingData) => CardState::ReceivingData,
            Some(CARD_STATUS::CURRENT_STATE::Value::Programming) => CardState::Programming,
            Some(CARD_STATUS::CURRENT_STATE::Value::Disconnect) => CardState::Disconnect,
            None => CardState::Reserved(status.read(CARD_STATUS::CURRENT_STATE) as u8),
        }
    }

    /// States in which a data phase is still running and CMD12 is needed to
    /// bring the card back to `Transfer`.
    pub fn is_moving_data(self) -> bool {
        matches!(self, CardState::SendingData | CardState::ReceivingData)
    }
}

/// Block geometry of a card.
///
/// `block_size`/`block_count` describe the card's own blocks as stated by
/// its CSD (or EXT_CSD). `log_block_size`/`log_block_count` describe the same
/// capacity in the 512 byte units that every read, write and erase call of
/// this crate uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub block_count: u32,
    pub log_block_size: u32,
    pub log_block_count: u32,
}

impl Geometry {
    /// Geometry of a card with `count` native 512 byte blocks.
    pub fn from_sectors(count: u32) -> Geometry {
        Geometry {
            block_size: LOGICAL_BLOCK_SIZE,
            block_count: count,
            log_block_size: LOGICAL_BLOCK_SIZE,
            log_block_count: count,
        }
    }

    /// Derive the geometry from a CSD.
    ///
    /// High capacity SD cards use the CSD 2.0 layout, everything else the
    /// standard capacity layout, so the caller passes the card type rather
    /// than trusting `CSD_STRUCTURE` alone. High capacity MMC cards carry
    /// no usable size in their CSD; their geometry comes from EXT_CSD.
    pub fn from_csd(card_type: CardType, csd: &CardSpecificData) -> Result<Geometry, CardErrors> {
        match card_type {
            CardType::SdHighCapacity => {
                let count = (u64::from(csd.device_size) + 1) * 1024;
                let count = u32::try_from(count).map_err(|_| CardErrors::UNSUPPORTED_FEATURE)?;
                Ok(Geometry::from_sectors(count))
            }
            CardType::MmcHighCapacity => Err(CardErrors::REQUEST_NOT_APPLICABLE),
            CardType::SdV1 | CardType::SdV2 | CardType::Mmc => {
                if csd.read_block_len > 11 {
                    return Err(CardErrors::UNSUPPORTED_FEATURE);
                }
                let block_size = 1u32 << csd.read_block_len;
                if block_size < LOGICAL_BLOCK_SIZE {
                    return Err(CardErrors::UNSUPPORTED_FEATURE);
                }
                let mult = 1u32 << (csd.device_size_mult + 2);
                let block_count = (csd.device_size + 1) * mult;
                Ok(Geometry {
                    block_size,
                    block_count,
                    log_block_size: LOGICAL_BLOCK_SIZE,
                    log_block_count: block_count * (block_size / LOGICAL_BLOCK_SIZE),
                })
            }
        }
    }
}

/// Identification and geometry of an initialised card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardInfo {
    pub card_type: CardType,
    /// Relative card address.
    pub rca: u16,
    /// Supported command classes (CSD `CCC`).
    pub class: u16,
    pub geometry: Geometry,
}

impl CardInfo {
    /// Translate a logical block number into the data address the card
    /// expects. Fails when the byte address of a standard capacity card does
    /// not fit the 32 bit argument.
    pub fn card_address(&self, block: u32) -> Option<u32> {
        if self.card_type.is_high_capacity() {
            Some(block)
        } else {
            u32::try_from(u64::from(block) * u64::from(LOGICAL_BLOCK_SIZE)).ok()
        }
    }

    /// Inverse of [`CardInfo::card_address`].
    pub fn block_number(&self, address: u32) -> u32 {
        if self.card_type.is_high_capacity() {
            address
        } else {
            address / LOGICAL_BLOCK_SIZE
        }
    }

    /// Whether the card implements command class `class`.
    pub fn supports_class(&self, class: u16) -> bool {
        self.class & (1 << class) != 0
    }
}

/// Decoded CID.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardIdentification {
    pub manufacturer_id: u8,
    /// Two ASCII characters on SD, one binary byte on MMC.
    pub oem_id: u16,
    /// Product name, 5 ASCII characters on SD, 6 on MMC. Unused trailing
    /// bytes are zero.
    pub product_name: [u8; 6],
    pub product_revision: u8,
    pub serial_number: u32,
    /// Year of manufacture. MMC dates cannot be told apart past 2012 without
    /// EXT_CSD, so MMC years are reported in the 1997-2012 window.
    pub manufacture_year: u16,
    pub manufacture_month: u8,
}

impl CardIdentification {
    pub fn decode(raw: u128, mode: CardMode) -> CardIdentification {
        let cid = CidRegister::new(raw);
        let mut product_name = [0u8; 6];
        match mode {
            CardMode::Sd => {
                let pnm = cid.read(CID::PNM);
                for (i, c) in product_name.iter_mut().take(5).enumerate() {
                    *c = (pnm >> (8 * (4 - i))) as u8;
                }
                let mdt = cid.read(CID::MDT) as u16;
                CardIdentification {
                    manufacturer_id: cid.read(CID::MID) as u8,
                    oem_id: cid.read(CID::OID) as u16,
                    product_name,
                    product_revision: cid.read(CID::PRV) as u8,
                    serial_number: cid.read(CID::PSN) as u32,
                    manufacture_year: 2000 + (mdt >> 4),
                    manufacture_month: (mdt & 0xF) as u8,
                }
            }
            CardMode::Mmc => {
                let pnm = cid.read(CID::MMC_PNM);
                for (i, c) in product_name.iter_mut().enumerate() {
                    *c = (pnm >> (8 * (5 - i))) as u8;
                }
                let mdt = cid.read(CID::MMC_MDT) as u16;
                CardIdentification {
                    manufacturer_id: cid.read(CID::MID) as u8,
                    oem_id: cid.read(CID::MMC_OID) as u16,
                    product_name,
                    product_revision: cid.read(CID::MMC_PRV) as u8,
                    serial_number: cid.read(CID::MMC_PSN) as u32,
                    manufacture_year: 1997 + (mdt & 0xF),
                    manufacture_month: (mdt >> 4) as u8,
                }
            }
        }
    }
}

/// Decoded CSD.
///
/// `device_size` and `device_size_mult` hold `C_SIZE`/`C_SIZE_MULT` of the
/// layout the card uses: 12 bit `C_SIZE` with a multiplier for standard
/// capacity cards, 22 bit `C_SIZE` and no multiplier for CSD 2.0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardSpecificData {
    pub structure: u8,
    /// MMC system specification version. Reserved on SD cards.
    pub spec_version: u8,
    pub taac: u8,
    pub nsac: u8,
    pub max_transfer_rate: u8,
    pub card_command_classes: u16,
    pub read_block_len: u8,
    pub read_block_partial: bool,
    pub write_block_misalign: bool,
    pub read_block_misalign: bool,
    pub dsr_implemented: bool,
    pub device_size: u32,
    pub device_size_mult: u8,
    /// SD `ERASE_BLK_EN`.
    pub erase_block_enable: bool,
    /// SD `SECTOR_SIZE`, or MMC `ERASE_GRP_SIZE`.
    pub erase_sector_size: u8,
    /// MMC `ERASE_GRP_MULT`. Zero on SD cards.
    pub erase_group_mult: u8,
    pub write_protect_group_size: u8,
    pub write_protect_group_enable: bool,
    pub write_speed_factor: u8,
    pub write_block_len: u8,
    pub write_block_partial: bool,
    pub copy: bool,
    pub permanent_write_protect: bool,
    pub temporary_write_protect: bool,
    pub file_format: u8,
}

impl CardSpecificData {
    pub fn decode(raw: u128, card_type: CardType) -> CardSpecificData {
        let csd = CsdRegister::new(raw);
        let flag = |f| csd.is_set(f);
        let (device_size, device_size_mult) = if card_type == CardType::SdHighCapacity {
            (csd.read(CSD::C_SIZE_V2) as u32, 0)
        } else {
            (csd.read(CSD::C_SIZE_V1) as u32, csd.read(CSD::C_SIZE_MULT_V1) as u8)
        };
        let mmc = card_type.mode() == CardMode::Mmc;
        CardSpecificData {
            structure: csd.read(CSD::CSD_STRUCTURE) as u8,
            spec_version: if mmc { csd.read(CSD::SPEC_VERS) as u8 } else { 0 },
            taac: csd.read(CSD::TAAC) as u8,
            nsac: csd.read(CSD::NSAC) as u8,
            max_transfer_rate: csd.read(CSD::TRAN_SPEED) as u8,
            card_command_classes: csd.read(CSD::CCC) as u16,
            read_block_len: csd.read(CSD::READ_BL_LEN) as u8,
            read_block_partial: flag(CSD::READ_BL_PARTIAL),
            write_block_misalign: flag(CSD::WRITE_BLK_MISALIGN),
            read_block_misalign: flag(CSD::READ_BLK_MISALIGN),
            dsr_implemented: flag(CSD::DSR_IMP),
            device_size,
            device_size_mult,
            erase_block_enable: !mmc && flag(CSD::ERASE_BLK_EN),
            erase_sector_size: if mmc {
                csd.read(CSD::ERASE_GRP_SIZE) as u8
            } else {
                csd.read(CSD::SECTOR_SIZE) as u8
            },
            erase_group_mult: if mmc { csd.read(CSD::ERASE_GRP_MULT) as u8 } else { 0 },
            write_protect_group_size: csd.read(CSD::WP_GRP_SIZE) as u8,
            write_protect_group_enable: flag(CSD::WP_GRP_ENABLE),
            write_speed_factor: csd.read(CSD::R2W_FACTOR) as u8,
            write_block_len: csd.read(CSD::WRITE_BL_LEN) as u8,
            write_block_partial: flag(CSD::WRITE_BL_PARTIAL),
            copy: flag(CSD::COPY),
            permanent_write_protect: flag(CSD::PERM_WRITE_PROTECT),
            temporary_write_protect: flag(CSD::TMP_WRITE_PROTECT),
            file_format: csd.read(CSD::FILE_FORMAT) as u8,
        }
    }
}

/// Decoded SD configuration register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SdConfiguration {
    pub structure: u8,
    pub sd_spec: u8,
    pub sd_spec3: bool,
    pub sd_spec4: bool,
    pub sd_specx: u8,
    /// Erased blocks read as 0xFF when set, as 0x00 otherwise.
    pub data_stat_after_erase: bool,
    pub security: u8,
    pub extended_security: u8,
    pub bus_width_1: bool,
    pub bus_width_4: bool,
    pub command_support: u8,
}

impl SdConfiguration {
    /// Assemble the register from the 8 bytes of the ACMD51 data phase.
    pub fn raw_from_bytes(bytes: &[u8; 8]) -> u64 {
        u64::from_be_bytes(*bytes)
    }

    pub fn decode(raw: u64) -> SdConfiguration {
        let scr = ScrRegister::new(raw);
        SdConfiguration {
            structure: scr.read(SCR::SCR_STRUCTURE) as u8,
            sd_spec: scr.read(SCR::SD_SPEC) as u8,
            sd_spec3: scr.is_set(SCR::SD_SPEC3),
            sd_spec4: scr.is_set(SCR::SD_SPEC4),
            sd_specx: scr.read(SCR::SD_SPECX) as u8,
            data_stat_after_erase: scr.is_set(SCR::DATA_STAT_AFTER_ERASE),
            security: scr.read(SCR::SD_SECURITY) as u8,
            extended_security: scr.read(SCR::EX_SECURITY) as u8,
            bus_width_1: scr.is_set(SCR::BUS_WIDTH_1),
            bus_width_4: scr.is_set(SCR::BUS_WIDTH_4),
            command_support: scr.read(SCR::CMD_SUPPORT) as u8,
        }
    }

    /// Card implements the SD 1.10 (or later) switch function.
    pub fn supports_switch(&self) -> bool {
        self.sd_spec >= 1
    }
}

/// Decoded 512 bit SD Status (ACMD13).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SdStatus {
    /// 0: 1 bit, 2: 4 bit.
    pub bus_width: u8,
    pub secured_mode: bool,
    pub card_type: u16,
    pub protected_area_size: u32,
    pub speed_class: u8,
    pub performance_move: u8,
    pub au_size: u8,
    pub erase_size: u16,
    pub erase_timeout: u8,
    pub erase_offset: u8,
    pub uhs_speed_grade: u8,
    pub uhs_au_size: u8,
}

impl SdStatus {
    pub fn decode(block: &[u8; 64]) -> SdStatus {
        SdStatus {
            bus_width: block[0] >> 6,
            secured_mode: block[0] & 0x20 != 0,
            card_type: u16::from_be_bytes([block[2], block[3]]),
            protected_area_size: u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
            speed_class: block[8],
            performance_move: block[9],
            au_size: block[10] >> 4,
            erase_size: u16::from_be_bytes([block[11], block[12]]),
            erase_timeout: block[13] >> 2,
            erase_offset: block[13] & 0x3,
            uhs_speed_grade: block[14] >> 4,
            uhs_au_size: block[14] & 0xF,
        }
    }
}

/// Byte offsets into the MMC extended CSD.
pub mod ext_csd {
    pub const SEC_COUNT: usize = 212;
    pub const CARD_TYPE: usize = 196;
    pub const EXT_CSD_REV: usize = 192;
    pub const HS_TIMING: usize = 185;
    pub const BUS_WIDTH: usize = 183;
    pub const ERASED_MEM_CONT: usize = 181;

    /// `CARD_TYPE` bit for 26 MHz high speed.
    pub const CARD_TYPE_HS_26: u8 = 1 << 0;
    /// `CARD_TYPE` bit for 52 MHz high speed.
    pub const CARD_TYPE_HS_52: u8 = 1 << 1;
}

/// The fields of the MMC extended CSD this crate uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtendedCsd {
    pub revision: u8,
    pub card_type: u8,
    pub bus_width: u8,
    pub hs_timing: u8,
    /// Erased memory reads as 0xFF when set.
    pub erased_mem_cont: u8,
    /// Number of 512 byte sectors, for high capacity cards.
    pub sector_count: u32,
}

impl ExtendedCsd {
    pub fn decode(block: &[u8; 512]) -> ExtendedCsd {
        let s = ext_csd::SEC_COUNT;
        ExtendedCsd {
            revision: block[ext_csd::EXT_CSD_REV],
            card_type: block[ext_csd::CARD_TYPE],
            bus_width: block[ext_csd::BUS_WIDTH],
            hs_timing: block[ext_csd::HS_TIMING],
            erased_mem_cont: block[ext_csd::ERASED_MEM_CONT],
            sector_count: u32::from_le_bytes([block[s], block[s + 1], block[s + 2], block[s + 3]]),
        }
    }

    pub fn supports_high_speed(&self) -> bool {
        self.card_type & (ext_csd::CARD_TYPE_HS_26 | ext_csd::CARD_TYPE_HS_52) != 0
    }
}
