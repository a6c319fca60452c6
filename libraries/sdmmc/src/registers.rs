// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Bit layouts of the host controller status words and of the card
//! registers.
//!
//! Host controller words (`INTERRUPT`, `PRESENT_STATE`) follow the SD Host
//! Controller layout, with the error interrupt status in the upper half of
//! `INTERRUPT`. Card registers follow the SD Physical Layer and JEDEC eMMC
//! specifications. 128-bit registers (CID, CSD) are stored with bit 0 of the
//! register in bit 0 of the `u128`.

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

register_bitfields![u32,
    /// Combined normal and error interrupt status / enable
    pub INTERRUPT [
        /// Command complete
        CC OFFSET(0) NUMBITS(1) [],
        /// Transfer complete
        TC OFFSET(1) NUMBITS(1) [],
        /// Block gap event
        BGE OFFSET(2) NUMBITS(1) [],
        /// DMA interrupt
        DMAINT OFFSET(3) NUMBITS(1) [],
        /// Buffer write ready
        BWR OFFSET(4) NUMBITS(1) [],
        /// Buffer read ready
        BRR OFFSET(5) NUMBITS(1) [],
        /// Card insertion
        CIST OFFSET(6) NUMBITS(1) [],
        /// Card removal
        CRM OFFSET(7) NUMBITS(1) [],
        /// Card interrupt
        CINT OFFSET(8) NUMBITS(1) [],
        /// Error interrupt summary
        EI OFFSET(15) NUMBITS(1) [],
        /// Command timeout error
        CTOE OFFSET(16) NUMBITS(1) [],
        /// Command CRC error
        CCE OFFSET(17) NUMBITS(1) [],
        /// Command end bit error
        CEBE OFFSET(18) NUMBITS(1) [],
        /// Command index error
        CIE OFFSET(19) NUMBITS(1) [],
        /// Data timeout error
        DTOE OFFSET(20) NUMBITS(1) [],
        /// Data CRC error
        DCE OFFSET(21) NUMBITS(1) [],
        /// Data end bit error
        DEBE OFFSET(22) NUMBITS(1) [],
        /// Auto CMD12 error
        ACE OFFSET(24) NUMBITS(1) [],
        /// ADMA error
        ADMAE OFFSET(25) NUMBITS(1) []
    ],
    /// Host present state
    pub PRESENT_STATE [
        /// Command inhibit (CMD line busy)
        CIC OFFSET(0) NUMBITS(1) [],
        /// Command inhibit (DAT lines busy)
        CID OFFSET(1) NUMBITS(1) [],
        /// DAT line active
        DA OFFSET(2) NUMBITS(1) [],
        /// Write transfer active
        WTA OFFSET(8) NUMBITS(1) [],
        /// Read transfer active
        RTA OFFSET(9) NUMBITS(1) [],
        /// Buffer write enable
        BWE OFFSET(10) NUMBITS(1) [],
        /// Buffer read enable
        BRE OFFSET(11) NUMBITS(1) [],
        /// Card inserted
        CIN OFFSET(16) NUMBITS(1) [],
        /// Card state stable
        CSS OFFSET(17) NUMBITS(1) [],
        /// Write protect pin level
        WPL OFFSET(19) NUMBITS(1) [],
        /// DAT[3:0] line levels
        DATL OFFSET(20) NUMBITS(4) [],
        /// CMD line level
        CMDL OFFSET(24) NUMBITS(1) []
    ],
    /// Card status returned in R1/R1b responses and by CMD13
    pub CARD_STATUS [
        OUT_OF_RANGE OFFSET(31) NUMBITS(1) [],
        ADDRESS_ERROR OFFSET(30) NUMBITS(1) [],
        BLOCK_LEN_ERROR OFFSET(29) NUMBITS(1) [],
        ERASE_SEQ_ERROR OFFSET(28) NUMBITS(1) [],
        ERASE_PARAM OFFSET(27) NUMBITS(1) [],
        WP_VIOLATION OFFSET(26) NUMBITS(1) [],
        CARD_IS_LOCKED OFFSET(25) NUMBITS(1) [],
        LOCK_UNLOCK_FAILED OFFSET(24) NUMBITS(1) [],
        COM_CRC_ERROR OFFSET(23) NUMBITS(1) [],
        ILLEGAL_COMMAND OFFSET(22) NUMBITS(1) [],
        CARD_ECC_FAILED OFFSET(21) NUMBITS(1) [],
        CC_ERROR OFFSET(20) NUMBITS(1) [],
        ERROR OFFSET(19) NUMBITS(1) [],
        CSD_OVERWRITE OFFSET(16) NUMBITS(1) [],
        WP_ERASE_SKIP OFFSET(15) NUMBITS(1) [],
        CARD_ECC_DISABLED OFFSET(14) NUMBITS(1) [],
        ERASE_RESET OFFSET(13) NUMBITS(1) [],
        CURRENT_STATE OFFSET(9) NUMBITS(4) [
            Idle = 0,
            Ready = 1,
            Identification = 2,
            Standby = 3,
            Transfer = 4,
            SendingData = 5,
            ReceivingData = 6,
            Programming = 7,
            Disconnect = 8
        ],
        READY_FOR_DATA OFFSET(8) NUMBITS(1) [],
        /// MMC only, reserved on SD cards
        SWITCH_ERROR OFFSET(7) NUMBITS(1) [],
        APP_CMD OFFSET(5) NUMBITS(1) [],
        AKE_SEQ_ERROR OFFSET(3) NUMBITS(1) []
    ],
    /// R6 response to SEND_RELATIVE_ADDR (SD)
    pub PUBLISHED_RCA [
        RCA OFFSET(16) NUMBITS(16) [],
        COM_CRC_ERROR OFFSET(15) NUMBITS(1) [],
        ILLEGAL_COMMAND OFFSET(14) NUMBITS(1) [],
        ERROR OFFSET(13) NUMBITS(1) [],
        CURRENT_STATE OFFSET(9) NUMBITS(4) [],
        READY_FOR_DATA OFFSET(8) NUMBITS(1) [],
        APP_CMD OFFSET(5) NUMBITS(1) [],
        AKE_SEQ_ERROR OFFSET(3) NUMBITS(1) []
    ],
    /// R7 response to SEND_IF_COND
    pub IF_COND [
        VOLTAGE_ACCEPTED OFFSET(8) NUMBITS(4) [],
        CHECK_PATTERN OFFSET(0) NUMBITS(8) []
    ],
    /// Operating conditions register (R3)
    pub OCR [
        /// Power up status, set once the card finished powering up
        BUSY OFFSET(31) NUMBITS(1) [],
        /// SD: card capacity status
        CCS OFFSET(30) NUMBITS(1) [],
        /// MMC: access mode
        ACCESS_MODE OFFSET(29) NUMBITS(2) [
            Byte = 0,
            Sector = 2
        ],
        /// SD: switching to 1.8V accepted
        S18A OFFSET(24) NUMBITS(1) [],
        /// 2.7V - 3.6V window
        VDD_27_36 OFFSET(15) NUMBITS(9) []
    ]
];

register_bitfields![u128,
    /// Card specific data. Fields with a `_V1` suffix belong to the
    /// standard capacity layout (SD CSD 1.0 and MMC), fields with a `_V2`
    /// suffix to the SD CSD 2.0 high capacity layout.
    pub CSD [
        CSD_STRUCTURE OFFSET(126) NUMBITS(2) [],
        /// MMC system specification version
        SPEC_VERS OFFSET(122) NUMBITS(4) [],
        TAAC OFFSET(112) NUMBITS(8) [],
        NSAC OFFSET(104) NUMBITS(8) [],
        TRAN_SPEED OFFSET(96) NUMBITS(8) [],
        CCC OFFSET(84) NUMBITS(12) [],
        READ_BL_LEN OFFSET(80) NUMBITS(4) [],
        READ_BL_PARTIAL OFFSET(79) NUMBITS(1) [],
        WRITE_BLK_MISALIGN OFFSET(78) NUMBITS(1) [],
        READ_BLK_MISALIGN OFFSET(77) NUMBITS(1) [],
        DSR_IMP OFFSET(76) NUMBITS(1) [],
        C_SIZE_V1 OFFSET(62) NUMBITS(12) [],
        VDD_R_CURR_MIN_V1 OFFSET(59) NUMBITS(3) [],
        VDD_R_CURR_MAX_V1 OFFSET(56) NUMBITS(3) [],
        VDD_W_CURR_MIN_V1 OFFSET(53) NUMBITS(3) [],
        VDD_W_CURR_MAX_V1 OFFSET(50) NUMBITS(3) [],
        C_SIZE_MULT_V1 OFFSET(47) NUMBITS(3) [],
        C_SIZE_V2 OFFSET(48) NUMBITS(22) [],
        /// SD only
        ERASE_BLK_EN OFFSET(46) NUMBITS(1) [],
        /// SD only
        SECTOR_SIZE OFFSET(39) NUMBITS(7) [],
        /// MMC only
        ERASE_GRP_SIZE OFFSET(42) NUMBITS(5) [],
        /// MMC only
        ERASE_GRP_MULT OFFSET(37) NUMBITS(5) [],
        WP_GRP_SIZE OFFSET(32) NUMBITS(7) [],
        WP_GRP_ENABLE OFFSET(31) NUMBITS(1) [],
        R2W_FACTOR OFFSET(26) NUMBITS(3) [],
        WRITE_BL_LEN OFFSET(22) NUMBITS(4) [],
        WRITE_BL_PARTIAL OFFSET(21) NUMBITS(1) [],
        FILE_FORMAT_GRP OFFSET(15) NUMBITS(1) [],
        COPY OFFSET(14) NUMBITS(1) [],
        PERM_WRITE_PROTECT OFFSET(13) NUMBITS(1) [],
        TMP_WRITE_PROTECT OFFSET(12) NUMBITS(1) [],
        FILE_FORMAT OFFSET(10) NUMBITS(2) [],
        CRC OFFSET(1) NUMBITS(7) []
    ],
    /// Card identification. Unprefixed fields are the SD layout, `MMC_`
    /// fields the MMC layout.
    pub CID [
        MID OFFSET(120) NUMBITS(8) [],
        OID OFFSET(104) NUMBITS(16) [],
        PNM OFFSET(64) NUMBITS(40) [],
        PRV OFFSET(56) NUMBITS(8) [],
        PSN OFFSET(24) NUMBITS(32) [],
        MDT OFFSET(8) NUMBITS(12) [],
        MMC_CBX OFFSET(112) NUMBITS(2) [],
        MMC_OID OFFSET(104) NUMBITS(8) [],
        MMC_PNM OFFSET(56) NUMBITS(48) [],
        MMC_PRV OFFSET(48) NUMBITS(8) [],
        MMC_PSN OFFSET(16) NUMBITS(32) [],
        MMC_MDT OFFSET(8) NUMBITS(8) [],
        CRC OFFSET(1) NUMBITS(7) []
    ]
];

register_bitfields![u64,
    /// SD configuration register, read MSB first from the data line
    pub SCR [
        SCR_STRUCTURE OFFSET(60) NUMBITS(4) [],
        SD_SPEC OFFSET(56) NUMBITS(4) [
            Version1_0 = 0,
            Version1_10 = 1,
            Version2_00 = 2
        ],
        DATA_STAT_AFTER_ERASE OFFSET(55) NUMBITS(1) [],
        SD_SECURITY OFFSET(52) NUMBITS(3) [],
        BUS_WIDTH_4 OFFSET(50) NUMBITS(1) [],
        BUS_WIDTH_1 OFFSET(48) NUMBITS(1) [],
        SD_SPEC3 OFFSET(47) NUMBITS(1) [],
        EX_SECURITY OFFSET(43) NUMBITS(4) [],
        SD_SPEC4 OFFSET(42) NUMBITS(1) [],
        SD_SPECX OFFSET(38) NUMBITS(4) [],
        CMD_SUPPORT OFFSET(32) NUMBITS(5) []
    ]
];

/// Host interrupt status (or enable) word.
pub type InterruptStatus = LocalRegisterCopy<u32, INTERRUPT::Register>;
/// Host present state word.
pub type PresentState = LocalRegisterCopy<u32, PRESENT_STATE::Register>;
/// R1 card status.
pub type CardStatus = LocalRegisterCopy<u32, CARD_STATUS::Register>;
/// R6 published RCA response.
pub type PublishedRca = LocalRegisterCopy<u32, PUBLISHED_RCA::Register>;
/// R7 interface condition response.
pub type IfCond = LocalRegisterCopy<u32, IF_COND::Register>;
/// R3 operating conditions.
pub type Ocr = LocalRegisterCopy<u32, OCR::Register>;
/// Raw card specific data.
pub type CsdRegister = LocalRegisterCopy<u128, CSD::Register>;
/// Raw card identification.
pub type CidRegister = LocalRegisterCopy<u128, CID::Register>;
/// Raw SD configuration register.
pub type ScrRegister = LocalRegisterCopy<u64, SCR::Register>;

/// Data path error interrupts.
pub fn data_errors() -> tock_registers::fields::FieldValue<u32, INTERRUPT::Register> {
    INTERRUPT::DTOE::SET + INTERRUPT::DCE::SET + INTERRUPT::DEBE::SET + INTERRUPT::ADMAE::SET
}

/// Every interrupt the card client ever arms or clears.
pub fn all_interrupts() -> tock_registers::fields::FieldValue<u32, INTERRUPT::Register> {
    INTERRUPT::CC::SET
        + INTERRUPT::TC::SET
        + INTERRUPT::BWR::SET
        + INTERRUPT::BRR::SET
        + INTERRUPT::EI::SET
        + INTERRUPT::CTOE::SET
        + INTERRUPT::CCE::SET
        + INTERRUPT::CEBE::SET
        + INTERRUPT::CIE::SET
        + data_errors()
        + INTERRUPT::ACE::SET
}
