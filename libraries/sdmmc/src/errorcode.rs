// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Result discriminator and sticky error flags.
//!
//! Every public card operation returns a `Result<_, ErrorCode>`. The
//! `ErrorCode` only says *how* the operation ended; the detailed reasons are
//! OR-accumulated into a [`CardErrors`] set held by the card, which the
//! caller can fetch with
//! [`SdmmcCard::error_code`](crate::sdmmc::SdmmcCard::error_code).
//!
//! The sticky set is cleared when `init`, `deinit` or any other top-level
//! operation starts. Nothing clears it while an operation is running,
//! including the interrupt handler completing that operation.

use bitflags::bitflags;

use crate::hil::CommandError;
use crate::registers::{CardStatus, InterruptStatus, CARD_STATUS, INTERRUPT};

/// How a card operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The card or the host reported a failure. See the sticky
    /// [`CardErrors`] for the reason.
    Fail,
    /// A polled transfer did not finish within the caller's timeout.
    Timeout,
    /// An argument was rejected before anything was sent to the card.
    InvalidParameter,
    /// The card is not in a state, or not configured in a way, that allows
    /// the operation (not initialised, no DMA channel, ...).
    InvalidMode,
    /// An interrupt or DMA transfer is still pending on this card.
    Busy,
}

impl ErrorCode {
    /// Stable error message for display/logging.
    pub const fn message(&self) -> &'static str {
        match self {
            ErrorCode::Fail => "Card operation failed",
            ErrorCode::Timeout => "Card operation timed out",
            ErrorCode::InvalidParameter => "Invalid parameter",
            ErrorCode::InvalidMode => "Invalid mode for operation",
            ErrorCode::Busy => "Transfer in progress",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

bitflags! {
    /// Sticky error flags accumulated by a card during an operation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CardErrors: u64 {
        // Command path, reported by the host controller.
        /// Command response timed out.
        const CMD_TIMEOUT = 1 << 0;
        /// Command response failed its CRC check.
        const CMD_CRC_FAIL = 1 << 1;
        /// Command response end bit was not 1.
        const CMD_END_BIT = 1 << 2;
        /// Command response carried the wrong command index.
        const CMD_INDEX = 1 << 3;

        // Data path, reported by the host controller.
        /// Data timeout.
        const DATA_TIMEOUT = 1 << 4;
        /// Data block failed its CRC check.
        const DATA_CRC_FAIL = 1 << 5;
        /// Data end (stop) bit error.
        const DATA_STOP_BIT = 1 << 6;
        /// The DMA channel reported an error or could not be started.
        const DMA = 1 << 7;

        // Card status (R1) error bits.
        /// The argument was out of the card's address range.
        const ADDR_OUT_OF_RANGE = 1 << 8;
        /// Misaligned address.
        const ADDR_MISALIGNED = 1 << 9;
        /// Block length not allowed by the card.
        const BLOCK_LEN_ERR = 1 << 10;
        /// Erase command sequence error.
        const ERASE_SEQ_ERR = 1 << 11;
        /// Invalid selection of erase groups.
        const BAD_ERASE_PARAM = 1 << 12;
        /// Write to a protected block.
        const WRITE_PROT_VIOLATION = 1 << 13;
        /// Lock/unlock command failed.
        const LOCK_UNLOCK_FAILED = 1 << 14;
        /// CRC check of the previous command failed.
        const COM_CRC_FAILED = 1 << 15;
        /// Command not legal in the card's state.
        const ILLEGAL_CMD = 1 << 16;
        /// Card internal ECC failed to correct the data.
        const CARD_ECC_FAILED = 1 << 17;
        /// Internal card controller error.
        const CC_ERR = 1 << 18;
        /// General or unknown error.
        const GENERAL_UNKNOWN_ERR = 1 << 19;
        /// CID/CSD overwrite error.
        const CID_CSD_OVERWRITE = 1 << 20;
        /// Only part of the address space was erased.
        const WP_ERASE_SKIP = 1 << 21;
        /// Command executed without using the internal ECC.
        const CARD_ECC_DISABLED = 1 << 22;
        /// Erase sequence was cleared by an out of sequence command.
        const ERASE_RESET = 1 << 23;
        /// Error in the authentication sequence.
        const AKE_SEQ_ERR = 1 << 24;

        // Card state errors detected by the driver.
        /// The card is locked and refuses the operation.
        const CARD_LOCKED = 1 << 25;
        /// The card never left busy during voltage negotiation.
        const INVALID_VOLTAGE_RANGE = 1 << 26;
        /// The card does not support the requested feature.
        const REQUEST_NOT_APPLICABLE = 1 << 27;
        /// The card or its register contents are not supported by the driver.
        const UNSUPPORTED_FEATURE = 1 << 28;
        /// The card did not grant the requested switch function.
        const SWITCH_ERR = 1 << 29;
        /// The card stayed busy past a bounded wait.
        const BUSY = 1 << 30;
        /// A polled transfer ran out of time.
        const TIMEOUT = 1 << 31;

        // Parameter errors.
        /// Bad argument, including misaligned DMA buffers.
        const INVALID_PARAMETER = 1 << 32;
    }
}

impl CardErrors {
    /// Every R1 error bit that fails a command, translated to sticky flags.
    pub fn from_card_status(status: CardStatus) -> CardErrors {
        let mut errors = CardErrors::empty();
        let table = [
            (CARD_STATUS::OUT_OF_RANGE, CardErrors::ADDR_OUT_OF_RANGE),
            (CARD_STATUS::ADDRESS_ERROR, CardErrors::ADDR_MISALIGNED),
            (CARD_STATUS::BLOCK_LEN_ERROR, CardErrors::BLOCK_LEN_ERR),
            (CARD_STATUS::ERASE_SEQ_ERROR, CardErrors::ERASE_SEQ_ERR),
            (CARD_STATUS::ERASE_PARAM, CardErrors::BAD_ERASE_PARAM),
            (CARD_STATUS::WP_VIOLATION, CardErrors::WRITE_PROT_VIOLATION),
            (CARD_STATUS::LOCK_UNLOCK_FAILED, CardErrors::LOCK_UNLOCK_FAILED),
            (CARD_STATUS::COM_CRC_ERROR, CardErrors::COM_CRC_FAILED),
            (CARD_STATUS::ILLEGAL_COMMAND, CardErrors::ILLEGAL_CMD),
            (CARD_STATUS::CARD_ECC_FAILED, CardErrors::CARD_ECC_FAILED),
            (CARD_STATUS::CC_ERROR, CardErrors::CC_ERR),
            (CARD_STATUS::ERROR, CardErrors::GENERAL_UNKNOWN_ERR),
            (CARD_STATUS::CSD_OVERWRITE, CardErrors::CID_CSD_OVERWRITE),
            (CARD_STATUS::WP_ERASE_SKIP, CardErrors::WP_ERASE_SKIP),
            (CARD_STATUS::CARD_ECC_DISABLED, CardErrors::CARD_ECC_DISABLED),
            (CARD_STATUS::ERASE_RESET, CardErrors::ERASE_RESET),
            (CARD_STATUS::SWITCH_ERROR, CardErrors::SWITCH_ERR),
            (CARD_STATUS::AKE_SEQ_ERROR, CardErrors::AKE_SEQ_ERR),
        ];
        for (field, flag) in table {
            if status.is_set(field) {
                errors |= flag;
            }
        }
        errors
    }

    /// Data path error bits of the host interrupt status.
    pub fn from_interrupt_status(status: InterruptStatus) -> CardErrors {
        let mut errors = CardErrors::empty();
        if status.is_set(INTERRUPT::DTOE) {
            errors |= CardErrors::DATA_TIMEOUT;
        }
        if status.is_set(INTERRUPT::DCE) {
            errors |= CardErrors::DATA_CRC_FAIL;
        }
        if status.is_set(INTERRUPT::DEBE) {
            errors |= CardErrors::DATA_STOP_BIT;
        }
        if status.is_set(INTERRUPT::ADMAE) {
            errors |= CardErrors::DMA;
        }
        errors
    }
}

impl From<CommandError> for CardErrors {
    fn from(err: CommandError) -> CardErrors {
        match err {
            CommandError::Timeout => CardErrors::CMD_TIMEOUT,
            CommandError::Crc => CardErrors::CMD_CRC_FAIL,
            CommandError::EndBit => CardErrors::CMD_END_BIT,
            CommandError::Index => CardErrors::CMD_INDEX,
        }
    }
}
