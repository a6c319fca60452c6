// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Block erase, read and write.
//!
//! All addresses are 512 byte logical block numbers. Reads and writes come
//! in three flavours sharing the same setup (range check, block length,
//! data descriptor, transfer context, command):
//!
//!  * `read_blocks`/`write_blocks` poll the host until the data phase is
//!    over or the caller's timeout expired.
//!  * `read_blocks_int`/`write_blocks_int` return once the command is sent.
//!    The interrupt handler moves one block per buffer ready interrupt.
//!  * `read_blocks_dma`/`write_blocks_dma` hand the buffer to a DMA channel
//!    and return. The interrupt handler finishes the transfer.
//!
//! The asynchronous flavours take ownership of a `&'static mut [u8]` and give
//! it back through [`TransferClient`](crate::hil::TransferClient) or, when
//! they fail to start, in the error.

use log::debug;

use crate::card::{CardInfo, CardMode, LOGICAL_BLOCK_SIZE};
use crate::command::{self, cmd};
use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::{
    Command, DataTransfer, Direction, DmaChannel, InterruptMask, ResponseType, SdioHost,
    TransferMode,
};
use crate::registers::{self, InterruptStatus, CARD_STATUS, INTERRUPT, PRESENT_STATE};
use crate::sdmmc::{Operation, SdmmcCard, Strategy, TransferContext, TransferState};

/// Data timeout programmed into the host, as a power of two of the SD clock
/// period.
pub const DATA_TIMEOUT_EXPONENT: u8 = 27;

/// Command class of the erase commands.
const CLASS_ERASE: u16 = 5;

const BLOCK: usize = LOGICAL_BLOCK_SIZE as usize;

impl Operation {
    fn new(direction: Direction, count: u32) -> Operation {
        match (direction, count > 1) {
            (Direction::Read, false) => Operation::ReadSingle,
            (Direction::Read, true) => Operation::ReadMultiple,
            (Direction::Write, false) => Operation::WriteSingle,
            (Direction::Write, true) => Operation::WriteMultiple,
        }
    }

    pub fn direction(self) -> Direction {
        if self.is_read() {
            Direction::Read
        } else {
            Direction::Write
        }
    }

    fn command_index(self) -> u8 {
        match self {
            Operation::ReadSingle => cmd::READ_SINGLE_BLOCK,
            Operation::ReadMultiple => cmd::READ_MULTIPLE_BLOCK,
            Operation::WriteSingle => cmd::WRITE_BLOCK,
            Operation::WriteMultiple => cmd::WRITE_MULTIPLE_BLOCK,
        }
    }
}

impl<'a, H: SdioHost> SdmmcCard<'a, H> {
    /// Erase logical blocks `start` to `end`, both included, and wait for
    /// the card to finish.
    pub fn erase(&self, start: u32, end: u32) -> Result<(), ErrorCode> {
        self.begin()?;
        let info = self.ready_info()?;
        if start > end {
            return Err(self.fail(CardErrors::INVALID_PARAMETER));
        }
        if end >= info.geometry.log_block_count {
            return Err(self.fail(CardErrors::ADDR_OUT_OF_RANGE));
        }
        if !info.supports_class(CLASS_ERASE) {
            return Err(self.fail(CardErrors::REQUEST_NOT_APPLICABLE));
        }

        let status = self.check(command::send_status(self.host, info.rca))?;
        if status.is_set(CARD_STATUS::CARD_IS_LOCKED) {
            return Err(self.fail(CardErrors::CARD_LOCKED));
        }

        let first = self.card_address(&info, start)?;
        let last = self.card_address(&info, end)?;
        let (start_index, end_index) = match info.card_type.mode() {
            CardMode::Sd => (cmd::ERASE_WR_BLK_START, cmd::ERASE_WR_BLK_END),
            CardMode::Mmc => (cmd::ERASE_GROUP_START, cmd::ERASE_GROUP_END),
        };
        self.check(command::send_r1(
            self.host,
            Command::new(start_index, first, ResponseType::R1),
        ))?;
        self.check(command::send_r1(
            self.host,
            Command::new(end_index, last, ResponseType::R1),
        ))?;
        self.check(command::send_r1(
            self.host,
            Command::new(cmd::ERASE, 0, ResponseType::R1b),
        ))?;
        debug!("sdmmc: erasing blocks {}..={}", start, end);
        self.wait_ready_for_data(info.rca)
    }

    /// Read `count` blocks starting at `block` into `buffer`, polling for at
    /// most `timeout_ms`.
    pub fn read_blocks(
        &self,
        block: u32,
        count: u32,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), ErrorCode> {
        let (address, len) = self.prepare(block, count, buffer.len())?;
        let operation = Operation::new(Direction::Read, count);
        self.setup_data(operation, Strategy::Polling, count)?;
        if let Err(e) = self.send_data_command(operation, address) {
            self.state.set(TransferState::Error);
            return Err(e);
        }
        let result = self.poll_read(&mut buffer[..len], BLOCK, self.poll_budget(timeout_ms));
        self.finish_polled(operation, result)
    }

    /// Write `count` blocks from `buffer` starting at `block`, polling for at
    /// most `timeout_ms`.
    pub fn write_blocks(
        &self,
        block: u32,
        count: u32,
        buffer: &[u8],
        timeout_ms: u32,
    ) -> Result<(), ErrorCode> {
        let (address, len) = self.prepare(block, count, buffer.len())?;
        let operation = Operation::new(Direction::Write, count);
        self.setup_data(operation, Strategy::Polling, count)?;
        if let Err(e) = self.send_data_command(operation, address) {
            self.state.set(TransferState::Error);
            return Err(e);
        }
        let result = self.poll_write(&buffer[..len], BLOCK, self.poll_budget(timeout_ms));
        self.finish_polled(operation, result)
    }

    /// Start an interrupt driven read. `buffer` comes back through
    /// `rx_complete` or `transfer_error`.
    pub fn read_blocks_int(
        &self,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.start_interrupt_transfer(Direction::Read, block, count, buffer)
    }

    /// Start an interrupt driven write. `buffer` comes back through
    /// `tx_complete` or `transfer_error`.
    pub fn write_blocks_int(
        &self,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.start_interrupt_transfer(Direction::Write, block, count, buffer)
    }

    /// Start a DMA read. `buffer` must be word aligned.
    pub fn read_blocks_dma(
        &self,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.start_dma_transfer(Direction::Read, block, count, buffer)
    }

    /// Start a DMA write. `buffer` must be word aligned.
    pub fn write_blocks_dma(
        &self,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        self.start_dma_transfer(Direction::Write, block, count, buffer)
    }

    fn start_interrupt_transfer(
        &self,
        direction: Direction,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        let (address, len) = match self.prepare(block, count, buffer.len()) {
            Ok(v) => v,
            Err(e) => return Err((e, buffer)),
        };
        let operation = Operation::new(direction, count);
        if let Err(e) = self.setup_data(operation, Strategy::Interrupt, count) {
            return Err((e, buffer));
        }

        self.buffer.set(Some(buffer));
        self.cursor.set(0);
        self.remaining.set(len);
        self.state.set(TransferState::Active);
        let buffer_ready = match direction {
            Direction::Read => INTERRUPT::BRR::SET,
            Direction::Write => INTERRUPT::BWR::SET,
        };
        self.host
            .enable_interrupts(buffer_ready + completion_interrupts(), true);

        match self.send_data_command(operation, address) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.host.enable_interrupts(registers::all_interrupts(), false);
                self.state.set(TransferState::Error);
                self.remaining.set(0);
                match self.buffer.take() {
                    Some(buffer) => Err((e, buffer)),
                    // The interrupt handler already ended the transfer and
                    // reported it.
                    None => Ok(()),
                }
            }
        }
    }

    fn start_dma_transfer(
        &self,
        direction: Direction,
        block: u32,
        count: u32,
        buffer: &'static mut [u8],
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        let (address, len) = match self.prepare(block, count, buffer.len()) {
            Ok(v) => v,
            Err(e) => return Err((e, buffer)),
        };
        if buffer.as_ptr() as usize % 4 != 0 {
            return Err((self.fail(CardErrors::INVALID_PARAMETER), buffer));
        }
        let operation = Operation::new(direction, count);
        let dma = match self.dma_channel(operation) {
            Some(dma) => dma,
            None => return Err((ErrorCode::InvalidMode, buffer)),
        };
        if let Err(e) = self.setup_data(operation, Strategy::Dma, count) {
            return Err((e, buffer));
        }

        self.state.set(TransferState::Active);
        self.host.enable_interrupts(completion_interrupts(), true);
        if let Err((_, buffer)) = dma.start_transfer(direction, buffer, len) {
            self.host.enable_interrupts(registers::all_interrupts(), false);
            self.state.set(TransferState::Error);
            return Err((self.fail(CardErrors::DMA), buffer));
        }

        match self.send_data_command(operation, address) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.host.enable_interrupts(registers::all_interrupts(), false);
                self.state.set(TransferState::Error);
                match dma.stop_transfer() {
                    Some(buffer) => Err((e, buffer)),
                    None => Ok(()),
                }
            }
        }
    }

    /// Common entry checks of a block transfer. Returns the card address of
    /// `block` and the number of bytes to move.
    fn prepare(
        &self,
        block: u32,
        count: u32,
        buffer_len: usize,
    ) -> Result<(u32, usize), ErrorCode> {
        self.begin()?;
        let info = self.ready_info()?;
        if count == 0 || count > u32::from(u16::MAX) {
            return Err(self.fail(CardErrors::INVALID_PARAMETER));
        }
        let len = count as usize * BLOCK;
        if buffer_len < len {
            return Err(self.fail(CardErrors::INVALID_PARAMETER));
        }
        if u64::from(block) + u64::from(count) > u64::from(info.geometry.log_block_count) {
            return Err(self.fail(CardErrors::ADDR_OUT_OF_RANGE));
        }
        let address = self.card_address(&info, block)?;
        Ok((address, len))
    }

    fn card_address(&self, info: &CardInfo, block: u32) -> Result<u32, ErrorCode> {
        info.card_address(block)
            .ok_or_else(|| self.fail(CardErrors::ADDR_OUT_OF_RANGE))
    }

    /// Set the block length, program the data descriptor and record the
    /// transfer context. Nothing has moved on the data lines yet.
    fn setup_data(
        &self,
        operation: Operation,
        strategy: Strategy,
        count: u32,
    ) -> Result<(), ErrorCode> {
        self.check(command::send_r1(
            self.host,
            Command::new(cmd::SET_BLOCKLEN, LOGICAL_BLOCK_SIZE, ResponseType::R1),
        ))?;
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.configure_data(&DataTransfer {
            block_size: LOGICAL_BLOCK_SIZE as u16,
            block_count: count as u16,
            direction: operation.direction(),
            mode: if operation.is_multiple() {
                TransferMode::Multiple
            } else {
                TransferMode::Single
            },
            timeout_exponent: DATA_TIMEOUT_EXPONENT,
        });
        self.context.set(Some(TransferContext {
            operation,
            strategy,
        }));
        Ok(())
    }

    fn send_data_command(&self, operation: Operation, address: u32) -> Result<(), ErrorCode> {
        self.check(command::send_r1(
            self.host,
            Command::with_data(operation.command_index(), address, ResponseType::R1),
        ))
        .map(|_| ())
    }

    /// End a polled transfer: stop a multi-block transfer whatever happened
    /// to its data, then record the outcome.
    fn finish_polled(
        &self,
        operation: Operation,
        result: Result<(), ErrorCode>,
    ) -> Result<(), ErrorCode> {
        let result = if operation.is_multiple() {
            let stopped = self.check(command::stop_transmission(self.host)).map(|_| ());
            result.and(stopped)
        } else {
            result
        };
        self.state.set(if result.is_ok() {
            TransferState::Completed
        } else {
            TransferState::Error
        });
        result
    }

    pub(crate) fn dma_channel(&self, operation: Operation) -> Option<&'a dyn DmaChannel> {
        if operation.is_read() {
            self.dma_rx.get()
        } else {
            self.dma_tx.get()
        }
    }

    /// Read `dest.len()` bytes, one `block_size` block each time the host
    /// has one ready, until the host signals transfer complete.
    pub(crate) fn poll_read(
        &self,
        dest: &mut [u8],
        block_size: usize,
        budget: u64,
    ) -> Result<(), ErrorCode> {
        let mut offset = 0;
        let mut polls = budget;
        loop {
            let status = self.host.interrupt_status();
            if status.any_matching_bits_set(registers::data_errors()) {
                return Err(self.polled_data_error(status));
            }
            if offset < dest.len() && self.host.present_state().is_set(PRESENT_STATE::BRE) {
                for word in dest[offset..offset + block_size].chunks_exact_mut(4) {
                    self.host.read_buffer(word);
                }
                offset += block_size;
                continue;
            }
            if status.is_set(INTERRUPT::TC) {
                self.host.clear_interrupt_status(registers::all_interrupts());
                return Ok(());
            }
            polls -= 1;
            if polls == 0 {
                return Err(self.polled_timeout());
            }
        }
    }

    /// Write `src`, one `block_size` block each time the host has room for
    /// one, until the host signals transfer complete.
    pub(crate) fn poll_write(
        &self,
        src: &[u8],
        block_size: usize,
        budget: u64,
    ) -> Result<(), ErrorCode> {
        let mut offset = 0;
        let mut polls = budget;
        loop {
            let status = self.host.interrupt_status();
            if status.any_matching_bits_set(registers::data_errors()) {
                return Err(self.polled_data_error(status));
            }
            if offset < src.len() && self.host.present_state().is_set(PRESENT_STATE::BWE) {
                for word in src[offset..offset + block_size].chunks_exact(4) {
                    self.host.write_buffer(word);
                }
                offset += block_size;
                continue;
            }
            if status.is_set(INTERRUPT::TC) {
                self.host.clear_interrupt_status(registers::all_interrupts());
                return Ok(());
            }
            polls -= 1;
            if polls == 0 {
                return Err(self.polled_timeout());
            }
        }
    }

    fn polled_data_error(&self, status: InterruptStatus) -> ErrorCode {
        self.host.clear_interrupt_status(registers::all_interrupts());
        debug!("sdmmc: data error, status {:#010x}", status.get());
        self.fail(CardErrors::from_interrupt_status(status))
    }

    fn polled_timeout(&self) -> ErrorCode {
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.record(CardErrors::TIMEOUT);
        ErrorCode::Timeout
    }
}

/// Transfer complete and data error interrupts.
fn completion_interrupts() -> InterruptMask {
    INTERRUPT::TC::SET + registers::data_errors()
}
