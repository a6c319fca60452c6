// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! A simulated SD host controller with one card behind it, two DMA channels
//! and a recording transfer client.
//!
//! Data phases behave like a real FIFO: a read makes one block at a time
//! available (buffer read ready), a write accepts one block at a time
//! (buffer write ready), and transfer complete is raised once the last
//! block moved. When the matching DMA channel holds a buffer the whole data
//! phase happens at once, as soon as the command is sent.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;

use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::{
    BusWidth, Command, CommandError, DataTransfer, Direction, DmaChannel, InterruptMask,
    SdioHost, SpeedMode, TransferClient,
};
use crate::registers::{InterruptStatus, PresentState, PRESENT_STATE};

pub const SIM_BLOCKS: usize = 1024;
const BLOCK: usize = 512;

pub const SD_RCA: u16 = 0xB368;

// CURRENT_STATE values
const IDLE: u32 = 0;
const READY: u32 = 1;
const IDENT: u32 = 2;
const STANDBY: u32 = 3;
const TRANSFER: u32 = 4;
const SENDING: u32 = 5;
const RECEIVING: u32 = 6;
const PROGRAMMING: u32 = 7;

const OUT_OF_RANGE: u32 = 1 << 31;
const ADDRESS_ERROR: u32 = 1 << 30;
const CARD_IS_LOCKED: u32 = 1 << 25;
const ILLEGAL_COMMAND: u32 = 1 << 22;
const READY_FOR_DATA: u32 = 1 << 8;
const SWITCH_ERROR: u32 = 1 << 7;
const APP_CMD: u32 = 1 << 5;

const OCR_VOLTAGES: u32 = 0x00FF_8000;
const OCR_BUSY: u32 = 1 << 31;
const OCR_CCS: u32 = 1 << 30;
const OCR_SECTOR_MODE: u32 = 2 << 29;

/// Host interrupt bits of a data CRC error.
pub const DATA_CRC_ERROR: u32 = (1 << 21) | (1 << 15);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimCardKind {
    SdV1,
    SdV2,
    Sdhc,
    Mmc,
    MmcHighCapacity,
}

impl SimCardKind {
    fn is_sd(self) -> bool {
        matches!(self, SimCardKind::SdV1 | SimCardKind::SdV2 | SimCardKind::Sdhc)
    }

    fn is_high_capacity(self) -> bool {
        matches!(self, SimCardKind::Sdhc | SimCardKind::MmcHighCapacity)
    }
}

struct DataPhase {
    direction: Direction,
    /// Read data not yet in the FIFO.
    pending: VecDeque<u8>,
    block_size: usize,
    /// Next byte offset written into memory.
    offset: usize,
    blocks_left: usize,
    multi: bool,
}

pub struct SimDma {
    buffer: Cell<Option<&'static mut [u8]>>,
    len: Cell<usize>,
    direction: Cell<Option<Direction>>,
    pub starts: Cell<usize>,
}

impl SimDma {
    fn new() -> SimDma {
        SimDma {
            buffer: Cell::new(None),
            len: Cell::new(0),
            direction: Cell::new(None),
            starts: Cell::new(0),
        }
    }

    pub fn armed(&self) -> bool {
        self.direction.get().is_some()
    }

    /// Copy `data` into the channel's buffer.
    fn fill(&self, data: &[u8]) -> bool {
        match self.buffer.take() {
            Some(buffer) => {
                let n = self.len.get().min(data.len());
                buffer[..n].copy_from_slice(&data[..n]);
                self.buffer.set(Some(buffer));
                true
            }
            None => false,
        }
    }

    /// Copy the channel's buffer out.
    fn drain(&self) -> Option<Vec<u8>> {
        self.buffer.take().map(|buffer| {
            let data = buffer[..self.len.get()].to_vec();
            self.buffer.set(Some(buffer));
            data
        })
    }
}

impl DmaChannel for SimDma {
    fn start_transfer(
        &self,
        direction: Direction,
        buffer: &'static mut [u8],
        len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if self.armed() {
            return Err((ErrorCode::Busy, buffer));
        }
        self.starts.set(self.starts.get() + 1);
        self.buffer.set(Some(buffer));
        self.len.set(len);
        self.direction.set(Some(direction));
        Ok(())
    }

    fn stop_transfer(&self) -> Option<&'static mut [u8]> {
        self.direction.set(None);
        self.buffer.take()
    }
}

pub struct SimHost {
    pub kind: SimCardKind,
    memory: RefCell<Vec<u8>>,

    // Card
    card_state: Cell<u32>,
    app_cmd: Cell<bool>,
    op_cond_queries: Cell<u32>,
    erase_start: Cell<usize>,
    erase_end: Cell<usize>,
    hs_timing: Cell<u8>,
    mmc_bus_width: Cell<u8>,
    sd_high_speed: Cell<bool>,
    pending_switch_error: Cell<bool>,

    // Knobs
    /// Operating condition queries answered busy before the card is ready.
    pub busy_op_cond: Cell<u32>,
    pub read_block_len: Cell<u32>,
    pub mmc_spec_vers: Cell<u32>,
    pub locked: Cell<bool>,
    /// CMD13 polls answered with `Programming` before the card is ready.
    pub busy_status_polls: Cell<u32>,
    /// MMC SWITCH commands are refused with SWITCH_ERROR.
    pub switch_error: Cell<bool>,
    /// SD SWITCH_FUNC advertises high speed but never grants it.
    pub switch_refused: Cell<bool>,
    /// Data commands are accepted but no data ever moves.
    pub stall_data: Cell<bool>,
    /// Interrupt status bits raised instead of moving data.
    pub data_error: Cell<u32>,

    // Host
    powered: Cell<bool>,
    clock_on: Cell<bool>,
    pub divider: Cell<u16>,
    pub bus_width: Cell<BusWidth>,
    pub speed: Cell<SpeedMode>,
    response: Cell<[u32; 4]>,
    int_status: Cell<u32>,
    int_enable: Cell<u32>,
    transfer: Cell<Option<DataTransfer>>,
    phase: RefCell<Option<DataPhase>>,
    fifo: RefCell<VecDeque<u8>>,
    log: RefCell<Vec<(bool, Command)>>,

    pub dma_tx: SimDma,
    pub dma_rx: SimDma,
}

impl SimHost {
    pub fn new(kind: SimCardKind) -> SimHost {
        SimHost {
            kind,
            memory: RefCell::new(vec![0x5A; SIM_BLOCKS * BLOCK]),
            card_state: Cell::new(IDLE),
            app_cmd: Cell::new(false),
            op_cond_queries: Cell::new(0),
            erase_start: Cell::new(0),
            erase_end: Cell::new(0),
            hs_timing: Cell::new(0),
            mmc_bus_width: Cell::new(0),
            sd_high_speed: Cell::new(false),
            pending_switch_error: Cell::new(false),
            busy_op_cond: Cell::new(3),
            read_block_len: Cell::new(9),
            mmc_spec_vers: Cell::new(4),
            locked: Cell::new(false),
            busy_status_polls: Cell::new(0),
            switch_error: Cell::new(false),
            switch_refused: Cell::new(false),
            stall_data: Cell::new(false),
            data_error: Cell::new(0),
            powered: Cell::new(false),
            clock_on: Cell::new(false),
            divider: Cell::new(0),
            bus_width: Cell::new(BusWidth::One),
            speed: Cell::new(SpeedMode::Default),
            response: Cell::new([0; 4]),
            int_status: Cell::new(0),
            int_enable: Cell::new(0),
            transfer: Cell::new(None),
            phase: RefCell::new(None),
            fifo: RefCell::new(VecDeque::new()),
            log: RefCell::new(Vec::new()),
            dma_tx: SimDma::new(),
            dma_rx: SimDma::new(),
        }
    }

    pub fn powered(&self) -> bool {
        self.powered.get() && self.clock_on.get()
    }

    /// Whether an enabled interrupt is pending.
    pub fn irq_pending(&self) -> bool {
        self.int_status.get() & self.int_enable.get() != 0
    }

    pub fn sd_high_speed(&self) -> bool {
        self.sd_high_speed.get()
    }

    pub fn hs_timing(&self) -> u8 {
        self.hs_timing.get()
    }

    pub fn mmc_bus_width(&self) -> u8 {
        self.mmc_bus_width.get()
    }

    /// Whether the card is still in a data state.
    pub fn card_moving_data(&self) -> bool {
        matches!(self.card_state.get(), SENDING | RECEIVING)
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    pub fn log_is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    /// Number of (non application) commands `index` sent.
    pub fn sent(&self, index: u8) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|(app, c)| !*app && c.index == index)
            .count()
    }

    /// Number of application commands `index` sent.
    pub fn sent_app(&self, index: u8) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|(app, c)| *app && c.index == index)
            .count()
    }

    /// Arguments of every (non application) command `index` sent.
    pub fn arguments(&self, index: u8) -> Vec<u32> {
        self.log
            .borrow()
            .iter()
            .filter(|(app, c)| !*app && c.index == index)
            .map(|(_, c)| c.argument)
            .collect()
    }

    pub fn block(&self, block: usize) -> Vec<u8> {
        self.memory.borrow()[block * BLOCK..(block + 1) * BLOCK].to_vec()
    }

    pub fn fill_block(&self, block: usize, value: u8) {
        self.memory.borrow_mut()[block * BLOCK..(block + 1) * BLOCK].fill(value);
    }

    fn erased_byte(&self) -> u8 {
        if self.kind.is_sd() {
            0x00
        } else {
            0xFF
        }
    }

    fn cid(&self) -> u128 {
        let mut raw: u128 = 1;
        if self.kind.is_sd() {
            raw |= 0x03u128 << 120;
            raw |= u128::from(u16::from_be_bytes(*b"SD")) << 104;
            for (i, c) in b"SIM01".iter().enumerate() {
                raw |= u128::from(*c) << (64 + 8 * (4 - i));
            }
            raw |= 0x10u128 << 56;
            raw |= 0x1234_5678u128 << 24;
            raw |= ((22u128 << 4) | 5) << 8;
        } else {
            raw |= 0x15u128 << 120;
            raw |= 0x1u128 << 112;
            raw |= 0x01u128 << 104;
            for (i, c) in b"SIMMMC".iter().enumerate() {
                raw |= u128::from(*c) << (56 + 8 * (5 - i));
            }
            raw |= 0x20u128 << 48;
            raw |= 0xCAFE_F00Du128 << 16;
            raw |= ((5u128 << 4) | 10) << 8;
        }
        raw
    }

    fn csd(&self) -> u128 {
        let read_bl_len = u128::from(self.read_block_len.get());
        let base: u128 = (0x32u128 << 96) | (read_bl_len << 80) | (read_bl_len << 22) | 1;
        let mmc = (2u128 << 126) | (0x0F5u128 << 84);
        match self.kind {
            // C_SIZE 255, C_SIZE_MULT 0: 1024 blocks of 512 bytes.
            SimCardKind::SdV1 | SimCardKind::SdV2 => base | (0x5B5u128 << 84) | (255u128 << 62),
            SimCardKind::Sdhc => (1u128 << 126) | base | (0x5B5u128 << 84),
            SimCardKind::Mmc => {
                let spec_vers = u128::from(self.mmc_spec_vers.get());
                mmc | (spec_vers << 122) | base | (255u128 << 62)
            }
            SimCardKind::MmcHighCapacity => {
                mmc | (4u128 << 122) | base | (0xFFFu128 << 62) | (7u128 << 47)
            }
        }
    }

    fn scr(&self) -> Vec<u8> {
        let sd_spec = if self.kind == SimCardKind::SdV1 { 0 } else { 2 };
        vec![sd_spec, 0x05, 0, 0, 0, 0, 0, 0]
    }

    fn ext_csd(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK];
        if self.kind == SimCardKind::MmcHighCapacity {
            block[212..216].copy_from_slice(&(SIM_BLOCKS as u32).to_le_bytes());
        }
        block[196] = 0x03;
        block[192] = 5;
        block[185] = self.hs_timing.get();
        block[183] = self.mmc_bus_width.get();
        block[181] = 1;
        block
    }

    fn sd_status(&self) -> Vec<u8> {
        let mut block = vec![0u8; 64];
        if self.bus_width.get() == BusWidth::Four {
            block[0] = 0x80;
        }
        block[8] = 4;
        block[10] = 0x90;
        block
    }

    fn status_word(&self) -> u32 {
        let state = self.card_state.get();
        let mut status = state << 9;
        if state == TRANSFER {
            status |= READY_FOR_DATA;
        }
        if self.locked.get() {
            status |= CARD_IS_LOCKED;
        }
        status
    }

    fn respond(&self, word: u32) -> Result<(), CommandError> {
        self.response.set([word, 0, 0, 0]);
        Ok(())
    }

    fn respond_r2(&self, raw: u128) -> Result<(), CommandError> {
        self.response.set([
            raw as u32,
            (raw >> 32) as u32,
            (raw >> 64) as u32,
            (raw >> 96) as u32,
        ]);
        Ok(())
    }

    /// OCR responses carry no CRC; this host flags them as CRC failures.
    fn respond_r3(&self, ocr: u32) -> Result<(), CommandError> {
        self.response.set([ocr, 0, 0, 0]);
        Err(CommandError::Crc)
    }

    fn op_cond_ready(&self) -> bool {
        let queries = self.op_cond_queries.get() + 1;
        self.op_cond_queries.set(queries);
        queries > self.busy_op_cond.get()
    }

    /// Card byte offset of a data address argument.
    fn byte_offset(&self, argument: u32) -> Option<usize> {
        if self.kind.is_high_capacity() {
            Some(argument as usize * BLOCK)
        } else if argument as usize % BLOCK == 0 {
            Some(argument as usize)
        } else {
            None
        }
    }

    fn basic_command(&self, command: Command) -> Result<(), CommandError> {
        match command.index {
            0 => {
                self.card_state.set(IDLE);
                self.op_cond_queries.set(0);
                Ok(())
            }
            1 if !self.kind.is_sd() => {
                if self.op_cond_ready() {
                    self.card_state.set(READY);
                    let mode = if self.kind.is_high_capacity() {
                        OCR_SECTOR_MODE
                    } else {
                        0
                    };
                    self.respond_r3(OCR_BUSY | OCR_VOLTAGES | mode)
                } else {
                    self.respond_r3(OCR_VOLTAGES)
                }
            }
            2 => {
                self.card_state.set(IDENT);
                self.respond_r2(self.cid())
            }
            3 => {
                let status = self.status_word();
                self.card_state.set(STANDBY);
                if self.kind.is_sd() {
                    self.respond((u32::from(SD_RCA) << 16) | (status & 0x1E00))
                } else {
                    self.respond(status)
                }
            }
            6 if self.kind.is_sd() => self.sd_switch(command.argument),
            6 => self.mmc_switch(command.argument),
            7 => {
                let status = self.status_word();
                self.card_state.set(TRANSFER);
                self.respond(status)
            }
            8 if self.kind.is_sd() => {
                if self.kind == SimCardKind::SdV1 {
                    Err(CommandError::Timeout)
                } else {
                    self.respond(command.argument & 0xFFF)
                }
            }
            8 => self.start_read(self.ext_csd(), false),
            9 => self.respond_r2(self.csd()),
            12 => {
                *self.phase.borrow_mut() = None;
                self.fifo.borrow_mut().clear();
                self.card_state.set(TRANSFER);
                self.respond(self.status_word())
            }
            13 => {
                let busy = self.busy_status_polls.get();
                if busy > 0 {
                    self.busy_status_polls.set(busy - 1);
                    return self.respond(PROGRAMMING << 9);
                }
                let mut status = self.status_word();
                if self.pending_switch_error.replace(false) {
                    status |= SWITCH_ERROR;
                }
                self.respond(status)
            }
            16 => self.respond(self.status_word()),
            17 | 18 => {
                let count = self.transfer.get().map_or(1, |t| t.block_count as usize);
                let Some(offset) = self.byte_offset(command.argument) else {
                    return self.respond(self.status_word() | ADDRESS_ERROR);
                };
                if offset + count * BLOCK > SIM_BLOCKS * BLOCK {
                    return self.respond(self.status_word() | OUT_OF_RANGE);
                }
                let data = self.memory.borrow()[offset..offset + count * BLOCK].to_vec();
                self.start_read(data, command.index == 18)
            }
            24 | 25 => {
                let count = self.transfer.get().map_or(1, |t| t.block_count as usize);
                let Some(offset) = self.byte_offset(command.argument) else {
                    return self.respond(self.status_word() | ADDRESS_ERROR);
                };
                if offset + count * BLOCK > SIM_BLOCKS * BLOCK {
                    return self.respond(self.status_word() | OUT_OF_RANGE);
                }
                self.start_write(offset, count, command.index == 25)
            }
            32 | 35 => match self.byte_offset(command.argument) {
                Some(offset) => {
                    self.erase_start.set(offset / BLOCK);
                    self.respond(self.status_word())
                }
                None => self.respond(self.status_word() | ADDRESS_ERROR),
            },
            33 | 36 => match self.byte_offset(command.argument) {
                Some(offset) => {
                    self.erase_end.set(offset / BLOCK);
                    self.respond(self.status_word())
                }
                None => self.respond(self.status_word() | ADDRESS_ERROR),
            },
            38 => {
                let (start, end) = (self.erase_start.get(), self.erase_end.get());
                self.memory.borrow_mut()[start * BLOCK..(end + 1) * BLOCK].fill(self.erased_byte());
                self.respond(self.status_word())
            }
            55 => {
                self.app_cmd.set(true);
                self.respond(self.status_word() | APP_CMD)
            }
            _ => self.respond(self.status_word() | ILLEGAL_COMMAND),
        }
    }

    fn application_command(&self, command: Command) -> Result<(), CommandError> {
        match command.index {
            6 => self.respond(self.status_word() | APP_CMD),
            13 => self.start_read(self.sd_status(), false),
            41 => {
                if self.op_cond_ready() {
                    self.card_state.set(READY);
                    let hcs = command.argument & (1 << 30) != 0;
                    let ccs = if self.kind == SimCardKind::Sdhc && hcs {
                        OCR_CCS
                    } else {
                        0
                    };
                    self.respond_r3(OCR_BUSY | OCR_VOLTAGES | ccs)
                } else {
                    self.respond_r3(OCR_VOLTAGES)
                }
            }
            51 => self.start_read(self.scr(), false),
            _ => self.respond(self.status_word() | ILLEGAL_COMMAND),
        }
    }

    fn sd_switch(&self, argument: u32) -> Result<(), CommandError> {
        let set = argument & (1 << 31) != 0;
        let function = (argument & 0xF) as u8;
        let supported: u16 = 0x8003;
        let granted = if supported & (1 << function) == 0 || (set && self.switch_refused.get()) {
            0xF
        } else {
            function
        };
        if set && granted == function {
            self.sd_high_speed.set(function == 1);
        }
        let mut block = vec![0u8; 64];
        block[1] = 100;
        block[12..14].copy_from_slice(&supported.to_be_bytes());
        block[16] = granted;
        self.start_read(block, false)
    }

    fn mmc_switch(&self, argument: u32) -> Result<(), CommandError> {
        let status = self.status_word();
        if self.switch_error.get() {
            self.pending_switch_error.set(true);
            return self.respond(status);
        }
        let index = (argument >> 16) & 0xFF;
        let value = ((argument >> 8) & 0xFF) as u8;
        match index {
            185 => self.hs_timing.set(value),
            183 => self.mmc_bus_width.set(value),
            _ => {}
        }
        self.respond(status)
    }

    fn start_read(&self, data: Vec<u8>, multi: bool) -> Result<(), CommandError> {
        self.respond(self.status_word())?;
        self.card_state.set(SENDING);
        if self.stall_data.get() {
            return Ok(());
        }
        if self.data_error.get() != 0 {
            self.raise(self.data_error.get());
            return Ok(());
        }
        if self.dma_rx.armed() && self.dma_rx.fill(&data) {
            self.data_done(multi);
            return Ok(());
        }
        let block_size = self
            .transfer
            .get()
            .map_or(data.len(), |t| t.block_size as usize);
        *self.phase.borrow_mut() = Some(DataPhase {
            direction: Direction::Read,
            pending: data.into_iter().collect(),
            block_size,
            offset: 0,
            blocks_left: 0,
            multi,
        });
        self.load_block();
        Ok(())
    }

    fn start_write(&self, offset: usize, count: usize, multi: bool) -> Result<(), CommandError> {
        self.respond(self.status_word())?;
        self.card_state.set(RECEIVING);
        if self.stall_data.get() {
            return Ok(());
        }
        if self.data_error.get() != 0 {
            self.raise(self.data_error.get());
            return Ok(());
        }
        if self.dma_tx.armed() {
            if let Some(data) = self.dma_tx.drain() {
                let len = data.len().min(count * BLOCK);
                self.memory.borrow_mut()[offset..offset + len].copy_from_slice(&data[..len]);
                self.data_done(multi);
                return Ok(());
            }
        }
        *self.phase.borrow_mut() = Some(DataPhase {
            direction: Direction::Write,
            pending: VecDeque::new(),
            block_size: BLOCK,
            offset,
            blocks_left: count,
            multi,
        });
        self.raise(1 << 4);
        Ok(())
    }

    /// Move the next read block into the FIFO.
    fn load_block(&self) {
        let mut phase = self.phase.borrow_mut();
        if let Some(phase) = phase.as_mut() {
            let n = phase.block_size.min(phase.pending.len());
            self.fifo.borrow_mut().extend(phase.pending.drain(..n));
            self.raise(1 << 5);
        }
    }

    fn data_done(&self, multi: bool) {
        *self.phase.borrow_mut() = None;
        if !multi {
            self.card_state.set(TRANSFER);
        }
        self.raise(1 << 1);
    }

    fn raise(&self, bits: u32) {
        self.int_status.set(self.int_status.get() | bits);
    }
}

impl SdioHost for SimHost {
    fn power(&self, on: bool) {
        self.powered.set(on);
        if !on {
            self.card_state.set(IDLE);
        }
    }

    fn clock(&self, on: bool) {
        self.clock_on.set(on);
    }

    fn set_clock_divider(&self, divider: u16) {
        self.divider.set(divider);
    }

    fn set_bus_width(&self, width: BusWidth) {
        self.bus_width.set(width);
    }

    fn set_speed_mode(&self, mode: SpeedMode) {
        self.speed.set(mode);
    }

    fn send_command(&self, command: Command) -> Result<(), CommandError> {
        let app = self.app_cmd.replace(false);
        self.log.borrow_mut().push((app, command));
        if !self.powered() {
            return Err(CommandError::Timeout);
        }
        if app {
            self.application_command(command)
        } else {
            self.basic_command(command)
        }
    }

    fn response(&self) -> [u32; 4] {
        self.response.get()
    }

    fn configure_data(&self, transfer: &DataTransfer) {
        self.transfer.set(Some(*transfer));
    }

    fn read_buffer(&self, dest: &mut [u8]) {
        assert_eq!(dest.len() % 4, 0);
        let drained = {
            let mut fifo = self.fifo.borrow_mut();
            for byte in dest.iter_mut() {
                *byte = fifo.pop_front().expect("read from an empty FIFO");
            }
            fifo.is_empty()
        };
        if !drained {
            return;
        }
        let more = self
            .phase
            .borrow()
            .as_ref()
            .map_or(false, |phase| !phase.pending.is_empty());
        if more {
            self.load_block();
        } else if let Some(phase) = self.phase.borrow_mut().take() {
            if !phase.multi {
                self.card_state.set(TRANSFER);
            }
            self.raise(1 << 1);
        }
    }

    fn write_buffer(&self, src: &[u8]) {
        assert_eq!(src.len() % 4, 0);
        let mut fifo = self.fifo.borrow_mut();
        fifo.extend(src.iter().copied());
        let mut phase_slot = self.phase.borrow_mut();
        let Some(phase) = phase_slot.as_mut() else {
            panic!("write outside a data phase");
        };
        if fifo.len() < phase.block_size {
            return;
        }
        let block: Vec<u8> = fifo.drain(..phase.block_size).collect();
        self.memory.borrow_mut()[phase.offset..phase.offset + block.len()].copy_from_slice(&block);
        phase.offset += block.len();
        phase.blocks_left -= 1;
        if phase.blocks_left > 0 {
            self.raise(1 << 4);
        } else {
            let multi = phase.multi;
            *phase_slot = None;
            if !multi {
                self.card_state.set(TRANSFER);
            }
            self.raise(1 << 1);
        }
    }

    fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::new(self.int_status.get())
    }

    fn clear_interrupt_status(&self, mask: InterruptMask) {
        self.int_status.set(self.int_status.get() & !mask.value);
    }

    fn enable_interrupts(&self, mask: InterruptMask, enable: bool) {
        if enable {
            self.int_enable.set(self.int_enable.get() | mask.value);
        } else {
            self.int_enable.set(self.int_enable.get() & !mask.value);
        }
    }

    fn present_state(&self) -> PresentState {
        let mut state = PresentState::new(0);
        state.modify(PRESENT_STATE::CIN::SET);
        if let Some(phase) = self.phase.borrow().as_ref() {
            match phase.direction {
                Direction::Read => {
                    if !self.fifo.borrow().is_empty() {
                        state.modify(PRESENT_STATE::BRE::SET);
                    }
                }
                Direction::Write => {
                    if phase.blocks_left > 0 && self.fifo.borrow().len() < phase.block_size {
                        state.modify(PRESENT_STATE::BWE::SET);
                    }
                }
            }
        }
        state
    }
}

/// How a transfer reported back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Tx,
    Rx,
    Error(CardErrors),
}

pub struct SimClient {
    pub completion: Cell<Option<Completion>>,
    pub buffer: Cell<Option<&'static mut [u8]>>,
}

impl SimClient {
    pub fn new() -> SimClient {
        SimClient {
            completion: Cell::new(None),
            buffer: Cell::new(None),
        }
    }
}

impl TransferClient for SimClient {
    fn tx_complete(&self, buffer: &'static mut [u8]) {
        self.completion.set(Some(Completion::Tx));
        self.buffer.set(Some(buffer));
    }

    fn rx_complete(&self, buffer: &'static mut [u8]) {
        self.completion.set(Some(Completion::Rx));
        self.buffer.set(Some(buffer));
    }

    fn transfer_error(&self, buffer: Option<&'static mut [u8]>, errors: CardErrors) {
        self.completion.set(Some(Completion::Error(errors)));
        self.buffer.set(buffer);
    }
}

/// A leaked, word aligned buffer of `len` bytes.
pub fn aligned_buffer(len: usize) -> &'static mut [u8] {
    let raw: &'static mut [u8] = vec![0u8; len + 4].leak();
    let skip = (4 - raw.as_ptr() as usize % 4) % 4;
    &mut raw[skip..skip + len]
}

/// A leaked buffer of `len` bytes whose address is not a multiple of 4.
pub fn misaligned_buffer(len: usize) -> &'static mut [u8] {
    let raw: &'static mut [u8] = vec![0u8; len + 5].leak();
    let skip = (4 - raw.as_ptr() as usize % 4) % 4 + 1;
    &mut raw[skip..skip + len]
}

/// Let the interrupt line fire until nothing enabled is pending.
pub fn run_interrupts<F: Fn()>(host: &SimHost, handle_interrupt: F) {
    for _ in 0..10_000 {
        if !host.irq_pending() {
            return;
        }
        handle_interrupt();
    }
    panic!("interrupt storm");
}
