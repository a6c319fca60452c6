// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Completion of interrupt and DMA transfers, and abort.
//!
//! `handle_interrupt` is the only code that runs in interrupt context. It is
//! driven by the transfer context the foreground wrote before sending the
//! data command:
//!
//! ```text
//!            data error              buffer ready (Interrupt only)      transfer complete
//!   Active ------------> Error       Active --> move one block --> Active ------------> Completed
//!     | stop DMA, CMD12 if the card                                    | CMD12 if multi-block
//!     | is still moving data                                           | stop DMA
//!     v transfer_error                                                 v tx_complete / rx_complete
//! ```
//!
//! Errors are handled first, buffer ready second and transfer complete last,
//! so the final block of an interrupt driven read is drained before the
//! transfer is reported complete.

use core::cmp;

use log::{debug, warn};

use crate::card::LOGICAL_BLOCK_SIZE;
use crate::command;
use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::SdioHost;
use crate::registers::{self, InterruptStatus, INTERRUPT};
use crate::sdmmc::{SdmmcCard, Strategy, TransferContext, TransferState};

impl<'a, H: SdioHost> SdmmcCard<'a, H> {
    /// Service the host controller interrupt line.
    pub fn handle_interrupt(&self) {
        let status = self.host.interrupt_status();
        let context = match self.context.get() {
            Some(context) if self.state.get() == TransferState::Active => context,
            _ => {
                debug!("sdmmc: unexpected interrupt {:#010x}", status.get());
                self.host.clear_interrupt_status(registers::all_interrupts());
                return;
            }
        };

        if status.any_matching_bits_set(registers::data_errors()) {
            self.data_error(context, status);
            return;
        }

        if context.strategy == Strategy::Interrupt {
            if status.is_set(INTERRUPT::BRR) {
                self.host.clear_interrupt_status(INTERRUPT::BRR::SET);
                self.read_block_from_fifo();
            }
            if status.is_set(INTERRUPT::BWR) {
                self.host.clear_interrupt_status(INTERRUPT::BWR::SET);
                self.write_block_to_fifo();
            }
        }

        if status.is_set(INTERRUPT::TC) {
            self.transfer_complete(context);
        }
    }

    /// Stop whatever transfer is pending: disable the interrupt sources,
    /// tear down the DMA channel and stop the card if it is still moving
    /// data. Returns the outcome of stopping the card and the reclaimed
    /// transfer buffer.
    ///
    /// A write aborted half way leaves the card's contents in whatever state
    /// the card's own firmware leaves them.
    pub fn abort(&self) -> (Result<(), ErrorCode>, Option<&'static mut [u8]>) {
        self.host.enable_interrupts(registers::all_interrupts(), false);
        self.host.clear_interrupt_status(registers::all_interrupts());

        let buffer = self.reclaim_buffer(self.context.get());
        self.cursor.set(0);
        self.remaining.set(0);

        let result = match self.info.get() {
            Some(info) => self.stop_if_moving_data(info.rca),
            None => Ok(()),
        };
        self.state.set(if result.is_ok() {
            TransferState::Idle
        } else {
            TransferState::Error
        });
        (result, buffer)
    }

    fn data_error(&self, context: TransferContext, status: InterruptStatus) {
        self.record(CardErrors::from_interrupt_status(status));
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.enable_interrupts(registers::all_interrupts(), false);

        let buffer = self.reclaim_buffer(Some(context));
        if context.strategy == Strategy::Dma {
            if let Some(info) = self.info.get() {
                // Failures are recorded in the sticky set reported below.
                let _ = self.stop_if_moving_data(info.rca);
            }
        }
        self.remaining.set(0);
        self.state.set(TransferState::Error);
        warn!(
            "sdmmc: {:?} failed, status {:#010x}",
            context.operation,
            status.get()
        );
        let errors = self.errors.get();
        self.client
            .get()
            .map(|client| client.transfer_error(buffer, errors));
    }

    fn transfer_complete(&self, context: TransferContext) {
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.enable_interrupts(registers::all_interrupts(), false);

        let stopped = if context.operation.is_multiple() {
            command::stop_transmission(self.host).map(|_| ())
        } else {
            Ok(())
        };
        let buffer = self.reclaim_buffer(Some(context));
        self.remaining.set(0);

        let failure = match (stopped, buffer.is_some()) {
            (Err(errors), _) => Some(errors),
            (Ok(()), false) => Some(CardErrors::DMA),
            (Ok(()), true) => None,
        };
        if let Some(errors) = failure {
            self.record(errors);
            self.state.set(TransferState::Error);
            let errors = self.errors.get();
            self.client
                .get()
                .map(|client| client.transfer_error(buffer, errors));
            return;
        }

        self.state.set(TransferState::Completed);
        if let (Some(client), Some(buffer)) = (self.client.get(), buffer) {
            if context.operation.is_read() {
                client.rx_complete(buffer);
            } else {
                client.tx_complete(buffer);
            }
        }
    }

    /// Pop one block from the FIFO into the interrupt transfer buffer.
    fn read_block_from_fifo(&self) {
        let remaining = self.remaining.get();
        if remaining == 0 {
            return;
        }
        self.buffer.take().map(|buffer| {
            let start = self.cursor.get();
            let len = cmp::min(remaining, LOGICAL_BLOCK_SIZE as usize);
            for word in buffer[start..start + len].chunks_exact_mut(4) {
                self.host.read_buffer(word);
            }
            self.cursor.set(start + len);
            self.remaining.set(remaining - len);
            self.buffer.set(Some(buffer));
        });
        if self.remaining.get() == 0 {
            self.host.enable_interrupts(INTERRUPT::BRR::SET, false);
        }
    }

    /// Push one block from the interrupt transfer buffer into the FIFO.
    fn write_block_to_fifo(&self) {
        let remaining = self.remaining.get();
        if remaining == 0 {
            return;
        }
        self.buffer.take().map(|buffer| {
            let start = self.cursor.get();
            let len = cmp::min(remaining, LOGICAL_BLOCK_SIZE as usize);
            for word in buffer[start..start + len].chunks_exact(4) {
                self.host.write_buffer(word);
            }
            self.cursor.set(start + len);
            self.remaining.set(remaining - len);
            self.buffer.set(Some(buffer));
        });
        if self.remaining.get() == 0 {
            self.host.enable_interrupts(INTERRUPT::BWR::SET, false);
        }
    }

    /// Take the transfer buffer back from the interrupt handler's storage or
    /// from the DMA channel, depending on the transfer strategy.
    fn reclaim_buffer(&self, context: Option<TransferContext>) -> Option<&'static mut [u8]> {
        match context {
            Some(TransferContext {
                operation,
                strategy: Strategy::Dma,
            }) => self
                .dma_channel(operation)
                .and_then(|dma| dma.stop_transfer()),
            _ => self.buffer.take(),
        }
    }

    /// Send STOP_TRANSMISSION if the card is still sending or receiving.
    fn stop_if_moving_data(&self, rca: u16) -> Result<(), ErrorCode> {
        let state = self.check(command::current_state(self.host, rca))?;
        if state.is_moving_data() {
            debug!("sdmmc: stopping card in {:?}", state);
            self.check(command::stop_transmission(self.host))?;
        }
        Ok(())
    }
}
