// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interfaces between the card client, the SD host controller driver, a DMA
//! engine and the application.
//!
//! The card client never touches hardware registers itself. A chip crate
//! implements [`SdioHost`] for its SD host controller and, optionally,
//! [`DmaChannel`] for the DMA channels wired to the controller's data FIFO.
//! The application implements [`TransferClient`] to learn about completed
//! interrupt and DMA transfers.

use tock_registers::fields::FieldValue;

use crate::errorcode::{CardErrors, ErrorCode};
use crate::registers::{InterruptStatus, PresentState, INTERRUPT};

/// Interrupt mask accepted by [`SdioHost::clear_interrupt_status`] and
/// [`SdioHost::enable_interrupts`].
pub type InterruptMask = FieldValue<u32, INTERRUPT::Register>;

/// Shape of the response a command expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseType {
    /// No response (CMD0).
    None,
    /// 48 bit normal response carrying the card status.
    R1,
    /// R1 followed by a busy phase on DAT0.
    R1b,
    /// 136 bit response carrying the CID or CSD.
    R2,
    /// OCR response. R3 carries no CRC.
    R3,
    /// SD published RCA response.
    R6,
    /// SD interface condition response.
    R7,
}

/// A command to send on the CMD line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Command index, 0 to 63. Application specific commands use the same
    /// index as their generic counterpart and must follow a CMD55.
    pub index: u8,
    /// 32 bit argument.
    pub argument: u32,
    /// Response the host should wait for.
    pub response: ResponseType,
    /// Whether a data phase follows on the DAT lines.
    pub data_present: bool,
}

impl Command {
    /// A command without a data phase.
    pub const fn new(index: u8, argument: u32, response: ResponseType) -> Command {
        Command {
            index,
            argument,
            response,
            data_present: false,
        }
    }

    /// A command followed by a data phase.
    pub const fn with_data(index: u8, argument: u32, response: ResponseType) -> Command {
        Command {
            index,
            argument,
            response,
            data_present: true,
        }
    }
}

/// Failure of a single command, as reported by the host controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// No response within the host's command timeout.
    Timeout,
    /// The response failed its CRC check.
    Crc,
    /// The response end bit was 0.
    EndBit,
    /// The response carried a different command index.
    Index,
}

/// Direction of a data phase, seen from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// Whether a data phase moves one or several blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferMode {
    Single,
    Multiple,
}

/// Descriptor programmed into the host before a data command is sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataTransfer {
    /// Bytes per block.
    pub block_size: u16,
    /// Number of blocks in the data phase.
    pub block_count: u16,
    pub direction: Direction,
    pub mode: TransferMode,
    /// Data timeout, as a power of two of the SD clock period.
    pub timeout_exponent: u8,
}

/// Width of the data bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

/// Bus timing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpeedMode {
    /// Default speed (SD up to 25 MHz, MMC up to 26 MHz).
    Default,
    /// High speed (SD up to 50 MHz, MMC up to 52 MHz).
    High,
}

/// Primitives of an SD host controller.
///
/// All calls are synchronous. `send_command` blocks until the response has
/// arrived or the host's hardware command timeout expired; it does not wait
/// for a data phase. Buffer accesses move whole 32-bit FIFO words, so the
/// slices passed to `read_buffer` and `write_buffer` have a length that is a
/// multiple of 4. Bytes are in bus order.
pub trait SdioHost {
    /// Switch bus power on or off.
    fn power(&self, on: bool);

    /// Gate the SD clock.
    fn clock(&self, on: bool);

    /// Program the SD clock divider.
    fn set_clock_divider(&self, divider: u16);

    fn set_bus_width(&self, width: BusWidth);

    fn set_speed_mode(&self, mode: SpeedMode);

    /// Send a command and wait for its response.
    fn send_command(&self, command: Command) -> Result<(), CommandError>;

    /// Response of the last command. For 48 bit responses only word 0 is
    /// meaningful. For R2 the words hold the 128 bit register, least
    /// significant word first, with bit 0 of word 0 being bit 0 of the
    /// register.
    fn response(&self) -> [u32; 4];

    /// Program block size, count, direction and data timeout for the next
    /// data command.
    fn configure_data(&self, transfer: &DataTransfer);

    /// Pop words from the data FIFO.
    fn read_buffer(&self, dest: &mut [u8]);

    /// Push words into the data FIFO.
    fn write_buffer(&self, src: &[u8]);

    /// Current normal and error interrupt status, whether enabled or not.
    fn interrupt_status(&self) -> InterruptStatus;

    /// Acknowledge the given status bits.
    fn clear_interrupt_status(&self, mask: InterruptMask);

    /// Route (or stop routing) the given status bits to the interrupt line.
    fn enable_interrupts(&self, mask: InterruptMask, enable: bool);

    /// Host present state (FIFO readiness, inhibit bits, card detect).
    fn present_state(&self) -> PresentState;
}

/// A DMA channel connected to the host controller's data FIFO.
///
/// The channel owns the buffer from a successful `start_transfer` until
/// `stop_transfer` hands it back. The host controller signals the end of the
/// data phase with its transfer complete interrupt, so the channel does not
/// need a client of its own.
pub trait DmaChannel {
    /// Move `len` bytes between `buffer` and the FIFO. On failure the buffer
    /// is returned.
    fn start_transfer(
        &self,
        direction: Direction,
        buffer: &'static mut [u8],
        len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    /// Disable the channel and return its buffer, if any.
    fn stop_transfer(&self) -> Option<&'static mut [u8]>;
}

/// Completion callbacks for interrupt and DMA transfers.
///
/// Called from [`SdmmcCard::handle_interrupt`](crate::sdmmc::SdmmcCard::handle_interrupt),
/// i.e. in interrupt context. Every method has an empty default body.
pub trait TransferClient {
    /// A write finished. The card is done with `buffer`.
    fn tx_complete(&self, _buffer: &'static mut [u8]) {}

    /// A read finished and `buffer` holds the data.
    fn rx_complete(&self, _buffer: &'static mut [u8]) {}

    /// A transfer failed. `errors` is the sticky error set of the card at
    /// the time of the failure.
    fn transfer_error(&self, _buffer: Option<&'static mut [u8]>, _errors: CardErrors) {}
}
