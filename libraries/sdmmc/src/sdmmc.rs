// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The card handle.
//!
//! [`SdmmcCard`] holds everything known about the card in one slot: the
//! host it is reached through, the negotiated configuration, the metadata
//! read during identification, the sticky error set and the context of the
//! transfer in flight. The operations themselves live in the `ident`, `bus`,
//! `transfer` and `irq` modules as further `impl` blocks on this type.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let card = static_init!(SdmmcCard<'static, Sdioc>, SdmmcCard::new(&peripherals.sdioc1));
//! card.set_client(app);
//! card.set_dma(&peripherals.dma1_ch0, &peripherals.dma1_ch1);
//! card.init(CardConfig::default())?;
//! ```

use core::cell::Cell;

use log::{debug, info, warn};

use crate::card::{
    CardIdentification, CardInfo, CardMode, CardSpecificData, CardState, CardType, ExtendedCsd,
    SdConfiguration,
};
use crate::command;
use crate::errorcode::{CardErrors, ErrorCode};
use crate::hil::{BusWidth, DmaChannel, SdioHost, SpeedMode, TransferClient};
use crate::registers;

/// CPU cycles one iteration of a polling loop is assumed to take. Polling
/// timeouts are converted to iteration counts with it.
pub const CYCLES_PER_POLL: u32 = 8;

/// Configuration applied by [`SdmmcCard::init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardConfig {
    /// Protocol family of the card in the slot.
    pub mode: CardMode,
    /// Bus width to negotiate once the card is identified.
    pub bus_width: BusWidth,
    /// Speed mode to negotiate once the card is identified.
    pub speed: SpeedMode,
    /// Clock divider for identification (at most 400 kHz).
    pub init_clock_divider: u16,
    /// Clock divider for default speed transfers.
    pub clock_divider: u16,
    /// Clock divider for high speed transfers.
    pub high_speed_clock_divider: u16,
    /// Core clock, used to turn millisecond timeouts into poll counts.
    pub system_clock_hz: u32,
}

impl Default for CardConfig {
    fn default() -> CardConfig {
        CardConfig {
            mode: CardMode::Sd,
            bus_width: BusWidth::Four,
            speed: SpeedMode::High,
            init_clock_divider: 250,
            clock_divider: 4,
            high_speed_clock_divider: 2,
            system_clock_hz: 100_000_000,
        }
    }
}

/// Direction and granularity of a block transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    ReadSingle,
    ReadMultiple,
    WriteSingle,
    WriteMultiple,
}

impl Operation {
    pub fn is_read(self) -> bool {
        matches!(self, Operation::ReadSingle | Operation::ReadMultiple)
    }

    /// Multi-block transfers end with STOP_TRANSMISSION.
    pub fn is_multiple(self) -> bool {
        matches!(self, Operation::ReadMultiple | Operation::WriteMultiple)
    }
}

/// How the data of a block transfer moves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The caller spins on the host's status until the transfer ends.
    Polling,
    /// The interrupt handler moves one block per buffer ready interrupt.
    Interrupt,
    /// A DMA channel moves the data, the interrupt handler finishes up.
    Dma,
}

/// What the interrupt handler needs to know about the transfer in flight.
///
/// Every block transfer writes a fresh context before its command is sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferContext {
    pub operation: Operation,
    pub strategy: Strategy,
}

/// Progress of the last operation started on the card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    /// An interrupt or DMA transfer is pending. Only
    /// [`SdmmcCard::handle_interrupt`] and [`SdmmcCard::abort`] may touch the
    /// card until it ends.
    Active,
    Completed,
    Error,
}

/// A card in one SD/MMC slot.
pub struct SdmmcCard<'a, H: SdioHost> {
    pub(crate) host: &'a H,
    pub(crate) client: Cell<Option<&'a dyn TransferClient>>,
    pub(crate) dma_tx: Cell<Option<&'a dyn DmaChannel>>,
    pub(crate) dma_rx: Cell<Option<&'a dyn DmaChannel>>,
    pub(crate) config: Cell<CardConfig>,

    pub(crate) errors: Cell<CardErrors>,
    pub(crate) state: Cell<TransferState>,
    pub(crate) context: Cell<Option<TransferContext>>,

    // Interrupt driven transfers. Written before the data command is sent,
    // owned by the interrupt handler until the transfer ends.
    pub(crate) buffer: Cell<Option<&'static mut [u8]>>,
    pub(crate) cursor: Cell<usize>,
    pub(crate) remaining: Cell<usize>,

    // Card metadata. `info` is only set once identification completed.
    pub(crate) card_type: Cell<Option<CardType>>,
    pub(crate) raw_cid: Cell<u128>,
    pub(crate) raw_csd: Cell<u128>,
    pub(crate) raw_scr: Cell<Option<u64>>,
    pub(crate) ext_csd: Cell<Option<ExtendedCsd>>,
    pub(crate) info: Cell<Option<CardInfo>>,
}

impl<'a, H: SdioHost> SdmmcCard<'a, H> {
    pub fn new(host: &'a H) -> SdmmcCard<'a, H> {
        SdmmcCard {
            host,
            client: Cell::new(None),
            dma_tx: Cell::new(None),
            dma_rx: Cell::new(None),
            config: Cell::new(CardConfig::default()),
            errors: Cell::new(CardErrors::empty()),
            state: Cell::new(TransferState::Idle),
            context: Cell::new(None),
            buffer: Cell::new(None),
            cursor: Cell::new(0),
            remaining: Cell::new(0),
            card_type: Cell::new(None),
            raw_cid: Cell::new(0),
            raw_csd: Cell::new(0),
            raw_scr: Cell::new(None),
            ext_csd: Cell::new(None),
            info: Cell::new(None),
        }
    }

    pub fn set_client(&self, client: &'a dyn TransferClient) {
        self.client.set(Some(client));
    }

    /// Give the card DMA channels for writes (`tx`) and reads (`rx`).
    pub fn set_dma(&self, tx: &'a dyn DmaChannel, rx: &'a dyn DmaChannel) {
        self.dma_tx.set(Some(tx));
        self.dma_rx.set(Some(rx));
    }

    /// Power the bus, identify the card and negotiate the configured bus
    /// width and speed mode.
    ///
    /// Identification failures fail `init` and leave the card
    /// uninitialised. Bus width and speed negotiation failures do not: the
    /// card stays at the configuration that worked, and the reason is left
    /// in [`SdmmcCard::error_code`].
    pub fn init(&self, config: CardConfig) -> Result<(), ErrorCode> {
        self.begin()?;
        self.forget_card();
        self.config.set(config);

        self.host.enable_interrupts(registers::all_interrupts(), false);
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.set_bus_width(BusWidth::One);
        self.host.set_speed_mode(SpeedMode::Default);
        self.host.set_clock_divider(config.init_clock_divider);
        self.host.power(true);
        self.host.clock(true);

        let card_type = self.power_up(config.mode)?;
        self.card_type.set(Some(card_type));
        let info = self.identify(card_type)?;

        self.host.set_clock_divider(config.clock_divider);
        if card_type.mode() == CardMode::Sd {
            if let Err(e) = self.read_scr(info.rca) {
                warn!("sdmmc: SCR unavailable ({:?})", e);
            }
        }
        self.info.set(Some(info));
        info!(
            "sdmmc: {:?} card, rca {:#06x}, {} blocks",
            info.card_type, info.rca, info.geometry.log_block_count
        );

        if config.bus_width != BusWidth::One {
            if let Err(e) = self.configure_bus_width(config.bus_width) {
                warn!("sdmmc: staying on a 1 bit bus ({:?})", e);
            }
        }
        if config.speed == SpeedMode::High {
            if let Err(e) = self.configure_speed_mode(SpeedMode::High) {
                warn!("sdmmc: staying at default speed ({:?})", e);
            }
        }
        Ok(())
    }

    /// Power the bus down and forget the card.
    pub fn deinit(&self) -> Result<(), ErrorCode> {
        self.begin()?;
        self.host.enable_interrupts(registers::all_interrupts(), false);
        self.host.clear_interrupt_status(registers::all_interrupts());
        self.host.clock(false);
        self.host.power(false);
        self.forget_card();
        debug!("sdmmc: card deinitialised");
        Ok(())
    }

    /// Query the card's current state with SEND_STATUS.
    ///
    /// This is a diagnostic query: it does not reset the sticky error set,
    /// it only adds to it when the query itself fails. Like every other
    /// operation it is refused with `Busy` while a transfer is pending.
    pub fn card_state(&self) -> Result<CardState, ErrorCode> {
        if self.state.get() == TransferState::Active {
            return Err(ErrorCode::Busy);
        }
        let info = self.ready_info()?;
        self.check(command::current_state(self.host, info.rca))
    }

    /// Identification and geometry, once `init` succeeded.
    pub fn card_info(&self) -> Option<CardInfo> {
        self.info.get()
    }

    pub fn cid(&self) -> Option<CardIdentification> {
        self.info
            .get()
            .map(|info| CardIdentification::decode(self.raw_cid.get(), info.card_type.mode()))
    }

    pub fn csd(&self) -> Option<CardSpecificData> {
        self.info
            .get()
            .map(|info| CardSpecificData::decode(self.raw_csd.get(), info.card_type))
    }

    /// SD configuration register. `None` for MMC cards.
    pub fn scr(&self) -> Option<SdConfiguration> {
        self.info.get()?;
        self.raw_scr.get().map(SdConfiguration::decode)
    }

    /// MMC extended CSD, as read during `init`. `None` for SD cards and for
    /// MMC cards older than version 4.
    pub fn ext_csd(&self) -> Option<ExtendedCsd> {
        self.info.get()?;
        self.ext_csd.get()
    }

    /// Sticky error flags of the last operation.
    pub fn error_code(&self) -> CardErrors {
        self.errors.get()
    }

    pub fn transfer_state(&self) -> TransferState {
        self.state.get()
    }

    /// Context of the last block transfer started.
    pub fn transfer_context(&self) -> Option<TransferContext> {
        self.context.get()
    }

    /// Byte value erased blocks read back as.
    pub fn erased_byte(&self) -> u8 {
        let erased_high = match self.card_type.get().map(CardType::mode) {
            Some(CardMode::Sd) => self
                .raw_scr
                .get()
                .is_some_and(|raw| SdConfiguration::decode(raw).data_stat_after_erase),
            Some(CardMode::Mmc) => self.ext_csd.get().is_some_and(|ext| ext.erased_mem_cont != 0),
            None => false,
        };
        if erased_high {
            0xFF
        } else {
            0x00
        }
    }

    /// Entry of every top-level operation: refuse to start while a transfer
    /// is pending, otherwise reset the sticky error set.
    pub(crate) fn begin(&self) -> Result<(), ErrorCode> {
        if self.state.get() == TransferState::Active {
            return Err(ErrorCode::Busy);
        }
        self.errors.set(CardErrors::empty());
        Ok(())
    }

    pub(crate) fn record(&self, errors: CardErrors) {
        self.errors.set(self.errors.get() | errors);
    }

    /// Record `errors` and return the matching result code.
    pub(crate) fn fail(&self, errors: CardErrors) -> ErrorCode {
        self.record(errors);
        if errors.contains(CardErrors::INVALID_PARAMETER) {
            ErrorCode::InvalidParameter
        } else {
            ErrorCode::Fail
        }
    }

    pub(crate) fn check<T>(&self, result: Result<T, CardErrors>) -> Result<T, ErrorCode> {
        result.map_err(|errors| self.fail(errors))
    }

    /// Card info of an initialised card, `InvalidMode` otherwise.
    pub(crate) fn ready_info(&self) -> Result<CardInfo, ErrorCode> {
        self.info.get().ok_or(ErrorCode::InvalidMode)
    }

    /// Number of polling loop iterations that fit in `timeout_ms`.
    pub(crate) fn poll_budget(&self, timeout_ms: u32) -> u64 {
        let per_ms = self.config.get().system_clock_hz / CYCLES_PER_POLL / 1000;
        (u64::from(timeout_ms) * u64::from(per_ms)).max(1)
    }

    fn forget_card(&self) {
        self.state.set(TransferState::Idle);
        self.context.set(None);
        self.buffer.set(None);
        self.cursor.set(0);
        self.remaining.set(0);
        self.card_type.set(None);
        self.raw_cid.set(0);
        self.raw_csd.set(0);
        self.raw_scr.set(None);
        self.ext_csd.set(None);
        self.info.set(None);
    }
}
