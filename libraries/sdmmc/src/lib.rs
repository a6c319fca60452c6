// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! # SD/MMC card protocol client
//!
//! This crate drives SD and MMC memory cards through a generic SD host
//! controller. It sits between an application issuing block requests and a
//! chip-specific host controller driver, which is reached through the
//! [`SdioHost`](crate::hil::SdioHost) HIL.
//!
//! The crate covers:
//!
//!  * Card power-up and identification (SD v1.x, SD v2.0, SDHC/SDXC,
//!    standard and high capacity MMC).
//!  * Parsing of the CID, CSD, SCR, SD Status and EXT_CSD registers and
//!    derivation of the card geometry.
//!  * Bus width and speed mode negotiation.
//!  * Block erase, and block reads/writes using one of three strategies:
//!    polling, interrupt driven, or DMA.
//!  * An interrupt handler that completes interrupt and DMA transfers and
//!    reports the result to a [`TransferClient`](crate::hil::TransferClient).
//!
//! ## Usage
//!
//! ```rust,ignore
//! let card = SdmmcCard::new(&sdioc);
//! card.set_client(&app);
//! card.set_dma(&dma_tx, &dma_rx);
//! card.init(CardConfig::default())?;
//!
//! let mut block = [0u8; 512];
//! card.read_blocks(0, 1, &mut block, 100)?;
//! ```
//!
//! The board is expected to route the host controller's interrupt to
//! [`SdmmcCard::handle_interrupt`](crate::sdmmc::SdmmcCard::handle_interrupt).
//!
//! ## Concurrency
//!
//! A card is driven from a single thread of control plus the host
//! controller's interrupt line. Operations on one card must be issued
//! strictly one after another: while an interrupt or DMA transfer is
//! pending, any new operation returns [`ErrorCode::Busy`]. Buffers passed to
//! the `_int` and `_dma` operations are owned by the driver until they are
//! handed back through the client callbacks or [`abort`].
//!
//! [`abort`]: crate::sdmmc::SdmmcCard::abort

#![no_std]
#![forbid(unsafe_code)]

pub mod bus;
pub mod card;
pub mod command;
pub mod errorcode;
pub mod hil;
pub mod ident;
pub mod irq;
pub mod registers;
pub mod sdmmc;
pub mod transfer;

// Use this to generate nicer docs
#[doc(inline)]
pub use crate::errorcode::{CardErrors, ErrorCode};
#[doc(inline)]
pub use crate::sdmmc::{CardConfig, SdmmcCard};

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod tests;
