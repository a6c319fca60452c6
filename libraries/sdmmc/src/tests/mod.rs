// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Driver scenarios against a simulated host controller and card.

mod sim;

use crate::card::CardMode;
use crate::hil::BusWidth;
use crate::sdmmc::{CardConfig, SdmmcCard};
use sim::SimHost;

fn sd_config() -> CardConfig {
    CardConfig::default()
}

fn mmc_config() -> CardConfig {
    CardConfig {
        mode: CardMode::Mmc,
        bus_width: BusWidth::Eight,
        ..CardConfig::default()
    }
}

/// A card on `host`, initialised with `config`.
fn init_card(host: &SimHost, config: CardConfig) -> SdmmcCard<'_, SimHost> {
    let card = SdmmcCard::new(host);
    assert_eq!(card.init(config), Ok(()));
    card
}
