// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::settings::Settings;

/// Print the parsed configuration, to debug layering and overrides.
pub fn exec(settings: Settings) -> anyhow::Result<()> {
    println!("{settings:#?}");
    Ok(())
}
