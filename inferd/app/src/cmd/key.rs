// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Context;

use inferd_chain_message::tx::derive_address;
use inferd_crypto::SecretKey;

use crate::options::{KeyArgs, KeyCommands, KeyGenArgs, KeyShowArgs};

pub fn exec(args: &KeyArgs) -> anyhow::Result<()> {
    match &args.command {
        KeyCommands::Gen(args) => gen(args),
        KeyCommands::Show(args) => show(args),
    }
}

fn gen(args: &KeyGenArgs) -> anyhow::Result<()> {
    let secret = SecretKey::random(&mut rand::thread_rng());
    let hex = hex::encode(*secret.serialize());
    std::fs::write(&args.out, format!("{hex}\n"))
        .with_context(|| format!("cannot write key to {:?}", args.out))?;
    println!("{:?}", args.out);
    Ok(())
}

fn show(args: &KeyShowArgs) -> anyhow::Result<()> {
    let secret = read_secret_key(&args.secret_key)?;
    let public_key = secret.public_key();
    let address = derive_address(&public_key, &args.prefix)?;

    println!(
        "public key: {}",
        inferd_crypto::to_b64(&inferd_crypto::serialize_public_key(&public_key))
    );
    println!("address:    {address}");
    Ok(())
}

/// Read a hex encoded secret key file.
pub fn read_secret_key(path: &std::path::Path) -> anyhow::Result<SecretKey> {
    let hex = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read key file {path:?}"))?;
    let bytes = hex::decode(hex.trim()).context("key file is not valid hex")?;
    SecretKey::try_from(bytes).context("key file is not a valid secp256k1 key")
}
