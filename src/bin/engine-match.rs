use std::path::PathBuf;

use anyhow::{self, Context};
use engine_tournament::prelude::*;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let _ = args.next(); // Skip binary name
    let path = PathBuf::from(args.next().context("usage: engine-match <match file>")?);

    let config = Configuration::from_env();
    let summary = EngineMatch::from_match_file(&path, config)?
        .start()?
        .join()?;

    for player in &summary.players {
        println!(
            "{}: +{} -{} ={}",
            player.name, player.wins, player.losses, player.draws
        );
    }
    if let Some(error) = summary.error {
        anyhow::bail!(error);
    }
    Ok(())
}
