use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};

use crate::{
    game::{DrawAdjudication, ResignAdjudication},
    player::Protocol,
};

use super::{EngineEntry, MatchFile, SprtParameters, TournamentKind};

/// Split `"<protocol> <command> [args...]"`.
pub fn get_engine_from_config(config: &str) -> anyhow::Result<(Protocol, String, Vec<String>)> {
    if config.contains('"') || config.contains('\'') || config.contains('`') {
        bail!("arguments should not contain any quote")
    }
    let mut words = config.split_whitespace();
    let protocol: Protocol = words.next().context("missing protocol")?.parse()?;
    let command = words.next().context("missing command")?.to_string();
    Ok((protocol, command, words.map(String::from).collect()))
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value '{value}' for '{key}': {e}"))
}

fn parse_numbers<const N: usize>(key: &str, value: &str) -> anyhow::Result<[f64; N]> {
    let numbers = value
        .split_whitespace()
        .map(|v| parse_value::<f64>(key, v))
        .collect::<anyhow::Result<Vec<_>>>()?;
    numbers
        .try_into()
        .map_err(|_| anyhow::anyhow!("'{key}' expects {N} numbers, got '{value}'"))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value '{value}' for '{key}': expected true or false"),
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn apply_setting(file: &mut MatchFile, key: &str, value: &str) -> anyhow::Result<()> {
    let value = unquote(value);
    match key {
        "games" => file.games = parse_value(key, value)?,
        "rounds" => file.rounds = parse_value(key, value)?,
        "concurrency" => file.concurrency = Some(parse_value(key, value)?),
        "tc" => file.time_control = parse_value(key, value)?,
        "timemargin" => file.time_margin = Duration::from_millis(parse_value(key, value)?),
        "tournament" => {
            file.tournament = match value {
                "round-robin" | "roundrobin" => TournamentKind::RoundRobin,
                "gauntlet" => TournamentKind::Gauntlet,
                _ => bail!("unknown tournament type '{value}'"),
            }
        }
        "book" => file.book = Some(PathBuf::from(value)),
        "book-depth" => file.book_depth = parse_value(key, value)?,
        "fen" => file.fen = Some(value.to_string()),
        "rating-interval" => file.rating_interval = Some(parse_value(key, value)?),
        "sprt" => {
            let [elo0, elo1, alpha, beta] = parse_numbers(key, value)?;
            file.sprt = Some(SprtParameters {
                elo0,
                elo1,
                alpha,
                beta,
            });
        }
        "seed" => file.seed = Some(parse_value(key, value)?),
        "repeat" => file.repeat = parse_bool(key, value)?,
        "reuse-engines" => file.reuse_engines = Some(parse_bool(key, value)?),
        "max-moves" => file.max_moves = Some(parse_value(key, value)?),
        "max-protocol-errors" => file.max_protocol_errors = Some(parse_value(key, value)?),
        "draw-adjudication" => {
            let [move_number, move_count, score] = parse_numbers(key, value)?;
            file.draw_adjudication = Some(DrawAdjudication {
                move_number: move_number as u32,
                move_count: move_count as u32,
                score: score as i32,
            });
        }
        "resign-adjudication" => {
            let [move_count, score] = parse_numbers(key, value)?;
            file.resign_adjudication = Some(ResignAdjudication {
                move_count: move_count as u32,
                score: score as i32,
            });
        }
        "debug" => file.debug = Some(parse_bool(key, value)?),
        _ => bail!("unknown key '{key}'"),
    }
    Ok(())
}

/// Flat `key: value` lines, then an `engines:` list of `- name: "protocol command args"`.
pub fn parse_match_file(yaml: &str) -> anyhow::Result<MatchFile> {
    let mut file = MatchFile::default();
    let mut in_engines = false;

    for (i, line) in yaml.lines().enumerate() {
        let line = line.trim_end();

        // Skip empty lines and comments
        if line.trim().is_empty() || line.trim().starts_with('#') {
            continue;
        }

        if !in_engines {
            if line.starts_with("engines:") {
                in_engines = true;
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .with_context(|| format!("Line {}: Expected 'key: value'", i + 1))?;
            let value = value.trim();
            if value.is_empty() {
                bail!("Line {}: '{}' value missing", i + 1, key.trim());
            }
            apply_setting(&mut file, key.trim(), value)
                .with_context(|| format!("Line {}", i + 1))?;
        } else {
            // Inside engines list, expect lines like: '- name: "uci ./engine"'
            let line = line.trim_start();
            let Some(rest) = line.strip_prefix('-') else {
                bail!("Line {}: Expected list item starting with '-'", i + 1);
            };
            let (name, value_part) = rest
                .split_once(':')
                .with_context(|| format!("Line {}: Missing ':' in engine item", i + 1))?;
            let value_part = value_part.trim();

            // Value should start and end with double quotes
            let Some(value) = value_part
                .strip_prefix('"')
                .and_then(|v| v.find('"').map(|end| &v[..end]))
            else {
                bail!("Line {}: Value must be quoted with double quotes", i + 1);
            };

            let name = name.trim();
            if file.engines.iter().any(|e| e.name == name) {
                bail!("Line {}: engine '{name}' is listed twice", i + 1);
            }
            let (protocol, command, args) = get_engine_from_config(value)
                .with_context(|| format!("Line {}: engine '{name}'", i + 1))?;
            file.engines.push(EngineEntry {
                name: name.to_string(),
                protocol,
                command,
                args,
            });
        }
    }

    if file.engines.is_empty() {
        bail!("Missing 'engines' list");
    }
    Ok(file)
}
