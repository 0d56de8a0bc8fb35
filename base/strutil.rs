// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Human-readable byte sizes, as used in logs and the configuration file:
//! whitespace-separated parts, each a decimal count with an optional binary
//! suffix, summed. `107374182400` encodes as `100G`; `100G 42` decodes back
//! to `107374182442`.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{digit1, space0};
use nom::combinator::{all_consuming, map, map_res, opt, value};
use nom::multi::fold_many1;
use nom::sequence::{delimited, pair};
use nom::IResult;

/// Binary suffixes, largest first, as (character, power of 2).
static MULTIPLIERS: [(char, u32); 4] = [('T', 40), ('G', 30), ('M', 20), ('K', 10)];

/// Encodes a non-negative size into human-readable form.
pub fn encode_size(raw: i64) -> String {
    let mut remaining = raw;
    let mut parts = Vec::new();
    for &(suffix, shift) in &MULTIPLIERS {
        if remaining >= 1i64 << shift {
            parts.push(format!("{}{suffix}", remaining >> shift));
            remaining &= (1i64 << shift) - 1;
        }
    }
    if remaining > 0 || parts.is_empty() {
        parts.push(remaining.to_string());
    }
    parts.join(" ")
}

fn suffix(input: &str) -> IResult<&str, i64> {
    alt((
        value(1i64 << 40, tag("T")),
        value(1i64 << 30, tag("G")),
        value(1i64 << 20, tag("M")),
        value(1i64 << 10, tag("K")),
    ))(input)
}

fn part(input: &str) -> IResult<&str, i64> {
    map(
        pair(map_res(digit1, str::parse::<i64>), opt(suffix)),
        |(count, unit)| count * unit.unwrap_or(1),
    )(input)
}

/// Decodes a human-readable size as output by [`encode_size`].
#[allow(clippy::result_unit_err)]
pub fn decode_size(encoded: &str) -> Result<i64, ()> {
    all_consuming(fold_many1(
        delimited(space0, part, space0),
        || 0i64,
        |sum, p| sum + p,
    ))(encoded)
    .map(|(_, size)| size)
    .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_decode() {
        assert_eq!(super::decode_size("100M").unwrap(), 100i64 << 20);
        assert_eq!(super::decode_size("100M 42").unwrap(), (100i64 << 20) + 42);
        assert_eq!(super::decode_size("1T 1K").unwrap(), (1i64 << 40) + 1024);
        super::decode_size("").unwrap_err();
        super::decode_size("+100M").unwrap_err();
        super::decode_size("100Q").unwrap_err();
    }

    #[test]
    fn test_encode() {
        assert_eq!(super::encode_size(0), "0");
        assert_eq!(super::encode_size(42), "42");
        assert_eq!(super::encode_size(100i64 << 20), "100M");
        assert_eq!(super::encode_size((100i64 << 20) + 42), "100M 42");
        assert_eq!(super::encode_size((1i64 << 40) + 1024), "1T 1K");
    }

    #[test]
    fn round_trip() {
        for raw in [0, 1, 1023, 1024, (3i64 << 30) + (7 << 10) + 9] {
            assert_eq!(super::decode_size(&super::encode_size(raw)).unwrap(), raw);
        }
    }
}
