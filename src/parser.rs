//! Parser for DX cluster spot lines.
//!
//! This module uses the `nom` parsing library to pick spot fields out of the
//! lines a cluster sends. Only lines posted by one configured spotter in one
//! of the accepted modes are of interest; everything else is skipped without
//! comment.
//!
//! # Spot Format
//!
//! Clusters differ in column layout, so fields are located by token rather
//! than by column. A spot needs these four tokens in sequence somewhere on the
//! line, once the spotter's own `CALL-#` token is set aside:
//! ```text
//! FREQ  CALLSIGN  MODE  SNR
//! ```
//!
//! Examples that parse identically:
//! ```text
//! DX de VE3EID-#:  14074.00  VE3XYZ  FT8  -05 dB  2345Z
//! 14074.00 VE3EID-# VE3XYZ FT8 -05 dB 23:45:10
//! ```

use chrono::{DateTime, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::{tag_no_case, take_while_m_n},
    character::complete::{alphanumeric1, char, digit1, one_of, space0},
    combinator::{all_consuming, map_res, opt, recognize},
    multi::many0,
};
use thiserror::Error;

use crate::spot::{Mode, ParsedSpot};

/// Errors for lines that name the target spotter and an accepted mode but
/// could not be read as a spot.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("No frequency/callsign/mode/SNR sequence found")]
    MissingFields,

    #[error("Invalid frequency: {0}")]
    InvalidFrequency(String),

    #[error("Invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("Invalid SNR: {0}")]
    InvalidSnr(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a decimal frequency in kHz, e.g. `14074.00`.
fn parse_frequency(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse a callsign: alphanumeric with optional `/` suffixes (`VE3XYZ/P`).
fn parse_callsign(input: &str) -> IResult<&str, &str> {
    recognize((alphanumeric1, many0((char('/'), alphanumeric1)))).parse(input)
}

/// Parse a signed 1-2 digit SNR, e.g. `-05`, `+3`, `12`, `- 7` or `-05dB`.
fn parse_snr(input: &str) -> IResult<&str, i32> {
    (
        opt(one_of("+-")),
        space0,
        map_res(
            take_while_m_n(1, 2, |c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<i32>(),
        ),
        opt(tag_no_case("dB")),
    )
        .map(|(sign, _, value, _)| if sign == Some('-') { -value } else { value })
        .parse(input)
}

/// Run a token parser that must consume the whole token.
fn whole<'a, O>(
    token: &'a str,
    parser: impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
) -> Option<O> {
    all_consuming(parser)
        .parse(token)
        .ok()
        .map(|(_, out)| out)
}

/// Filters and parses lines for one spotter and a set of modes.
#[derive(Debug, Clone)]
pub struct SpotParser {
    spotter: String,
    spotter_token: String,
    modes: Vec<Mode>,
}

impl SpotParser {
    /// Create a parser for `spotter` (bare callsign, e.g. `VE3EID`) that
    /// accepts spots in any of `modes`.
    pub fn new(spotter: &str, modes: impl IntoIterator<Item = Mode>) -> Self {
        let spotter = spotter.trim().to_ascii_uppercase();
        Self {
            spotter_token: format!("{}-#", spotter),
            spotter,
            modes: modes.into_iter().collect(),
        }
    }

    /// The target spotter callsign.
    pub fn spotter(&self) -> &str {
        &self.spotter
    }

    /// The accepted modes.
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    fn accepted_mode(&self, token: &str) -> Option<Mode> {
        self.modes
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(token))
    }

    fn is_spotter_token(&self, token: &str) -> bool {
        token
            .trim_end_matches(':')
            .eq_ignore_ascii_case(&self.spotter_token)
    }

    /// Parse one complete line.
    ///
    /// Returns `Ok(None)` when the line is not from the target spotter or
    /// names no accepted mode, `Ok(Some(spot))` for a readable spot, and
    /// `Err` when the line is eligible but its fields cannot be extracted.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::Utc;
    /// use dxcluster_ingest::parser::SpotParser;
    /// use dxcluster_ingest::spot::Mode;
    ///
    /// let parser = SpotParser::new("VE3EID", [Mode::Ft8, Mode::Ft4]);
    /// let line = "DX de VE3EID-#:  14074.00  VE3XYZ  FT8  -05 dB  2345Z";
    /// let spot = parser.parse_line(line, Utc::now()).unwrap().unwrap();
    /// assert_eq!(spot.callsign, "VE3XYZ");
    /// assert_eq!(spot.snr_db, -5);
    ///
    /// assert!(parser.parse_line("DX de K1TTT-#: 7030.0 W1AW CW 10 dB", Utc::now()).unwrap().is_none());
    /// ```
    pub fn parse_line(
        &self,
        line: &str,
        received_at: DateTime<Utc>,
    ) -> ParseResult<Option<ParsedSpot>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let spotter_pos = match tokens.iter().position(|t| self.is_spotter_token(t)) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        if !tokens.iter().any(|t| self.accepted_mode(t).is_some()) {
            return Ok(None);
        }

        let body: Vec<&str> = tokens
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != spotter_pos)
            .map(|(_, t)| *t)
            .collect();

        self.extract(&body, received_at).map(Some)
    }

    /// Find the first `FREQ CALL MODE SNR` run in the tokens.
    fn extract(&self, tokens: &[&str], received_at: DateTime<Utc>) -> ParseResult<ParsedSpot> {
        let mut error = ParseError::MissingFields;

        for i in 0..tokens.len().saturating_sub(2) {
            let Some(mode) = self.accepted_mode(tokens[i + 2]) else {
                continue;
            };

            let Some(frequency_khz) = whole(tokens[i], parse_frequency) else {
                error = ParseError::InvalidFrequency(tokens[i].to_string());
                continue;
            };

            let Some(callsign) = whole(tokens[i + 1], parse_callsign) else {
                error = ParseError::InvalidCallsign(tokens[i + 1].to_string());
                continue;
            };

            let snr_text = match (tokens.get(i + 3), tokens.get(i + 4)) {
                (Some(&sign @ ("-" | "+")), Some(digits)) => format!("{} {}", sign, digits),
                (Some(token), _) => token.to_string(),
                (None, _) => {
                    error = ParseError::InvalidSnr(String::new());
                    continue;
                }
            };
            let Some(snr_db) = whole(snr_text.as_str(), parse_snr) else {
                error = ParseError::InvalidSnr(snr_text);
                continue;
            };

            return Ok(ParsedSpot {
                frequency_khz,
                callsign: callsign.to_ascii_uppercase(),
                snr_db,
                mode,
                received_at,
            });
        }

        Err(error)
    }
}
