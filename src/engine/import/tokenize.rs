//! Vehicle name extraction from free-text application fields.

use std::collections::HashSet;

use regex::Regex;

use crate::error::{CatalogError, Result};
use crate::util::fold_key;

/// Compiled once per import.
#[derive(Debug, Clone)]
pub struct VehicleTokenizer {
    delimiters: Regex,
}

impl VehicleTokenizer {
    pub fn new() -> Result<Self> {
        let delimiters = Regex::new(r"[\s,;|/()+]+").map_err(|err| {
            CatalogError::SpreadsheetInvalid(format!("vehicle delimiter pattern: {err}"))
        })?;
        Ok(Self { delimiters })
    }

    /// Splits an application text such as `"Gol Uno 1.0/Palio (2010)"` into
    /// vehicle names. Tokens without a letter (years, engine sizes) are dropped
    /// and repeats collapse case- and diacritic-insensitively, first spelling kept.
    pub fn vehicle_tokens(&self, application: &str) -> Vec<String> {
        collect_unique(self.delimiters.split(application))
    }
}

/// A dedicated vehicles column lists one multi-word name per entry:
/// `"Gol G5; Uno Mille"`.
pub fn vehicle_list(cell: &str) -> Vec<String> {
    collect_unique(cell.split([';', ',', '|', '\n', '\r']))
}

fn collect_unique<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for token in raw {
        let token =
            token.trim_matches(|ch: char| ch.is_whitespace() || matches!(ch, '.' | '-' | ':'));
        if !token.chars().any(char::is_alphabetic) {
            continue;
        }
        let cleaned = token.split_whitespace().collect::<Vec<_>>().join(" ");
        if seen.insert(fold_key(&cleaned)) {
            out.push(cleaned);
        }
    }

    out
}
