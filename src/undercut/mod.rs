// src/undercut/mod.rs
//! Pure pricing engine: given the competing listing set for a pair, compute
//! the next rate that legitimately undercuts the competition without
//! colliding with a quote that is already on the board.
//!
//! Marketplace convention: rates below one are usually quoted as unit
//! fractions ("1/N" pay-units per want-unit), and sellers compete by bumping
//! the denominator. Rates above one are quoted as decimals or small exact
//! fractions like "3/2". No network access, no timers; everything in here is
//! deterministic over its inputs.

use crate::types::{Listing, PairSummary, SuggestedPrice, UndercutSuggestion};
use itertools::Itertools;
use std::collections::BTreeSet;

/// Tolerance for recognizing a rate as an exact unit fraction.
const UNIT_FRACTION_EPS: f64 = 1e-8;
/// Acceptance tolerance for the bounded rational search, and for the
/// idempotence comparison against the caller's own rate.
const RATIONAL_EPS: f64 = 1e-6;
/// Denominator bound for the rational approximation of decimal targets.
const MAX_DENOMINATOR: u64 = 100;

/// The caller's own listing within the pair's listing set, when they already
/// hold one. `index` is the position in the rate-ascending listing order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwnListing {
    pub rate: f64,
    pub index: usize,
}

/// Computes the suggested next competitive rate for a listing set sorted
/// ascending by rate. Returns `value: None` when no meaningful undercut
/// exists at the target's resolution; `already_optimal` is set when the
/// caller already holds the best position and the suggestion would merely
/// restate their current quote.
pub fn suggest_undercut(listings: &[Listing], own: Option<OwnListing>) -> UndercutSuggestion {
    let own_is_best = own.map(|o| o.index == 0).unwrap_or(false);

    if listings.is_empty() {
        return UndercutSuggestion::none();
    }

    // Target to beat: when we already sit at the top, the second-best listing
    // is the one that constrains our price. With nobody else on the board
    // there is nothing to undercut.
    let target = if own_is_best {
        match listings.get(1) {
            Some(second) => second.rate,
            None => {
                return UndercutSuggestion {
                    value: None,
                    already_optimal: true,
                }
            }
        }
    } else {
        listings[0].rate
    };

    if target <= 0.0 {
        // A zero rate is economically undefined; refuse to price against it.
        return UndercutSuggestion::none();
    }

    let own_rate = own.map(|o| o.rate);
    let suggestion = if let Some(denominator) = unit_fraction_denominator(target) {
        Some(undercut_unit_fraction(listings, own, denominator))
    } else if target > 1.0 {
        Some(undercut_decimal(target))
    } else {
        // Small or irregular fractional quotes: only usable when a bounded
        // non-trivial fraction represents them. A target of exactly one
        // reduces to 1/1, which is no undercut at all.
        approximate_fraction(target).and_then(|(num, den, err)| {
            if den != 1 && err < RATIONAL_EPS {
                Some(SuggestedPrice::Fraction(num, den))
            } else {
                None
            }
        })
    };

    let already_optimal = match (suggestion, own_rate) {
        (Some(price), Some(rate)) if own_is_best => (price.as_f64() - rate).abs() < RATIONAL_EPS,
        _ => false,
    };

    UndercutSuggestion {
        value: suggestion,
        already_optimal,
    }
}

/// Convenience wrapper over a `PairSummary`: locates the caller's own listing
/// by account name and runs the engine against the summary's listing set.
pub fn suggest_for_summary(summary: &PairSummary, account_names: &str) -> UndercutSuggestion {
    let own = find_own_listing(&summary.listings, account_names);
    suggest_undercut(&summary.listings, own)
}

/// `round(1/r)` reproducing `r` within tolerance makes `r` a unit-fraction
/// quote; returns its denominator.
fn unit_fraction_denominator(rate: f64) -> Option<u64> {
    if rate <= 0.0 || rate >= 1.0 {
        return None;
    }
    let n = (1.0 / rate).round();
    if n < 1.0 {
        return None;
    }
    if (1.0 / n - rate).abs() < UNIT_FRACTION_EPS {
        Some(n as u64)
    } else {
        None
    }
}

/// Greedy smallest-unused-denominator search. Occupied denominators are those
/// of every *competing* unit-fraction quote (the caller's own listing is the
/// one being replaced, so landing on it again is legal and signals that the
/// current quote is already the right price). Ties at one rate count once.
fn undercut_unit_fraction(
    listings: &[Listing],
    own: Option<OwnListing>,
    target_denominator: u64,
) -> SuggestedPrice {
    let occupied: BTreeSet<u64> = listings
        .iter()
        .enumerate()
        .filter(|(idx, _)| own.map(|o| o.index != *idx).unwrap_or(true))
        .filter_map(|(_, l)| unit_fraction_denominator(l.rate))
        .collect();

    // When the caller is not on the board at the top, their prior quote (if
    // any unit fraction) must still be beaten, hence the max().
    let own_denominator = match own {
        Some(o) if o.index != 0 => unit_fraction_denominator(o.rate).unwrap_or(0),
        _ => 0,
    };

    let mut candidate = target_denominator.max(own_denominator) + 1;
    while occupied.contains(&candidate) {
        candidate += 1;
    }
    SuggestedPrice::Fraction(1, candidate)
}

/// Decimal targets above one: integers step down by one; non-integers get a
/// bounded rational approximation, falling back to `floor(target)` when no
/// non-trivial fraction lands within tolerance.
fn undercut_decimal(target: f64) -> SuggestedPrice {
    if target.fract().abs() < UNIT_FRACTION_EPS {
        return SuggestedPrice::Decimal(target - 1.0);
    }
    match approximate_fraction(target) {
        Some((num, den, err)) if den != 1 && err < RATIONAL_EPS => {
            SuggestedPrice::Fraction(num, den)
        }
        _ => SuggestedPrice::Decimal(target.floor()),
    }
}

/// Searches denominators `1..=100` for the fraction minimizing the absolute
/// error against `target`, accepting early on an exact-enough hit, and
/// reduces the result by its greatest common divisor. Deterministic, never
/// randomized.
fn approximate_fraction(target: f64) -> Option<(u64, u64, f64)> {
    let mut best: Option<(u64, u64, f64)> = None;
    for den in 1..=MAX_DENOMINATOR {
        let num = (target * den as f64).round();
        if num < 1.0 {
            continue;
        }
        let num = num as u64;
        let err = (target - num as f64 / den as f64).abs();
        if best.map(|(_, _, e)| err < e).unwrap_or(true) {
            best = Some((num, den, err));
        }
        if err < RATIONAL_EPS {
            break;
        }
    }
    best.map(|(num, den, err)| {
        let g = gcd(num, den);
        (num / g, den / g, err)
    })
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Strips the trailing `#1234` discriminator the marketplace appends to
/// account names and lowercases for comparison.
pub fn normalize_account(name: &str) -> String {
    if let Some(pos) = name.rfind('#') {
        let suffix = &name[pos + 1..];
        if (3..=5).contains(&suffix.len()) && suffix.chars().all(|c| c.is_ascii_digit()) {
            return name[..pos].to_lowercase();
        }
    }
    name.to_lowercase()
}

/// Locates the caller's own listing in a rate-ascending listing set by any of
/// their comma-separated account names.
pub fn find_own_listing(listings: &[Listing], account_names: &str) -> Option<OwnListing> {
    let mine: Vec<String> = account_names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_account)
        .collect();
    if mine.is_empty() {
        return None;
    }
    listings.iter().enumerate().find_map(|(index, listing)| {
        let account = listing.account.as_deref()?;
        if mine.contains(&normalize_account(account)) {
            Some(OwnListing {
                rate: listing.rate,
                index,
            })
        } else {
            None
        }
    })
}

/// Round-trip margin annotation: for each A->B pair with a reciprocal B->A
/// pair configured, compute what one full cycle earns relative to what it
/// costs, from the two median rates. Links both summaries to each other.
pub fn annotate_profit_margins(pairs: &mut [PairSummary]) {
    for i in 0..pairs.len() {
        if pairs[i].linked_pair_index.is_some() || pairs[i].median_rate.is_none() {
            continue;
        }
        let reciprocal = (0..pairs.len()).find(|&j| {
            j != i
                && pairs[i].pair.want == pairs[j].pair.pay
                && pairs[i].pair.pay == pairs[j].pair.want
        });
        let Some(j) = reciprocal else { continue };
        let Some(median_back) = pairs[j].median_rate.filter(|m| *m > 0.0) else {
            continue;
        };
        let receive_per_cycle = pairs[i].median_rate.unwrap_or(0.0);
        let spend_to_get_back = 1.0 / median_back;
        let raw_profit = receive_per_cycle - spend_to_get_back;
        let profit_pct = if spend_to_get_back > 0.0 {
            raw_profit / spend_to_get_back * 100.0
        } else {
            0.0
        };
        for k in [i, j] {
            pairs[k].profit_margin_raw = Some(round_to(raw_profit, 4));
            pairs[k].profit_margin_pct = Some(round_to(profit_pct, 2));
        }
        pairs[i].linked_pair_index = Some(j);
        pairs[j].linked_pair_index = Some(i);
    }
}

fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Formats the distinct occupied unit-fraction denominators of a listing set,
/// for log lines and operator-facing output.
pub fn occupied_denominators(listings: &[Listing]) -> Vec<u64> {
    listings
        .iter()
        .filter_map(|l| unit_fraction_denominator(l.rate))
        .unique()
        .sorted()
        .collect()
}
