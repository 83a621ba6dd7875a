//! Local Energy Market computations: offer aggregation, session pricing
//! mechanisms, and the collective scheduling optimization.

pub mod iterative;
pub mod milp;
pub mod pricing;

use serde::{Deserialize, Serialize};

/// Mechanism used to settle the price of one market interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMechanism {
    CrossingValue,
    Mmr,
    Sdr,
}

impl PricingMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrossingValue => "crossing_value",
            Self::Mmr => "mmr",
            Self::Sdr => "sdr",
        }
    }
}

/// How market trades are organized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LemOrganization {
    /// One community-wide pool with a single price per interval.
    Pool,
    /// Pairwise transactions between members.
    Bilateral,
}

impl LemOrganization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Bilateral => "bilateral",
        }
    }
}

/// User-tunable pricing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PricingKnobs {
    /// Divisor of the mid-market-rate expression; above 2 favors buyers.
    pub mmr_divisor: f64,
    /// Incentive paid on internal trades when the community has net surplus.
    pub sdr_compensation: f64,
    /// Added on top of the crossing price.
    pub crossing_increment: f64,
}

impl Default for PricingKnobs {
    fn default() -> Self {
        Self {
            mmr_divisor: 2.0,
            sdr_compensation: 0.0,
            crossing_increment: 0.0,
        }
    }
}

/// One buying or selling offer for a single interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    /// Meter that formulated the offer.
    pub origin: String,
    /// Energy offered, in kWh (always positive).
    pub amount: f64,
    /// Opportunity cost of the offer, in EUR/kWh.
    pub value: f64,
}

/// All offers of one market interval.
#[derive(Debug, Clone, Default)]
pub struct OfferBook {
    pub buys: Vec<Offer>,
    pub sells: Vec<Offer>,
}

/// Builds the interval offer book from per-meter net loads.
///
/// Meters with positive net load bid to buy at their retail buy tariff;
/// meters with negative net load offer to sell at their retail sell tariff.
/// Balanced meters place no offer.
pub fn offer_book<'a, I>(entries: I) -> OfferBook
where
    I: IntoIterator<Item = (&'a str, f64, f64, f64)>,
{
    let mut book = OfferBook::default();
    for (meter_id, net_load, buy_tariff, sell_tariff) in entries {
        if net_load > 0.0 {
            book.buys.push(Offer {
                origin: meter_id.to_string(),
                amount: net_load,
                value: buy_tariff,
            });
        } else if net_load < 0.0 {
            book.sells.push(Offer {
                origin: meter_id.to_string(),
                amount: -net_load,
                value: sell_tariff,
            });
        }
    }
    book
}

/// Rounds to cents; used for monetary aggregates.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Rounds to three decimals; used for energies and prices.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
