//! Session pricing mechanisms.
//!
//! Each mechanism settles a single price for one market interval from the
//! interval's buying and selling offers. No optimization is involved; the
//! offers carry the members' opportunity costs (their retail tariffs).

use super::{Offer, OfferBook, PricingKnobs, PricingMechanism};

/// Settles the interval price with the selected mechanism.
pub fn settle(mechanism: PricingMechanism, book: &OfferBook, knobs: &PricingKnobs) -> f64 {
    match mechanism {
        PricingMechanism::CrossingValue => {
            crossing_value(&book.buys, &book.sells, knobs.crossing_increment)
        }
        PricingMechanism::Mmr => mmr(&book.buys, &book.sells, knobs.mmr_divisor),
        PricingMechanism::Sdr => sdr(&book.buys, &book.sells, knobs.sdr_compensation),
    }
}

/// Amount-weighted average offer value; 0.0 for an empty side.
fn weighted_value(offers: &[Offer]) -> f64 {
    let total: f64 = offers.iter().map(|o| o.amount).sum();
    if total <= 0.0 {
        return 0.0;
    }
    offers.iter().map(|o| o.amount * o.value).sum::<f64>() / total
}

/// Price at the intersection of the aggregate demand and supply curves.
///
/// Buying offers are served in descending value order, selling offers in
/// ascending order; energy is matched while the marginal buyer still values
/// it at least as much as the marginal seller asks. The settled price is the
/// midpoint of the two marginal offers' values, plus `small_increment`.
/// Returns 0.0 when the curves do not cross.
pub fn crossing_value(buys: &[Offer], sells: &[Offer], small_increment: f64) -> f64 {
    let mut demand: Vec<&Offer> = buys.iter().filter(|o| o.amount > 0.0).collect();
    let mut supply: Vec<&Offer> = sells.iter().filter(|o| o.amount > 0.0).collect();
    demand.sort_by(|a, b| b.value.total_cmp(&a.value));
    supply.sort_by(|a, b| a.value.total_cmp(&b.value));

    let (mut d, mut s) = (0usize, 0usize);
    let (mut d_left, mut s_left) = (0.0f64, 0.0f64);
    let mut marginal: Option<(f64, f64)> = None;

    while d < demand.len() && s < supply.len() {
        if d_left <= 0.0 {
            d_left = demand[d].amount;
        }
        if s_left <= 0.0 {
            s_left = supply[s].amount;
        }
        if demand[d].value < supply[s].value {
            break;
        }
        marginal = Some((demand[d].value, supply[s].value));
        let traded = d_left.min(s_left);
        d_left -= traded;
        s_left -= traded;
        if d_left <= 0.0 {
            d += 1;
        }
        if s_left <= 0.0 {
            s += 1;
        }
    }

    match marginal {
        Some((bid, ask)) => (bid + ask) / 2.0 + small_increment,
        None => 0.0,
    }
}

/// Mid-market rate: the sum of the amount-weighted buy and sell values over
/// `divisor`. The canonical divisor is 2; larger values lower the price
/// (favoring buyers), smaller values raise it (favoring sellers).
pub fn mmr(buys: &[Offer], sells: &[Offer], divisor: f64) -> f64 {
    if buys.is_empty() && sells.is_empty() {
        return 0.0;
    }
    (weighted_value(buys) + weighted_value(sells)) / divisor
}

/// Supply-demand ratio pricing.
///
/// With `r = supply / demand`, a deficit interval (`r <= 1`) settles on the
/// hyperbolic blend of the weighted buy value `b` and sell value `s`,
/// `b*s / ((b - s)*r + s)`, so the price slides from `b` (no local supply)
/// to `s` (exactly balanced). A surplus interval pays
/// `s + compensation*(b - s)`, rewarding internal trades when the community
/// exports.
pub fn sdr(buys: &[Offer], sells: &[Offer], compensation: f64) -> f64 {
    if buys.is_empty() && sells.is_empty() {
        return 0.0;
    }
    let demand: f64 = buys.iter().map(|o| o.amount).sum();
    let supply: f64 = sells.iter().map(|o| o.amount).sum();
    let b = weighted_value(buys);
    let s = weighted_value(sells);

    if supply > demand {
        return s + compensation * (b - s);
    }
    // demand >= supply and demand > 0 here (both empty handled above; a
    // supply-only book has demand == 0 < supply).
    let r = if demand > 0.0 { supply / demand } else { 0.0 };
    let denominator = (b - s) * r + s;
    if denominator.abs() < 1e-12 {
        return b;
    }
    b * s / denominator
}
