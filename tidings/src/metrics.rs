// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tidings.
//
// tidings is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tidings is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tidings.  If not,
// see <http://www.gnu.org/licenses/>.

//! # tidings metrics
//!
//! tidings collects metrics through [OpenTelemetry]. OTel asks us to create each instrument once
//! and re-use it, which raises the question of where to keep them all. Rather than hang dozens of
//! `Counter<u64>` fields off the application state, or maintain a central list of metric names
//! that every module has to touch, each module declares the instruments it needs right next to
//! the code that records them:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("applier.records.applied", Sort::IntegralCounter) }
//!
//! async fn apply(/*...*/) {
//!     // ...
//!     counter_add!(state.instruments, "applier.records.applied", 1, &[]);
//! }
//! ```
//!
//! David Tolnay's [inventory] crate gathers the registrations at link time. [Instruments::new]
//! builds every registered instrument up-front, so recording needs only a shared reference &
//! the [Instruments] can live in an `Arc` alongside the rest of the application state.
//!
//! Recording to a name that was never registered, or to an instrument of the wrong sort, is a
//! programming error and panics.
//!
//! [OpenTelemetry]: https://opentelemetry.io/docs/languages/rust/

use std::collections::HashMap;

use itertools::Itertools;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
    /// `Histogram<f64>`; we use these for durations, in seconds
    Histogram,
}

/// A metric name & the sort of instrument it names
///
/// ```ignore
/// inventory::submit!{metrics::Registration::new("auth.successes", Sort::IntegralCounter)}
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Every metric name registered more than once
fn duplicates() -> Vec<&'static str> {
    inventory::iter::<Registration>
        .into_iter()
        .map(Registration::name)
        .duplicates()
        .collect()
}

/// Panic if any metric name has been registered twice
///
/// Call this at startup, before building [Instruments], to fail fast & say why.
pub fn check_metric_registrations() {
    let dups = duplicates();
    if !dups.is_empty() {
        panic!("These metric names were registered more than once: {:?}", dups);
    }
}

enum Instrument {
    Counter(Counter<u64>),
    Gauge(Gauge<u64>),
    Histogram(Histogram<f64>),
}

impl Instrument {
    fn build(meter: &Meter, reg: &Registration) -> Instrument {
        match reg.sort {
            Sort::IntegralCounter => Instrument::Counter(meter.u64_counter(reg.name).build()),
            Sort::IntegralGauge => Instrument::Gauge(meter.u64_gauge(reg.name).build()),
            Sort::Histogram => Instrument::Histogram(
                meter
                    .f64_histogram(reg.name)
                    .with_unit("s")
                    .build(),
            ),
        }
    }
}

/// Every registered OTel instrument, by name
pub struct Instruments {
    by_name: HashMap<&'static str, Instrument>,
}

impl Instruments {
    /// Build all registered instruments from the global meter provider's meter `scope`
    ///
    /// Install the meter provider first; instruments built from the default (no-op) provider
    /// record nothing.
    pub fn new(scope: &'static str) -> Instruments {
        check_metric_registrations();
        let meter = global::meter(scope);
        Instruments {
            by_name: inventory::iter::<Registration>
                .into_iter()
                .map(|reg| (reg.name, Instrument::build(&meter, reg)))
                .collect(),
        }
    }
    /// Add `count` to the counter `name`
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.by_name.get(name) {
            Some(Instrument::Counter(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    /// Set the gauge `name` to `value`
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.by_name.get(name) {
            Some(Instrument::Gauge(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
    /// Record one observation of `value` in the histogram `name`
    pub fn observe(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        match self.by_name.get(name) {
            Some(Instrument::Histogram(h)) => h.record(value, attributes),
            _ => panic!("{} does not name a histogram", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

#[macro_export]
macro_rules! histogram_observe {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.observe($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registrations_are_unique() {
        assert!(duplicates().is_empty());
        let instruments = Instruments::new("tidings");
        instruments.add("applier.records.applied", 1, &[]);
        instruments.recordu("applier.consecutive.failures", 0, &[]);
        instruments.observe("http.server.duration", 0.25, &[]);
    }

    #[test]
    #[should_panic]
    fn sorts_are_checked() {
        Instruments::new("tidings").recordu("applier.records.applied", 1, &[]);
    }
}
