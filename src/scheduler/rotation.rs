//! Deterministic content rotation
//!
//! This module decides which content item each destination receives on a
//! cycle:
//! - `fixed` units always publish their single enabled item
//! - `random` units walk a daily permutation; the destination at position
//!   `i` (in id order) starts at the unit's offset plus `i`, so one cycle
//!   spreads different items across destinations
//! - in both modes a destination never gets an item that another unit is
//!   currently showing there
//!
//! The permutation is seeded from the local date and the unit id, so retries
//! on the same day see the same order.

use chrono::NaiveDate;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{ContentItem, Destination, SelectionMode, ScheduleUnit, UnitId};
use crate::storage::Occupancy;

// ============================================================================
// Selection result
// ============================================================================

/// Why a destination gets nothing this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Every candidate is already live there through another unit
    AllExcluded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllExcluded => write!(f, "all candidates are shown by other units"),
        }
    }
}

/// Outcome of selection for one destination
#[derive(Debug, Clone, PartialEq)]
pub enum Choice {
    Publish(ContentItem),
    Skip(SkipReason),
}

impl Choice {
    pub fn content(&self) -> Option<&ContentItem> {
        match self {
            Self::Publish(item) => Some(item),
            Self::Skip(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub destination: Destination,
    pub choice: Choice,
}

/// Destination to content mapping for one cycle of a unit
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub unit_id: UnitId,

    /// One entry per destination, in id order
    pub assignments: Vec<Assignment>,

    /// Offset to persist after the cycle (random mode only)
    pub next_offset: Option<u32>,
}

impl Selection {
    /// Content chosen for a destination, if any
    pub fn content_for(&self, destination_id: i64) -> Option<&ContentItem> {
        self.assignments
            .iter()
            .find(|a| a.destination.id == destination_id)
            .and_then(|a| a.choice.content())
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Picks content per destination for a unit's cycle
#[derive(Debug, Clone, Default)]
pub struct RotationSelector;

impl RotationSelector {
    pub fn new() -> Self {
        Self
    }

    /// Seed for a unit's permutation on a given local date
    pub fn seed(date: NaiveDate, unit_id: UnitId) -> u64 {
        let digest = Sha256::digest(format!("{}_{}", date.format("%Y-%m-%d"), unit_id).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Daily permutation of the pool
    ///
    /// Items are ordered by id before shuffling so the result does not
    /// depend on the order the pool was loaded in.
    pub fn permutation(date: NaiveDate, unit_id: UnitId, pool: &[ContentItem]) -> Vec<ContentItem> {
        let mut order = pool.to_vec();
        order.sort_by_key(|item| item.id);

        let mut rng = ChaCha8Rng::seed_from_u64(Self::seed(date, unit_id));
        order.shuffle(&mut rng);
        order
    }

    /// Build the destination mapping for one cycle
    ///
    /// Returns [`Error::SelectionExhausted`] when the unit has no eligible
    /// content at all; destinations where every candidate is excluded are
    /// reported as [`Choice::Skip`] instead.
    pub fn select<O>(
        &self,
        unit: &ScheduleUnit,
        pool: &[ContentItem],
        destinations: &[Destination],
        occupancy: &O,
        date: NaiveDate,
    ) -> Result<Selection>
    where
        O: Occupancy + ?Sized,
    {
        let mut eligible: Vec<ContentItem> = pool
            .iter()
            .filter(|item| item.is_eligible_for(unit.id))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return Err(Error::SelectionExhausted {
                unit_id: unit.id,
                destination_id: None,
            });
        }

        let (candidates, start, next_offset) = match unit.mode {
            SelectionMode::Fixed => {
                eligible.sort_by_key(|item| item.id);
                if eligible.len() > 1 {
                    warn!(
                        unit_id = unit.id,
                        enabled_items = eligible.len(),
                        chosen = eligible[0].id,
                        "Fixed unit has several enabled items, using the lowest id"
                    );
                }
                eligible.truncate(1);
                (eligible, 0, None)
            }
            SelectionMode::Random => {
                let order = Self::permutation(date, unit.id, &eligible);
                let n = order.len();
                let start = unit.rotation_offset as usize % n;
                let next = ((u64::from(unit.rotation_offset) + 1) % n as u64) as u32;
                debug!(
                    unit_id = unit.id,
                    %date,
                    order = ?order.iter().map(|c| c.id).collect::<Vec<_>>(),
                    start,
                    "Daily permutation"
                );
                (order, start, Some(next))
            }
        };

        let mut ordered: Vec<&Destination> = destinations.iter().collect();
        ordered.sort_by_key(|d| d.id);

        let mut assignments = Vec::with_capacity(ordered.len());
        for (index, destination) in ordered.into_iter().enumerate() {
            let occupied = occupancy.occupied_by_others(destination.id, unit.id)?;
            let n = candidates.len();
            let first = (start + index) % n;

            let pick = (0..n)
                .map(|i| &candidates[(first + i) % n])
                .find(|item| !occupied.contains(&item.id));

            let choice = match pick {
                Some(item) => Choice::Publish(item.clone()),
                None => {
                    info!(
                        unit_id = unit.id,
                        destination_id = destination.id,
                        "No content left for destination after dedup, skipping"
                    );
                    Choice::Skip(SkipReason::AllExcluded)
                }
            };

            assignments.push(Assignment {
                destination: destination.clone(),
                choice,
            });
        }

        Ok(Selection {
            unit_id: unit.id,
            assignments,
            next_offset,
        })
    }
}
