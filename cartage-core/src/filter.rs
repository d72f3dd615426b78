//! Declarative selection predicates evaluated by database adapters.
//!
//! Spatial selection of tiles uses the centre of a feature's envelope so that
//! each feature lands in exactly one tile. See [`TileFilter`].

use std::collections::BTreeSet;

use geo::{Coord, Intersects, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::model::{ExternalId, Feature, FeatureTypeId};
use crate::tiling::Tiling;

/// Spatial reference system metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReferenceSystem {
    /// Numeric SRID.
    pub srid: u32,
    /// Whether coordinates carry a height component.
    pub is_3d: bool,
    /// Human-readable name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,
}

impl ReferenceSystem {
    /// Build reference system metadata.
    pub fn new(srid: u32, is_3d: bool, name: impl Into<String>) -> Self {
        Self {
            srid,
            is_3d,
            name: name.into(),
        }
    }
}

/// Membership test for a single tile.
///
/// Intervals are half-open `[min, max)` except along the outer maximum edges
/// of the tiling, which are closed so the whole extent is covered.
///
/// # Examples
/// ```
/// use geo::{Coord, Rect};
/// use cartage_core::TileFilter;
///
/// let extent = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
/// let inner = TileFilter::new(extent, false, false);
/// assert!(inner.contains(Coord { x: 0.0, y: 0.5 }));
/// assert!(!inner.contains(Coord { x: 1.0, y: 0.5 }));
/// let outer = TileFilter::new(extent, true, true);
/// assert!(outer.contains(Coord { x: 1.0, y: 1.0 }));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileFilter {
    extent: Rect<f64>,
    closed_max_x: bool,
    closed_max_y: bool,
}

impl TileFilter {
    /// Create a filter for `extent`, closing the maximum edges as requested.
    #[must_use]
    pub const fn new(extent: Rect<f64>, closed_max_x: bool, closed_max_y: bool) -> Self {
        Self {
            extent,
            closed_max_x,
            closed_max_y,
        }
    }

    /// Bounding rectangle of the tile.
    #[must_use]
    pub const fn extent(&self) -> Rect<f64> {
        self.extent
    }

    /// Whether the maximum x edge belongs to the tile.
    #[must_use]
    pub const fn closed_max_x(&self) -> bool {
        self.closed_max_x
    }

    /// Whether the maximum y edge belongs to the tile.
    #[must_use]
    pub const fn closed_max_y(&self) -> bool {
        self.closed_max_y
    }

    /// Whether `point` falls inside the tile.
    #[must_use]
    pub fn contains(&self, point: Coord<f64>) -> bool {
        let min = self.extent.min();
        let max = self.extent.max();
        let within_x = point.x >= min.x && (point.x < max.x || (self.closed_max_x && point.x <= max.x));
        let within_y = point.y >= min.y && (point.y < max.y || (self.closed_max_y && point.y <= max.y));
        within_x && within_y
    }
}

/// Selection predicate over features.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Select everything.
    All,
    /// Select features whose envelope centre lies in a tile.
    Within(TileFilter),
    /// Select features whose envelope intersects a bounding box.
    BBox(Rect<f64>),
    /// Select features of the listed types.
    TypeIn(BTreeSet<FeatureTypeId>),
    /// Select features with the listed external ids.
    IdIn(BTreeSet<ExternalId>),
    /// Both predicates must hold.
    And(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Combine two predicates with logical AND, dropping redundant `All`.
    ///
    /// # Examples
    /// ```
    /// use std::collections::BTreeSet;
    /// use cartage_core::{FeatureTypeId, Predicate};
    ///
    /// let types = Predicate::TypeIn(BTreeSet::from([FeatureTypeId::new(26)]));
    /// assert_eq!(Predicate::All.and(types.clone()), types);
    /// ```
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, rhs) => rhs,
            (lhs, Self::All) => lhs,
            (lhs, rhs) => Self::And(Box::new(lhs), Box::new(rhs)),
        }
    }

    /// Evaluate the predicate against a feature.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        match self {
            Self::All => true,
            Self::Within(tile) => tile.contains(feature.centre()),
            Self::BBox(bbox) => bbox.intersects(&feature.envelope),
            Self::TypeIn(types) => types.contains(&feature.type_id),
            Self::IdIn(ids) => ids.contains(&feature.external_id),
            Self::And(lhs, rhs) => lhs.matches(feature) && rhs.matches(feature),
        }
    }

    /// Whether evaluating the predicate needs a spatial index.
    #[must_use]
    pub fn contains_spatial_operators(&self) -> bool {
        match self {
            Self::Within(_) | Self::BBox(_) => true,
            Self::And(lhs, rhs) => lhs.contains_spatial_operators() || rhs.contains_spatial_operators(),
            Self::All | Self::TypeIn(_) | Self::IdIn(_) => false,
        }
    }

    /// Smallest rectangle that every spatial clause is confined to.
    ///
    /// Returns `None` when the predicate has no spatial clause. Adapters use
    /// it to narrow candidates through their spatial index before calling
    /// [`Predicate::matches`].
    #[must_use]
    pub fn spatial_bounds(&self) -> Option<Rect<f64>> {
        match self {
            Self::Within(tile) => Some(tile.extent()),
            Self::BBox(bbox) => Some(*bbox),
            Self::And(lhs, rhs) => match (lhs.spatial_bounds(), rhs.spatial_bounds()) {
                (Some(a), Some(b)) => Some(intersection(a, b)),
                (a, b) => a.or(b),
            },
            Self::All | Self::TypeIn(_) | Self::IdIn(_) => None,
        }
    }
}

fn intersection(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    let min = Coord {
        x: a.min().x.max(b.min().x),
        y: a.min().y.max(b.min().y),
    };
    let max = Coord {
        x: a.max().x.min(b.max().x).max(min.x),
        y: a.max().y.min(b.max().y).max(min.y),
    };
    Rect::new(min, max)
}

/// A selection request, optionally split into tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Non-spatial or spatial selection applied to every tile.
    pub predicate: Predicate,
    /// Optional tiling grid.
    pub tiling: Option<Tiling>,
    /// Reference system of the tiling extent when it differs from the
    /// database's.
    pub target_srs: Option<ReferenceSystem>,
}

impl Query {
    /// Query selecting everything without tiling.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            predicate: Predicate::All,
            tiling: None,
            target_srs: None,
        }
    }

    /// Whether the query needs spatial indexes in the database.
    #[must_use]
    pub fn requires_spatial_index(&self) -> bool {
        self.tiling.is_some() || self.predicate.contains_spatial_operators()
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}
