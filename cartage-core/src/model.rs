//! Feature objects, identifiers and counters moved by a transfer session.
//!
//! A [`Feature`] is the unit of work handed to a worker pool. Its references
//! to other features are expressed through external identifiers because the
//! target may not have been produced yet when the feature is processed.

use std::collections::BTreeMap;
use std::fmt;

use geo::{Coord, Rect};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors raised when constructing model values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// An external identifier was empty or whitespace only.
    #[error("external identifier must not be empty")]
    EmptyExternalId,
}

/// Stable textual identifier of a feature or geometry (the `gml:id`).
///
/// # Examples
/// ```
/// use cartage_core::ExternalId;
///
/// let id = ExternalId::new("BLDG_0001").unwrap();
/// assert_eq!(id.as_str(), "BLDG_0001");
/// assert!(ExternalId::new("  ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct ExternalId(String);

impl ExternalId {
    /// Validate and wrap an identifier.
    ///
    /// # Errors
    /// Returns [`ModelError::EmptyExternalId`] when the value is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, ModelError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ModelError::EmptyExternalId);
        }
        Ok(Self(value))
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ExternalId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ExternalId> for String {
    fn from(value: ExternalId) -> Self {
        value.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transfer-time key assigned to a feature by the database side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct InternalKey(i64);

impl InternalKey {
    /// Wrap a raw key.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Return the raw key.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a feature type in the schema mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct FeatureTypeId(u32);

impl FeatureTypeId {
    /// Wrap a raw type identifier.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Return the raw type identifier.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FeatureTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification used by the geometry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GeometryClass {
    /// Single point.
    Point,
    /// Collection of points.
    MultiPoint,
    /// Line string or curve.
    Curve,
    /// Collection of curves.
    MultiCurve,
    /// Polygon or surface patch.
    Surface,
    /// Collection of surfaces.
    MultiSurface,
    /// Closed volume.
    Solid,
    /// Solid assembled from other solids.
    CompositeSolid,
    /// Prototype geometry placed by reference.
    Implicit,
}

impl GeometryClass {
    /// Return the class name used in logs and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::MultiPoint => "multi_point",
            Self::Curve => "curve",
            Self::MultiCurve => "multi_curve",
            Self::Surface => "surface",
            Self::MultiSurface => "multi_surface",
            Self::Solid => "solid",
            Self::CompositeSolid => "composite_solid",
            Self::Implicit => "implicit",
        }
    }
}

impl fmt::Display for GeometryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an inter-feature reference carried by a [`Feature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ReferenceKind {
    /// The feature is a group and the target one of its members.
    GroupMember,
    /// The feature is a group and the target its parent.
    GroupParent,
    /// Generic link from the feature to another feature.
    FeatureLink,
    /// A surface of the feature is bound to the target texture.
    TextureBinding,
}

impl ReferenceKind {
    /// Deferred queue that stores unresolved references of this kind.
    #[must_use]
    pub const fn deferred_kind(self) -> DeferredKind {
        match self {
            Self::GroupMember | Self::GroupParent => DeferredKind::GroupMember,
            Self::FeatureLink => DeferredKind::FeatureLink,
            Self::TextureBinding => DeferredKind::TextureBinding,
        }
    }
}

/// Kind of deferred work recorded during the main pass.
///
/// Each kind owns a separate queue; ordering is only preserved between
/// records of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeferredKind {
    /// Group membership or group parent link.
    GroupMember,
    /// Link between two features.
    FeatureLink,
    /// Surface to texture binding.
    TextureBinding,
    /// Binary texture image to fetch and store.
    TextureImage,
}

impl DeferredKind {
    /// Every kind in resolution order.
    pub const ALL: [Self; 4] = [
        Self::GroupMember,
        Self::FeatureLink,
        Self::TextureBinding,
        Self::TextureImage,
    ];

    /// Return the kind name used for table names and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GroupMember => "group_member",
            Self::FeatureLink => "feature_link",
            Self::TextureBinding => "texture_binding",
            Self::TextureImage => "texture_image",
        }
    }
}

impl fmt::Display for DeferredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a feature to another feature by external id.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureReference {
    /// Relationship kind.
    pub kind: ReferenceKind,
    /// External id of the referenced feature.
    pub target: ExternalId,
    /// Optional role of the relationship.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub role: Option<String>,
}

/// Reference to a texture image by URI or file path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextureReference {
    /// Location of the image, remote URL or local path.
    pub uri: String,
}

/// A reference whose target key became known and can be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolvedReference {
    /// Relationship kind.
    pub kind: ReferenceKind,
    /// Key of the referencing feature.
    pub source: InternalKey,
    /// External id of the referenced feature.
    pub target: ExternalId,
    /// Resolved key of the referenced feature.
    pub target_key: InternalKey,
    /// Optional role of the relationship.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub role: Option<String>,
}

/// Geospatial feature object moved between the database and a file.
///
/// # Examples
/// ```
/// use geo::{Coord, Rect};
/// use cartage_core::{ExternalId, Feature, FeatureTypeId, GeometryClass, InternalKey};
///
/// let envelope = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 2.0, y: 2.0 });
/// let feature = Feature::new(
///     InternalKey::new(1),
///     ExternalId::new("BLDG_1").unwrap(),
///     FeatureTypeId::new(26),
///     envelope,
/// )
/// .with_geometry(GeometryClass::Solid, 1);
/// assert_eq!(feature.centre(), Coord { x: 1.0, y: 1.0 });
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Feature {
    /// Internal key assigned by the database side.
    pub key: InternalKey,
    /// Stable external identifier.
    pub external_id: ExternalId,
    /// Schema type of the feature.
    pub type_id: FeatureTypeId,
    /// Bounding envelope in the database reference system.
    pub envelope: Rect<f64>,
    /// Free-form attributes.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "BTreeMap::is_empty"))]
    pub attributes: BTreeMap<String, String>,
    /// References to other features.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Vec::is_empty"))]
    pub references: Vec<FeatureReference>,
    /// Referenced texture images.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Vec::is_empty"))]
    pub textures: Vec<TextureReference>,
    /// Geometry counts by class.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "BTreeMap::is_empty"))]
    pub geometries: BTreeMap<GeometryClass, u64>,
}

impl Feature {
    /// Create a feature without attributes, references or geometries.
    #[must_use]
    pub const fn new(
        key: InternalKey,
        external_id: ExternalId,
        type_id: FeatureTypeId,
        envelope: Rect<f64>,
    ) -> Self {
        Self {
            key,
            external_id,
            type_id,
            envelope,
            attributes: BTreeMap::new(),
            references: Vec::new(),
            textures: Vec::new(),
            geometries: BTreeMap::new(),
        }
    }

    /// Add a reference to another feature.
    #[must_use]
    pub fn with_reference(mut self, kind: ReferenceKind, target: ExternalId) -> Self {
        self.references.push(FeatureReference {
            kind,
            target,
            role: None,
        });
        self
    }

    /// Add a reference carrying a role.
    #[must_use]
    pub fn with_role_reference(
        mut self,
        kind: ReferenceKind,
        target: ExternalId,
        role: impl Into<String>,
    ) -> Self {
        self.references.push(FeatureReference {
            kind,
            target,
            role: Some(role.into()),
        });
        self
    }

    /// Add a texture image reference.
    #[must_use]
    pub fn with_texture(mut self, uri: impl Into<String>) -> Self {
        self.textures.push(TextureReference { uri: uri.into() });
        self
    }

    /// Count `count` geometries of the given class.
    #[must_use]
    pub fn with_geometry(mut self, class: GeometryClass, count: u64) -> Self {
        *self.geometries.entry(class).or_default() += count;
        self
    }

    /// Set an attribute value.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Centre of the envelope, used to assign the feature to a tile.
    #[must_use]
    pub fn centre(&self) -> Coord<f64> {
        self.envelope.center()
    }
}

/// Feature decoded from an import source.
///
/// Import sources do not carry internal keys and may omit the external id;
/// both are assigned before the feature reaches the database sink.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceFeature {
    /// External id, if the source provided one.
    #[cfg_attr(feature = "serde", serde(default, deserialize_with = "blank_as_none"))]
    pub external_id: Option<ExternalId>,
    /// Schema type of the feature.
    pub type_id: FeatureTypeId,
    /// Bounding envelope.
    pub envelope: Rect<f64>,
    /// Free-form attributes.
    #[cfg_attr(feature = "serde", serde(default))]
    pub attributes: BTreeMap<String, String>,
    /// References to other features.
    #[cfg_attr(feature = "serde", serde(default))]
    pub references: Vec<FeatureReference>,
    /// Referenced texture images.
    #[cfg_attr(feature = "serde", serde(default))]
    pub textures: Vec<TextureReference>,
    /// Geometry counts by class.
    #[cfg_attr(feature = "serde", serde(default))]
    pub geometries: BTreeMap<GeometryClass, u64>,
}

#[cfg(feature = "serde")]
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<ExternalId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| ExternalId::new(value).ok()))
}

impl SourceFeature {
    /// Source feature without attributes, references or geometries.
    #[must_use]
    pub const fn new(
        external_id: Option<ExternalId>,
        type_id: FeatureTypeId,
        envelope: Rect<f64>,
    ) -> Self {
        Self {
            external_id,
            type_id,
            envelope,
            attributes: BTreeMap::new(),
            references: Vec::new(),
            textures: Vec::new(),
            geometries: BTreeMap::new(),
        }
    }

    /// Whether every envelope coordinate is finite.
    #[must_use]
    pub fn has_finite_envelope(&self) -> bool {
        let min = self.envelope.min();
        let max = self.envelope.max();
        [min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite())
    }

    /// Complete the feature with its assigned key and id.
    #[must_use]
    pub fn into_feature(self, key: InternalKey, external_id: ExternalId) -> Feature {
        Feature {
            key,
            external_id,
            type_id: self.type_id,
            envelope: self.envelope,
            attributes: self.attributes,
            references: self.references,
            textures: self.textures,
            geometries: self.geometries,
        }
    }
}

impl From<Feature> for SourceFeature {
    fn from(feature: Feature) -> Self {
        Self {
            external_id: Some(feature.external_id),
            type_id: feature.type_id,
            envelope: feature.envelope,
            attributes: feature.attributes,
            references: feature.references,
            textures: feature.textures,
            geometries: feature.geometries,
        }
    }
}

/// Per-type object counts and per-class geometry counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counters {
    /// Objects by feature type.
    pub objects: BTreeMap<FeatureTypeId, u64>,
    /// Geometries by class.
    pub geometries: BTreeMap<GeometryClass, u64>,
}

impl Counters {
    /// Count one feature and its geometries.
    pub fn record_feature(&mut self, feature: &Feature) {
        *self.objects.entry(feature.type_id).or_default() += 1;
        for (class, count) in &feature.geometries {
            *self.geometries.entry(*class).or_default() += count;
        }
    }

    /// Add object increments keyed by type.
    pub fn add_objects(&mut self, increments: &BTreeMap<FeatureTypeId, u64>) {
        for (type_id, count) in increments {
            *self.objects.entry(*type_id).or_default() += count;
        }
    }

    /// Add geometry increments keyed by class.
    pub fn add_geometries(&mut self, increments: &BTreeMap<GeometryClass, u64>) {
        for (class, count) in increments {
            *self.geometries.entry(*class).or_default() += count;
        }
    }

    /// Add every count of `other` to `self`.
    pub fn merge(&mut self, other: &Self) {
        self.add_objects(&other.objects);
        self.add_geometries(&other.geometries);
    }

    /// Reset all counts.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.geometries.clear();
    }

    /// Whether nothing has been counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.geometries.is_empty()
    }

    /// Sum of all object counts.
    #[must_use]
    pub fn total_objects(&self) -> u64 {
        self.objects.values().sum()
    }

    /// Sum of all geometry counts.
    #[must_use]
    pub fn total_geometries(&self) -> u64 {
        self.geometries.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn id(value: &str) -> ExternalId {
        ExternalId::new(value).expect("valid id")
    }

    #[fixture]
    fn building() -> Feature {
        Feature::new(
            InternalKey::new(7),
            id("BLDG_7"),
            FeatureTypeId::new(26),
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 4.0, y: 2.0 }),
        )
        .with_geometry(GeometryClass::Solid, 1)
        .with_geometry(GeometryClass::Surface, 6)
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn external_id_rejects_blank(#[case] value: &str) {
        assert_eq!(ExternalId::new(value), Err(ModelError::EmptyExternalId));
    }

    #[rstest]
    fn centre_is_midpoint_of_envelope(building: Feature) {
        assert_eq!(building.centre(), Coord { x: 2.0, y: 1.0 });
    }

    #[rstest]
    fn counters_record_objects_and_geometries(building: Feature) {
        let mut counters = Counters::default();
        counters.record_feature(&building);
        counters.record_feature(&building);
        assert_eq!(counters.total_objects(), 2);
        assert_eq!(counters.total_geometries(), 14);
        assert_eq!(counters.objects.get(&FeatureTypeId::new(26)), Some(&2));
    }

    #[rstest]
    fn counters_merge_and_clear(building: Feature) {
        let mut tile = Counters::default();
        tile.record_feature(&building);
        let mut total = Counters::default();
        total.merge(&tile);
        total.merge(&tile);
        tile.clear();
        assert!(tile.is_empty());
        assert_eq!(total.total_objects(), 2);
        assert_eq!(total.geometries.get(&GeometryClass::Surface), Some(&12));
    }

    #[rstest]
    #[case(ReferenceKind::GroupMember, DeferredKind::GroupMember)]
    #[case(ReferenceKind::GroupParent, DeferredKind::GroupMember)]
    #[case(ReferenceKind::FeatureLink, DeferredKind::FeatureLink)]
    #[case(ReferenceKind::TextureBinding, DeferredKind::TextureBinding)]
    fn reference_kinds_map_to_queues(#[case] kind: ReferenceKind, #[case] queue: DeferredKind) {
        assert_eq!(kind.deferred_kind(), queue);
    }

    #[cfg(feature = "serde")]
    #[rstest]
    #[case(r#"{"type_id": 26, "envelope": {"min": {"x": 0.0, "y": 0.0}, "max": {"x": 1.0, "y": 1.0}}}"#)]
    #[case(r#"{"external_id": " ", "type_id": 26, "envelope": {"min": {"x": 0.0, "y": 0.0}, "max": {"x": 1.0, "y": 1.0}}}"#)]
    fn source_feature_treats_missing_id_as_none(#[case] json: &str) {
        let source: SourceFeature = serde_json::from_str(json).expect("deserialise");
        assert_eq!(source.external_id, None);
        assert!(source.has_finite_envelope());
    }

    #[rstest]
    fn source_feature_round_trips_into_feature(building: Feature) {
        let source = SourceFeature::from(building.clone());
        let rebuilt = source.into_feature(building.key, building.external_id.clone());
        assert_eq!(rebuilt, building);
    }

    #[cfg(feature = "serde")]
    #[rstest]
    fn feature_serialises_without_empty_collections(building: Feature) {
        let json = serde_json::to_value(&building).expect("serialise");
        assert!(json.get("references").is_none());
        let back: Feature = serde_json::from_value(json).expect("deserialise");
        assert_eq!(back, building);
    }
}
