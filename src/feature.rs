//! Image features as found in the coverage vector tiles.
//!
//! Tiles come off the wire as Mapbox Vector Tiles and are kept in the tile
//! cache as GeoJSON feature collections. Both representations are turned into
//! typed [`Feature`]s here, and [`FeatureFilter`] narrows them down to the
//! ones worth downloading.

use geozero::mvt::{tile, Message, Tile as VectorTile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use crate::bounding_box::BoundingBox;
use crate::error::{Error, Result};
use crate::tile::Tile;

const DEFAULT_EXTENT: u32 = 4096;

const CMD_MOVE_TO: u32 = 1;

/// A single captured image.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub image_id: u64,
    pub sequence_id: String,
    pub lng: f64,
    pub lat: f64,
    pub is_pano: bool,
}

/// GeoJSON feature collection as stored in the tile cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub features: Vec<GeoFeature>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum CollectionType {
    #[default]
    FeatureCollection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoFeature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub geometry: Point,
    pub properties: ImageProperties,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FeatureType {
    Feature,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Point {
    Point { coordinates: [f64; 2] },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageProperties {
    pub id: u64,
    pub sequence_id: String,
    #[serde(default)]
    pub is_pano: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compass_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<u64>,
}

impl ImageProperties {
    /// The sequence id becomes a directory name, so it has to be a single
    /// plain path component.
    fn validate(&self) -> Result<()> {
        let seq = self.sequence_id.as_str();
        if seq.is_empty() || seq == "." || seq == ".." || seq.contains(['/', '\\', '\0']) {
            return Err(Error::MalformedTileData(format!(
                "image {} has an unusable sequence_id {:?}",
                self.id, seq
            )));
        }
        Ok(())
    }
}

impl GeoFeature {
    pub fn new(lng: f64, lat: f64, properties: ImageProperties) -> Self {
        Self {
            kind: FeatureType::Feature,
            geometry: Point::Point {
                coordinates: [lng, lat],
            },
            properties,
        }
    }

    pub fn coordinates(&self) -> (f64, f64) {
        let Point::Point { coordinates } = &self.geometry;
        (coordinates[0], coordinates[1])
    }

    pub fn to_feature(&self) -> Feature {
        let (lng, lat) = self.coordinates();
        Feature {
            image_id: self.properties.id,
            sequence_id: self.properties.sequence_id.clone(),
            lng,
            lat,
            is_pano: self.properties.is_pano,
        }
    }
}

impl FeatureCollection {
    pub fn new(features: Vec<GeoFeature>) -> Self {
        Self {
            kind: CollectionType::FeatureCollection,
            features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Parses a cached collection. Features that don't carry the fields
    /// needed downstream are dropped, the rest are kept.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            features: Vec<serde_json::Value>,
        }

        let raw: Raw =
            serde_json::from_slice(data).map_err(|e| Error::MalformedTileData(e.to_string()))?;
        let features = raw
            .features
            .into_iter()
            .filter_map(|value| {
                let image_id = value.pointer("/properties/id").cloned();
                let parsed = serde_json::from_value::<GeoFeature>(value)
                    .map_err(|e| Error::MalformedTileData(e.to_string()))
                    .and_then(|f| f.properties.validate().map(|_| f));
                match parsed {
                    Ok(feature) => Some(feature),
                    Err(e) => {
                        warn!(image_id = ?image_id, error = %e, "skipping cached feature");
                        None
                    }
                }
            })
            .collect();

        Ok(Self::new(features))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::MalformedTileData(e.to_string()))
    }
}

/// Decodes the point features of `layer` in a raw vector tile.
///
/// A tile without that layer decodes to an empty collection. Features that
/// can't be turned into images are logged and left out.
pub fn decode_vector_tile(data: &[u8], tile: Tile, layer: &str) -> Result<FeatureCollection> {
    let vt = VectorTile::decode(data).map_err(|e| Error::MalformedTileData(e.to_string()))?;

    let layer = match vt.layers.iter().find(|l| l.name == layer) {
        Some(layer) => layer,
        None => return Ok(FeatureCollection::default()),
    };
    let extent = layer.extent.unwrap_or(DEFAULT_EXTENT) as f64;

    let mut features = Vec::with_capacity(layer.features.len());
    for feature in &layer.features {
        match decode_feature(layer, feature, tile, extent) {
            Ok(decoded) => features.extend(decoded),
            Err(e) => warn!(tile = %tile, image_id = ?feature.id, error = %e, "skipping feature"),
        }
    }

    Ok(FeatureCollection::new(features))
}

fn decode_feature(
    layer: &tile::Layer,
    feature: &tile::Feature,
    tile: Tile,
    extent: f64,
) -> Result<Vec<GeoFeature>> {
    if feature.r#type != Some(tile::GeomType::Point as i32) {
        return Err(Error::MalformedTileData("not a point".to_owned()));
    }

    let properties = properties(layer, feature)?;
    Ok(decode_points(&feature.geometry)?
        .into_iter()
        .map(|(px, py)| {
            let (lng, lat) = tile.project(px as f64, py as f64, extent);
            GeoFeature::new(lng, lat, properties.clone())
        })
        .collect())
}

fn decode_points(geometry: &[u32]) -> Result<Vec<(i64, i64)>> {
    let mut points = Vec::new();
    let (mut x, mut y) = (0_i64, 0_i64);
    let mut it = geometry.iter();

    while let Some(cmd) = it.next() {
        let (id, count) = (cmd & 0x7, cmd >> 3);
        if id != CMD_MOVE_TO {
            return Err(Error::MalformedTileData(format!(
                "unexpected geometry command {} in point feature",
                id
            )));
        }

        for _ in 0..count {
            match (it.next(), it.next()) {
                (Some(dx), Some(dy)) => {
                    x += zigzag(*dx);
                    y += zigzag(*dy);
                    points.push((x, y));
                }
                _ => {
                    return Err(Error::MalformedTileData(
                        "truncated point geometry".to_owned(),
                    ))
                }
            }
        }
    }

    Ok(points)
}

fn zigzag(v: u32) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn properties(layer: &tile::Layer, feature: &tile::Feature) -> Result<ImageProperties> {
    let mut id = feature.id;
    let mut sequence_id = None;
    let mut props = ImageProperties {
        id: 0,
        sequence_id: String::new(),
        is_pano: false,
        compass_angle: None,
        captured_at: None,
        creator_id: None,
        organization_id: None,
    };

    for pair in feature.tags.chunks(2) {
        let (key, value) = match pair {
            [k, v] => (
                layer.keys.get(*k as usize),
                layer.values.get(*v as usize),
            ),
            _ => (None, None),
        };
        let (key, value) = match (key, value) {
            (Some(key), Some(value)) => (key.as_str(), value),
            _ => {
                return Err(Error::MalformedTileData(
                    "feature tag points outside the layer tables".to_owned(),
                ))
            }
        };

        match key {
            "id" => id = as_u64(value).or(id),
            "sequence_id" => sequence_id = value.string_value.clone(),
            "is_pano" => props.is_pano = value.bool_value.unwrap_or(false),
            "compass_angle" => props.compass_angle = as_f64(value),
            "captured_at" => props.captured_at = as_u64(value).map(|v| v as i64),
            "creator_id" => props.creator_id = as_u64(value),
            "organization_id" => props.organization_id = as_u64(value),
            _ => {}
        }
    }

    props.id = id.ok_or_else(|| Error::MalformedTileData("feature without an id".to_owned()))?;
    props.sequence_id = sequence_id.ok_or_else(|| {
        Error::MalformedTileData(format!("image {} has no sequence_id", props.id))
    })?;
    props.validate()?;

    Ok(props)
}

fn as_u64(value: &tile::Value) -> Option<u64> {
    value
        .uint_value
        .or_else(|| value.int_value.and_then(|v| u64::try_from(v).ok()))
        .or_else(|| value.sint_value.and_then(|v| u64::try_from(v).ok()))
        .or_else(|| value.string_value.as_ref().and_then(|v| v.parse().ok()))
}

fn as_f64(value: &tile::Value) -> Option<f64> {
    value
        .double_value
        .or_else(|| value.float_value.map(f64::from))
        .or_else(|| value.int_value.map(|v| v as f64))
        .or_else(|| value.uint_value.map(|v| v as f64))
        .or_else(|| value.sint_value.map(|v| v as f64))
}

/// Narrows a tile's features to the ones strictly inside the bounding box
/// and, if given, on the image allow-list.
#[derive(Clone, Debug)]
pub struct FeatureFilter {
    bounding_box: BoundingBox,
    allowed_image_ids: Option<HashSet<u64>>,
}

impl FeatureFilter {
    pub fn new(bounding_box: BoundingBox, allowed_image_ids: Option<HashSet<u64>>) -> Self {
        Self {
            bounding_box,
            allowed_image_ids,
        }
    }

    pub fn accepts(&self, feature: &Feature) -> bool {
        self.bounding_box.contains(feature.lng, feature.lat)
            && self
                .allowed_image_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&feature.image_id))
    }

    /// Surviving features in tile order, each image at most once.
    pub fn apply(&self, collection: &FeatureCollection) -> Vec<Feature> {
        let mut seen = HashSet::new();
        collection
            .features
            .iter()
            .map(GeoFeature::to_feature)
            .filter(|f| self.accepts(f))
            .filter(|f| seen.insert(f.image_id))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn props(id: u64, sequence_id: &str) -> ImageProperties {
        ImageProperties {
            id,
            sequence_id: sequence_id.to_owned(),
            is_pano: false,
            compass_angle: None,
            captured_at: None,
            creator_id: None,
            organization_id: None,
        }
    }

    fn zz(v: i64) -> u32 {
        ((v << 1) ^ (v >> 63)) as u32
    }

    fn string_value(s: &str) -> tile::Value {
        tile::Value {
            string_value: Some(s.to_owned()),
            ..Default::default()
        }
    }

    /// Encodes point features `(id, sequence, px, py)` into an `image` layer.
    pub(crate) fn encode_tile(points: &[(u64, &str, u32, u32)]) -> Vec<u8> {
        let mut values = Vec::new();
        let mut features = Vec::new();
        for (id, sequence, px, py) in points {
            values.push(tile::Value {
                uint_value: Some(*id),
                ..Default::default()
            });
            values.push(string_value(sequence));
            let n = values.len() as u32;
            features.push(tile::Feature {
                id: Some(*id),
                tags: vec![0, n - 2, 1, n - 1],
                r#type: Some(tile::GeomType::Point as i32),
                geometry: vec![(1 << 3) | CMD_MOVE_TO, zz(*px as i64), zz(*py as i64)],
            });
        }

        let vt = VectorTile {
            layers: vec![tile::Layer {
                version: 2,
                name: "image".to_owned(),
                features,
                keys: vec!["id".to_owned(), "sequence_id".to_owned()],
                values,
                extent: Some(4096),
            }],
        };
        vt.encode_to_vec()
    }

    #[test]
    fn decodes_image_layer() {
        let tile = Tile::new(8424, 5384, 14);
        let data = encode_tile(&[(101, "seq-a", 2048, 1024), (202, "seq-b", 10, 4000)]);

        let collection = decode_vector_tile(&data, tile, "image").unwrap();
        assert_eq!(collection.features.len(), 2);

        let first = collection.features[0].to_feature();
        assert_eq!(first.image_id, 101);
        assert_eq!(first.sequence_id, "seq-a");
        let (lng, lat) = tile.project(2048.0, 1024.0, 4096.0);
        assert!((first.lng - lng).abs() < 1e-12);
        assert!((first.lat - lat).abs() < 1e-12);
        assert_eq!(collection.features[1].properties.id, 202);
    }

    #[test]
    fn missing_layer_is_empty() {
        let data = encode_tile(&[(101, "seq-a", 1, 1)]);
        let collection = decode_vector_tile(&data, Tile::new(0, 0, 14), "sequence").unwrap();
        assert!(collection.is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let res = decode_vector_tile(b"\xff\xff\xff\xff", Tile::new(0, 0, 14), "image");
        assert!(matches!(res, Err(Error::MalformedTileData(_))));
    }

    #[test]
    fn cached_feature_without_sequence_id_is_dropped() {
        let json = br#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[4.5,52.5]},
             "properties":{"id":101}},
            {"type":"Feature","geometry":{"type":"Point","coordinates":[4.6,52.6]},
             "properties":{"id":202,"sequence_id":"seq-b"}}]}"#;
        let collection = FeatureCollection::from_json(json).unwrap();
        assert_eq!(collection.features.len(), 1);
        assert_eq!(collection.features[0].properties.id, 202);
    }

    #[test]
    fn unparsable_cache_file_is_malformed() {
        assert!(matches!(
            FeatureCollection::from_json(b"{\"type\":\"FeatureCollection\""),
            Err(Error::MalformedTileData(_))
        ));
        assert!(matches!(
            FeatureCollection::from_json(b"[1, 2]"),
            Err(Error::MalformedTileData(_))
        ));
    }

    #[test]
    fn sequence_id_must_be_a_plain_name() {
        for bad in ["", "..", "a/b", "a\\b"] {
            let collection = FeatureCollection::new(vec![
                GeoFeature::new(4.5, 52.5, props(1, bad)),
                GeoFeature::new(4.5, 52.5, props(2, "fine")),
            ]);
            let json = serde_json::to_vec(&collection).unwrap();
            let parsed = FeatureCollection::from_json(&json).unwrap();
            let ids: Vec<u64> = parsed.features.iter().map(|f| f.properties.id).collect();
            assert_eq!(ids, vec![2], "{:?}", bad);
        }
    }

    #[test]
    fn bad_feature_leaves_siblings_alone() {
        let data = encode_tile(&[
            (101, "seq-a", 1, 1),
            (102, "bad/seq", 2, 2),
            (103, "../etc", 3, 3),
        ]);
        let collection = decode_vector_tile(&data, Tile::new(0, 0, 14), "image").unwrap();
        let ids: Vec<u64> = collection.features.iter().map(|f| f.properties.id).collect();
        assert_eq!(ids, vec![101]);
    }

    #[test]
    fn non_point_feature_is_skipped() {
        let data = encode_tile(&[(101, "seq-a", 1, 1), (202, "seq-b", 2, 2)]);
        let mut vt = VectorTile::decode(&data[..]).unwrap();
        vt.layers[0].features[0].r#type = Some(tile::GeomType::Linestring as i32);

        let data = vt.encode_to_vec();
        let collection = decode_vector_tile(&data, Tile::new(0, 0, 14), "image").unwrap();
        let ids: Vec<u64> = collection.features.iter().map(|f| f.properties.id).collect();
        assert_eq!(ids, vec![202]);
    }

    #[test]
    fn cached_json_roundtrip_keeps_extra_fields() {
        let mut p = props(101, "seq-a");
        p.compass_angle = Some(12.5);
        p.is_pano = true;
        let collection = FeatureCollection::new(vec![GeoFeature::new(4.5, 52.5, p)]);
        let parsed = FeatureCollection::from_json(&collection.to_json().unwrap()).unwrap();
        assert_eq!(parsed, collection);
        assert!(parsed.features[0].to_feature().is_pano);
    }

    fn collection(points: &[(u64, f64, f64)]) -> FeatureCollection {
        FeatureCollection::new(
            points
                .iter()
                .map(|(id, lng, lat)| GeoFeature::new(*lng, *lat, props(*id, "seq")))
                .collect(),
        )
    }

    #[test]
    fn filter_excludes_boundary() {
        let bbox = BoundingBox::new(4.0, 52.0, 5.0, 53.0).unwrap();
        let filter = FeatureFilter::new(bbox, None);
        let features = filter.apply(&collection(&[
            (1, 4.0, 52.5),
            (2, 4.0 + 1e-9, 52.5),
            (3, 5.0, 52.5),
            (4, 4.5, 52.0),
            (5, 4.5, 53.0),
            (6, 3.0, 52.5),
        ]));
        let ids: Vec<u64> = features.iter().map(|f| f.image_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn filter_applies_allow_list_with_bounding_box() {
        let bbox = BoundingBox::new(4.0, 52.0, 5.0, 53.0).unwrap();
        let allowed = [101, 202].iter().copied().collect();
        let filter = FeatureFilter::new(bbox, Some(allowed));

        let features = filter.apply(&collection(&[
            (101, 4.5, 52.5),
            (102, 4.5, 52.5),
            (202, 4.6, 52.6),
            (303, 4.7, 52.7),
        ]));
        let ids: Vec<u64> = features.iter().map(|f| f.image_id).collect();
        assert_eq!(ids, vec![101, 202]);

        let features = filter.apply(&collection(&[(101, 4.5, 52.5), (202, 6.0, 52.6)]));
        let ids: Vec<u64> = features.iter().map(|f| f.image_id).collect();
        assert_eq!(ids, vec![101]);
    }

    #[test]
    fn filter_drops_duplicate_images() {
        let bbox = BoundingBox::new(4.0, 52.0, 5.0, 53.0).unwrap();
        let filter = FeatureFilter::new(bbox, None);
        let features = filter.apply(&collection(&[(7, 4.5, 52.5), (7, 4.5, 52.5)]));
        assert_eq!(features.len(), 1);
    }
}
