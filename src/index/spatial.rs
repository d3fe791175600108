//! Spatial Index (Morton Cells)
//!
//! Points `(lat, lon)` map to a cell code at a configured level by
//! interleaving the bits of the normalized coordinates. Entries are
//! `<cell-code> / <item-id> -> packed (lat, lon)`; the stored point lets
//! a box query filter candidates exactly after enumerating the covering
//! cells. Results are deduplicated across cells.

use crate::error::{Error, Result};
use crate::index::{key_path_values, EntryStream, IndexDescriptor, IndexEntry};
use crate::kv::{KvRead, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum cell level: two interleaved coordinates must fit in 64 bits.
pub const MAX_LEVEL: u8 = 31;

/// A bounding-box query.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialQuery {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl SpatialQuery {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Normalized grid coordinate of a latitude/longitude at a level.
fn grid_coord(value: f64, min: f64, max: f64, level: u8) -> u32 {
    let cells = 1u64 << level;
    let normalized = ((value - min) / (max - min)).clamp(0.0, 1.0);
    ((normalized * cells as f64) as u64).min(cells - 1) as u32
}

/// Interleave x (even bits) and y (odd bits) into a Morton code.
pub fn morton_encode(x: u32, y: u32, level: u8) -> u64 {
    let mut code = 0u64;
    for bit in 0..level {
        code |= ((x as u64 >> bit) & 1) << (2 * bit);
        code |= ((y as u64 >> bit) & 1) << (2 * bit + 1);
    }
    code
}

/// Cell code of a point at a level.
pub fn cell_of(lat: f64, lon: f64, level: u8) -> u64 {
    let x = grid_coord(lon, -180.0, 180.0, level);
    let y = grid_coord(lat, -90.0, 90.0, level);
    morton_encode(x, y, level)
}

fn point_of(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<Option<(f64, f64)>> {
    let values = key_path_values(descriptor, ty, record)?;
    if values.len() != 2 {
        return Err(Error::InvalidQuery(format!(
            "spatial index '{}' requires (lat, lon) key paths",
            descriptor.name
        )));
    }
    match (values.get(0), values.get(1)) {
        (Some(TupleValue::Float(lat)), Some(TupleValue::Float(lon))) => Ok(Some((*lat, *lon))),
        // A record without a point simply has no entries
        (Some(TupleValue::Null), _) | (_, Some(TupleValue::Null)) => Ok(None),
        _ => Err(Error::InvalidQuery(format!(
            "spatial index '{}' requires float lat/lon fields",
            descriptor.name
        ))),
    }
}

/// Map a record to its cell entry.
pub fn entries(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
    level: u8,
) -> Result<BTreeMap<Tuple, Vec<u8>>> {
    let mut out = BTreeMap::new();
    let Some((lat, lon)) = point_of(descriptor, ty, record)? else {
        return Ok(out);
    };
    let cell = cell_of(lat, lon, level.min(MAX_LEVEL));
    let mut key = Tuple::from_single(cell as i64);
    key = key.concat(&ty.primary_key(record)?);
    let point = Tuple::new(vec![TupleValue::Float(lat), TupleValue::Float(lon)]);
    out.insert(key, point.pack());
    Ok(out)
}

/// Search a bounding box: enumerate covering cells, scan each, filter by
/// the stored point, deduplicate across cells.
pub fn search<'a>(
    subspace: &Subspace,
    reader: &dyn KvRead,
    query: &SpatialQuery,
    level: u8,
) -> Result<EntryStream<'a>> {
    if query.min_lat > query.max_lat || query.min_lon > query.max_lon {
        return Err(Error::InvalidQuery("empty bounding box".into()));
    }
    let level = level.min(MAX_LEVEL);
    let x0 = grid_coord(query.min_lon, -180.0, 180.0, level);
    let x1 = grid_coord(query.max_lon, -180.0, 180.0, level);
    let y0 = grid_coord(query.min_lat, -90.0, 90.0, level);
    let y1 = grid_coord(query.max_lat, -90.0, 90.0, level);

    let mut seen: BTreeSet<Tuple> = BTreeSet::new();
    let mut results: Vec<IndexEntry> = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let cell = morton_encode(x, y, level);
            let cell_space = subspace.child(cell as i64);
            let (begin, end) = cell_space.range();
            for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
                let (key, value) = pair?;
                let item_id = cell_space.unpack(&key)?;
                if seen.contains(&item_id) {
                    continue;
                }
                let point = Tuple::unpack(&value)?;
                let (Some(TupleValue::Float(lat)), Some(TupleValue::Float(lon))) =
                    (point.get(0), point.get(1))
                else {
                    return Err(Error::InvalidEncoding("bad stored point".into()));
                };
                if query.contains(*lat, *lon) {
                    seen.insert(item_id.clone());
                    results.push(IndexEntry {
                        key_values: Tuple::from_single(cell as i64),
                        item_id,
                        stored_values: Some(point),
                    });
                }
            }
        }
    }
    Ok(Box::new(results.into_iter().map(Ok)))
}
