//! Pixel → pose resolution.
//!
//! Two lookups live here and they never consult each other:
//! - [`CalibrationTable::nearest`]: nearest-neighbour over the calibrated pixel→6D table.
//! - [`SlotSet::classify`]: picks the container slot whose reference pixel is closest.
//!
//! Both are loaded once per run and are read-only afterwards. [`CalibrationStore`] keeps
//! them in an embedded Sled database so a run does not need the original JSON files.

use std::path::Path;

use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::facts::{Pixel, Pose6D};

const CALIBRATION_TREE: &str = "calibration";
const SLOTS_TREE: &str = "slots";

/// One calibrated correspondence between a camera pixel and a robot pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub pixel: Pixel,
    pub pose: Pose6D,
}

/// Bucket size of the pixel index. Each leaf must be able to hold every entry that shares
/// one pixel coordinate value, so calibration grids may have at most this many rows (or
/// columns) on a single line.
const PIXEL_BUCKET: usize = 256;

type PixelTree = KdTree<f32, u64, 2, PIXEL_BUCKET, u32>;

/// Calibrated pixel → 6D pose table.
///
/// Entry order is significant: on exact distance ties the lowest index wins. The pixel
/// index is built once on construction; the table is read-only afterwards.
pub struct CalibrationTable {
    entries: Vec<CalibrationEntry>,
    tree: PixelTree,
}

impl std::fmt::Debug for CalibrationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationTable")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Clone for CalibrationTable {
    fn clone(&self) -> Self {
        Self::new(self.entries.clone())
    }
}

impl PartialEq for CalibrationTable {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CalibrationTable {
    pub fn new(entries: Vec<CalibrationEntry>) -> Self {
        let mut tree = PixelTree::with_capacity(entries.len().max(1));
        for (idx, entry) in entries.iter().enumerate() {
            tree.add(&[entry.pixel.u(), entry.pixel.v()], idx as u64);
        }
        Self { entries, tree }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CalibrationEntry] {
        &self.entries
    }

    /// Returns the pose of the entry whose pixel is nearest to `pixel`.
    ///
    /// Returns `None` only for an empty table.
    pub fn nearest(&self, pixel: &Pixel) -> Option<&Pose6D> {
        if self.entries.is_empty() {
            return None;
        }
        let query = [pixel.u(), pixel.v()];
        let best = self.tree.nearest_one::<SquaredEuclidean>(&query);

        // The tree returns any one of several equidistant entries. Collect everything in a
        // slightly widened radius and settle on exact distance, then index.
        let radius = best.distance + best.distance.max(1.0) * 4.0 * f32::EPSILON;
        let idx = self
            .tree
            .within::<SquaredEuclidean>(&query, radius)
            .into_iter()
            .map(|nn| nn.item as usize)
            .chain(std::iter::once(best.item as usize))
            .filter_map(|idx| {
                let entry = self.entries.get(idx)?;
                Some((entry.pixel.distance_squared(pixel), idx))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, idx)| idx)?;

        self.entries.get(idx).map(|entry| &entry.pose)
    }

    /// Parses the persisted mapping `{"u,v": [x, y, z, roll, pitch, yaw], ...}`.
    ///
    /// Entries are sorted by `(u, v)` so the tie-break order does not depend on the file.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut entries = Vec::with_capacity(raw.len());

        for (key, value) in raw {
            let pixel = parse_pixel_key(&key)?;
            let pose: [f32; 6] = serde_json::from_value(value).map_err(|e| {
                CoreError::Calibration(format!("pose for pixel '{key}' is not 6 numbers: {e}"))
            })?;
            entries.push(CalibrationEntry {
                pixel,
                pose: Pose6D::from_array(pose),
            });
        }

        entries.sort_by(|a, b| {
            a.pixel
                .u()
                .total_cmp(&b.pixel.u())
                .then(a.pixel.v().total_cmp(&b.pixel.v()))
        });

        Ok(Self::new(entries))
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let table = Self::from_json_str(&json)?;
        info!(path = %path.display(), entries = table.len(), "loaded calibration table");
        Ok(table)
    }
}

fn parse_pixel_key(key: &str) -> Result<Pixel> {
    let trimmed = key.trim().trim_start_matches('(').trim_end_matches(')');
    let mut parts = trimmed.split(',').map(|p| p.trim().parse::<f32>());

    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(u)), Some(Ok(v)), None) => Ok(Pixel::new(u, v)),
        _ => Err(CoreError::Calibration(format!(
            "calibration key '{key}' is not a 'u,v' pixel"
        ))),
    }
}

/// A named container with a reference pixel (for classification) and a fixed pose (for
/// placing into it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSlot {
    pub name: String,
    pub pixel: Pixel,
    pub pose: Pose6D,
}

#[derive(Deserialize)]
struct PersistedSlot {
    pixel: [f32; 2],
    pose6d: [f32; 6],
}

/// The fixed set of container slots. Never empty; the first slot is the default.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSet {
    slots: Vec<ReferenceSlot>,
}

impl SlotSet {
    pub fn new(slots: Vec<ReferenceSlot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(CoreError::Calibration(
                "at least one container slot is required".to_string(),
            ));
        }
        Ok(Self { slots })
    }

    /// Parses `{"Green Bin": {"pixel": [u, v], "pose6d": [..6]}, ...}` keeping file order.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut slots = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let persisted: PersistedSlot = serde_json::from_value(value).map_err(|e| {
                CoreError::Calibration(format!("container '{name}' is malformed: {e}"))
            })?;
            slots.push(ReferenceSlot {
                name,
                pixel: Pixel::new(persisted.pixel[0], persisted.pixel[1]),
                pose: Pose6D::from_array(persisted.pose6d),
            });
        }
        Self::new(slots)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn default_slot(&self) -> &ReferenceSlot {
        &self.slots[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Case-insensitive lookup by container name.
    pub fn by_name(&self, name: &str) -> Option<&ReferenceSlot> {
        self.slots
            .iter()
            .find(|slot| slot.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Returns the slot whose reference pixel is nearest to `pixel` by squared distance.
    /// Ties go to the earlier slot, so the default slot wins an exact midpoint.
    pub fn classify(&self, pixel: &Pixel) -> &ReferenceSlot {
        let mut best = &self.slots[0];
        let mut best_d2 = best.pixel.distance_squared(pixel);
        for slot in &self.slots[1..] {
            let d2 = slot.pixel.distance_squared(pixel);
            if d2 < best_d2 {
                best = slot;
                best_d2 = d2;
            }
        }
        debug!(pixel = %pixel, slot = %best.name, "classified pixel");
        best
    }
}

/// Persistent calibration store (embedded DB).
///
/// Keys are big-endian indices so iteration returns entries in their original order.
pub struct CalibrationStore {
    db: sled::Db,
}

impl std::fmt::Debug for CalibrationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationStore")
            .field("calibration_entries", &self.tree_len(CALIBRATION_TREE))
            .field("slots", &self.tree_len(SLOTS_TREE))
            .finish()
    }
}

impl CalibrationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Wraps an already-open Sled handle (temporary databases in tests).
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    fn tree_len(&self, name: &str) -> usize {
        self.db.open_tree(name).map(|t| t.len()).unwrap_or(0)
    }

    /// Swaps the whole content of `name` for `values` in one atomic batch, so a failed
    /// import never leaves a partial table behind.
    fn replace_tree(&self, name: &str, values: Vec<Vec<u8>>) -> Result<()> {
        let tree = self.db.open_tree(name)?;
        let mut batch = sled::Batch::default();
        for key in tree.iter().keys() {
            batch.remove(key?);
        }
        for (idx, value) in values.into_iter().enumerate() {
            batch.insert((idx as u64).to_be_bytes().to_vec(), value);
        }
        tree.apply_batch(batch)?;
        tree.flush()?;
        debug!(tree = name, entries = tree.len(), "replaced stored tree");
        Ok(())
    }

    /// Replaces the stored calibration table.
    pub fn save_table(&self, table: &CalibrationTable) -> Result<()> {
        let values = table
            .entries()
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.replace_tree(CALIBRATION_TREE, values)
    }

    pub fn load_table(&self) -> Result<CalibrationTable> {
        let tree = self.db.open_tree(CALIBRATION_TREE)?;
        let mut entries = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (_, value) = item?;
            entries.push(serde_json::from_slice::<CalibrationEntry>(&value)?);
        }
        Ok(CalibrationTable::new(entries))
    }

    /// Replaces the stored container slots.
    pub fn save_slots(&self, slots: &SlotSet) -> Result<()> {
        let values = slots
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.replace_tree(SLOTS_TREE, values)
    }

    /// Returns `None` when no slots have been stored yet.
    pub fn load_slots(&self) -> Result<Option<SlotSet>> {
        let tree = self.db.open_tree(SLOTS_TREE)?;
        if tree.is_empty() {
            return Ok(None);
        }
        let mut slots = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (_, value) = item?;
            slots.push(serde_json::from_slice::<ReferenceSlot>(&value)?);
        }
        SlotSet::new(slots).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bins() -> SlotSet {
        SlotSet::new(vec![
            ReferenceSlot {
                name: "Green Bin".to_string(),
                pixel: Pixel::new(100.0, 100.0),
                pose: Pose6D::new(172.8, -226.4, 107.4, 93.9, -0.83, 47.41),
            },
            ReferenceSlot {
                name: "Blue Bin".to_string(),
                pixel: Pixel::new(300.0, 100.0),
                pose: Pose6D::new(166.7, -273.3, 108.2, 73.14, -1.83, 12.7),
            },
        ])
        .expect("two slots")
    }

    fn table() -> CalibrationTable {
        CalibrationTable::from_json_str(
            r#"{
                "16,240": [81.3, -310.6, 100.0, 74.31, 0.13, -5.22],
                "0,0": [1, 2, 3, 4, 5, 6],
                "100, 50": [10, 20, 30, 0, 0, 0]
            }"#,
        )
        .expect("valid table")
    }

    #[test]
    fn exact_calibration_pixel_returns_its_pose() {
        let table = table();
        for entry in table.entries() {
            assert_eq!(table.nearest(&entry.pixel), Some(&entry.pose));
        }
    }

    #[test]
    fn nearest_picks_closest_entry() {
        let pose = table().nearest(&Pixel::new(95.0, 55.0)).copied();
        assert_eq!(pose, Some(Pose6D::new(10.0, 20.0, 30.0, 0.0, 0.0, 0.0)));
    }

    #[test]
    fn nearest_ties_resolve_to_lowest_index() {
        let table = CalibrationTable::new(vec![
            CalibrationEntry {
                pixel: Pixel::new(0.0, 0.0),
                pose: Pose6D::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            },
            CalibrationEntry {
                pixel: Pixel::new(10.0, 0.0),
                pose: Pose6D::new(2.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            },
        ]);
        let pose = table.nearest(&Pixel::new(5.0, 0.0)).expect("non-empty");
        assert_eq!(pose.position.x, 1.0);
    }

    fn grid(columns: u32, rows: u32, spacing: f32) -> CalibrationTable {
        let mut entries = Vec::new();
        for c in 0..columns {
            for r in 0..rows {
                entries.push(CalibrationEntry {
                    pixel: Pixel::new(c as f32 * spacing, r as f32 * spacing),
                    pose: Pose6D::new(c as f32, r as f32, 0.0, 0.0, 0.0, 0.0),
                });
            }
        }
        CalibrationTable::new(entries)
    }

    fn scan(table: &CalibrationTable, pixel: &Pixel) -> Pose6D {
        let mut best = 0;
        for (idx, entry) in table.entries().iter().enumerate() {
            if entry.pixel.distance_squared(pixel) < table.entries()[best].pixel.distance_squared(pixel) {
                best = idx;
            }
        }
        table.entries()[best].pose
    }

    #[test]
    fn nearest_agrees_with_full_scan_on_dense_grid() {
        // 40 entries share each column value, more than a default leaf holds.
        let table = grid(12, 40, 16.0);
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let u = (seed >> 8) as f32 / (1u32 << 24) as f32 * 200.0 - 10.0;
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let v = (seed >> 8) as f32 / (1u32 << 24) as f32 * 660.0 - 10.0;
            let pixel = Pixel::new(u, v);
            assert_eq!(table.nearest(&pixel), Some(&scan(&table, &pixel)), "at {pixel}");
        }
    }

    #[test]
    fn grid_midpoints_resolve_to_lowest_index() {
        let table = grid(4, 4, 10.0);
        // Equidistant from (10,10), (10,20), (20,10), (20,20); (10,10) is inserted first.
        let pose = table.nearest(&Pixel::new(15.0, 15.0)).expect("non-empty");
        assert_eq!((pose.position.x, pose.position.y), (1.0, 1.0));
        // Between two rows of the same column.
        let pose = table.nearest(&Pixel::new(30.0, 25.0)).expect("non-empty");
        assert_eq!((pose.position.x, pose.position.y), (3.0, 2.0));
    }

    #[test]
    fn cloned_table_answers_like_the_original() {
        let table = grid(3, 3, 5.0);
        let copy = table.clone();
        assert_eq!(copy, table);
        let pixel = Pixel::new(7.0, 1.0);
        assert_eq!(copy.nearest(&pixel), table.nearest(&pixel));
    }

    #[test]
    fn empty_table_has_no_nearest() {
        assert!(CalibrationTable::default()
            .nearest(&Pixel::new(1.0, 1.0))
            .is_none());
    }

    #[test]
    fn json_entries_are_sorted_by_pixel() {
        let table = table();
        let first = table.entries()[0].pixel;
        assert_eq!((first.u(), first.v()), (0.0, 0.0));
    }

    #[test]
    fn bad_pixel_key_is_rejected() {
        let err = CalibrationTable::from_json_str(r#"{"16": [1, 2, 3, 4, 5, 6]}"#).unwrap_err();
        assert!(matches!(err, CoreError::Calibration(_)));
    }

    #[test]
    fn short_pose_is_rejected() {
        let err = CalibrationTable::from_json_str(r#"{"1,2": [1, 2, 3]}"#).unwrap_err();
        assert!(matches!(err, CoreError::Calibration(_)));
    }

    #[test]
    fn classify_picks_nearer_slot() {
        let slots = bins();
        assert_eq!(slots.classify(&Pixel::new(290.0, 120.0)).name, "Blue Bin");
        assert_eq!(slots.classify(&Pixel::new(90.0, 80.0)).name, "Green Bin");
    }

    #[test]
    fn classify_midpoint_resolves_to_default() {
        let slots = bins();
        assert_eq!(slots.classify(&Pixel::new(200.0, 100.0)).name, "Green Bin");
    }

    #[test]
    fn slot_json_keeps_file_order() {
        let slots = SlotSet::from_json_str(
            r#"{
                "Green Bin": {"pixel": [100, 100], "pose6d": [172.8, -226.4, 107.4, 93.9, -0.83, 47.41]},
                "Blue Bin": {"pixel": [300, 100], "pose6d": [166.7, -273.3, 108.2, 73.14, -1.83, 12.7]}
            }"#,
        )
        .expect("valid slots");
        assert_eq!(slots.default_slot().name, "Green Bin");
        assert_eq!(slots.by_name("blue bin").map(|s| s.pose.yaw()), Some(12.7));
    }

    #[test]
    fn empty_slot_set_is_rejected() {
        assert!(SlotSet::new(Vec::new()).is_err());
    }

    #[test]
    fn store_round_trips_table_and_slots() {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("failed to open temporary sled db");
        let store = CalibrationStore::from_db(db);

        assert!(store.load_slots().expect("load").is_none());

        store.save_table(&table()).expect("save table");
        store.save_slots(&bins()).expect("save slots");

        assert_eq!(store.load_table().expect("load table"), table());
        let slots = store.load_slots().expect("load slots").expect("stored");
        assert_eq!(slots.default_slot().name, "Green Bin");
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn saving_a_smaller_table_replaces_the_larger_one() {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("failed to open temporary sled db");
        let store = CalibrationStore::from_db(db);

        store.save_table(&grid(5, 5, 10.0)).expect("save large table");
        store.save_table(&table()).expect("save small table");

        let loaded = store.load_table().expect("load table");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded, table());

        let single = SlotSet::new(vec![bins().default_slot().clone()]).expect("one slot");
        store.save_slots(&bins()).expect("save slots");
        store.save_slots(&single).expect("save single slot");
        let slots = store.load_slots().expect("load slots").expect("stored");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.default_slot().name, "Green Bin");
    }
}
