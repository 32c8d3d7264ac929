// ============================================================================
// Geo Index
// ============================================================================

use serde_json::Value;
use std::sync::RwLock;

use crate::core::{IndexId, Result};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::Shaper;
use crate::txn::{Transaction, TransactionCollection};

use super::IndexMeta;

/// Where the coordinates live in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoVariant {
    /// one path holding a [lat, lon] pair
    CombinedLatLon,
    /// one path holding a [lon, lat] pair (GeoJSON ordering)
    CombinedLonLat,
    /// two separate numeric paths
    IndividualLatLon,
}

impl GeoVariant {
    pub fn is_combined(&self) -> bool {
        matches!(self, GeoVariant::CombinedLatLon | GeoVariant::CombinedLonLat)
    }
}

#[derive(Clone, Copy)]
struct GeoEntry {
    slot: SlotIndex,
    latitude: f64,
    longitude: f64,
}

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Index over one coordinate pair per document. Documents without usable
/// coordinates are skipped (the geo index is implicitly sparse).
pub struct GeoIndex {
    meta: IndexMeta,
    variant: GeoVariant,
    entries: RwLock<Vec<GeoEntry>>,
}

impl GeoIndex {
    /// One indexed path holding the pair; `geo_json` flips it to [lon, lat].
    pub fn new_combined(id: IndexId, field: String, geo_json: bool) -> Self {
        let variant = if geo_json {
            GeoVariant::CombinedLonLat
        } else {
            GeoVariant::CombinedLatLon
        };
        Self {
            meta: IndexMeta::new(id, vec![field], false, true),
            variant,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Separate latitude and longitude paths.
    pub fn new_separate(id: IndexId, latitude_field: String, longitude_field: String) -> Self {
        Self {
            meta: IndexMeta::new(id, vec![latitude_field, longitude_field], false, true),
            variant: GeoVariant::IndividualLatLon,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn variant(&self) -> &GeoVariant {
        &self.variant
    }

    pub fn geo_json(&self) -> bool {
        self.variant == GeoVariant::CombinedLonLat
    }

    pub fn type_name(&self) -> &'static str {
        if self.variant.is_combined() {
            "geo1"
        } else {
            "geo2"
        }
    }

    fn coordinates_of(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<Option<(f64, f64)>> {
        let Some(body) = mp.body() else {
            return Ok(None);
        };
        let decoded = body.decode()?;

        match self.variant {
            GeoVariant::CombinedLatLon | GeoVariant::CombinedLonLat => {
                let Some(value) = shaper.extract(&decoded, &self.meta.fields[0])? else {
                    return Ok(None);
                };
                let Some(pair) = value.value().as_array() else {
                    return Ok(None);
                };
                if pair.len() != 2 {
                    return Ok(None);
                }
                let (Some(first), Some(second)) = (as_f64(&pair[0]), as_f64(&pair[1])) else {
                    return Ok(None);
                };
                if self.variant == GeoVariant::CombinedLonLat {
                    Ok(Some((second, first)))
                } else {
                    Ok(Some((first, second)))
                }
            }
            GeoVariant::IndividualLatLon => {
                let latitude = shaper
                    .extract(&decoded, &self.meta.fields[0])?
                    .and_then(|v| as_f64(v.value()));
                let longitude = shaper
                    .extract(&decoded, &self.meta.fields[1])?
                    .and_then(|v| as_f64(v.value()));
                match (latitude, longitude) {
                    (Some(latitude), Some(longitude)) => Ok(Some((latitude, longitude))),
                    _ => Ok(None),
                }
            }
        }
    }

    pub fn insert(
        &self,
        collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.insert_slot(collection.shaper(), mp)
    }

    fn insert_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        let Some((latitude, longitude)) = self.coordinates_of(shaper, mp)? else {
            return Ok(());
        };
        let mut entries = self.entries.write()?;
        entries.push(GeoEntry {
            slot: mp.index(),
            latitude,
            longitude,
        });
        Ok(())
    }

    /// The `limit` nearest visible documents, closest first.
    pub fn near(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        latitude: f64,
        longitude: f64,
        limit: usize,
    ) -> Result<Vec<(MptrHandle, f64)>> {
        let mut result = self.visible_with_distances(collection, transaction, latitude, longitude)?;
        result.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        result.truncate(limit);
        Ok(result)
    }

    /// All visible documents within `radius` meters, closest first.
    pub fn within(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        latitude: f64,
        longitude: f64,
        radius: f64,
    ) -> Result<Vec<(MptrHandle, f64)>> {
        let mut result = self.visible_with_distances(collection, transaction, latitude, longitude)?;
        result.retain(|(_, distance)| *distance <= radius);
        result.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(result)
    }

    fn visible_with_distances(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<(MptrHandle, f64)>> {
        let entries = {
            let guard = self.entries.read()?;
            guard.clone()
        };
        let manager = collection.collection().masterpointer_manager();
        let mut result = Vec::new();
        for entry in entries {
            let handle = manager.handle(entry.slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                let distance =
                    distance_meters(latitude, longitude, entry.latitude, entry.longitude);
                result.push((handle, distance));
            }
        }
        Ok(result)
    }

    pub fn remove(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        _key: &str,
        mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        if self.erase(mp)? {
            Ok(Some(mp.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn forget(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.erase(mp)?;
        Ok(())
    }

    pub fn pre_commit(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
    ) -> Result<()> {
        Ok(())
    }

    fn erase(&self, mp: &MptrHandle) -> Result<bool> {
        let mut entries = self.entries.write()?;
        let before = entries.len();
        entries.retain(|entry| entry.slot != mp.index());
        Ok(entries.len() != before)
    }

    pub fn fill_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        self.insert_slot(shaper, mp)
    }

    pub fn memory(&self) -> usize {
        let entries = self.entries.read().expect("geo index poisoned");
        entries.len() * std::mem::size_of::<GeoEntry>()
    }

    pub fn click_lock(&self) {
        let _guard = self.entries.write().expect("geo index poisoned");
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_sanity() {
        // Cologne -> Paris is roughly 400 km
        let distance = distance_meters(50.9375, 6.9603, 48.8566, 2.3522);
        assert!((350_000.0..450_000.0).contains(&distance));

        assert!(distance_meters(10.0, 20.0, 10.0, 20.0) < 1e-6);
    }
}
