//! Nearest location reference lookup (§4.5, §4.9), grounded in
//! `location_reference_loader.py`'s PostGIS KNN query: `ST_DWithin` to bound
//! the search, `<->` to order by distance, `LIMIT 1`.

use sqlx::PgPool;

use crate::enrich::{LocationMatch, LocationReference};
use crate::error::Result;

pub struct PostgisLocationReference {
    pool: PgPool,
}

impl PostgisLocationReference {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct NearestRow {
    reference_id: i64,
    distance_m: f64,
}

#[async_trait::async_trait]
impl LocationReference for PostgisLocationReference {
    async fn nearest(&self, lat: f64, lon: f64, max_km: f64) -> Result<Option<LocationMatch>> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            log::warn!("invalid GPS coordinates passed to location lookup: lat={lat}, lon={lon}");
            return Ok(None);
        }

        let max_distance_m = max_km * 1000.0;
        let row: Option<NearestRow> = sqlx::query_as(
            "SELECT id as reference_id, \
             ST_DistanceSphere(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326)) as distance_m \
             FROM location_reference \
             WHERE geom IS NOT NULL \
               AND ST_DWithin(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326), $3) \
             ORDER BY geom <-> ST_SetSRID(ST_MakePoint($1, $2), 4326) \
             LIMIT 1",
        )
        .bind(lon)
        .bind(lat)
        .bind(max_distance_m)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LocationMatch {
            reference_id: r.reference_id,
            distance_km: r.distance_m / 1000.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_coordinates_are_rejected_before_querying() {
        assert!(!(-90.0..=90.0).contains(&91.0_f64));
        assert!(!(-180.0..=180.0).contains(&200.0_f64));
    }
}
